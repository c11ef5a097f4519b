// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    pin::Pin,
    process::ExitStatus,
    task::{Context, Poll},
    time::Duration,
};

use futures::Stream;
use log::{debug, warn};
use serde::Serialize;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{Instant, sleep_until},
};

use crate::errors::TraceError;

use super::{
    LaunchedTrace, TraceOutput, TraceRequest, TraceSource, parser::TraceParser,
    record::SyscallRecord,
};

/// Summary of a finished session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionOutcome {
    /// Records delivered into the stream.
    pub records: usize,
    /// Tracer output lines that weren't syscalls.
    pub skipped_lines: usize,
    /// The timeout fired; the records gathered before it are complete and valid.
    pub timed_out: bool,
    /// The consumer stopped the session before the trace ended.
    pub cancelled: bool,
    #[serde(skip)]
    pub tracer_status: Option<ExitStatus>,
}

/// Syscall records in completion order, produced as the tracer writes them.  Dropping the stream stops the tracer and
/// target.
pub struct SyscallStream {
    rx: mpsc::Receiver<SyscallRecord>,
    producer: Option<JoinHandle<SessionOutcome>>,
}

impl SyscallStream {
    pub async fn next(&mut self) -> Option<SyscallRecord> {
        self.rx.recv().await
    }

    /// End the session, stopping the tracer and target if the trace hasn't ended yet.  Records not yet consumed are
    /// discarded.
    pub async fn finish(mut self) -> SessionOutcome {
        self.rx.close();
        match self.producer.take() {
            Some(producer) => producer.await.unwrap_or_else(|e| {
                warn!("trace reader task failed: {e}");
                SessionOutcome::default()
            }),
            None => SessionOutcome::default(),
        }
    }

    /// Consume every record, then finish.
    pub async fn collect_all(mut self) -> (Vec<SyscallRecord>, SessionOutcome) {
        let mut records = Vec::new();
        while let Some(record) = self.next().await {
            records.push(record);
        }
        let outcome = self.finish().await;
        (records, outcome)
    }
}

impl Stream for SyscallStream {
    type Item = SyscallRecord;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub(super) async fn start<S: TraceSource>(
    source: &S,
    request: TraceRequest,
) -> Result<SyscallStream, TraceError> {
    let limits = source.limits();
    let deadline = request.timeout_duration().map(|t| Instant::now() + t);
    let launched = source.launch(&request).await?;
    debug!("{} session started for {:?}", source.name(), request.target());

    let parser = TraceParser::new(source.dialect())
        .syscall_filter(request.syscall_filter().map(String::from))
        .follow_children(request.is_following_children());
    let (tx, rx) = mpsc::channel(limits.channel_capacity.max(1));
    let (ready_tx, ready_rx) = oneshot::channel();

    let producer = Producer {
        launched,
        parser,
        tx,
        deadline,
        grace: limits.termination_grace,
        ready: Some(ready_tx),
        outcome: SessionOutcome::default(),
    };
    let producer = tokio::spawn(producer.run());

    match ready_rx.await {
        Ok(Ok(())) => Ok(SyscallStream {
            rx,
            producer: Some(producer),
        }),
        Ok(Err(e)) => Err(e),
        Err(_) => {
            let status = match producer.await {
                Ok(outcome) => outcome.tracer_status,
                Err(_) => None,
            };
            Err(TraceError::TraceFailed {
                status,
                diagnostics: vec![String::from("trace reader stopped before the session started")],
            })
        }
    }
}

enum Wake {
    Line(std::io::Result<Option<String>>),
    Deadline,
    Closed,
}

struct Producer {
    launched: LaunchedTrace,
    parser: TraceParser,
    tx: mpsc::Sender<SyscallRecord>,
    deadline: Option<Instant>,
    grace: Duration,
    ready: Option<oneshot::Sender<Result<(), TraceError>>>,
    outcome: SessionOutcome,
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Producer {
    async fn run(mut self) -> SessionOutcome {
        loop {
            let wake = tokio::select! {
                line = self.launched.output.next_line() => Wake::Line(line),
                () = sleep_until_deadline(self.deadline) => Wake::Deadline,
                () = self.tx.closed() => Wake::Closed,
            };
            match wake {
                Wake::Line(Ok(Some(line))) => {
                    if !self.process_line(&line).await {
                        break;
                    }
                }
                Wake::Line(Ok(None)) => break,
                Wake::Line(Err(e)) => {
                    warn!("error reading trace output: {e}");
                    break;
                }
                Wake::Deadline if !self.outcome.timed_out => self.on_timeout().await,
                Wake::Deadline => {
                    debug!("trace output still open {:?} after teardown", self.grace);
                    break;
                }
                Wake::Closed => {
                    self.outcome.cancelled = true;
                    break;
                }
            }
        }

        self.parser.finish();
        if self.outcome.cancelled {
            debug!("consumer closed the session");
        }
        if let Some(process) = &mut self.launched.process {
            process.terminate().await;
            self.outcome.tracer_status = process.status();
        }
        self.outcome.skipped_lines = self.parser.skipped_lines();

        if let Some(ready) = self.ready.take() {
            // Ended before any syscall was recognized.
            let result = self.startup_result().await;
            let _ = ready.send(result);
        }
        self.outcome
    }

    async fn startup_result(&mut self) -> Result<(), TraceError> {
        if self.outcome.timed_out || self.outcome.cancelled {
            return Ok(());
        }
        match &mut self.launched.process {
            Some(process) if process.status().is_some_and(|s| !s.success()) => {
                Err(process.startup_failure().await)
            }
            _ => Ok(()),
        }
    }

    /// Returns `false` when the consumer has gone away.
    async fn process_line(&mut self, line: &str) -> bool {
        let skipped_before = self.parser.skipped_lines();
        let records = self.parser.feed(line);

        if let Some(process) = &mut self.launched.process {
            if self.parser.skipped_lines() > skipped_before && self.launched.output.carries_diagnostics() {
                process.record_diagnostic(line);
            }
            if let Some(pid) = self.parser.target_pid() {
                process.set_target_pid(pid);
            }
        }

        if self.parser.recognized_lines() > 0 {
            if let Some(ready) = self.ready.take() {
                let _ = ready.send(Ok(()));
            }
        }

        for record in records {
            if !self.deliver(record).await {
                self.outcome.cancelled = true;
                return false;
            }
        }
        true
    }

    /// Waits for channel capacity.  The deadline still applies while waiting, so a consumer that stops reading doesn't
    /// keep the target running.
    async fn deliver(&mut self, record: SyscallRecord) -> bool {
        loop {
            let deadline = if self.outcome.timed_out {
                None
            } else {
                self.deadline
            };
            tokio::select! {
                permit = self.tx.reserve() => {
                    return match permit {
                        Ok(permit) => {
                            permit.send(record);
                            self.outcome.records += 1;
                            true
                        }
                        Err(_) => false,
                    };
                }
                () = sleep_until_deadline(deadline) => {}
            }
            self.on_timeout().await;
        }
    }

    async fn on_timeout(&mut self) {
        debug!("trace timeout reached; stopping tracer");
        self.outcome.timed_out = true;
        match &mut self.launched.process {
            Some(process) => {
                process.terminate().await;
                // Whatever the tracer wrote before it exited is still readable.
                self.deadline = Some(Instant::now() + self.grace);
            }
            None => {
                // Nothing to stop; replayed output that's still open will never end.
                if matches!(self.launched.output, TraceOutput::Replay { .. }) {
                    self.deadline = Some(Instant::now());
                }
            }
        }
    }
}
