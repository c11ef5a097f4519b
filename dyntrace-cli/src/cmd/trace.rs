// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{fmt::Display, io::Write, process::ExitCode};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::{
    config::{TraceConfig, get_trace_config},
    errors::TraceError,
    sys_trace::{
        ConnectionStream, ReplaySource, SessionLimits, SessionOutcome, SyscallStream,
        TraceRequest, connections_with, source_from_config, trace_with,
    },
};

use super::{
    cli::{CommonOptions, ConnectionsOptions, ReplayOptions, TargetParameters, TraceOptions},
    output::RecordWriter,
};

/// Exit code when the timeout stopped the target; the records printed are valid but incomplete.
pub const TIMEOUT_EXIT_CODE: u8 = 3;

/// Either kind of record stream, as far as printing it goes.
trait RecordSource {
    type Record: Display + Serialize;

    async fn next_record(&mut self) -> Option<Self::Record>;

    async fn finish_session(self) -> SessionOutcome;
}

impl RecordSource for SyscallStream {
    type Record = crate::sys_trace::SyscallRecord;

    async fn next_record(&mut self) -> Option<Self::Record> {
        self.next().await
    }

    async fn finish_session(self) -> SessionOutcome {
        self.finish().await
    }
}

impl RecordSource for ConnectionStream {
    type Record = crate::sys_trace::ConnectionRecord;

    async fn next_record(&mut self) -> Option<Self::Record> {
        self.next().await
    }

    async fn finish_session(self) -> SessionOutcome {
        self.finish().await
    }
}

// Design note: as with the library's streams, these `cli` functions only do the interactive output; everything they
// report comes from `trace_with`/`connections_with`.
pub async fn trace_cli(common: &CommonOptions, options: &TraceOptions) -> ExitCode {
    let Some(config) = load_config(common) else {
        return ExitCode::FAILURE;
    };
    let source = source_from_config(&config);
    let request = target_request(&options.target_parameters)
        .syscall(options.syscall.clone())
        .follow_children(options.follow_children);
    match trace_with(&source, request).await {
        Ok(stream) => print_stream(stream, &options.target_parameters).await,
        Err(e) => failure(&e),
    }
}

pub async fn connections_cli(common: &CommonOptions, options: &ConnectionsOptions) -> ExitCode {
    let Some(config) = load_config(common) else {
        return ExitCode::FAILURE;
    };
    let source = source_from_config(&config);
    let request = target_request(&options.target_parameters);
    match connections_with(&source, request).await {
        Ok(stream) => print_stream(stream, &options.target_parameters).await,
        Err(e) => failure(&e),
    }
}

pub async fn replay_cli(common: &CommonOptions, options: &ReplayOptions) -> ExitCode {
    let Some(config) = load_config(common) else {
        return ExitCode::FAILURE;
    };
    let source = match ReplaySource::from_file(options.dialect.into(), &options.file) {
        Ok(source) => source.with_limits(SessionLimits::from(&config)),
        Err(e) => return failure(&e),
    };
    let request = TraceRequest::new(&options.file)
        .syscall(options.syscall.clone())
        .follow_children(options.follow_children);

    let mut writer = RecordWriter::new(std::io::stdout(), options.format);
    let result = if options.connections {
        match connections_with(&source, request).await {
            Ok(stream) => report(stream, &mut writer).await,
            Err(e) => return failure(&e),
        }
    } else {
        match trace_with(&source, request).await {
            Ok(stream) => report(stream, &mut writer).await,
            Err(e) => return failure(&e),
        }
    };
    ExitCode::from(result.map_or(1, |outcome| exit_code(&outcome)))
}

fn load_config(common: &CommonOptions) -> Option<TraceConfig> {
    match get_trace_config(common.config.as_ref()) {
        Ok(config) => Some(config),
        Err(e) => {
            error!("unable to load configuration: {e:#}");
            None
        }
    }
}

fn target_request(parameters: &TargetParameters) -> TraceRequest {
    TraceRequest::new(&parameters.target)
        .args(parameters.args.iter().cloned())
        .run_as_root(!parameters.no_root)
        .timeout(parameters.timeout_duration())
}

fn failure(e: &TraceError) -> ExitCode {
    error!("{e}");
    ExitCode::from(e.exit_code())
}

async fn print_stream<S: RecordSource>(stream: S, parameters: &TargetParameters) -> ExitCode {
    let mut writer = RecordWriter::new(std::io::stdout(), parameters.format);
    ExitCode::from(
        report(stream, &mut writer)
            .await
            .map_or(1, |outcome| exit_code(&outcome)),
    )
}

/// Print every record, then end the session.  Returns `Err` with the session already ended if output failed, eg. a
/// closed pipe.
async fn report<S: RecordSource, W: Write>(
    mut stream: S,
    writer: &mut RecordWriter<W>,
) -> Result<SessionOutcome, SessionOutcome> {
    let mut write_failed = false;
    while let Some(record) = stream.next_record().await {
        if let Err(e) = writer.write(&record) {
            debug!("stopping trace; unable to write output: {e}");
            write_failed = true;
            break;
        }
    }
    if let Err(e) = writer.flush() {
        debug!("unable to flush output: {e}");
        write_failed = true;
    }

    let outcome = stream.finish_session().await;
    info!(
        "{} records reported; {} trace lines not recognized",
        outcome.records, outcome.skipped_lines
    );
    if write_failed {
        Err(outcome)
    } else {
        Ok(outcome)
    }
}

fn exit_code(outcome: &SessionOutcome) -> u8 {
    if outcome.timed_out {
        warn!("timeout reached; the target was stopped and results are partial");
        TIMEOUT_EXIT_CODE
    } else {
        0
    }
}
