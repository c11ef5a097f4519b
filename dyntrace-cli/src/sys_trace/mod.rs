// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{collections::VecDeque, path::PathBuf, time::Duration};

use enum_dispatch::enum_dispatch;
use log::debug;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt as _, BufReader, Split},
    process::ChildStderr,
};

use crate::config::{TraceConfig, TracerSelection};
use crate::errors::TraceError;

pub use connections::{ConnectionStream, ConnectionTracker};
pub use dtruss::DtrussSource;
pub use parser::Dialect;
pub use process::TracerProcess;
pub use record::{ArgValue, ConnectionRecord, Protocol, SyscallRecord};
pub use replay::ReplaySource;
pub use session::{SessionOutcome, SyscallStream};
pub use strace::StraceSource;

pub mod connections;
pub mod dtruss;
pub mod parser;
pub mod process;
pub mod record;
pub mod replay;
pub mod session;
pub mod strace;

/// Description of one tracing session: what to run, and what to keep from the trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceRequest {
    target: PathBuf,
    args: Vec<String>,
    syscall: Option<String>,
    run_as_root: bool,
    timeout: Option<Duration>,
    follow_children: bool,
    tracer_syscalls: Option<Vec<String>>,
}

impl TraceRequest {
    #[must_use]
    pub fn new(target: impl Into<PathBuf>) -> Self {
        TraceRequest {
            target: target.into(),
            args: Vec::new(),
            syscall: None,
            run_as_root: true,
            timeout: None,
            follow_children: false,
            tracer_syscalls: None,
        }
    }

    /// Arguments passed through to the target, in order.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Keep only syscalls with exactly this name, as the tracer prints it.
    #[must_use]
    pub fn syscall(mut self, name: Option<impl Into<String>>) -> Self {
        self.syscall = name.map(Into::into);
        self
    }

    /// Run the tracer through the configured elevation command (default); `false` traces as the invoking user.
    #[must_use]
    pub fn run_as_root(mut self, run_as_root: bool) -> Self {
        self.run_as_root = run_as_root;
        self
    }

    /// Wall-clock limit on the session; when it passes the target is terminated and the records gathered so far are
    /// still delivered.
    #[must_use]
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Also report syscalls of processes the target creates; by default only the target's own are reported.
    #[must_use]
    pub fn follow_children(mut self, follow: bool) -> Self {
        self.follow_children = follow;
        self
    }

    /// Restrict what the tracer itself records.  Narrower than `syscall` because it's applied before any output is
    /// written, so unrelated calls cost nothing.
    #[must_use]
    pub fn tracer_syscalls<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tracer_syscalls = Some(names.into_iter().map(Into::into).collect());
        self
    }

    #[must_use]
    pub fn target(&self) -> &PathBuf {
        &self.target
    }

    #[must_use]
    pub fn target_args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn syscall_filter(&self) -> Option<&str> {
        self.syscall.as_deref()
    }

    #[must_use]
    pub fn is_run_as_root(&self) -> bool {
        self.run_as_root
    }

    #[must_use]
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout
    }

    #[must_use]
    pub fn is_following_children(&self) -> bool {
        self.follow_children
    }

    #[must_use]
    pub fn tracer_syscall_set(&self) -> Option<&[String]> {
        self.tracer_syscalls.as_deref()
    }
}

/// Buffering and teardown limits shared by every session a source starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLimits {
    pub channel_capacity: usize,
    pub termination_grace: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        SessionLimits::from(&TraceConfig::default())
    }
}

impl From<&TraceConfig> for SessionLimits {
    fn from(config: &TraceConfig) -> Self {
        SessionLimits {
            channel_capacity: config.channel_capacity.max(1),
            termination_grace: config.termination_grace(),
        }
    }
}

/// Where a session reads raw trace lines from.
pub enum TraceOutput {
    /// strace's `--output` FIFO.
    Fifo(Split<BufReader<File>>),
    /// A tracer that writes its trace to stderr, interleaved with its own diagnostics.
    Stderr(Split<BufReader<ChildStderr>>),
    /// Canned lines; `hold_open` keeps the stream pending after the last line as a live tracer would.
    Replay {
        lines: VecDeque<String>,
        hold_open: bool,
    },
}

impl TraceOutput {
    /// Cancel safe; a line is never lost if the future is dropped before completing.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        let segment = match self {
            TraceOutput::Fifo(split) => split.next_segment().await?,
            TraceOutput::Stderr(split) => split.next_segment().await?,
            TraceOutput::Replay { lines, hold_open } => {
                return match lines.pop_front() {
                    Some(line) => Ok(Some(line)),
                    None if *hold_open => std::future::pending().await,
                    None => Ok(None),
                };
            }
        };
        // Trace text is ASCII apart from escapes, but target-controlled bytes mustn't end the session.
        Ok(segment.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// `true` when lines that aren't trace records are the tracer's own diagnostics.
    #[must_use]
    pub fn carries_diagnostics(&self) -> bool {
        matches!(self, TraceOutput::Stderr(_))
    }

    #[must_use]
    pub fn from_fifo(file: File) -> Self {
        TraceOutput::Fifo(BufReader::new(file).split(b'\n'))
    }

    #[must_use]
    pub fn from_stderr(stderr: ChildStderr) -> Self {
        TraceOutput::Stderr(BufReader::new(stderr).split(b'\n'))
    }
}

/// A started session: its output, and the tracer process if there is one.
pub struct LaunchedTrace {
    pub output: TraceOutput,
    pub process: Option<TracerProcess>,
}

/// A facility that can run a target under syscall tracing and stream the trace text back.
#[enum_dispatch]
#[allow(async_fn_in_trait)] // should be fine to the extent that this is only used internally to this project
pub trait TraceSource {
    /// Human-readable name of the facility, for diagnostics.
    fn name(&self) -> &str;

    fn dialect(&self) -> Dialect;

    /// Whether socket address structures appear in the trace; required for connection tracking.
    fn renders_socket_addresses(&self) -> bool;

    fn limits(&self) -> SessionLimits;

    /// Start the tracer and target.  Fails before spawning anything if the target isn't an executable file.
    async fn launch(&self, request: &TraceRequest) -> Result<LaunchedTrace, TraceError>;
}

#[enum_dispatch(TraceSource)]
pub enum TraceSourceDispatch {
    StraceSource,
    DtrussSource,
    ReplaySource,
}

/// The tracer the configuration selects; `auto` picks the host's facility.
#[must_use]
pub fn source_from_config(config: &TraceConfig) -> TraceSourceDispatch {
    let selection = match config.tracer {
        TracerSelection::Auto if cfg!(target_os = "macos") => TracerSelection::Dtruss,
        TracerSelection::Auto => TracerSelection::Strace,
        other => other,
    };
    debug!("using tracer {selection:?}");
    match selection {
        TracerSelection::Dtruss => DtrussSource::new(config).into(),
        TracerSelection::Strace | TracerSelection::Auto => StraceSource::new(config).into(),
    }
}

/// Trace `request.target()` with the tracer selected by the default configuration file.
pub async fn trace(request: TraceRequest) -> Result<SyscallStream, TraceError> {
    let source = default_source()?;
    trace_with(&source, request).await
}

/// Trace `request.target()` with `source`.  Returns once the tracer has reported its first syscall (or ended without
/// reporting any), so that startup failures surface here rather than as an empty stream.
pub async fn trace_with<S: TraceSource>(
    source: &S,
    request: TraceRequest,
) -> Result<SyscallStream, TraceError> {
    session::start(source, request).await
}

/// Distinct IP endpoints contacted by `request.target()`, with the tracer selected by the default configuration file.
pub async fn connections(request: TraceRequest) -> Result<ConnectionStream, TraceError> {
    let source = default_source()?;
    connections_with(&source, request).await
}

pub async fn connections_with<S: TraceSource>(
    source: &S,
    request: TraceRequest,
) -> Result<ConnectionStream, TraceError> {
    if !source.renders_socket_addresses() {
        return Err(TraceError::TracerUnavailable {
            tracer: String::from(source.name()),
            reason: String::from("its trace does not include socket addresses"),
        });
    }
    let request = request
        .syscall(None::<String>)
        .tracer_syscalls(connections::TRACED_SYSCALLS.iter().copied());
    let stream = trace_with(source, request).await?;
    Ok(ConnectionStream::new(stream))
}

fn default_source() -> Result<TraceSourceDispatch, TraceError> {
    let config = crate::config::get_trace_config(None).map_err(|e| TraceError::TracerUnavailable {
        tracer: String::from("(configuration)"),
        reason: format!("{e:#}"),
    })?;
    Ok(source_from_config(&config))
}
