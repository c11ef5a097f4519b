// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    collections::VecDeque,
    ffi::OsStr,
    fs::OpenOptions,
    io::ErrorKind,
    os::unix::fs::{OpenOptionsExt as _, PermissionsExt as _},
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{debug, trace, warn};
use nix::{
    errno::Errno,
    sys::signal::{Signal, kill},
    unistd::{Pid, Uid},
};
use tempfile::TempDir;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt as _, BufReader},
    process::{Child, ChildStderr, Command},
    task::JoinHandle,
    time::timeout,
};

use crate::errors::TraceError;

/// Diagnostic lines retained from a tracer's stderr; older lines are discarded.
const DIAGNOSTIC_LINES: usize = 64;

/// Named pipe the tracer writes its trace into, in a private temporary directory removed on drop.
pub struct Fifo {
    path: PathBuf,
    _dir: TempDir,
}

impl Fifo {
    pub fn create() -> Result<Self, TraceError> {
        let dir = tempfile::Builder::new().prefix("dyntrace-").tempdir()?;
        let path = dir.path().join("trace.fifo");
        nix::unistd::mkfifo(
            &path,
            nix::sys::stat::Mode::S_IRUSR | nix::sys::stat::Mode::S_IWUSR,
        )
        .map_err(std::io::Error::from)?;
        Ok(Fifo { path, _dir: dir })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the read end.  A FIFO open blocks until a writer arrives, so this races against `tracer` exiting.  A short
    /// trace can be written completely before this is polled, so a completed open wins over the exit, and after the exit
    /// a pending open is released and the pipe is still read; the session reports a tracer that failed without writing
    /// a trace.
    pub async fn open_reader(&self, tracer: &mut TracerProcess) -> Result<File, TraceError> {
        let path = self.path.clone();
        let mut open = tokio::spawn(async move { File::open(path).await });

        let status = tokio::select! {
            biased;
            file = &mut open => return join_open(file),
            status = tracer.wait() => status,
        };

        debug!("tracer exited with {status:?} before the trace FIFO open completed");
        let file = loop {
            // Non-blocking write open succeeds once the reader's open is pending, which completes that open.
            let _ = OpenOptions::new()
                .write(true)
                .custom_flags(nix::libc::O_NONBLOCK)
                .open(&self.path);
            if let Ok(file) = timeout(Duration::from_millis(20), &mut open).await {
                break join_open(file);
            }
        };

        match file {
            Ok(file) => Ok(file),
            Err(_) if !status.is_some_and(|s| s.success()) => Err(tracer.startup_failure().await),
            Err(e) => Err(e),
        }
    }
}

fn join_open(
    joined: Result<std::io::Result<File>, tokio::task::JoinError>,
) -> Result<File, TraceError> {
    joined
        .map_err(|e| std::io::Error::other(format!("FIFO open task failed: {e}")))?
        .map_err(TraceError::from)
}

/// Confirm `target` is an executable file, searching `PATH` for bare command names.
pub fn resolve_target(target: &Path) -> Result<PathBuf, TraceError> {
    let unavailable = |reason: &str| TraceError::TargetUnavailable {
        path: target.to_path_buf(),
        reason: String::from(reason),
    };

    let candidate = if target.components().count() == 1 && !target.exists() {
        std::env::var_os("PATH")
            .and_then(|paths| {
                std::env::split_paths(&paths)
                    .map(|dir| dir.join(target))
                    .find(|p| p.is_file())
            })
            .ok_or_else(|| unavailable("not found"))?
    } else {
        target.to_path_buf()
    };

    let metadata = match std::fs::metadata(&candidate) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Err(unavailable("not found")),
        Err(e) => return Err(unavailable(&e.to_string())),
    };
    if !metadata.is_file() {
        return Err(unavailable("not a regular file"));
    }
    if metadata.permissions().mode() & 0o111 == 0 {
        return Err(unavailable("not executable"));
    }
    Ok(candidate)
}

/// How a tracer is started: its program and arguments, and the command used to elevate it.
#[derive(Debug, Clone)]
pub struct TracerInvocation {
    pub program: PathBuf,
    pub args: Vec<std::ffi::OsString>,
    /// Non-empty when the tracer runs through an elevation command such as `sudo -n`.
    pub elevation: Vec<String>,
    pub termination_grace: Duration,
}

impl TracerInvocation {
    /// `elevation` is only applied when the request asks for root and this process isn't already root.
    #[must_use]
    pub fn new(program: &Path, run_as_root: bool, elevation: &[String], grace: Duration) -> Self {
        let elevation = if run_as_root && !Uid::effective().is_root() {
            elevation.to_vec()
        } else {
            vec![]
        };
        TracerInvocation {
            program: program.to_path_buf(),
            args: vec![],
            elevation,
            termination_grace: grace,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    #[must_use]
    pub fn is_elevated(&self) -> bool {
        !self.elevation.is_empty()
    }

    fn command(&self) -> Command {
        let mut cmd = match self.elevation.split_first() {
            Some((elevate, elevate_args)) => {
                let mut cmd = Command::new(elevate);
                cmd.args(elevate_args).arg(&self.program);
                cmd
            }
            None => Command::new(&self.program),
        };
        cmd.args(&self.args);
        cmd
    }

    fn spawned_program(&self) -> String {
        match self.elevation.first() {
            Some(elevate) => elevate.clone(),
            None => self.program.to_string_lossy().into_owned(),
        }
    }
}

/// A running tracer (and, through it, the target).  Guarantees the tracer is reaped and the target doesn't outlive
/// the session.
pub struct TracerProcess {
    child: Child,
    invocation: TracerInvocation,
    target_pid: Option<Pid>,
    status: Option<ExitStatus>,
    diagnostics: Arc<Mutex<VecDeque<String>>>,
    stderr_drain: Option<JoinHandle<()>>,
    terminated: bool,
}

impl TracerProcess {
    /// Spawn the tracer.  With `drain_stderr`, stderr is read continuously into the diagnostics buffer; otherwise the
    /// caller takes it with `take_stderr`.
    pub fn spawn(invocation: TracerInvocation, drain_stderr: bool) -> Result<Self, TraceError> {
        let mut cmd = invocation.command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!("spawning tracer: {cmd:?}");

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                TraceError::TracerUnavailable {
                    tracer: invocation.spawned_program(),
                    reason: String::from("not found"),
                }
            } else if e.kind() == ErrorKind::PermissionDenied {
                TraceError::PermissionDenied {
                    reason: format!("unable to execute {}: {e}", invocation.spawned_program()),
                }
            } else {
                TraceError::Io(e)
            }
        })?;

        let diagnostics = Arc::new(Mutex::new(VecDeque::with_capacity(DIAGNOSTIC_LINES)));
        let stderr_drain = if drain_stderr {
            child
                .stderr
                .take()
                .map(|stderr| tokio::spawn(drain(stderr, diagnostics.clone())))
        } else {
            None
        };

        Ok(TracerProcess {
            child,
            invocation,
            target_pid: None,
            status: None,
            diagnostics,
            stderr_drain,
            terminated: false,
        })
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.child.stderr.take()
    }

    /// Record the target's pid once the trace reveals it, so teardown can kill it directly.
    pub fn set_target_pid(&mut self, pid: i32) {
        if self.target_pid.is_none() {
            self.target_pid = Some(Pid::from_raw(pid));
        }
    }

    pub fn record_diagnostic(&self, line: &str) {
        push_diagnostic(&self.diagnostics, line);
    }

    #[must_use]
    pub fn diagnostics(&self) -> Vec<String> {
        match self.diagnostics.lock() {
            Ok(d) => d.iter().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().iter().cloned().collect(),
        }
    }

    #[must_use]
    pub fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// Wait for the tracer to exit.  Cancel safe.
    pub async fn wait(&mut self) -> Option<ExitStatus> {
        if self.status.is_none() {
            match self.child.wait().await {
                Ok(status) => self.status = Some(status),
                Err(e) => warn!("unable to wait for tracer: {e}"),
            }
        }
        self.status
    }

    fn try_wait(&mut self) -> Option<ExitStatus> {
        if self.status.is_none() {
            self.status = self.child.try_wait().ok().flatten();
        }
        self.status
    }

    /// Stop the tracer and target and reap the tracer.  Idempotent.
    pub async fn terminate(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;

        if self.try_wait().is_none() {
            // strace forwards fatal signals to the command it started; the direct kill of the target covers tracers
            // that don't, and targets that ignore SIGTERM.
            if let Some(pid) = self.child.id() {
                self.signal(pid_from(pid), Signal::SIGTERM).await;
            }
            if let Some(target) = self.target_pid {
                self.signal(target, Signal::SIGKILL).await;
            }

            if timeout(self.invocation.termination_grace, self.wait())
                .await
                .is_err()
            {
                warn!(
                    "tracer did not exit within {:?}; killing it",
                    self.invocation.termination_grace
                );
                if let Some(pid) = self.child.id() {
                    self.signal(pid_from(pid), Signal::SIGKILL).await;
                }
                let _ = self.child.start_kill();
                self.wait().await;
            }
        }
        debug!("tracer exited: {:?}", self.status);
        self.finish_diagnostics().await;
    }

    async fn finish_diagnostics(&mut self) {
        if let Some(drain) = self.stderr_drain.take() {
            // stderr stays open while anything the tracer started is alive; don't wait on it indefinitely.
            if timeout(self.invocation.termination_grace, drain).await.is_err() {
                debug!("tracer stderr still open after teardown");
            }
        }
    }

    /// Deliver `signal`, falling back to the elevation command when the process belongs to root.
    async fn signal(&self, pid: Pid, signal: Signal) {
        match kill(pid, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(Errno::EPERM) if self.invocation.is_elevated() => {
                let mut cmd = match self.invocation.elevation.split_first() {
                    Some((elevate, elevate_args)) => {
                        let mut cmd = Command::new(elevate);
                        cmd.args(elevate_args);
                        cmd
                    }
                    None => return,
                };
                cmd.arg("kill")
                    .arg(format!("-{}", signal.as_str().trim_start_matches("SIG")))
                    .arg(pid.as_raw().to_string())
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null());
                trace!("elevated kill: {cmd:?}");
                match cmd.status().await {
                    Ok(status) if status.success() => {}
                    Ok(status) => warn!("elevated {signal} of {pid} failed: {status}"),
                    Err(e) => warn!("elevated {signal} of {pid} failed: {e}"),
                }
            }
            Err(e) => warn!("unable to send {signal} to {pid}: {e}"),
        }
    }

    /// The error for a tracer that ended without producing a trace.
    pub async fn startup_failure(&mut self) -> TraceError {
        self.terminate().await;
        classify_failure(
            &self.invocation.spawned_program(),
            self.status,
            self.diagnostics(),
        )
    }
}

impl Drop for TracerProcess {
    fn drop(&mut self) {
        if self.terminated || self.try_wait().is_some() {
            return;
        }
        // Best effort without blocking; `kill_on_drop` takes care of the tracer itself.
        if let Some(pid) = self.child.id() {
            let _ = kill(pid_from(pid), Signal::SIGTERM);
        }
        if let Some(target) = self.target_pid {
            let _ = kill(target, Signal::SIGKILL);
        }
    }
}

fn pid_from(pid: u32) -> Pid {
    Pid::from_raw(i32::try_from(pid).unwrap_or(i32::MAX))
}

fn push_diagnostic(diagnostics: &Mutex<VecDeque<String>>, line: &str) {
    let mut diagnostics = match diagnostics.lock() {
        Ok(d) => d,
        Err(poisoned) => poisoned.into_inner(),
    };
    if diagnostics.len() == DIAGNOSTIC_LINES {
        diagnostics.pop_front();
    }
    diagnostics.push_back(String::from(line));
}

async fn drain(stderr: ChildStderr, diagnostics: Arc<Mutex<VecDeque<String>>>) {
    let mut lines = BufReader::new(stderr).split(b'\n');
    loop {
        match lines.next_segment().await {
            Ok(Some(bytes)) => {
                let line = String::from_utf8_lossy(&bytes);
                trace!("tracer stderr: {line}");
                push_diagnostic(&diagnostics, line.trim_end());
            }
            Ok(None) => break,
            Err(e) => {
                debug!("tracer stderr read failed: {e}");
                break;
            }
        }
    }
}

const PERMISSION_MARKERS: &[&str] = &[
    "a password is required",
    "not in the sudoers",
    "is not allowed to execute",
    "a terminal is required",
    "Operation not permitted",
    "Permission denied",
    "requires additional privileges",
    "must be run as root",
];

const MISSING_COMMAND_MARKERS: &[&str] = &["command not found", "No such file or directory"];

/// Map a tracer that exited without tracing anything onto the error describing why.
#[must_use]
pub fn classify_failure(
    tracer: &str,
    status: Option<ExitStatus>,
    diagnostics: Vec<String>,
) -> TraceError {
    if let Some(line) = diagnostics
        .iter()
        .find(|line| PERMISSION_MARKERS.iter().any(|m| line.contains(m)))
    {
        return TraceError::PermissionDenied {
            reason: line.clone(),
        };
    }
    if let Some(line) = diagnostics.iter().find(|line| {
        line.starts_with(tracer) && MISSING_COMMAND_MARKERS.iter().any(|m| line.contains(m))
    }) {
        return TraceError::TracerUnavailable {
            tracer: String::from(tracer),
            reason: line.clone(),
        };
    }
    TraceError::TraceFailed {
        status,
        diagnostics,
    }
}
