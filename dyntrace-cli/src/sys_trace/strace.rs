// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{path::PathBuf, process::Command as SyncCommand, process::Stdio};

use log::debug;

use crate::config::TraceConfig;
use crate::errors::TraceError;

use super::{
    Dialect, LaunchedTrace, SessionLimits, TraceOutput, TraceRequest, TraceSource,
    process::{Fifo, TracerInvocation, TracerProcess, resolve_target},
};

/// Calls attribution needs to see in every trace, whatever else is filtered out.
const PROCESS_LIFECYCLE: &str = "%process";

/// Implementation of `TraceSource` that runs the target under `strace --follow-forks`, reading the trace from a FIFO.
#[derive(Debug, Clone)]
pub struct StraceSource {
    program: PathBuf,
    elevation: Vec<String>,
    string_limit: u32,
    limits: SessionLimits,
}

impl StraceSource {
    #[must_use]
    pub fn new(config: &TraceConfig) -> Self {
        StraceSource {
            program: config.strace_path.clone(),
            elevation: config.elevation_command.clone(),
            string_limit: config.string_limit,
            limits: SessionLimits::from(config),
        }
    }

    /// Whether strace is installed and runnable by this user.
    #[must_use]
    pub fn is_available(&self) -> bool {
        let output = SyncCommand::new(&self.program)
            .arg("--help")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match output {
            Ok(status) => status.success(),
            Err(_) => false,
        }
    }

    fn invocation(&self, request: &TraceRequest, target: PathBuf, fifo: &Fifo) -> TracerInvocation {
        let mut invocation = TracerInvocation::new(
            &self.program,
            request.is_run_as_root(),
            &self.elevation,
            self.limits.termination_grace,
        )
        .arg("--follow-forks")
        .arg(format!("--string-limit={}", self.string_limit))
        .arg("--strings-in-hex=non-ascii-chars");
        if let Some(syscalls) = request.tracer_syscall_set() {
            let mut set = syscalls.join(",");
            set.push(',');
            set.push_str(PROCESS_LIFECYCLE);
            invocation = invocation.arg(format!("--trace={set}"));
        }
        invocation = invocation.arg("--output").arg(fifo.path()).arg(target);
        for arg in request.target_args() {
            invocation = invocation.arg(arg);
        }
        invocation
    }
}

impl TraceSource for StraceSource {
    fn name(&self) -> &str {
        "strace"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Strace
    }

    fn renders_socket_addresses(&self) -> bool {
        true
    }

    fn limits(&self) -> SessionLimits {
        self.limits
    }

    async fn launch(&self, request: &TraceRequest) -> Result<LaunchedTrace, TraceError> {
        let target = resolve_target(request.target())?;

        // strace writes to a named pipe, read as the data streams in, so the trace never has to be held on disk.
        let fifo = Fifo::create()?;
        let invocation = self.invocation(request, target, &fifo);
        let mut process = TracerProcess::spawn(invocation, true)?;
        let file = fifo.open_reader(&mut process).await?;
        debug!("strace trace FIFO opened");

        Ok(LaunchedTrace {
            output: TraceOutput::from_fifo(file),
            process: Some(process),
        })
    }
}
