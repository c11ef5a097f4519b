// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;

use crate::config::TraceConfig;
use crate::errors::TraceError;

use super::{
    Dialect, LaunchedTrace, SessionLimits, TraceOutput, TraceRequest, TraceSource,
    process::{TracerInvocation, TracerProcess, resolve_target},
};

/// Implementation of `TraceSource` for macOS' `dtruss`.  dtruss prints its trace on stderr, mixed with dtrace's own
/// diagnostics, and renders socket addresses as bare pointers, so it can't be used for connection tracking.
#[derive(Debug, Clone)]
pub struct DtrussSource {
    program: PathBuf,
    elevation: Vec<String>,
    limits: SessionLimits,
}

impl DtrussSource {
    #[must_use]
    pub fn new(config: &TraceConfig) -> Self {
        DtrussSource {
            program: config.dtruss_path.clone(),
            elevation: config.elevation_command.clone(),
            limits: SessionLimits::from(config),
        }
    }

    // Connection tracking never reaches dtruss, so the request's tracer-side syscall set doesn't apply here.
    fn invocation(&self, request: &TraceRequest, target: PathBuf) -> TracerInvocation {
        let mut invocation = TracerInvocation::new(
            &self.program,
            request.is_run_as_root(),
            &self.elevation,
            self.limits.termination_grace,
        )
        .arg("-f")
        .arg(target);
        for arg in request.target_args() {
            invocation = invocation.arg(arg);
        }
        invocation
    }
}

impl TraceSource for DtrussSource {
    fn name(&self) -> &str {
        "dtruss"
    }

    fn dialect(&self) -> Dialect {
        Dialect::Dtruss
    }

    fn renders_socket_addresses(&self) -> bool {
        false
    }

    fn limits(&self) -> SessionLimits {
        self.limits
    }

    async fn launch(&self, request: &TraceRequest) -> Result<LaunchedTrace, TraceError> {
        let target = resolve_target(request.target())?;
        let invocation = self.invocation(request, target);

        let mut process = TracerProcess::spawn(invocation, false)?;
        let stderr = process
            .take_stderr()
            .ok_or_else(|| std::io::Error::other("dtruss stderr was not captured"))?;

        Ok(LaunchedTrace {
            output: TraceOutput::from_stderr(stderr),
            process: Some(process),
        })
    }
}
