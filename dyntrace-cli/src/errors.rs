// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("target executable {path:?} is unavailable: {reason}")]
    TargetUnavailable { path: PathBuf, reason: String },

    #[error("tracer `{tracer}` is unavailable: {reason}")]
    TracerUnavailable { tracer: String, reason: String },

    #[error("insufficient privileges to trace: {reason}")]
    PermissionDenied { reason: String },

    #[error("tracer failed with status {status:?}; diagnostics: {diagnostics:?}")]
    TraceFailed {
        status: Option<ExitStatus>,
        diagnostics: Vec<String>,
    },

    #[error("i/o error while tracing: `{0}`")]
    Io(#[from] std::io::Error),
}

impl TraceError {
    /// Process exit code the CLI reports for this error.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            TraceError::PermissionDenied { .. } => 2,
            TraceError::TargetUnavailable { .. }
            | TraceError::TracerUnavailable { .. }
            | TraceError::TraceFailed { .. }
            | TraceError::Io(_) => 1,
        }
    }
}
