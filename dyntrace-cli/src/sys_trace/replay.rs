// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::path::Path;

use crate::errors::TraceError;

use super::{Dialect, LaunchedTrace, SessionLimits, TraceOutput, TraceRequest, TraceSource};

/// Implementation of `TraceSource` that plays back previously captured trace text without running anything.  The
/// request's target and arguments are ignored; its filters, timeout and child handling apply as usual.
#[derive(Debug, Clone)]
pub struct ReplaySource {
    dialect: Dialect,
    text: String,
    hold_open: bool,
    limits: SessionLimits,
}

impl ReplaySource {
    #[must_use]
    pub fn new(dialect: Dialect, text: impl Into<String>) -> Self {
        ReplaySource {
            dialect,
            text: text.into(),
            hold_open: false,
            limits: SessionLimits::default(),
        }
    }

    pub fn from_file(dialect: Dialect, path: &Path) -> Result<Self, TraceError> {
        let bytes = std::fs::read(path)?;
        Ok(Self::new(dialect, String::from_utf8_lossy(&bytes)))
    }

    /// Keep the stream open after the last line, like a tracer whose target never exits.
    #[must_use]
    pub fn hold_open(mut self, hold_open: bool) -> Self {
        self.hold_open = hold_open;
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: SessionLimits) -> Self {
        self.limits = limits;
        self
    }
}

impl TraceSource for ReplaySource {
    fn name(&self) -> &str {
        "replay"
    }

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn renders_socket_addresses(&self) -> bool {
        self.dialect == Dialect::Strace
    }

    fn limits(&self) -> SessionLimits {
        self.limits
    }

    async fn launch(&self, _request: &TraceRequest) -> Result<LaunchedTrace, TraceError> {
        Ok(LaunchedTrace {
            output: TraceOutput::Replay {
                lines: self.text.lines().map(String::from).collect(),
                hold_open: self.hold_open,
            },
            process: None,
        })
    }
}
