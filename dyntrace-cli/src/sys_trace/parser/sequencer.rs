// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;

use log::debug;

use super::decoder::errno_value;
use super::tokenizer::{CallOutcome, CallSegment, Retval, TokenizerOutput};

/// A syscall whose invocation and completion have both been seen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedCall {
    pub pid: Option<i32>,
    pub name: String,
    /// Raw argument text; for calls that were interrupted by another thread's output this is the unfinished and
    /// resumed halves joined together.
    pub args: String,
    pub result: i64,
    pub errno: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencerOutput {
    Call(CompletedCall),
    Exit { pid: Option<i32> },
}

#[derive(Debug)]
struct PendingCall {
    name: String,
    args: String,
}

/// Reassembles `<unfinished ...>` / `<... resumed>` pairs.  Strace emits these when a thread blocks in a syscall and
/// another thread's output is written before the first one returns:
///
/// - `25979 read(3,  <unfinished ...>`
/// - `26006 close(4) = 0`
/// - `25979 <... read resumed>"data", 4096) = 4`
///
/// The pending half is held per pid; the completed call is emitted when the resumed half arrives, so records are in
/// completion order.
#[derive(Debug, Default)]
pub struct Sequencer {
    pending: HashMap<Option<i32>, PendingCall>,
}

impl Sequencer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` for lines that don't complete a syscall: unfinished halves, and calls that never returned.
    pub fn sequence(&mut self, output: &TokenizerOutput<'_>) -> Option<SequencerOutput> {
        let segment = match output {
            TokenizerOutput::Exit { pid } => {
                if let Some(pending) = self.pending.remove(pid) {
                    debug!("{pid:?} exited during {}(...)", pending.name);
                }
                return Some(SequencerOutput::Exit { pid: *pid });
            }
            TokenizerOutput::Call(segment) => segment,
        };

        match segment.outcome {
            CallOutcome::Complete(retval) => {
                completed(segment, String::from(segment.args), retval).map(SequencerOutput::Call)
            }
            CallOutcome::Unfinished => {
                let previous = self.pending.insert(
                    segment.pid,
                    PendingCall {
                        name: String::from(segment.name),
                        args: String::from(segment.args),
                    },
                );
                if let Some(previous) = previous {
                    debug!(
                        "{:?} started {} while {} was still unfinished; dropping the earlier call",
                        segment.pid, segment.name, previous.name
                    );
                }
                None
            }
            CallOutcome::Resumed(retval) => {
                let Some(pending) = self.pending.remove(&segment.pid) else {
                    debug!(
                        "{:?} resumed {} with no unfinished call on record",
                        segment.pid, segment.name
                    );
                    return None;
                };
                if pending.name != segment.name {
                    debug!(
                        "{:?} resumed {} but {} was unfinished",
                        segment.pid, segment.name, pending.name
                    );
                    return None;
                }
                let args = join_arguments(&pending.args, segment.args);
                completed(segment, args, retval).map(SequencerOutput::Call)
            }
        }
    }

    /// Calls that were started but never resumed before the trace ended.
    #[must_use]
    pub fn unfinished_count(&self) -> usize {
        self.pending.len()
    }
}

fn completed(segment: &CallSegment<'_>, args: String, retval: Retval<'_>) -> Option<CompletedCall> {
    let (result, errno) = match retval {
        Retval::Success(v) => (v, 0),
        Retval::Failure(v, code) => (v, errno_value(code)),
        Retval::NoReturn => {
            debug!("{:?} {}(...) did not return", segment.pid, segment.name);
            return None;
        }
    };
    Some(CompletedCall {
        pid: segment.pid,
        name: String::from(segment.name),
        args,
        result,
        errno,
    })
}

fn join_arguments(unfinished: &str, resumed: &str) -> String {
    let head = unfinished.trim_end().trim_end_matches(',').trim_end();
    let tail = resumed.trim_start().trim_start_matches(',').trim_start();
    if head.is_empty() {
        String::from(tail)
    } else if tail.is_empty() {
        String::from(head)
    } else if tail.starts_with("=>") {
        format!("{head} {tail}")
    } else {
        format!("{head}, {tail}")
    }
}
