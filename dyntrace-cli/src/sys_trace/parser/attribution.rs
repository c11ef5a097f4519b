// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;

use log::debug;

use super::sequencer::{CompletedCall, SequencerOutput};

/// Kernel task id as printed in a trace line; a thread's id, or the process id for its main thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadId(pub i32);

/// Process id; every thread of a process shares it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadGroupId(pub i32);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributedCall {
    pub tgid: ThreadGroupId,
    /// `true` when the call came from the traced target rather than a child process it created.
    pub is_target: bool,
    pub call: CompletedCall,
}

/// Folds thread ids into their process and tells the target's calls apart from its children's.
///
/// The first call seen (the target's `execve`) identifies the target.  Process-creation calls register the ids they
/// return: `clone`/`clone3` with `CLONE_THREAD` add a thread to the caller's process, anything else starts a new
/// process.  There's no guarantee the creating call returns to the parent before the new task starts running, so:
///
/// - `25979 clone3({flags=...|CLONE_THREAD|...} <unfinished ...>`
/// - `26006 close(3) = 0`
/// - `25979 <... clone3 resumed> => {parent_tid=[26006]}, 88) = 26006`
///
/// Calls from ids that aren't registered yet are held, and released immediately after the creating call.  This is
/// the only reordering of calls; held calls from an id that never gets registered are discarded.
#[derive(Debug, Default)]
pub struct ProcessTracker {
    target: Option<ThreadGroupId>,
    thread_groups: HashMap<ThreadId, ThreadGroupId>,
    held: HashMap<ThreadId, Vec<CompletedCall>>,
}

impl ProcessTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn target(&self) -> Option<ThreadGroupId> {
        self.target
    }

    /// Typically returns one call, but can return none when a call is held for an unknown id, or several when a
    /// process-creation call releases held calls.
    pub fn track(&mut self, output: SequencerOutput) -> Vec<AttributedCall> {
        let mut emitted = Vec::new();
        match output {
            SequencerOutput::Call(call) => self.attribute(call, &mut emitted),
            SequencerOutput::Exit { pid } => {
                let tid = ThreadId(self.thread_id(pid));
                // Exited ids can be reused by the kernel for an unrelated task.
                if Some(ThreadGroupId(tid.0)) != self.target {
                    self.thread_groups.remove(&tid);
                }
                if let Some(held) = self.held.remove(&tid) {
                    debug!("discarding {} held syscalls from exited {tid:?}", held.len());
                }
            }
        }
        emitted
    }

    /// Number of held calls that were never released; they're dropped.
    pub fn finish(&mut self) -> usize {
        let count = self.held.values().map(Vec::len).sum();
        for (tid, held) in self.held.drain() {
            debug!("discarding {} held syscalls from unannounced {tid:?}", held.len());
        }
        count
    }

    fn thread_id(&self, pid: Option<i32>) -> i32 {
        // Traces without pid prefixes only ever come from a single task.
        pid.unwrap_or_else(|| self.target.map_or(0, |t| t.0))
    }

    fn attribute(&mut self, call: CompletedCall, emitted: &mut Vec<AttributedCall>) {
        let tid = ThreadId(self.thread_id(call.pid));

        let tgid = if let Some(tgid) = self.thread_groups.get(&tid) {
            *tgid
        } else if self.target.is_none() {
            let tgid = ThreadGroupId(tid.0);
            debug!("target process is {tgid:?}");
            self.target = Some(tgid);
            self.thread_groups.insert(tid, tgid);
            tgid
        } else {
            debug!("holding syscall from unannounced {tid:?}: {}", call.name);
            self.held.entry(tid).or_default().push(call);
            return;
        };

        let created = created_task(&call, tgid);
        emitted.push(AttributedCall {
            tgid,
            is_target: Some(tgid) == self.target,
            call,
        });

        if let Some((child, child_tgid)) = created {
            self.thread_groups.insert(child, child_tgid);
            if let Some(held) = self.held.remove(&child) {
                debug!("releasing {} held syscalls from {child:?}", held.len());
                for call in held {
                    self.attribute(call, emitted);
                }
            }
        }
    }
}

/// The task a successful process-creation call started, and the process it belongs to.
fn created_task(call: &CompletedCall, caller: ThreadGroupId) -> Option<(ThreadId, ThreadGroupId)> {
    let is_clone = matches!(call.name.as_str(), "clone" | "clone3");
    let is_fork = matches!(call.name.as_str(), "fork" | "vfork");
    if !(is_clone || is_fork) || call.errno != 0 || call.result <= 0 {
        return None;
    }
    let child = i32::try_from(call.result).ok()?;
    if is_clone && call.args.contains("CLONE_THREAD") {
        Some((ThreadId(child), caller))
    } else {
        Some((ThreadId(child), ThreadGroupId(child)))
    }
}

#[cfg(test)]
mod tests {
    use anyhow::{Result, anyhow};

    use super::{AttributedCall, ProcessTracker, ThreadGroupId};
    use crate::sys_trace::parser::sequencer::Sequencer;
    use crate::sys_trace::parser::tokenizer::{Dialect, tokenize};

    struct Harness {
        sequencer: Sequencer,
        tracker: ProcessTracker,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                sequencer: Sequencer::new(),
                tracker: ProcessTracker::new(),
            }
        }

        fn feed(&mut self, line: &str) -> Result<Vec<AttributedCall>> {
            let tokens = tokenize(Dialect::Strace, line).ok_or_else(|| anyhow!("untokenizable: {line}"))?;
            Ok(match self.sequencer.sequence(&tokens) {
                Some(output) => self.tracker.track(output),
                None => vec![],
            })
        }
    }

    #[test]
    fn passthrough() -> Result<()> {
        let mut h = Harness::new();
        let t = h.feed(r"1234321 close(3)                        = 0")?;
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].tgid, ThreadGroupId(1_234_321));
        assert!(t[0].is_target);
        assert_eq!(h.tracker.target(), Some(ThreadGroupId(1_234_321)));
        Ok(())
    }

    #[test]
    fn thread_folded_into_process() -> Result<()> {
        let mut h = Harness::new();
        h.feed(r"15615 close(3)                        = 0")?;
        let t = h.feed(r"15615 clone3({flags=CLONE_VM|CLONE_FS|CLONE_FILES|CLONE_SIGHAND|CLONE_THREAD|CLONE_SYSVSEM|CLONE_SETTLS|CLONE_PARENT_SETTID|CLONE_CHILD_CLEARTID, child_tid=0x7f67099ff990, parent_tid=0x7f67099ff990, exit_signal=0, stack=0x7f67091ff000, stack_size=0x7fff80, tls=0x7f67099ff6c0} => {parent_tid=[0]}, 88) = 15620")?;
        assert_eq!(t.len(), 1);

        let t = h.feed(r"15620 close(3)                        = 0")?;
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].tgid, ThreadGroupId(15615));
        assert!(t[0].is_target);
        Ok(())
    }

    #[test]
    fn held_until_clone_resumes() -> Result<()> {
        let mut h = Harness::new();
        h.feed(r"15615 close(3)                        = 0")?;

        let t = h.feed(r"15615 clone3({flags=CLONE_VM|CLONE_FS|CLONE_FILES|CLONE_SIGHAND|CLONE_THREAD|CLONE_SYSVSEM|CLONE_SETTLS|CLONE_PARENT_SETTID|CLONE_CHILD_CLEARTID, child_tid=0x7f67099ff990, parent_tid=0x7f67099ff990, exit_signal=0, stack=0x7f67091ff000, stack_size=0x7fff80, tls=0x7f67099ff6c0} <unfinished ...>")?;
        assert_eq!(t.len(), 0);

        // held; 15620 hasn't been returned from clone3 yet
        let t = h.feed(r"15620 close(4)                        = 0")?;
        assert_eq!(t.len(), 0);

        let t = h.feed(r"15615 <... clone3 resumed> => {parent_tid=[15620]}, 88) = 15620")?;
        assert_eq!(t.len(), 2);
        assert_eq!(t[0].call.name, "clone3");
        assert_eq!(t[0].call.result, 15620);
        assert_eq!(t[1].call.name, "close");
        assert_eq!(t[1].call.args, "4");
        assert_eq!(t[1].tgid, ThreadGroupId(15615));
        Ok(())
    }

    #[test]
    fn child_process_is_not_target() -> Result<()> {
        let mut h = Harness::new();
        h.feed(r#"3000 execve("/bin/sh", ["sh"], 0x7ffd /* 20 vars */) = 0"#)?;
        h.feed(r"3000 clone(child_stack=NULL, flags=CLONE_CHILD_CLEARTID|CLONE_CHILD_SETTID|SIGCHLD, child_tidptr=0x7f9f93f88a10) = 3001")?;
        let t = h.feed(r"3001 close(3) = 0")?;
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].tgid, ThreadGroupId(3001));
        assert!(!t[0].is_target);

        let t = h.feed(r"3001 vfork() = 3002")?;
        assert_eq!(t.len(), 1);
        let t = h.feed(r"3002 close(3) = 0")?;
        assert_eq!(t[0].tgid, ThreadGroupId(3002));
        assert!(!t[0].is_target);
        Ok(())
    }

    #[test]
    fn failed_clone_registers_nothing() -> Result<()> {
        let mut h = Harness::new();
        h.feed(r"3000 close(3) = 0")?;
        h.feed(r"3000 clone(child_stack=NULL, flags=SIGCHLD) = -1 EAGAIN (Resource temporarily unavailable)")?;
        let t = h.feed(r"3001 close(3) = 0")?;
        assert!(t.is_empty());
        assert_eq!(h.tracker.finish(), 1);
        Ok(())
    }
}
