// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use log::{debug, trace};

use self::attribution::ProcessTracker;
use self::decoder::decode_args;
use self::sequencer::Sequencer;
use self::tokenizer::{TokenizerOutput, tokenize};
use super::record::SyscallRecord;

pub mod attribution;
pub mod decoder;
pub mod sequencer;
pub mod tokenizer;

pub use self::tokenizer::Dialect;

/// Turns tracer output into `SyscallRecord`s, one line at a time.  Pure; no I/O.
#[derive(Debug)]
pub struct TraceParser {
    dialect: Dialect,
    sequencer: Sequencer,
    tracker: ProcessTracker,
    syscall_filter: Option<String>,
    follow_children: bool,
    recognized_lines: usize,
    skipped_lines: usize,
}

impl TraceParser {
    #[must_use]
    pub fn new(dialect: Dialect) -> Self {
        TraceParser {
            dialect,
            sequencer: Sequencer::new(),
            tracker: ProcessTracker::new(),
            syscall_filter: None,
            follow_children: false,
            recognized_lines: 0,
            skipped_lines: 0,
        }
    }

    /// Only emit calls with exactly this name; `write_nocancel` doesn't match `write`.
    #[must_use]
    pub fn syscall_filter(mut self, name: Option<String>) -> Self {
        self.syscall_filter = name;
        self
    }

    #[must_use]
    pub fn follow_children(mut self, follow: bool) -> Self {
        self.follow_children = follow;
        self
    }

    pub fn feed(&mut self, line: &str) -> Vec<SyscallRecord> {
        let Some(tokens) = tokenize(self.dialect, line) else {
            debug!("skipping trace line: {line:?}");
            self.skipped_lines += 1;
            return vec![];
        };
        if matches!(tokens, TokenizerOutput::Call(_)) {
            self.recognized_lines += 1;
        }

        let Some(sequenced) = self.sequencer.sequence(&tokens) else {
            return vec![];
        };

        let mut records = vec![];
        for attributed in self.tracker.track(sequenced) {
            if !attributed.is_target && !self.follow_children {
                continue;
            }
            let call = attributed.call;
            if self
                .syscall_filter
                .as_ref()
                .is_some_and(|filter| *filter != call.name)
            {
                continue;
            }
            let record = SyscallRecord {
                pid: attributed.tgid.0,
                args: decode_args(&call.args, self.dialect),
                name: call.name,
                result: call.result,
                errno: call.errno,
            };
            trace!("{record}");
            records.push(record);
        }
        records
    }

    /// Discards state for calls that never completed; called once the tracer's output has ended.
    pub fn finish(&mut self) {
        let unfinished = self.sequencer.unfinished_count();
        if unfinished > 0 {
            debug!("{unfinished} syscalls were still unfinished at the end of the trace");
        }
        let held = self.tracker.finish();
        if held > 0 {
            debug!("{held} syscalls from unannounced tasks were discarded");
        }
    }

    /// Lines that matched the syscall grammar, whether or not they produced a record.
    #[must_use]
    pub fn recognized_lines(&self) -> usize {
        self.recognized_lines
    }

    #[must_use]
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    #[must_use]
    pub fn target_pid(&self) -> Option<i32> {
        self.tracker.target().map(|t| t.0)
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::{Dialect, TraceParser};
    use crate::sys_trace::record::ArgValue;

    const STRACE_SESSION: &str = r#"strace: Process 4000 attached
4000 execve("/tmp/hello", ["/tmp/hello"], 0x7ffd2c5e6e38 /* 26 vars */) = 0
4000 brk(NULL)                         = 0x55ad8bba6000
4000 clone(child_stack=NULL, flags=CLONE_CHILD_CLEARTID|CLONE_CHILD_SETTID|SIGCHLD, child_tidptr=0x7f9f93f88a10) = 4001
4001 write(1, "from child\n", 11) = 11
4001 +++ exited with 0 +++
4000 --- SIGCHLD {si_signo=SIGCHLD, si_code=CLD_EXITED, si_pid=4001, si_uid=1000, si_status=0, si_utime=0, si_stime=0} ---
4000 write(1, "Hello, world!\n", 14) = 14
4000 exit_group(0)                     = ?
4000 +++ exited with 0 +++
"#;

    fn parse_all(parser: &mut TraceParser, text: &str) -> Vec<crate::sys_trace::record::SyscallRecord> {
        let mut records = vec![];
        for line in text.lines() {
            records.extend(parser.feed(line));
        }
        parser.finish();
        records
    }

    #[test]
    fn single_target_only() {
        let mut parser = TraceParser::new(Dialect::Strace);
        let records = parse_all(&mut parser, STRACE_SESSION);
        assert_eq!(parser.target_pid(), Some(4000));
        assert!(records.iter().all(|r| r.pid == 4000));
        let names: Vec<_> = records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["execve", "brk", "clone", "write"]);
        // banner, blank trailing line excluded by lines(), SIGCHLD notice
        assert_eq!(parser.skipped_lines(), 2);
    }

    #[test]
    fn follow_children() {
        let mut parser = TraceParser::new(Dialect::Strace).follow_children(true);
        let records = parse_all(&mut parser, STRACE_SESSION);
        let child: Vec<_> = records.iter().filter(|r| r.pid == 4001).collect();
        assert_eq!(child.len(), 1);
        assert_eq!(child[0].args[1], "from child\n");
    }

    #[test]
    fn filter_is_exact() -> Result<()> {
        let mut parser =
            TraceParser::new(Dialect::Strace).syscall_filter(Some(String::from("write")));
        let records = parse_all(&mut parser, STRACE_SESSION);
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.name, "write");
        assert_eq!(
            record.args,
            vec![
                ArgValue::Integer(1),
                ArgValue::from("Hello, world!\n"),
                ArgValue::Integer(14)
            ]
        );
        assert_eq!(record.result, 14);
        assert_eq!(record.errno, 0);

        let mut parser =
            TraceParser::new(Dialect::Strace).syscall_filter(Some(String::from("wri")));
        assert!(parse_all(&mut parser, STRACE_SESSION).is_empty());
        Ok(())
    }

    #[test]
    fn dtruss_hello_world() {
        let text = "SYSCALL(args) \t\t = return\n\
                    4510/0x1e4d1:  open_nocancel(\"/dev/dtracehelper\\0\", 0x2, 0x0)\t\t = 3 0\n\
                    4510/0x1e4d1:  write_nocancel(0x1, \"Hello, world!\\n\\0\", 0xE)\t\t = 14 0\n\
                    4510/0x1e4d1:  open(\"/nope\\0\", 0x0, 0x0)\t\t = -1 Err#2\n";
        let mut parser =
            TraceParser::new(Dialect::Dtruss).syscall_filter(Some(String::from("write_nocancel")));
        let records = parse_all(&mut parser, text);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pid, 4510);
        assert_eq!(records[0].args[0], 1);
        assert_eq!(records[0].args[1], "Hello, world!\n");
        assert_eq!(records[0].args[2], 14);
        assert_eq!(records[0].result, 14);

        let mut parser =
            TraceParser::new(Dialect::Dtruss).syscall_filter(Some(String::from("write")));
        assert!(parse_all(&mut parser, text).is_empty());

        let mut parser = TraceParser::new(Dialect::Dtruss).syscall_filter(Some(String::from("open")));
        let records = parse_all(&mut parser, text);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].errno, 2);
        assert!(records[0].failed());
    }
}
