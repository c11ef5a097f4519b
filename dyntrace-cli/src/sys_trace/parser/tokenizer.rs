// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::str::FromStr;

use winnow::ascii::{digit1, hex_digit1, multispace0, multispace1, oct_digit1, space0};
use winnow::combinator::{alt, opt, preceded, terminated};
use winnow::error::{ContextError, ErrMode};
use winnow::token::{literal, one_of, rest, take_while};
use winnow::{ModalResult, Parser};

/// Output format family of a tracer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// `strace -f`: `1234 write(1, "hi\n", 3) = 3`
    Strace,
    /// `dtruss -f`: `1234/0x5678:  write_nocancel(0x1, "hi\n\0", 0x3)		 = 3 0`
    Dtruss,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode<'a> {
    /// Symbolic errno, eg. `ECONNREFUSED`; strace prints these.
    Name(&'a str),
    /// Numeric errno; dtruss prints these.
    Number(i32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retval<'a> {
    Success(i64),
    Failure(i64, ErrorCode<'a>),
    /// `= ?`; the call never returned (`exit_group`, a process killed mid-call, or an `ERESTARTSYS` interruption that
    /// will be traced again when the call restarts).
    NoReturn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome<'a> {
    /// Invocation and completion on a single line.
    Complete(Retval<'a>),
    /// Another pid's syscall interrupted the trace of this one; the rest comes in a later "resumed" line.
    Unfinished,
    /// Completion of an earlier `Unfinished` call on the same pid.
    Resumed(Retval<'a>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallSegment<'a> {
    /// Thread id for strace, process id for dtruss; `None` when the tracer didn't prefix the line.
    pub pid: Option<i32>,
    pub name: &'a str,
    /// Argument list exactly as rendered between the parentheses (or the partial list for unfinished/resumed lines).
    pub args: &'a str,
    pub outcome: CallOutcome<'a>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerOutput<'a> {
    Call(CallSegment<'a>),
    /// `+++ exited with 0 +++` or `+++ killed by SIGKILL +++`.
    Exit { pid: Option<i32> },
}

/// Tokenize one line of tracer output.  `None` is returned for anything that isn't a syscall or process exit -- banners,
/// blank lines, signal notices, attach/detach notices, and text that doesn't fit the dialect's grammar.
#[must_use]
pub fn tokenize(dialect: Dialect, line: &str) -> Option<TokenizerOutput<'_>> {
    let line = line.trim_end();
    match dialect {
        Dialect::Strace => strace_line.parse(line).ok(),
        Dialect::Dtruss => dtruss_line.parse(line).ok(),
    }
}

fn backtrack<O>() -> ModalResult<O> {
    Err(ErrMode::Backtrack(ContextError::new()))
}

fn strace_line<'i>(input: &mut &'i str) -> ModalResult<TokenizerOutput<'i>> {
    let pid = opt(strace_pid_prefix).parse_next(input)?;
    let _ = opt(terminated(strace_timestamp, multispace1)).parse_next(input)?;
    alt((
        preceded(alt((proc_exit, proc_killed)), rest).map(move |_| TokenizerOutput::Exit { pid }),
        resumed_call.map(move |(name, args, outcome)| {
            TokenizerOutput::Call(CallSegment {
                pid,
                name,
                args,
                outcome,
            })
        }),
        started_call.map(move |(name, args, outcome)| {
            TokenizerOutput::Call(CallSegment {
                pid,
                name,
                args,
                outcome,
            })
        }),
    ))
    .parse_next(input)
}

fn strace_pid_prefix(input: &mut &str) -> ModalResult<i32> {
    alt((
        terminated(parse_pid, multispace1),
        (literal("[pid"), multispace1, parse_pid, literal("]"), multispace1).map(|(_, _, pid, _, _)| pid),
    ))
    .parse_next(input)
}

/// Accepts the `-t`, `-tt` and `-ttt` timestamp forms; the value isn't retained.
fn strace_timestamp<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    alt((
        (digit1, literal(":"), digit1, literal(":"), digit1, opt((literal("."), digit1))).take(),
        (digit1, literal("."), digit1).take(),
    ))
    .parse_next(input)
}

fn parse_pid(input: &mut &str) -> ModalResult<i32> {
    digit1.try_map(i32::from_str).parse_next(input)
}

fn proc_exit<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    (literal("+++ exited with "), digit1, literal(" +++")).take().parse_next(input)
}

fn proc_killed<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    literal("+++ killed by ").parse_next(input)
}

fn function_name<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    take_while(1.., |c: char| c.is_ascii_alphanumeric() || c == '_').parse_next(input)
}

fn started_call<'i>(input: &mut &'i str) -> ModalResult<(&'i str, &'i str, CallOutcome<'i>)> {
    let name = function_name(input)?;
    let _ = literal("(").parse_next(input)?;
    let args = argument_text(input)?;
    let outcome = alt((
        complete_outcome.map(CallOutcome::Complete),
        unfinished_outcome,
    ))
    .parse_next(input)?;
    Ok((name, args.trim_end(), outcome))
}

fn resumed_call<'i>(input: &mut &'i str) -> ModalResult<(&'i str, &'i str, CallOutcome<'i>)> {
    let _ = literal("<... ").parse_next(input)?;
    let name = alt((function_name, literal("???"))).parse_next(input)?;
    let _ = literal(" resumed>").parse_next(input)?;
    // A process that dies mid-call: `<... read resumed> <unfinished ...>) = ?`
    let terminated_early = opt((space0, literal("<unfinished ...>)"), space0, literal("= ?")))
        .parse_next(input)?;
    if terminated_early.is_some() {
        return Ok((name, "", CallOutcome::Resumed(Retval::NoReturn)));
    }
    let args = argument_text(input)?;
    let retval = complete_outcome(input)?;
    Ok((name, args, CallOutcome::Resumed(retval)))
}

fn unfinished_outcome<'i>(input: &mut &'i str) -> ModalResult<CallOutcome<'i>> {
    let _ = multispace0(input)?;
    let _ = literal("<unfinished ...>").parse_next(input)?;
    // `exit_group(0 <unfinished ...>) = ?` never gets a resumed line.
    let closed = opt((literal(")"), multispace0, literal("= ?"), rest)).parse_next(input)?;
    Ok(match closed {
        Some(_) => CallOutcome::Complete(Retval::NoReturn),
        None => CallOutcome::Unfinished,
    })
}

fn complete_outcome<'i>(input: &mut &'i str) -> ModalResult<Retval<'i>> {
    let _ = literal(")").parse_next(input)?;
    let _ = multispace0(input)?;
    let _ = literal("=").parse_next(input)?;
    let _ = multispace0(input)?;
    alt((
        preceded(literal("?"), rest).map(|_| Retval::NoReturn),
        strace_retval,
    ))
    .parse_next(input)
}

fn strace_retval<'i>(input: &mut &'i str) -> ModalResult<Retval<'i>> {
    let value = integer_literal(input)?;
    let remainder = rest(input)?.trim_start();
    if value < 0 {
        let errname = remainder.split_whitespace().next().unwrap_or("");
        if is_errno_name(errname) {
            return Ok(Retval::Failure(value, ErrorCode::Name(errname)));
        }
    }
    // Anything else trailing the value is an annotation, eg. `= 1 ([{fd=3, revents=POLLIN}])` or
    // `= 0x2 (flags O_RDWR)`.
    Ok(Retval::Success(value))
}

fn is_errno_name(word: &str) -> bool {
    let mut chars = word.chars();
    chars.next() == Some('E')
        && word.len() > 1
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Decimal, `0`-prefixed octal or `0x` hex, optionally negative.  Hex values wider than `i64` keep their
/// two's-complement bit pattern, the way C would see them.
pub(crate) fn integer_literal(input: &mut &str) -> ModalResult<i64> {
    let negative = opt(literal("-")).parse_next(input)?.is_some();
    let value = alt((
        preceded(alt((literal("0x"), literal("0X"))), hex_digit1)
            .try_map(|hex| u64::from_str_radix(hex, 16))
            .map(|v| i64::from_ne_bytes(v.to_ne_bytes())),
        preceded(literal("0"), oct_digit1).try_map(|oct| i64::from_str_radix(oct, 8)),
        digit1.try_map(i64::from_str),
    ))
    .parse_next(input)?;
    Ok(if negative { value.wrapping_neg() } else { value })
}

/// Consumes an argument list up to, but not including, the `)` that closes the call or the `<unfinished ...>` marker.
/// Quotes, escapes and `()[]{}` nesting are respected so that a `)` within a string or structure doesn't end the list.
fn argument_text<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    let text: &'i str = *input;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, c) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '(' | '[' | '{' => depth += 1,
            ')' if depth == 0 => {
                let (args, remaining) = text.split_at(idx);
                *input = remaining;
                return Ok(args);
            }
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            '<' if depth == 0 => {
                let (args, remaining) = text.split_at(idx);
                if remaining.starts_with("<unfinished ...>") {
                    *input = remaining;
                    return Ok(args.trim_end().trim_end_matches(','));
                }
            }
            _ => {}
        }
    }
    backtrack()
}

fn dtruss_line<'i>(input: &mut &'i str) -> ModalResult<TokenizerOutput<'i>> {
    let _ = multispace0(input)?;
    let pid = opt(dtruss_pid_prefix).parse_next(input)?;
    let name = function_name(input)?;
    let _ = literal("(").parse_next(input)?;
    let args = argument_text(input)?;
    let _ = literal(")").parse_next(input)?;
    let _ = multispace0(input)?;
    let _ = literal("=").parse_next(input)?;
    let _ = multispace0(input)?;
    let retval = dtruss_retval(input)?;
    Ok(TokenizerOutput::Call(CallSegment {
        pid,
        name,
        args,
        outcome: CallOutcome::Complete(retval),
    }))
}

/// `1234/0x5678:` -- process id, then thread id in hex.
fn dtruss_pid_prefix(input: &mut &str) -> ModalResult<i32> {
    let pid = parse_pid(input)?;
    let _ = (literal("/"), literal("0x"), hex_digit1, literal(":"), multispace1).parse_next(input)?;
    Ok(pid)
}

fn dtruss_retval<'i>(input: &mut &'i str) -> ModalResult<Retval<'i>> {
    let value = integer_literal(input)?;
    let _ = multispace1(input)?;
    let errno = alt((
        preceded(literal("Err#"), digit1.try_map(i32::from_str)),
        digit1.try_map(i32::from_str),
    ))
    .parse_next(input)?;
    let _ = multispace0(input)?;
    Ok(if errno == 0 {
        Retval::Success(value)
    } else {
        Retval::Failure(value, ErrorCode::Number(errno))
    })
}

/// A `"..."` string token, including any `...` truncation marker strace appends after the closing quote.
pub(crate) fn quoted_text<'i>(input: &mut &'i str) -> ModalResult<&'i str> {
    let _ = one_of('"').parse_next(input)?;
    let text: &'i str = *input;
    let mut escaped = false;
    for (idx, c) in text.char_indices() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '"' {
            let (inner, remaining) = text.split_at(idx);
            *input = remaining.strip_prefix('"').unwrap_or(remaining);
            let _ = opt(literal("...")).parse_next(input)?;
            return Ok(inner);
        }
    }
    backtrack()
}

#[cfg(test)]
mod tests {
    use super::{CallOutcome, CallSegment, Dialect, ErrorCode, Retval, TokenizerOutput, tokenize};

    fn call(dialect: Dialect, line: &str) -> CallSegment<'_> {
        match tokenize(dialect, line) {
            Some(TokenizerOutput::Call(segment)) => segment,
            other => panic!("expected call from {line:?}, was {other:?}"),
        }
    }

    #[test]
    fn strace_all_retval_states() {
        let segment = call(Dialect::Strace, r"1316971 close(3)                                = 0");
        assert_eq!(
            segment,
            CallSegment {
                pid: Some(1_316_971),
                name: "close",
                args: "3",
                outcome: CallOutcome::Complete(Retval::Success(0)),
            }
        );

        let segment = call(
            Dialect::Strace,
            r"1316971 close(3)                        = -1 EBADF (Bad file descriptor)",
        );
        assert_eq!(
            segment.outcome,
            CallOutcome::Complete(Retval::Failure(-1, ErrorCode::Name("EBADF")))
        );

        let segment = call(Dialect::Strace, r"1435293 close(17 <unfinished ...>");
        assert_eq!(segment.args, "17");
        assert_eq!(segment.outcome, CallOutcome::Unfinished);

        // trailing comma before the unfinished marker
        let segment = call(Dialect::Strace, r"34187 read(7,  <unfinished ...>");
        assert_eq!(segment.args, "7");
        assert_eq!(segment.outcome, CallOutcome::Unfinished);

        let segment = call(
            Dialect::Strace,
            r"1316971 close(3)                        = ? ERESTARTSYS (To be restarted)",
        );
        assert_eq!(segment.outcome, CallOutcome::Complete(Retval::NoReturn));

        let segment = call(Dialect::Strace, r"1316971 brk(NULL)               = 0x55ad8bba6000");
        assert_eq!(
            segment.outcome,
            CallOutcome::Complete(Retval::Success(0x55ad_8bba_6000))
        );

        let segment = call(Dialect::Strace, r"26979 exit_group(0)     = ?");
        assert_eq!(segment.outcome, CallOutcome::Complete(Retval::NoReturn));
    }

    #[test]
    fn strace_retval_annotations() {
        let segment = call(
            Dialect::Strace,
            r"2222 poll([{fd=3, events=POLLIN}], 1, 0) = 1 ([{fd=3, revents=POLLIN}])",
        );
        assert_eq!(segment.args, "[{fd=3, events=POLLIN}], 1, 0");
        assert_eq!(segment.outcome, CallOutcome::Complete(Retval::Success(1)));

        let segment = call(Dialect::Strace, r"2222 fcntl(3, F_GETFL) = 0x2 (flags O_RDWR)");
        assert_eq!(segment.outcome, CallOutcome::Complete(Retval::Success(2)));
    }

    #[test]
    fn strace_parens_inside_arguments() {
        let segment = call(
            Dialect::Strace,
            r#"4000 connect(3, {sa_family=AF_INET, sin_port=htons(80), sin_addr=inet_addr("127.0.0.1")}, 16) = -1 ECONNREFUSED (Connection refused)"#,
        );
        assert_eq!(
            segment.args,
            r#"3, {sa_family=AF_INET, sin_port=htons(80), sin_addr=inet_addr("127.0.0.1")}, 16"#
        );
        assert_eq!(
            segment.outcome,
            CallOutcome::Complete(Retval::Failure(-1, ErrorCode::Name("ECONNREFUSED")))
        );

        let segment = call(Dialect::Strace, r#"4000 write(1, "a) = 5 (\"", 9) = 9"#);
        assert_eq!(segment.args, r#"1, "a) = 5 (\"", 9"#);
        assert_eq!(segment.outcome, CallOutcome::Complete(Retval::Success(9)));
    }

    #[test]
    fn strace_resumed() {
        let segment = call(
            Dialect::Strace,
            r"337651 <... clone resumed>, child_tidptr=0x7f9f93f88a10) = 337654",
        );
        assert_eq!(segment.name, "clone");
        assert_eq!(segment.args, ", child_tidptr=0x7f9f93f88a10");
        assert_eq!(
            segment.outcome,
            CallOutcome::Resumed(Retval::Success(337_654))
        );

        let segment = call(
            Dialect::Strace,
            r"15615 <... clone3 resumed> => {parent_tid=[15620]}, 88) = 15620",
        );
        assert_eq!(segment.args, " => {parent_tid=[15620]}, 88");

        let segment = call(
            Dialect::Strace,
            r"1316971 <... read resumed> <unfinished ...>) = ?",
        );
        assert_eq!(segment.outcome, CallOutcome::Resumed(Retval::NoReturn));
    }

    #[test]
    fn strace_prefix_forms() {
        let segment = call(Dialect::Strace, r#"[pid  4321] write(1, "x", 1) = 1"#);
        assert_eq!(segment.pid, Some(4321));

        let segment = call(Dialect::Strace, r#"write(1, "x", 1) = 1"#);
        assert_eq!(segment.pid, None);

        let segment = call(Dialect::Strace, r#"4321 12:01:02.123456 write(1, "x", 1) = 1"#);
        assert_eq!(segment.pid, Some(4321));
        assert_eq!(segment.name, "write");
    }

    #[test]
    fn strace_exit_and_chatter() {
        assert_eq!(
            tokenize(Dialect::Strace, r"15615 +++ exited with 0 +++"),
            Some(TokenizerOutput::Exit { pid: Some(15615) })
        );
        assert_eq!(
            tokenize(Dialect::Strace, r"15615 +++ killed by SIGKILL +++"),
            Some(TokenizerOutput::Exit { pid: Some(15615) })
        );
        assert_eq!(
            tokenize(
                Dialect::Strace,
                r"3523874 --- SIGCHLD {si_signo=SIGCHLD, si_code=CLD_EXITED, si_pid=3523875, si_uid=1000, si_status=0, si_utime=0, si_stime=0} ---"
            ),
            None
        );
        assert_eq!(tokenize(Dialect::Strace, ""), None);
        assert_eq!(
            tokenize(Dialect::Strace, "strace: Process 1234 attached"),
            None
        );
        assert_eq!(
            tokenize(Dialect::Strace, r#"1234 write(1, "never closed"#),
            None
        );
    }

    #[test]
    fn dtruss_calls() {
        let segment = call(
            Dialect::Dtruss,
            "  4510/0x1e4d1:  write_nocancel(0x1, \"Hello, world!\\n\\0\", 0xE)\t\t = 14 0",
        );
        assert_eq!(
            segment,
            CallSegment {
                pid: Some(4510),
                name: "write_nocancel",
                args: r#"0x1, "Hello, world!\n\0", 0xE"#,
                outcome: CallOutcome::Complete(Retval::Success(14)),
            }
        );

        let segment = call(
            Dialect::Dtruss,
            "4510/0x1e4d1:  open(\"/nope\\0\", 0x0, 0x0)\t\t = -1 Err#2",
        );
        assert_eq!(
            segment.outcome,
            CallOutcome::Complete(Retval::Failure(-1, ErrorCode::Number(2)))
        );

        let segment = call(
            Dialect::Dtruss,
            "4510/0x1e4d1:  connect(0x3, 0x7FF7BFEFF5A0, 0x10)\t\t = -1 61",
        );
        assert_eq!(
            segment.outcome,
            CallOutcome::Complete(Retval::Failure(-1, ErrorCode::Number(61)))
        );
    }

    #[test]
    fn dtruss_chatter() {
        assert_eq!(
            tokenize(Dialect::Dtruss, "SYSCALL(args) \t\t = return"),
            None
        );
        assert_eq!(
            tokenize(
                Dialect::Dtruss,
                "dtrace: failed to initialize dtrace: DTrace requires additional privileges"
            ),
            None
        );
        assert_eq!(
            tokenize(Dialect::Dtruss, "dtrace: 2 dynamic variable drops"),
            None
        );
    }
}
