// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::sync::LazyLock;

use log::debug;
use nix::libc;
use winnow::combinator::{alt, preceded, repeat};
use winnow::token::{one_of, take_till, take_while};
use winnow::{ModalResult, Parser};

use super::tokenizer::{Dialect, ErrorCode, integer_literal, quoted_text};
use crate::sys_trace::record::ArgValue;

macro_rules! constant_table {
    ($($name:ident),* $(,)?) => {
        &[$((stringify!($name), libc::$name as i64)),*]
    };
}

#[allow(clippy::cast_lossless, clippy::cast_possible_wrap, clippy::unnecessary_cast)]
static COMMON_FLAGS: &[(&str, i64)] = constant_table!(
    O_RDONLY, O_WRONLY, O_RDWR, O_CREAT, O_EXCL, O_NOCTTY, O_TRUNC, O_APPEND, O_NONBLOCK, O_CLOEXEC, O_DIRECTORY,
    O_NOFOLLOW, O_SYNC, O_DSYNC, O_ASYNC,
    AF_UNSPEC, AF_UNIX, AF_INET, AF_INET6,
    SOCK_STREAM, SOCK_DGRAM, SOCK_RAW, SOCK_SEQPACKET,
    IPPROTO_IP, IPPROTO_IPV6, IPPROTO_TCP, IPPROTO_UDP, IPPROTO_ICMP,
    SOL_SOCKET, SO_REUSEADDR, SO_KEEPALIVE, SO_ERROR, SO_BROADCAST, SO_SNDBUF, SO_RCVBUF,
    MSG_OOB, MSG_PEEK, MSG_DONTWAIT, MSG_WAITALL, MSG_TRUNC,
    PROT_NONE, PROT_READ, PROT_WRITE, PROT_EXEC,
    MAP_SHARED, MAP_PRIVATE, MAP_FIXED, MAP_ANONYMOUS, MAP_ANON,
    F_DUPFD, F_GETFD, F_SETFD, F_GETFL, F_SETFL, F_DUPFD_CLOEXEC, FD_CLOEXEC,
    AT_FDCWD, AT_SYMLINK_NOFOLLOW, AT_REMOVEDIR,
    S_IFREG, S_IFDIR, S_IFLNK, S_IFCHR, S_IFBLK, S_IFIFO, S_IFSOCK,
    SEEK_SET, SEEK_CUR, SEEK_END,
    F_OK, R_OK, W_OK, X_OK,
    WNOHANG, WUNTRACED,
    SIG_BLOCK, SIG_UNBLOCK, SIG_SETMASK,
);

#[cfg(target_os = "linux")]
#[allow(clippy::cast_lossless, clippy::cast_possible_wrap, clippy::unnecessary_cast)]
static LINUX_FLAGS: &[(&str, i64)] = constant_table!(
    O_LARGEFILE, O_PATH, O_NOATIME,
    AF_NETLINK, AF_PACKET,
    SOCK_NONBLOCK, SOCK_CLOEXEC,
    MSG_NOSIGNAL, MSG_CMSG_CLOEXEC,
    MAP_NORESERVE, MAP_DENYWRITE, MAP_STACK, MAP_POPULATE,
    AT_EMPTY_PATH, AT_NO_AUTOMOUNT,
    CLONE_VM, CLONE_FS, CLONE_FILES, CLONE_SIGHAND, CLONE_THREAD, CLONE_SYSVSEM, CLONE_SETTLS, CLONE_PARENT_SETTID,
    CLONE_CHILD_CLEARTID, CLONE_CHILD_SETTID, CLONE_VFORK, CLONE_PARENT,
    EPOLL_CLOEXEC, EFD_CLOEXEC, EFD_NONBLOCK,
    GRND_NONBLOCK, GRND_RANDOM,
);

#[cfg(not(target_os = "linux"))]
static LINUX_FLAGS: &[(&str, i64)] = &[];

#[allow(clippy::cast_lossless, clippy::unnecessary_cast)]
static COMMON_ERRNOS: &[(&str, i64)] = constant_table!(
    EPERM, ENOENT, ESRCH, EINTR, EIO, ENXIO, E2BIG, ENOEXEC, EBADF, ECHILD, EAGAIN, ENOMEM, EACCES, EFAULT, EBUSY,
    EEXIST, EXDEV, ENODEV, ENOTDIR, EISDIR, EINVAL, ENFILE, EMFILE, ENOTTY, ETXTBSY, EFBIG, ENOSPC, ESPIPE, EROFS,
    EMLINK, EPIPE, EDOM, ERANGE, EDEADLK, ENAMETOOLONG, ENOLCK, ENOSYS, ENOTEMPTY, ELOOP, ENOMSG, ENODATA, ENOTSOCK,
    EDESTADDRREQ, EMSGSIZE, EPROTOTYPE, ENOPROTOOPT, EPROTONOSUPPORT, EOPNOTSUPP, ENOTSUP, EAFNOSUPPORT, EADDRINUSE,
    EADDRNOTAVAIL, ENETDOWN, ENETUNREACH, ECONNABORTED, ECONNRESET, ENOBUFS, EISCONN, ENOTCONN, ETIMEDOUT,
    ECONNREFUSED, EHOSTUNREACH, EALREADY, EINPROGRESS, EOVERFLOW, ECANCELED,
);

/// Symbolic constant → value, for the constants the tracers print in argument lists.
static FLAGS: LazyLock<HashMap<&'static str, i64>> = LazyLock::new(|| {
    COMMON_FLAGS
        .iter()
        .chain(LINUX_FLAGS.iter())
        .copied()
        .chain([("NULL", 0)])
        .collect()
});

static ERRNOS: LazyLock<HashMap<&'static str, i32>> = LazyLock::new(|| {
    COMMON_ERRNOS
        .iter()
        .filter_map(|(name, value)| Some((*name, i32::try_from(*value).ok()?)))
        .collect()
});

/// Value of a symbolic constant such as `O_CLOEXEC` or `AT_FDCWD`.
#[must_use]
pub fn flag_value(name: &str) -> Option<i64> {
    FLAGS.get(name).copied()
}

/// Numeric errno for a tracer's error code.  Symbolic names the host doesn't know (eg. kernel-internal ones) become
/// `-1`, which still marks the call as failed.
#[must_use]
pub fn errno_value(code: ErrorCode<'_>) -> i32 {
    match code {
        ErrorCode::Number(n) => n,
        ErrorCode::Name(name) => ERRNOS.get(name).copied().unwrap_or_else(|| {
            debug!("unrecognized errno name {name:?}");
            -1
        }),
    }
}

/// Decode a raw argument list into typed values, one per top-level comma-separated token.
#[must_use]
pub fn decode_args(text: &str, dialect: Dialect) -> Vec<ArgValue> {
    split_top_level(text)
        .into_iter()
        .map(|token| decode_arg(token, dialect))
        .collect()
}

/// Split on commas that aren't inside a string or a `()[]{}` group.  Empty tokens are dropped.
#[must_use]
pub fn split_top_level(text: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut start = 0;
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
            ')' | ']' | '}' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                tokens.extend(text.get(start..idx).map(str::trim));
                start = idx + 1;
            }
            _ => {}
        }
    }
    tokens.extend(text.get(start..).map(str::trim));
    tokens.retain(|t| !t.is_empty());
    tokens
}

#[must_use]
pub fn decode_arg(token: &str, dialect: Dialect) -> ArgValue {
    let value = strip_comment(token);

    if value.starts_with('"') {
        if let Some(mut text) = decode_string(value) {
            if dialect == Dialect::Dtruss && text.ends_with('\0') {
                text.pop();
            }
            return ArgValue::Text(text);
        }
        return ArgValue::Raw(String::from(token));
    }

    if let Some(v) = decode_numeral(value) {
        return ArgValue::Integer(v);
    }

    if let Some(v) = decode_flags(value) {
        return ArgValue::Integer(v);
    }

    ArgValue::Raw(String::from(token))
}

/// `0x7ffc5a1fb3c8 /* 26 vars */` → `0x7ffc5a1fb3c8`
fn strip_comment(token: &str) -> &str {
    if token.ends_with("*/") {
        if let Some(idx) = token.find("/*") {
            return token.split_at(idx).0.trim_end();
        }
    }
    token
}

fn decode_numeral(value: &str) -> Option<i64> {
    integer_literal.parse(value).ok()
}

fn decode_flags(value: &str) -> Option<i64> {
    if value.is_empty()
        || !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '|')
    {
        return None;
    }
    let mut combined = 0i64;
    for component in value.split('|') {
        let v = flag_value(component).or_else(|| decode_numeral(component))?;
        combined |= v;
    }
    Some(combined)
}

fn decode_string(value: &str) -> Option<String> {
    let inner = quoted_text.parse(value).ok()?;
    let bytes = parse_encoded_string.parse(inner).ok()?;
    Some(String::from_utf8_lossy(&bytes).into_owned())
}

fn parse_escaped_char(input: &mut &str) -> ModalResult<u8> {
    preceded(
        one_of('\\'),
        alt((
            // hex: \x00
            parse_hex_byte,
            // octal: \0, \177
            parse_octal_byte,
            one_of('t').value(b'\t'),
            one_of('n').value(b'\n'),
            one_of('v').value(0x0b),
            one_of('f').value(0x0c),
            one_of('r').value(b'\r'),
            one_of('"').value(b'"'),
            one_of('\\').value(b'\\'),
        )),
    )
    .parse_next(input)
}

fn parse_hex_byte(input: &mut &str) -> ModalResult<u8> {
    let parse_hex = take_while(2..=2, |c: char| c.is_ascii_hexdigit());
    preceded(one_of('x'), parse_hex)
        .try_map(|hex| u8::from_str_radix(hex, 16))
        .parse_next(input)
}

fn parse_octal_byte(input: &mut &str) -> ModalResult<u8> {
    take_while(1..=3, |c: char| c.is_digit(8))
        .try_map(|oct| u8::from_str_radix(oct, 8))
        .parse_next(input)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringFragment<'a> {
    Literal(&'a str),
    EscapedChar(u8),
}

fn parse_str_fragment<'i>(input: &mut &'i str) -> ModalResult<StringFragment<'i>> {
    alt((
        take_till(1.., '\\').map(StringFragment::Literal),
        parse_escaped_char.map(StringFragment::EscapedChar),
    ))
    .parse_next(input)
}

fn parse_encoded_string(input: &mut &str) -> ModalResult<Vec<u8>> {
    repeat(0.., parse_str_fragment)
        .fold(
            || Vec::<u8>::with_capacity(input.len()),
            |mut bytes, fragment| {
                match fragment {
                    StringFragment::Literal(s) => bytes.extend(s.as_bytes()),
                    StringFragment::EscapedChar(c) => bytes.push(c),
                }
                bytes
            },
        )
        .parse_next(input)
}
