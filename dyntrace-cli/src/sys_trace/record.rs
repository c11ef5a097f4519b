// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fmt;

use serde::Serialize;

/// One decoded argument of a traced syscall.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ArgValue {
    /// Decimal, octal or hex numerals, `NULL`, and symbolic flags whose every component is known.
    Integer(i64),
    /// Quoted string argument with escapes resolved.
    Text(String),
    /// Anything the decoder couldn't type; the tracer's rendering of the argument, verbatim.  Structures, arrays,
    /// unknown symbolic names and `key=value` arguments all land here.
    Raw(String),
}

impl ArgValue {
    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ArgValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ArgValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl PartialEq<i64> for ArgValue {
    fn eq(&self, other: &i64) -> bool {
        self.as_integer() == Some(*other)
    }
}

impl PartialEq<&str> for ArgValue {
    fn eq(&self, other: &&str) -> bool {
        self.as_text() == Some(*other)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        ArgValue::Integer(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Text(String::from(value))
    }
}

impl fmt::Display for ArgValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgValue::Integer(v) => write!(f, "{v}"),
            ArgValue::Text(v) => write!(f, "{v:?}"),
            ArgValue::Raw(v) => f.write_str(v),
        }
    }
}

/// A completed syscall observed in the trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyscallRecord {
    /// Process id (thread group id) of the caller; thread ids are folded into their process.
    pub pid: i32,
    /// Syscall name exactly as the tracer printed it, eg. `write_nocancel` is not normalised to `write`.
    pub name: String,
    pub args: Vec<ArgValue>,
    pub result: i64,
    /// 0 unless the tracer reported a failure.
    pub errno: i32,
}

impl SyscallRecord {
    #[must_use]
    pub fn arg(&self, index: usize) -> Option<&ArgValue> {
        self.args.get(index)
    }

    #[must_use]
    pub fn failed(&self) -> bool {
        self.errno != 0
    }
}

impl fmt::Display for SyscallRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}(", self.pid, self.name)?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{arg}")?;
        }
        write!(f, ") = {}", self.result)?;
        if self.errno != 0 {
            write!(f, " (errno {})", self.errno)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "TCP",
            Protocol::Udp => "UDP",
        })
    }
}

/// A distinct IP endpoint contacted by the target, derived from its socket syscalls.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionRecord {
    pub pid: i32,
    pub remote_host: String,
    pub remote_port: u16,
    pub local_host: Option<String>,
    pub local_port: Option<u16>,
    pub protocol: Protocol,
}

impl fmt::Display for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ", self.pid, self.protocol)?;
        if let (Some(host), Some(port)) = (&self.local_host, self.local_port) {
            write!(f, "{} -> ", format_endpoint(host, port))?;
        }
        f.write_str(&format_endpoint(&self.remote_host, self.remote_port))
    }
}

fn format_endpoint(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::{ArgValue, ConnectionRecord, Protocol, SyscallRecord};

    #[test]
    fn arg_value_comparisons() {
        assert_eq!(ArgValue::Integer(14), 14);
        assert_eq!(ArgValue::Integer(0xE), 14);
        assert_eq!(ArgValue::Text(String::from("Hello, world!\n")), "Hello, world!\n");
        assert_ne!(ArgValue::Raw(String::from("O_WHATEVER")), "O_WHATEVER");
        assert_ne!(ArgValue::Text(String::from("14")), 14);
    }

    #[test]
    fn display() {
        let record = SyscallRecord {
            pid: 100,
            name: String::from("write"),
            args: vec![
                ArgValue::Integer(1),
                ArgValue::from("hi\n"),
                ArgValue::Integer(3),
            ],
            result: 3,
            errno: 0,
        };
        assert_eq!(record.to_string(), r#"100 write(1, "hi\n", 3) = 3"#);

        let connection = ConnectionRecord {
            pid: 100,
            remote_host: String::from("::1"),
            remote_port: 80,
            local_host: None,
            local_port: None,
            protocol: Protocol::Tcp,
        };
        assert_eq!(connection.to_string(), "100 TCP [::1]:80");
    }
}
