// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    collections::{HashMap, HashSet, VecDeque},
    pin::Pin,
    sync::LazyLock,
    task::{Context, Poll},
};

use futures::{Stream, StreamExt};
use log::{debug, trace};
use regex::Regex;

use super::{
    record::{ArgValue, ConnectionRecord, Protocol, SyscallRecord},
    session::{SessionOutcome, SyscallStream},
};

/// Syscalls the tracer is restricted to when only connections are wanted.
pub const TRACED_SYSCALLS: &[&str] = &[
    "socket",
    "connect",
    "bind",
    "getsockname",
    "sendto",
    "sendmsg",
    "sendmmsg",
    "recvfrom",
    "recvmsg",
    "close",
];

// Unanchored; address structures also appear nested inside msghdr renderings.
static SOCKET_ADDRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?x)
        sa_family=AF_INET6,
        \s+
        sin6_port=htons\((?<sin6_port>\d+)\),
        \s+
        sin6_flowinfo=htonl\(\d+\),
        \s+
        inet_pton\(
            AF_INET6,
            \s+
            "(?<sin6_addr>[^"]+)",
            \s+
            &sin6_addr
        \)
        |
        sa_family=AF_INET,
        \s+
        sin_port=htons\((?<sin_port>\d+)\),
        \s+
        sin_addr=inet_addr\("(?<sin_addr>[^"]+)"\)
        "#,
    )
    .expect("socket address regex")
});

#[derive(Debug, Default)]
struct SocketState {
    protocol: Option<Protocol>,
    local: Option<(String, u16)>,
}

/// Folds syscall records into the distinct IP endpoints a process contacted.
#[derive(Debug, Default)]
pub struct ConnectionTracker {
    sockets: HashMap<(i32, i32), SocketState>,
    seen: HashSet<(i32, String, u16, Protocol)>,
}

impl ConnectionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Connections first revealed by `record`.
    pub fn observe(&mut self, record: &SyscallRecord) -> Vec<ConnectionRecord> {
        match record.name.as_str() {
            "socket" => {
                self.socket(record);
                vec![]
            }
            "bind" | "getsockname" => {
                self.local_endpoint(record);
                vec![]
            }
            "close" => {
                if let Some(fd) = fd_argument(record) {
                    self.sockets.remove(&(record.pid, fd));
                }
                vec![]
            }
            "connect" => self.remote_endpoints(record, Protocol::Tcp),
            "sendto" | "sendmsg" | "sendmmsg" | "recvfrom" | "recvmsg" => {
                self.remote_endpoints(record, Protocol::Udp)
            }
            _ => vec![],
        }
    }

    fn socket(&mut self, record: &SyscallRecord) {
        if record.failed() {
            return;
        }
        let Ok(fd) = i32::try_from(record.result) else {
            return;
        };
        let protocol = match record.arg(1) {
            Some(ArgValue::Integer(socket_type)) => {
                // SOCK_NONBLOCK and SOCK_CLOEXEC share the argument with the type.
                match i32::try_from(socket_type & 0xf) {
                    Ok(nix::libc::SOCK_STREAM) => Some(Protocol::Tcp),
                    Ok(nix::libc::SOCK_DGRAM) => Some(Protocol::Udp),
                    _ => None,
                }
            }
            Some(ArgValue::Raw(text)) if text.contains("SOCK_STREAM") => Some(Protocol::Tcp),
            Some(ArgValue::Raw(text)) if text.contains("SOCK_DGRAM") => Some(Protocol::Udp),
            _ => None,
        };
        self.sockets.insert(
            (record.pid, fd),
            SocketState {
                protocol,
                local: None,
            },
        );
    }

    fn local_endpoint(&mut self, record: &SyscallRecord) {
        if record.failed() {
            return;
        }
        let Some(fd) = fd_argument(record) else {
            return;
        };
        if let Some(endpoint) = socket_addresses(record).into_iter().next() {
            self.sockets.entry((record.pid, fd)).or_default().local = Some(endpoint);
        }
    }

    fn remote_endpoints(&mut self, record: &SyscallRecord, fallback: Protocol) -> Vec<ConnectionRecord> {
        let state = fd_argument(record).and_then(|fd| self.sockets.get(&(record.pid, fd)));
        let protocol = state.and_then(|s| s.protocol).unwrap_or(fallback);
        let local = state.and_then(|s| s.local.clone());

        let mut found = vec![];
        for (host, port) in socket_addresses(record) {
            if !self
                .seen
                .insert((record.pid, host.clone(), port, protocol))
            {
                continue;
            }
            let connection = ConnectionRecord {
                pid: record.pid,
                remote_host: host,
                remote_port: port,
                local_host: local.as_ref().map(|(h, _)| h.clone()),
                local_port: local.as_ref().map(|(_, p)| *p),
                protocol,
            };
            trace!("connection: {connection}");
            found.push(connection);
        }
        found
    }
}

fn fd_argument(record: &SyscallRecord) -> Option<i32> {
    record
        .arg(0)
        .and_then(ArgValue::as_integer)
        .and_then(|fd| i32::try_from(fd).ok())
}

/// IP endpoints rendered anywhere in the record's structured arguments.  Port 0 and other address families are
/// skipped.
fn socket_addresses(record: &SyscallRecord) -> Vec<(String, u16)> {
    let mut addresses = vec![];
    for arg in &record.args {
        // Only the tracer's own renderings; a quoted buffer can contain anything.
        let ArgValue::Raw(text) = arg else {
            continue;
        };
        for cap in SOCKET_ADDRESS.captures_iter(text) {
            let (host, port) = match (cap.name("sin_addr"), cap.name("sin6_addr")) {
                (Some(addr), _) => (addr.as_str(), &cap["sin_port"]),
                (None, Some(addr)) => (addr.as_str(), &cap["sin6_port"]),
                (None, None) => continue,
            };
            match port.parse::<u16>() {
                Ok(0) => {}
                Ok(port) => addresses.push((String::from(host), port)),
                Err(e) => debug!("ignoring socket address with port {port:?}: {e}"),
            }
        }
    }
    addresses
}

/// Stream of distinct connections made by the target, in the order they were first seen.
pub struct ConnectionStream {
    inner: SyscallStream,
    tracker: ConnectionTracker,
    pending: VecDeque<ConnectionRecord>,
}

impl ConnectionStream {
    #[must_use]
    pub fn new(inner: SyscallStream) -> Self {
        ConnectionStream {
            inner,
            tracker: ConnectionTracker::new(),
            pending: VecDeque::new(),
        }
    }

    pub async fn next(&mut self) -> Option<ConnectionRecord> {
        StreamExt::next(self).await
    }

    /// End the session; see `SyscallStream::finish`.
    pub async fn finish(self) -> SessionOutcome {
        self.inner.finish().await
    }

    pub async fn collect_all(mut self) -> (Vec<ConnectionRecord>, SessionOutcome) {
        let mut connections = Vec::new();
        while let Some(connection) = self.next().await {
            connections.push(connection);
        }
        let outcome = self.finish().await;
        (connections, outcome)
    }
}

impl Stream for ConnectionStream {
    type Item = ConnectionRecord;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if let Some(connection) = this.pending.pop_front() {
                return Poll::Ready(Some(connection));
            }
            match this.inner.poll_next_unpin(cx) {
                Poll::Ready(Some(record)) => this.pending.extend(this.tracker.observe(&record)),
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
