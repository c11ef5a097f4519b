// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    net::{TcpListener, UdpSocket},
    time::Duration,
};

use anyhow::Result;
use dyntrace::{
    config::TraceConfig,
    sys_trace::{Protocol, StraceSource, TraceRequest, connections_with},
};
use util::{TargetBuilder as _, traceable_test_app};

mod util;

fn strace() -> StraceSource {
    StraceSource::new(&TraceConfig::default())
}

/// A local TCP port with nothing listening on it.
fn closed_tcp_port() -> Result<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[tokio::test]
async fn tcp_connect() -> Result<()> {
    let Some(builder) = traceable_test_app() else {
        return Ok(());
    };
    let target = builder.build("netapp")?;
    let port = closed_tcp_port()?;

    let request = TraceRequest::new(&target)
        .args([String::from("tcp-connect"), String::from("127.0.0.1"), port.to_string()])
        .run_as_root(false);
    let (connections, _) = connections_with(&strace(), request)
        .await?
        .collect_all()
        .await;

    assert_eq!(connections.len(), 1, "{connections:?}");
    assert_eq!(connections[0].remote_host, "127.0.0.1");
    assert_eq!(connections[0].remote_port, port);
    assert_eq!(connections[0].protocol, Protocol::Tcp);

    builder.cleanup(&target)?;
    Ok(())
}

#[tokio::test]
async fn udp_sends_deduplicated() -> Result<()> {
    let Some(builder) = traceable_test_app() else {
        return Ok(());
    };
    let target = builder.build("netapp")?;
    // Datagrams need somewhere to go that won't bounce with ICMP errors mid-test.
    let receiver = UdpSocket::bind("127.0.0.1:0")?;
    let port = receiver.local_addr()?.port();

    let request = TraceRequest::new(&target)
        .args([
            String::from("udp-send"),
            String::from("127.0.0.1"),
            port.to_string(),
            String::from("--count"),
            String::from("10"),
        ])
        .run_as_root(false);
    let (connections, _) = connections_with(&strace(), request)
        .await?
        .collect_all()
        .await;

    assert_eq!(connections.len(), 1, "{connections:?}");
    assert_eq!(connections[0].remote_host, "127.0.0.1");
    assert_eq!(connections[0].remote_port, port);
    assert_eq!(connections[0].protocol, Protocol::Udp);

    builder.cleanup(&target)?;
    Ok(())
}

#[tokio::test]
async fn no_network_activity() -> Result<()> {
    let Some(builder) = traceable_test_app() else {
        return Ok(());
    };
    let target = builder.build("noop")?;

    let request = TraceRequest::new(&target).args(["noop"]).run_as_root(false);
    let (connections, outcome) = connections_with(&strace(), request)
        .await?
        .collect_all()
        .await;
    assert!(connections.is_empty(), "{connections:?}");
    assert!(!outcome.timed_out);

    builder.cleanup(&target)?;
    Ok(())
}

#[tokio::test]
async fn timeout_after_connect() -> Result<()> {
    let Some(builder) = traceable_test_app() else {
        return Ok(());
    };
    let target = builder.build("netapp")?;
    let port = closed_tcp_port()?;

    let request = TraceRequest::new(&target)
        .args([
            String::from("tcp-connect-then-hang"),
            String::from("127.0.0.1"),
            port.to_string(),
        ])
        .run_as_root(false)
        .timeout(Some(Duration::from_secs(2)));
    let (connections, outcome) = connections_with(&strace(), request)
        .await?
        .collect_all()
        .await;

    assert!(outcome.timed_out);
    assert_eq!(connections.len(), 1, "{connections:?}");
    assert_eq!(connections[0].remote_port, port);

    builder.cleanup(&target)?;
    Ok(())
}
