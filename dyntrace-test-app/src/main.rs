// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    io::Write as _,
    net::{TcpStream, UdpSocket},
    process::Command,
    thread,
    time::Duration,
};

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Do nothing
    Noop,

    /// Write "Hello, world!" to stdout with a single write syscall.
    HelloWorld,

    /// Write "Hello, NAME!" to stdout with a single write syscall; the key is accepted and ignored, so that tests can
    /// check argument pass-through.
    Greet {
        name: String,

        #[arg(short, long)]
        key: Option<String>,
    },

    /// Write a line, then sleep far longer than any test waits.
    WriteThenHang,

    /// Attempt a TCP connection; a refused connection is the expected outcome on a closed port.
    TcpConnect {
        host: String,

        #[arg(default_value_t = 80)]
        port: u16,
    },

    /// Attempt a TCP connection, then sleep far longer than any test waits.
    TcpConnectThenHang {
        host: String,

        #[arg(default_value_t = 80)]
        port: u16,
    },

    /// Send `count` UDP datagrams to the same address.
    UdpSend {
        host: String,

        #[arg(default_value_t = 53)]
        port: u16,

        #[arg(short, long, default_value_t = 1)]
        count: u32,
    },

    /// Run this app again as a child process with `hello-world`, and wait for it.
    SpawnChild,
}

/// This application exists to be a syscall tracing target for dyntrace's internal tests.  Each mode performs a small,
/// predictable set of syscalls which the tests verify appear in the trace.
fn main() {
    let cli = Cli::parse();
    match &cli.command {
        Commands::Noop => {}
        Commands::HelloWorld => write_stdout("Hello, world!\n"),
        Commands::Greet { name, key: _ } => write_stdout(&format!("Hello, {name}!\n")),
        Commands::WriteThenHang => {
            write_stdout("hanging\n");
            hang();
        }
        Commands::TcpConnect { host, port } => tcp_connect(host, *port),
        Commands::TcpConnectThenHang { host, port } => {
            tcp_connect(host, *port);
            hang();
        }
        Commands::UdpSend { host, port, count } => {
            udp_send(host, *port, *count).expect("udp_send");
        }
        Commands::SpawnChild => spawn_child().expect("spawn_child"),
    }
}

/// One `write(1, ...)` for the whole text; std's buffered stdout could split it.
fn write_stdout(text: &str) {
    let written = nix::unistd::write(std::io::stdout(), text.as_bytes()).expect("write");
    assert_eq!(written, text.len());
}

fn hang() {
    thread::sleep(Duration::from_secs(3600));
}

fn tcp_connect(host: &str, port: u16) {
    match TcpStream::connect((host, port)) {
        Ok(mut stream) => {
            let _ = stream.write_all(b"\r\n");
        }
        Err(e) => {
            // Refused is fine; the attempt is what's traced.
            let _ = writeln!(std::io::stderr(), "connect failed: {e}");
        }
    }
}

fn udp_send(host: &str, port: u16, count: u32) -> Result<(), std::io::Error> {
    let socket = UdpSocket::bind(("127.0.0.1", 0))?;
    for _ in 0..count {
        socket.send_to(b"ping", (host, port))?;
    }
    Ok(())
}

fn spawn_child() -> Result<(), std::io::Error> {
    let status = Command::new(std::env::current_exe()?)
        .arg("hello-world")
        .status()?;
    assert!(status.success());
    Ok(())
}
