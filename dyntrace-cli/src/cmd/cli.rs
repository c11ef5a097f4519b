// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use log::set_max_level;
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};
use std::{fmt::Debug, path::PathBuf, process::ExitCode, time::Duration};

use crate::sys_trace::Dialect;

use super::{output::OutputFormat, trace};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
pub struct CommonOptions {
    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,

    /// Override `.config/dyntrace.toml` with a specific config file
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an executable under the syscall tracer and print each syscall it makes
    Trace(TraceOptions),

    /// Run an executable under the syscall tracer and print each distinct IP endpoint it contacts
    Connections(ConnectionsOptions),

    /// Parse a previously captured trace file
    Replay(ReplayOptions),
}

#[derive(Args, Debug)]
pub struct TargetParameters {
    /// Stop the target after this many seconds; records gathered until then are still reported
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Run the tracer as the current user instead of through the elevation command
    #[arg(long)]
    pub no_root: bool,

    /// Output format for records
    #[arg(value_enum, long, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Executable to trace; searched for on `PATH` when it has no directory component
    pub target: PathBuf,

    /// Arguments passed to the executable
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

impl TargetParameters {
    #[must_use]
    pub fn timeout_duration(&self) -> Option<Duration> {
        self.timeout.map(Duration::from_secs)
    }
}

#[derive(Args, Debug)]
pub struct TraceOptions {
    /// Only report syscalls with exactly this name
    #[arg(short, long)]
    pub syscall: Option<String>,

    /// Also report syscalls made by processes the target starts
    #[arg(long)]
    pub follow_children: bool,

    #[command(flatten)]
    pub target_parameters: TargetParameters,
}

#[derive(Args, Debug)]
pub struct ConnectionsOptions {
    #[command(flatten)]
    pub target_parameters: TargetParameters,
}

#[derive(Args, Debug)]
pub struct ReplayOptions {
    /// Tracer that produced the file
    #[arg(value_enum, long, default_value_t = ReplayDialect::Strace)]
    pub dialect: ReplayDialect,

    /// Only report syscalls with exactly this name
    #[arg(short, long)]
    pub syscall: Option<String>,

    /// Report distinct IP endpoints instead of syscalls
    #[arg(long, conflicts_with = "syscall")]
    pub connections: bool,

    /// Also report syscalls made by processes other than the first one in the trace
    #[arg(long)]
    pub follow_children: bool,

    /// Output format for records
    #[arg(value_enum, long, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Trace file to read
    pub file: PathBuf,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
pub enum ReplayDialect {
    /// `strace -f` output, with or without `-o`
    Strace,

    /// `dtruss -f` output
    Dtruss,
}

impl From<ReplayDialect> for Dialect {
    fn from(value: ReplayDialect) -> Self {
        match value {
            ReplayDialect::Strace => Dialect::Strace,
            ReplayDialect::Dtruss => Dialect::Dtruss,
        }
    }
}

pub async fn run_cli() -> ExitCode {
    let cli = Cli::parse();
    // stdout carries the records
    let logger = TermLogger::new(
        cli.common.verbose.log_level_filter(),
        Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );
    set_max_level(cli.common.verbose.log_level_filter());
    if log::set_boxed_logger(logger).is_err() {
        set_max_level(log::LevelFilter::Off);
    }

    match &cli.command {
        Commands::Trace(options) => trace::trace_cli(&cli.common, options).await,
        Commands::Connections(options) => trace::connections_cli(&cli.common, options).await,
        Commands::Replay(options) => trace::replay_cli(&cli.common, options).await,
    }
}
