// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

#![allow(dead_code)] // each test binary uses a different subset

use std::{
    fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use anyhow::{Result, anyhow};
use dyntrace::{config::TraceConfig, sys_trace::StraceSource};
use tempfile::TempDir;

/// Produces executables to trace.  Kept out of the library, which only ever runs what it's given.
pub trait TargetBuilder {
    /// Path to a ready-to-run executable named `name`.
    fn build(&self, name: &str) -> Result<PathBuf>;

    fn cleanup(&self, path: &Path) -> Result<()>;
}

/// Hands out copies of the prebuilt `dyntrace-test-app` binary under the requested names.
pub struct TestAppBuilder {
    app: PathBuf,
    dir: TempDir,
}

impl TestAppBuilder {
    pub fn new() -> Result<Self> {
        let app = get_test_binary().ok_or_else(|| anyhow!("dyntrace-test-app has not been built"))?;
        Ok(TestAppBuilder {
            app,
            dir: tempfile::Builder::new().prefix("dyntrace-test").tempdir()?,
        })
    }
}

impl TargetBuilder for TestAppBuilder {
    fn build(&self, name: &str) -> Result<PathBuf> {
        let path = self.dir.path().join(name);
        // fs::copy carries the permission bits over, so the copy is executable.
        fs::copy(&self.app, &path)?;
        Ok(path)
    }

    fn cleanup(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }
}

pub fn get_test_binary() -> Option<PathBuf> {
    // Set when the binary belongs to the package under test; otherwise fall back to the workspace's target directory.
    let env_var_name = "CARGO_BIN_EXE_dyntrace-test-app";
    if let Ok(path) = std::env::var(env_var_name) {
        return Some(PathBuf::from(path));
    }

    let target_dir = match std::env::var("CARGO_TARGET_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => Path::new(env!("CARGO_MANIFEST_DIR")).parent()?.join("target"),
    };
    let path = target_dir.join("debug").join("dyntrace-test-app");
    path.exists().then_some(path)
}

/// Whether strace can trace a process on this host as the current user; containers commonly forbid ptrace.
pub fn strace_can_trace() -> bool {
    let source = StraceSource::new(&TraceConfig::default());
    if !source.is_available() {
        return false;
    }
    Command::new("strace")
        .args(["-f", "-o", "/dev/null", "true"])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

/// The test app, or `None` (after explaining why) when the host can't run these tests.
pub fn traceable_test_app() -> Option<TestAppBuilder> {
    if !strace_can_trace() {
        println!("skipping: strace is unavailable or not permitted to trace");
        return None;
    }
    match TestAppBuilder::new() {
        Ok(builder) => Some(builder),
        Err(e) => {
            println!("skipping: {e}");
            None
        }
    }
}
