// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context as _, Result, anyhow};
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = ".config/dyntrace.toml";

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum TracerSelection {
    /// strace on Linux, dtruss on macOS.
    #[default]
    Auto,
    Strace,
    Dtruss,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct TraceConfig {
    pub tracer: TracerSelection,
    pub strace_path: PathBuf,
    pub dtruss_path: PathBuf,
    /// Command (and its arguments) prefixed onto the tracer invocation when tracing as root.
    pub elevation_command: Vec<String>,
    /// Longest string argument strace renders before truncating it.
    pub string_limit: u32,
    /// Records buffered between the tracer reader and the consumer before the reader waits.
    pub channel_capacity: usize,
    /// Time allowed for the tracer to flush and exit once teardown begins.
    pub termination_grace_ms: u64,
}

impl Default for TraceConfig {
    fn default() -> Self {
        TraceConfig {
            tracer: TracerSelection::Auto,
            strace_path: PathBuf::from("strace"),
            dtruss_path: PathBuf::from("dtruss"),
            elevation_command: vec![String::from("sudo"), String::from("-n")],
            string_limit: 4096,
            channel_capacity: 1024,
            termination_grace_ms: 500,
        }
    }
}

impl TraceConfig {
    #[must_use]
    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }
}

/// Reads `.config/dyntrace.toml`, or the override path if one is given.  Defaults are used when the default file
/// doesn't exist; a missing override is an error.
pub fn get_trace_config(override_config: Option<&String>) -> Result<TraceConfig> {
    let path = match override_config {
        Some(path) => path.as_str(),
        None => DEFAULT_CONFIG_PATH,
    };
    if fs::exists(path)? {
        let config: TraceConfig = toml::from_str(&fs::read_to_string(path)?)
            .with_context(|| format!("parsing config file {path}"))?;
        if config.channel_capacity == 0 {
            return Err(anyhow!("channel-capacity in {path} must be at least 1"));
        }
        Ok(config)
    } else {
        if let Some(override_config) = override_config {
            return Err(anyhow!(
                "override config path {override_config} could not be opened"
            ));
        }
        Ok(TraceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use anyhow::Result;
    use tempfile::TempDir;

    use super::{TraceConfig, TracerSelection, get_trace_config};

    #[test]
    fn partial_file_keeps_defaults() -> Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("dyntrace.toml");
        fs::write(
            &path,
            r#"
tracer = "strace"
strace-path = "/opt/strace/bin/strace"
elevation-command = ["doas"]
channel-capacity = 16
"#,
        )?;
        let config = get_trace_config(Some(&path.to_string_lossy().into_owned()))?;
        assert_eq!(config.tracer, TracerSelection::Strace);
        assert_eq!(config.strace_path.to_str(), Some("/opt/strace/bin/strace"));
        assert_eq!(config.elevation_command, vec![String::from("doas")]);
        assert_eq!(config.channel_capacity, 16);
        assert_eq!(config.string_limit, TraceConfig::default().string_limit);
        assert_eq!(config.termination_grace_ms, 500);
        Ok(())
    }

    #[test]
    fn missing_override_is_an_error() {
        let result = get_trace_config(Some(&String::from("/nonexistent/dyntrace.toml")));
        assert!(result.is_err());
    }

    #[test]
    fn rejects_invalid_values() -> Result<()> {
        let tmp = TempDir::new()?;
        let path = tmp.path().join("dyntrace.toml");
        fs::write(&path, "tracer = \"ktrace\"\n")?;
        assert!(get_trace_config(Some(&path.to_string_lossy().into_owned())).is_err());

        fs::write(&path, "channel-capacity = 0\n")?;
        assert!(get_trace_config(Some(&path.to_string_lossy().into_owned())).is_err());
        Ok(())
    }
}
