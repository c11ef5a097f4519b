// SPDX-FileCopyrightText: 2024 Mathieu Fenniak <mathieu@fenniak.net>
//
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{fmt::Display, io::Write};

use anyhow::Result;
use clap::ValueEnum;
use serde::Serialize;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug, Default)]
pub enum OutputFormat {
    /// One human-readable line per record
    #[default]
    Text,

    /// One JSON object per line
    Json,
}

/// Writes records to an output in the selected format, one per line.
pub struct RecordWriter<W: Write> {
    out: W,
    format: OutputFormat,
}

impl<W: Write> RecordWriter<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        RecordWriter { out, format }
    }

    pub fn write<T: Display + Serialize>(&mut self, record: &T) -> Result<()> {
        match self.format {
            OutputFormat::Text => writeln!(self.out, "{record}")?,
            OutputFormat::Json => {
                serde_json::to_writer(&mut self.out, record)?;
                writeln!(self.out)?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::{OutputFormat, RecordWriter};
    use crate::sys_trace::{ArgValue, ConnectionRecord, Protocol, SyscallRecord};

    fn write_record() -> SyscallRecord {
        SyscallRecord {
            pid: 4000,
            name: String::from("write"),
            args: vec![
                ArgValue::Integer(1),
                ArgValue::from("Hello, world!\n"),
                ArgValue::Integer(14),
            ],
            result: 14,
            errno: 0,
        }
    }

    #[test]
    fn text_lines() -> Result<()> {
        let mut writer = RecordWriter::new(Vec::new(), OutputFormat::Text);
        writer.write(&write_record())?;
        writer.write(&ConnectionRecord {
            pid: 4000,
            remote_host: String::from("127.0.0.1"),
            remote_port: 80,
            local_host: None,
            local_port: None,
            protocol: Protocol::Tcp,
        })?;
        let text = String::from_utf8(writer.into_inner())?;
        assert_eq!(
            text,
            "4000 write(1, \"Hello, world!\\n\", 14) = 14\n4000 TCP 127.0.0.1:80\n"
        );
        Ok(())
    }

    #[test]
    fn json_lines() -> Result<()> {
        let mut writer = RecordWriter::new(Vec::new(), OutputFormat::Json);
        writer.write(&write_record())?;
        writer.write(&write_record())?;
        let text = String::from_utf8(writer.into_inner())?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);

        let value: serde_json::Value = serde_json::from_str(lines[0])?;
        assert_eq!(value["pid"], 4000);
        assert_eq!(value["name"], "write");
        assert_eq!(value["result"], 14);
        assert_eq!(value["errno"], 0);
        assert_eq!(value["args"][1]["Text"], "Hello, world!\n");
        Ok(())
    }
}
