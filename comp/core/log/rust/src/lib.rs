// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! `log` backend used by the agent binaries.
//!
//! Lines follow the agent layout:
//! `2026-10-17 12:00:00 UTC | MONAGENT | INFO | (src/server.rs:42 in monagent::server) | message`

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use time::OffsetDateTime;
use time::macros::format_description;

#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to open log file: {0}")]
    Open(#[source] io::Error),
    #[error("logger already initialized: {0}")]
    AlreadySet(#[source] SetLoggerError),
}

enum Output {
    Stderr,
    File(Mutex<File>),
}

pub struct AgentLogger {
    name: String,
    level: LevelFilter,
    output: Output,
}

impl AgentLogger {
    pub fn stderr(name: &str, level: LevelFilter) -> Self {
        Self {
            name: name.to_uppercase(),
            level,
            output: Output::Stderr,
        }
    }

    /// Log to `path`, appending. The file is created if missing.
    pub fn file(name: &str, level: LevelFilter, path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            name: name.to_uppercase(),
            level,
            output: Output::File(Mutex::new(file)),
        })
    }

    pub fn format(&self, record: &Record<'_>) -> String {
        let now = OffsetDateTime::now_utc();
        let ts = now
            .format(format_description!(
                "[year]-[month]-[day] [hour]:[minute]:[second]"
            ))
            .unwrap_or_default();
        let location = match (record.file(), record.line()) {
            (Some(file), Some(line)) => format!("{file}:{line}"),
            (Some(file), None) => file.to_string(),
            _ => "unknown".to_string(),
        };
        let module = record.module_path().unwrap_or(record.target());
        format!(
            "{ts} UTC | {} | {} | ({location} in {module}) | {}",
            self.name,
            record.level(),
            record.args()
        )
    }
}

impl Log for AgentLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let line = self.format(record);
        match &self.output {
            Output::Stderr => {
                let _ = writeln!(io::stderr().lock(), "{line}");
            }
            Output::File(file) => {
                let mut file = file.lock().unwrap_or_else(PoisonError::into_inner);
                let _ = writeln!(file, "{line}");
            }
        }
    }

    fn flush(&self) {
        if let Output::File(file) = &self.output {
            let _ = file.lock().unwrap_or_else(PoisonError::into_inner).flush();
        }
    }
}

/// Parse a level name. Accepts the agent spellings (`warning`, `critical`)
/// on top of the `log` ones.
pub fn parse_level(s: &str) -> Option<LevelFilter> {
    match s.trim().to_lowercase().as_str() {
        "trace" => Some(LevelFilter::Trace),
        "debug" => Some(LevelFilter::Debug),
        "info" => Some(LevelFilter::Info),
        "warn" | "warning" => Some(LevelFilter::Warn),
        "error" | "critical" => Some(LevelFilter::Error),
        "off" => Some(LevelFilter::Off),
        _ => None,
    }
}

/// Install the global logger. Logs go to `file` when given, stderr otherwise.
pub fn init(name: &str, level: LevelFilter, file: Option<&Path>) -> Result<(), InitError> {
    let logger = match file {
        Some(path) => AgentLogger::file(name, level, path).map_err(InitError::Open)?,
        None => AgentLogger::stderr(name, level),
    };
    log::set_boxed_logger(Box::new(logger)).map_err(InitError::AlreadySet)?;
    log::set_max_level(level);
    Ok(())
}
