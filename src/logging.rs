use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

use crate::files::write_atomic;

const LOG_FILE: &str = "change_log.jsonl";
const MAX_ENTRIES: usize = 500;

#[derive(
    Clone, Copy, Debug, Deserialize, Serialize, ValueEnum, PartialEq, Eq, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Silent,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
}

/// Console reporter owned by one engine; never a process-wide logger.
#[derive(Clone, Copy, Debug, Default)]
pub struct Logger {
    level: LogLevel,
}

impl Logger {
    pub fn new(level: LogLevel) -> Self {
        Self { level }
    }

    pub fn enabled(&self, level: LogLevel) -> bool {
        level != LogLevel::Silent && level <= self.level
    }

    pub fn info(&self, message: impl AsRef<str>) {
        if self.enabled(LogLevel::Info) {
            println!("{}", message.as_ref());
        }
    }

    pub fn success(&self, message: impl AsRef<str>) {
        if self.enabled(LogLevel::Info) {
            println!("ok: {}", message.as_ref());
        }
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        if self.enabled(LogLevel::Warn) {
            eprintln!("warning: {}", message.as_ref());
        }
    }

    pub fn error(&self, message: impl AsRef<str>) {
        if self.enabled(LogLevel::Error) {
            eprintln!("error: {}", message.as_ref());
        }
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        if self.enabled(LogLevel::Debug) {
            println!("debug: {}", message.as_ref());
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct EventEntry {
    pub timestamp: String,
    pub uuid: Uuid,
    pub action: String,
    pub detail: String,
}

pub fn record_event(state_dir: &Path, uuid: Uuid, action: &str, detail: &str) -> Result<()> {
    let log_path = ensure_log_file(state_dir)?;
    let timestamp = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "unknown".into());
    let entry = EventEntry {
        timestamp,
        uuid,
        action: action.to_string(),
        detail: detail.to_string(),
    };
    let json = serde_json::to_string(&entry)?;
    let mut file = OpenOptions::new()
        .append(true)
        .create(true)
        .open(&log_path)
        .with_context(|| format!("opening {log_path:?}"))?;
    writeln!(file, "{json}")?;
    cap_log(&log_path)?;
    Ok(())
}

pub fn read_recent(state_dir: &Path, limit: usize) -> Result<Vec<EventEntry>> {
    let log_path = state_dir.join(LOG_FILE);
    if !log_path.exists() {
        return Ok(Vec::new());
    }
    let file = OpenOptions::new()
        .read(true)
        .open(&log_path)
        .with_context(|| format!("reading {log_path:?}"))?;
    let mut entries = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<EventEntry>(&line) {
            entries.push(entry);
        }
    }
    let skip = entries.len().saturating_sub(limit);
    Ok(entries.split_off(skip))
}

fn ensure_log_file(state_dir: &Path) -> Result<PathBuf> {
    if !state_dir.exists() {
        fs::create_dir_all(state_dir).with_context(|| format!("creating {state_dir:?}"))?;
    }
    Ok(state_dir.join(LOG_FILE))
}

/// Drops the oldest events once the log grows past `MAX_ENTRIES` lines.
fn cap_log(path: &Path) -> Result<()> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {path:?}"))?;
    let total = text.lines().count();
    if total <= MAX_ENTRIES {
        return Ok(());
    }
    let kept: String = text
        .lines()
        .skip(total - MAX_ENTRIES)
        .flat_map(|line| [line, "\n"])
        .collect();
    write_atomic(path, kept.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn level_gates_output() {
        let logger = Logger::new(LogLevel::Warn);
        assert!(logger.enabled(LogLevel::Error));
        assert!(logger.enabled(LogLevel::Warn));
        assert!(!logger.enabled(LogLevel::Info));
        assert!(!Logger::new(LogLevel::Silent).enabled(LogLevel::Error));
    }

    #[test]
    fn events_round_trip_through_the_log() {
        let temp = tempdir().expect("temp dir");
        let state_dir = temp.path().join("state");
        let id = Uuid::new_v4();
        record_event(&state_dir, id, "committed", "2 operation(s)").expect("record");
        record_event(&state_dir, id, "undone", "restored").expect("record");

        let entries = read_recent(&state_dir, 1).expect("read");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, "undone");
        assert_eq!(entries[0].uuid, id);
    }

    #[test]
    fn log_is_capped() {
        let temp = tempdir().expect("temp dir");
        let id = Uuid::new_v4();
        for idx in 0..(MAX_ENTRIES + 5) {
            record_event(temp.path(), id, "skipped", &idx.to_string()).expect("record");
        }
        let entries = read_recent(temp.path(), usize::MAX).expect("read");
        assert_eq!(entries.len(), MAX_ENTRIES);
        assert_eq!(entries[0].detail, "5");
    }
}
