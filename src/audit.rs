//! Append-only history of actions taken on remote machines.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditAction {
    Run,
    Dispatch,
    Kill,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditTarget {
    Command(String),
    Pid(u32),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Local>,
    pub action: AuditAction,
    pub machine: String,
    pub target: AuditTarget,
    pub actor: String,
}

impl AuditEntry {
    pub fn new(
        action: AuditAction,
        machine: impl Into<String>,
        target: AuditTarget,
        actor: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Local::now(),
            action,
            machine: machine.into(),
            target,
            actor: actor.into(),
        }
    }
}

pub trait AuditLog: Send + Sync {
    fn append(&self, entries: &[AuditEntry]) -> Result<()>;
}

/// One JSON object per line, appended to a single file.
#[derive(Debug, Clone)]
pub struct JsonLinesLog {
    path: PathBuf,
}

impl JsonLinesLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(&self) -> Result<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).context("Malformed history entry"))
            .collect()
    }
}

impl AuditLog for JsonLinesLog {
    fn append(&self, entries: &[AuditEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut buffer = String::new();
        for entry in entries {
            buffer.push_str(&serde_json::to_string(entry)?);
            buffer.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open history file {}", self.path.display()))?;
        file.write_all(buffer.as_bytes())?;
        Ok(())
    }
}

/// Record `entries`, logging instead of failing: the action already happened.
pub fn record(log: &dyn AuditLog, entries: &[AuditEntry]) {
    if let Err(e) = log.append(entries) {
        tracing::warn!("Failed to write history: {e:#}");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct MemoryLog {
        pub(crate) entries: Mutex<Vec<AuditEntry>>,
    }

    impl AuditLog for MemoryLog {
        fn append(&self, entries: &[AuditEntry]) -> Result<()> {
            self.entries.lock().unwrap().extend_from_slice(entries);
            Ok(())
        }
    }

    impl AuditLog for std::sync::Arc<MemoryLog> {
        fn append(&self, entries: &[AuditEntry]) -> Result<()> {
            self.as_ref().append(entries)
        }
    }

    #[test]
    fn test_json_lines_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonLinesLog::new(dir.path().join("nested").join("history.jsonl"));

        log.append(&[AuditEntry::new(
            AuditAction::Run,
            "tenet1",
            AuditTarget::Command("./sim -N 10".to_string()),
            "alice",
        )])
        .unwrap();
        log.append(&[AuditEntry::new(
            AuditAction::Kill,
            "tenet1",
            AuditTarget::Pid(4242),
            "alice",
        )])
        .unwrap();

        let entries = log.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].action, AuditAction::Kill);
        assert_eq!(entries[1].target, AuditTarget::Pid(4242));

        let raw = std::fs::read_to_string(log.path()).unwrap();
        assert!(raw.lines().next().unwrap().contains("\"action\":\"run\""));
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let log = JsonLinesLog::new(dir.path().join("history.jsonl"));
        assert!(log.read_all().unwrap().is_empty());
    }
}
