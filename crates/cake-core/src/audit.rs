//! Append-only audit log for command decisions.
//!
//! One JSON line per decision. A single writer holds an advisory file lock
//! for the life of the process; readers open independent handles and never
//! block the writer. The log survives restarts; nothing ever truncates it.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::error::{InterceptError, Result};

/// One audited command decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    /// The evaluated command line (truncated to 512 chars).
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// "allow", "block", or "confirm".
    pub decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rule_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternative: Option<String>,
    /// Evaluation duration in microseconds.
    pub eval_us: u64,
}

/// Single-writer append-only audit log.
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<File>,
}

impl AuditLog {
    /// Open (or create) the log and take the writer lock.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| InterceptError::Audit(e.to_string()))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| InterceptError::Audit(e.to_string()))?;
        file.try_lock_exclusive().map_err(|e| {
            InterceptError::Audit(format!(
                "audit log at {} already locked by another writer: {e}",
                path.display()
            ))
        })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Append one entry and flush it to disk.
    pub fn append(&self, entry: &AuditEntry) -> Result<()> {
        let line =
            serde_json::to_string(entry).map_err(|e| InterceptError::Audit(e.to_string()))?;
        let mut file = self
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.flush())
            .map_err(|e| InterceptError::Audit(e.to_string()))?;
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the last `limit` entries through an independent read handle.
    ///
    /// Unparseable lines (torn writes from a crash) are skipped.
    pub fn read_tail(path: &Path, limit: usize) -> Result<Vec<AuditEntry>> {
        let file = File::open(path).map_err(|e| InterceptError::Audit(e.to_string()))?;
        let reader = BufReader::new(file);
        let mut entries: Vec<AuditEntry> = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|e| InterceptError::Audit(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<AuditEntry>(&line) {
                entries.push(entry);
            }
        }
        let skip = entries.len().saturating_sub(limit);
        Ok(entries.split_off(skip))
    }
}
