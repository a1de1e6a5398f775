//! JSONL append-only audit trail of dispatch attempts.
//!
//! Adapted from the teacher's `AuditEvent`/`AuditEntry`/`AuditLog` pattern
//! (append-only JSON lines via `OpenOptions`), narrowed from general sandbox
//! operations to dispatch outcomes.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuditEvent {
    DispatchSucceeded {
        agent_id: String,
        project: String,
        vm_name: String,
    },
    DispatchFailed {
        project: String,
        stage: String,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: AuditEvent,
}

impl AuditEntry {
    fn new(event: AuditEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
        }
    }
}

pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: base_dir.into().join("dispatch-audit.jsonl"),
        }
    }

    pub fn record(&self, event: AuditEvent) -> Result<()> {
        let entry = AuditEntry::new(event);
        let line = serde_json::to_string(&entry).context("serializing audit entry")?;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("creating audit log directory")?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("opening audit log")?;

        writeln!(file, "{line}").context("writing audit entry")?;
        Ok(())
    }

    pub fn read_all(&self) -> Result<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(error = %e, "skipping malformed audit entry"),
            }
        }
        Ok(entries)
    }
}
