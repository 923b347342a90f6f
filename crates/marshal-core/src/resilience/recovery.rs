//! Crash-state snapshots for long-running operations.
//!
//! A component periodically snapshots its progress keyed by operation id;
//! after a restart the snapshots are enumerated to resume or report, and
//! cleared once the operation completes.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::io;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub operation_id: String,
    pub taken_at: DateTime<Utc>,
    pub progress: serde_json::Value,
}

pub struct StateRecovery {
    dir: PathBuf,
}

impl StateRecovery {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn snapshot_path(&self, operation_id: &str) -> PathBuf {
        self.dir.join(format!("{operation_id}.json"))
    }

    /// Atomically write the current progress for `operation_id`.
    pub fn snapshot(&self, operation_id: &str, progress: serde_json::Value) -> Result<()> {
        let snap = Snapshot {
            operation_id: operation_id.to_string(),
            taken_at: Utc::now(),
            progress,
        };
        io::atomic_write(
            &self.snapshot_path(operation_id),
            serde_json::to_string_pretty(&snap)?.as_bytes(),
        )
    }

    pub fn load(&self, operation_id: &str) -> Result<Option<Snapshot>> {
        let path = self.snapshot_path(operation_id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&std::fs::read_to_string(path)?)?))
    }

    /// All interrupted operations, oldest snapshot first.
    pub fn list(&self) -> Result<Vec<Snapshot>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut snaps = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            snaps.push(serde_json::from_str(&std::fs::read_to_string(path)?)?);
        }
        snaps.sort_by(|a: &Snapshot, b: &Snapshot| a.taken_at.cmp(&b.taken_at));
        Ok(snaps)
    }

    /// Remove the snapshot once the operation succeeds.
    pub fn clear(&self, operation_id: &str) -> Result<()> {
        let path = self.snapshot_path(operation_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
