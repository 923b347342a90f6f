//! Durable dead-letter queue for operations that exhausted retry.
//!
//! Items live in their own redb table until an operator removes them or a
//! `retry_all` replay succeeds. The key is the operation id, so re-adding
//! the same failed operation overwrites rather than duplicates.

use std::path::Path;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{MarshalError, Result};

const DEAD_LETTERS: TableDefinition<&str, &[u8]> = TableDefinition::new("dead_letters");

fn store_err(e: impl std::fmt::Display) -> MarshalError {
    MarshalError::Store(e.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterItem {
    pub operation_id: String,
    pub operation_type: String,
    pub payload: serde_json::Value,
    pub error: String,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetterItem {
    pub fn new(
        operation_id: impl Into<String>,
        operation_type: impl Into<String>,
        payload: serde_json::Value,
        error: impl Into<String>,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            operation_type: operation_type.into(),
            payload,
            error: error.into(),
            retry_count: 0,
            timestamp: Utc::now(),
        }
    }
}

/// Outcome of a `retry_all` replay.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub succeeded: usize,
    pub failed: usize,
}

pub struct DeadLetterQueue {
    db: Database,
}

impl DeadLetterQueue {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(store_err)?;
        let wt = db.begin_write().map_err(store_err)?;
        wt.open_table(DEAD_LETTERS).map_err(store_err)?;
        wt.commit().map_err(store_err)?;
        Ok(Self { db })
    }

    pub fn push(&self, item: &DeadLetterItem) -> Result<()> {
        let value = serde_json::to_vec(item)?;
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(DEAD_LETTERS).map_err(store_err)?;
            table
                .insert(item.operation_id.as_str(), value.as_slice())
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    /// All items, oldest first.
    pub fn list(&self) -> Result<Vec<DeadLetterItem>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(DEAD_LETTERS).map_err(store_err)?;
        let mut items = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (_, v) = entry.map_err(store_err)?;
            items.push(serde_json::from_slice(v.value())?);
        }
        items.sort_by(|a: &DeadLetterItem, b: &DeadLetterItem| a.timestamp.cmp(&b.timestamp));
        Ok(items)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.list()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove one item. Returns whether it existed.
    pub fn remove(&self, operation_id: &str) -> Result<bool> {
        let wt = self.db.begin_write().map_err(store_err)?;
        let existed = {
            let mut table = wt.open_table(DEAD_LETTERS).map_err(store_err)?;
            let existed = table.remove(operation_id).map_err(store_err)?.is_some();
            existed
        };
        wt.commit().map_err(store_err)?;
        Ok(existed)
    }

    /// Replay every item through `retry_fn`. Items that succeed are removed;
    /// items that fail stay with `retry_count` bumped and the new error.
    pub fn retry_all<F>(&self, mut retry_fn: F) -> Result<ReplayOutcome>
    where
        F: FnMut(&DeadLetterItem) -> std::result::Result<(), String>,
    {
        let mut outcome = ReplayOutcome::default();
        for mut item in self.list()? {
            match retry_fn(&item) {
                Ok(()) => {
                    self.remove(&item.operation_id)?;
                    info!(operation_id = %item.operation_id, "dead letter replayed successfully");
                    outcome.succeeded += 1;
                }
                Err(e) => {
                    item.retry_count += 1;
                    item.error = e;
                    self.push(&item)?;
                    outcome.failed += 1;
                }
            }
        }
        Ok(outcome)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
