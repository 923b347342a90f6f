//! Persistent record store using redb.
//!
//! # Table design
//!
//! A single `RECORDS` table maps the 16-byte record uuid to a JSON-encoded
//! `ActionRecord`. The record's `status` is a document field, not a physical
//! location: the atomic transition primitive is a compare-and-swap on the
//! `version` counter inside one write transaction, and the legal edges are
//! enforced by `ActionStatus::can_transition_to` before the swap. A stale
//! `version` means another writer got there first; the caller skips or
//! re-reads rather than clobbering.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::error::{MarshalError, Result};
use crate::record::{ActionRecord, ActionStatus};

/// Key: uuid bytes. Value: JSON-encoded ActionRecord.
const RECORDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("records");

fn store_err(e: impl std::fmt::Display) -> MarshalError {
    MarshalError::Store(e.to_string())
}

/// Persistent store for `ActionRecord` documents.
pub struct RecordStore {
    db: Database,
}

impl RecordStore {
    /// Open or create the redb database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(store_err)?;
        // Ensure the table exists before any reads
        let wt = db.begin_write().map_err(store_err)?;
        wt.open_table(RECORDS).map_err(store_err)?;
        wt.commit().map_err(store_err)?;
        Ok(Self { db })
    }

    /// Insert a new record. Fails if the id already exists.
    pub fn insert(&self, record: &ActionRecord) -> Result<()> {
        let value = serde_json::to_vec(record)?;
        let wt = self.db.begin_write().map_err(store_err)?;
        {
            let mut table = wt.open_table(RECORDS).map_err(store_err)?;
            let existing = table
                .get(record.id.as_bytes().as_slice())
                .map_err(store_err)?;
            if existing.is_some() {
                return Err(MarshalError::Store(format!(
                    "record already exists: {}",
                    record.id
                )));
            }
            drop(existing);
            table
                .insert(record.id.as_bytes().as_slice(), value.as_slice())
                .map_err(store_err)?;
        }
        wt.commit().map_err(store_err)?;
        Ok(())
    }

    pub fn get(&self, id: Uuid) -> Result<ActionRecord> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(RECORDS).map_err(store_err)?;
        let value = table
            .get(id.as_bytes().as_slice())
            .map_err(store_err)?
            .ok_or(MarshalError::RecordNotFound(id))?;
        Ok(serde_json::from_slice(value.value())?)
    }

    /// Transition a record along a legal status edge, guarded by CAS on
    /// `version`. `mutate` runs after the status flip to stamp
    /// transition-specific fields (result, error, decision timestamps).
    ///
    /// Returns the updated record.
    pub fn transition<F>(
        &self,
        id: Uuid,
        expected_version: u64,
        to: ActionStatus,
        mutate: F,
    ) -> Result<ActionRecord>
    where
        F: FnOnce(&mut ActionRecord),
    {
        self.write_record(id, expected_version, |record| {
            if !record.status.can_transition_to(to) {
                return Err(MarshalError::InvalidTransition {
                    from: record.status.to_string(),
                    to: to.to_string(),
                });
            }
            record.status = to;
            mutate(record);
            Ok(())
        })
    }

    /// Update a record in place without a status change (e.g. recording an
    /// operator decision on a still-pending record). Same CAS guard.
    pub fn update<F>(&self, id: Uuid, expected_version: u64, mutate: F) -> Result<ActionRecord>
    where
        F: FnOnce(&mut ActionRecord),
    {
        self.write_record(id, expected_version, |record| {
            mutate(record);
            Ok(())
        })
    }

    fn write_record<F>(&self, id: Uuid, expected_version: u64, apply: F) -> Result<ActionRecord>
    where
        F: FnOnce(&mut ActionRecord) -> Result<()>,
    {
        let wt = self.db.begin_write().map_err(store_err)?;
        let updated = {
            let mut table = wt.open_table(RECORDS).map_err(store_err)?;
            let mut record: ActionRecord = {
                let value = table
                    .get(id.as_bytes().as_slice())
                    .map_err(store_err)?
                    .ok_or(MarshalError::RecordNotFound(id))?;
                serde_json::from_slice(value.value())?
            };

            if record.version != expected_version {
                return Err(MarshalError::VersionConflict {
                    id,
                    expected: expected_version,
                    found: record.version,
                });
            }

            apply(&mut record)?;
            record.version += 1;
            record.updated_at = Utc::now();

            let value = serde_json::to_vec(&record)?;
            table
                .insert(id.as_bytes().as_slice(), value.as_slice())
                .map_err(store_err)?;
            record
        };
        wt.commit().map_err(store_err)?;
        Ok(updated)
    }

    /// All records with the given status, oldest first (the sweep order).
    pub fn list_status(&self, status: ActionStatus) -> Result<Vec<ActionRecord>> {
        let mut records: Vec<ActionRecord> = self
            .list_all()?
            .into_iter()
            .filter(|r| r.status == status)
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// List all records, newest first.
    pub fn list_all(&self) -> Result<Vec<ActionRecord>> {
        let rt = self.db.begin_read().map_err(store_err)?;
        let table = rt.open_table(RECORDS).map_err(store_err)?;
        let mut records = Vec::new();
        for entry in table.iter().map_err(store_err)? {
            let (_, v) = entry.map_err(store_err)?;
            records.push(serde_json::from_slice(v.value())?);
        }
        records.sort_by(|a: &ActionRecord, b: &ActionRecord| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Record count per status, for health and status reporting.
    pub fn counts(&self) -> Result<Vec<(ActionStatus, usize)>> {
        let mut counts: std::collections::HashMap<ActionStatus, usize> =
            std::collections::HashMap::new();
        for record in self.list_all()? {
            *counts.entry(record.status).or_default() += 1;
        }
        let mut counts: Vec<_> = counts.into_iter().collect();
        counts.sort_by_key(|(s, _)| s.as_str());
        Ok(counts)
    }

    /// On startup, fail any record stuck `InProgress` longer than `max_age`
    /// (the process died mid-execution). Returns the recovered records.
    pub fn recover_stale_in_progress(&self, max_age: Duration) -> Result<Vec<ActionRecord>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| MarshalError::Store(e.to_string()))?;

        let mut recovered = Vec::new();
        for record in self.list_status(ActionStatus::InProgress)? {
            if record.updated_at < cutoff {
                let updated = self.transition(
                    record.id,
                    record.version,
                    ActionStatus::Failed,
                    |r| r.error = Some("recovered from restart".into()),
                )?;
                recovered.push(updated);
            }
        }
        Ok(recovered)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
