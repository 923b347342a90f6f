//! Append-only structured audit log.
//!
//! One JSON object per line, one file per UTC day under `.marshal/audit/`.
//! Queried by operators (`marshal audit search`) and consumed to correlate
//! record failures with their execution history via `action_id`.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::Result;
use crate::io;

// ---------------------------------------------------------------------------
// AuditEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    /// "human", "system", or "scheduler".
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
    pub name: String,
}

impl Actor {
    pub fn system(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            kind: "system".into(),
            name: id.clone(),
            id,
        }
    }

    pub fn human(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            kind: "human".into(),
            name: id.clone(),
            id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub action_id: String,
    pub action_type: String,
    pub domain: String,
    pub actor: Actor,
    pub status: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl AuditEvent {
    pub fn new(
        action_id: impl Into<String>,
        action_type: impl Into<String>,
        domain: impl Into<String>,
        actor: Actor,
        status: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            action_id: action_id.into(),
            action_type: action_type.into(),
            domain: domain.into(),
            actor,
            status: status.into(),
            duration_ms: 0,
            target: None,
            context: None,
            input: None,
            output: None,
            error: None,
            approval: None,
            metrics: None,
            tags: Vec::new(),
            metadata: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = duration_ms;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

// ---------------------------------------------------------------------------
// AuditQuery
// ---------------------------------------------------------------------------

/// In-memory predicates applied after the date-range file scan.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub action_type: Option<String>,
    pub actor_id: Option<String>,
    pub status: Option<String>,
    pub domain: Option<String>,
    pub tag: Option<String>,
}

impl AuditQuery {
    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(t) = &self.action_type {
            if event.action_type != *t {
                return false;
            }
        }
        if let Some(a) = &self.actor_id {
            if event.actor.id != *a {
                return false;
            }
        }
        if let Some(s) = &self.status {
            if event.status != *s {
                return false;
            }
        }
        if let Some(d) = &self.domain {
            if event.domain != *d {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !event.tags.iter().any(|t| t == tag) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// AuditLog
// ---------------------------------------------------------------------------

pub struct AuditLog {
    dir: PathBuf,
}

impl AuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn open(root: &Path) -> Self {
        Self::new(crate::paths::audit_dir(root))
    }

    fn day_file(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.jsonl", date.format("%Y-%m-%d")))
    }

    /// Append one event to today's file.
    pub fn append(&self, event: &AuditEvent) -> Result<()> {
        let line = serde_json::to_string(event)?;
        io::append_line(&self.day_file(event.timestamp.date_naive()), &line)
    }

    /// Scan the day files covering the query's date range (default: the last
    /// 7 days) and apply the in-memory predicates. Unparseable lines are
    /// skipped with a warning, never fatal.
    pub fn search(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let to = query.to.unwrap_or_else(|| Utc::now().date_naive());
        let from = query.from.unwrap_or(to - Duration::days(7));

        let mut events = Vec::new();
        let mut date = from;
        while date <= to {
            let path = self.day_file(date);
            if path.exists() {
                let content = std::fs::read_to_string(&path)?;
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<AuditEvent>(line) {
                        Ok(event) => {
                            if query.matches(&event) {
                                events.push(event);
                            }
                        }
                        Err(e) => warn!(file = %path.display(), error = %e, "skipping unparseable audit line"),
                    }
                }
            }
            date += Duration::days(1);
        }
        Ok(events)
    }

    /// Delete whole day files older than `retention_days`. Returns the
    /// deleted file count.
    pub fn cleanup(&self, retention_days: u32) -> Result<usize> {
        if !self.dir.exists() {
            return Ok(0);
        }
        let horizon = Utc::now().date_naive() - Duration::days(retention_days as i64);
        let mut deleted = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(date) = day_file_date(&path) else {
                continue;
            };
            if date < horizon {
                std::fs::remove_file(&path)?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Event count per status over the query range, for `marshal status`.
    pub fn status_counts(&self, query: &AuditQuery) -> Result<HashMap<String, usize>> {
        let mut counts = HashMap::new();
        for event in self.search(query)? {
            *counts.entry(event.status).or_default() += 1;
        }
        Ok(counts)
    }
}

fn day_file_date(path: &Path) -> Option<NaiveDate> {
    let stem = path.file_stem()?.to_str()?;
    NaiveDate::parse_from_str(stem, "%Y-%m-%d").ok()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
