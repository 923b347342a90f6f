//! Ingestion and deduplication.
//!
//! The runner polls one `SignalSource`, fingerprints each signal, and turns
//! unseen signals into pending records. A fingerprint seen within the dedup
//! TTL suppresses the repeat. Consecutive poll failures trip a cooldown so a
//! broken source doesn't spin.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::audit::{Actor, AuditEvent, AuditLog};
use crate::config::IngestConfig;
use crate::error::Result;
use crate::paths;
use crate::record::{ActionRecord, RiskFactors};
use crate::resilience::TtlCache;
use crate::runtime::Shutdown;
use crate::store::RecordStore;

// ---------------------------------------------------------------------------
// Signal & fingerprinting
// ---------------------------------------------------------------------------

/// A normalized external signal, as produced by a source watcher.
#[derive(Debug, Clone)]
pub struct Signal {
    /// Where it came from (mailbox address, feed URL, channel id).
    pub origin: String,
    /// What it is about (subject, thread, post id).
    pub topic: String,
    pub timestamp: DateTime<Utc>,
    pub content: String,
    /// The action this signal should become.
    pub action_type: String,
    pub payload: serde_json::Value,
    /// Risk traits of acting on this signal, known to the source.
    pub risk: RiskFactors,
}

/// Content prefix length folded into the fingerprint. Long bodies differing
/// only past this point count as the same signal.
const FINGERPRINT_CONTENT_PREFIX: usize = 256;

/// Stable hash over (origin, topic, timestamp, content prefix).
pub fn fingerprint(signal: &Signal) -> String {
    let mut hasher = Sha256::new();
    hasher.update(signal.origin.as_bytes());
    hasher.update([0]);
    hasher.update(signal.topic.as_bytes());
    hasher.update([0]);
    hasher.update(signal.timestamp.to_rfc3339().as_bytes());
    hasher.update([0]);
    let prefix: String = signal.content.chars().take(FINGERPRINT_CONTENT_PREFIX).collect();
    hasher.update(prefix.as_bytes());

    let digest = hasher.finalize();
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

// ---------------------------------------------------------------------------
// SignalSource
// ---------------------------------------------------------------------------

/// One external source of signals. Implementations (mail watcher, feed
/// poller, platform mock) live outside the core.
#[async_trait]
pub trait SignalSource: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch whatever arrived since the last poll. An error counts toward
    /// the cooldown threshold.
    async fn poll(&mut self) -> Result<Vec<Signal>>;
}

// ---------------------------------------------------------------------------
// IngestRunner
// ---------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub created: usize,
    pub duplicates: usize,
}

pub struct IngestRunner {
    source: Box<dyn SignalSource>,
    store: Arc<RecordStore>,
    audit: Arc<AuditLog>,
    dedup: TtlCache<String, DateTime<Utc>>,
    config: IngestConfig,
    approval_timeout: chrono::Duration,
    failure_streak: u32,
    cooldown_until: Option<Instant>,
}

impl IngestRunner {
    pub fn new(
        source: Box<dyn SignalSource>,
        store: Arc<RecordStore>,
        audit: Arc<AuditLog>,
        config: IngestConfig,
        approval_timeout: chrono::Duration,
    ) -> Self {
        let dedup = TtlCache::new(
            config.dedup_capacity,
            Duration::from_secs(config.dedup_ttl_seconds),
        );
        Self {
            source,
            store,
            audit,
            dedup,
            config,
            approval_timeout,
            failure_streak: 0,
            cooldown_until: None,
        }
    }

    /// One poll cycle. Returns what happened, `None` while cooling down.
    pub async fn tick(&mut self) -> Result<Option<IngestOutcome>> {
        if let Some(until) = self.cooldown_until {
            if Instant::now() < until {
                return Ok(None);
            }
            self.cooldown_until = None;
        }

        let signals = match self.source.poll().await {
            Ok(signals) => {
                self.failure_streak = 0;
                signals
            }
            Err(e) => {
                self.failure_streak += 1;
                warn!(
                    source = self.source.name(),
                    streak = self.failure_streak,
                    error = %e,
                    "source poll failed"
                );
                if self.failure_streak >= self.config.failure_threshold {
                    self.enter_cooldown(&e.to_string())?;
                }
                return Ok(Some(IngestOutcome::default()));
            }
        };

        let mut outcome = IngestOutcome::default();
        for signal in signals {
            if self.ingest_signal(&signal)? {
                outcome.created += 1;
            } else {
                outcome.duplicates += 1;
            }
        }
        if outcome.created > 0 {
            info!(
                source = self.source.name(),
                created = outcome.created,
                duplicates = outcome.duplicates,
                "ingested signals"
            );
        }
        Ok(Some(outcome))
    }

    /// Returns true if a record was created, false if deduplicated.
    fn ingest_signal(&mut self, signal: &Signal) -> Result<bool> {
        paths::validate_action_type(&signal.action_type)?;

        let fp = fingerprint(signal);
        if self.dedup.contains(&fp) {
            return Ok(false);
        }

        let record = ActionRecord::new(
            signal.action_type.clone(),
            signal.payload.clone(),
            signal.risk,
            self.approval_timeout,
        );
        self.store.insert(&record)?;
        self.dedup.insert(fp, Utc::now());

        self.audit.append(
            &AuditEvent::new(
                record.id.to_string(),
                record.action_type.clone(),
                "ingest",
                Actor::system(self.source.name()),
                "created",
            )
            .with_tag(record.risk_level.as_str()),
        )?;
        Ok(true)
    }

    fn enter_cooldown(&mut self, error: &str) -> Result<()> {
        let cooldown = Duration::from_secs(self.config.cooldown_seconds);
        self.cooldown_until = Some(Instant::now() + cooldown);
        self.failure_streak = 0;
        warn!(
            source = self.source.name(),
            cooldown_seconds = cooldown.as_secs(),
            "source entered cooldown"
        );
        self.audit.append(
            &AuditEvent::new(
                "-",
                "source-poll",
                "ingest",
                Actor::system(self.source.name()),
                "cooldown",
            )
            .with_error(error),
        )
    }

    /// The component loop: poll on the configured interval until shutdown.
    pub async fn run(mut self, mut shutdown: Shutdown) -> Result<()> {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_seconds.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "ingest tick failed");
                    }
                }
                _ = shutdown.triggered() => {
                    info!(source = self.source.name(), "ingest loop stopping");
                    return Ok(());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
