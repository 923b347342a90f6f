use crate::error::Result;
use crate::io;
use crate::paths;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// IngestConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_ingest_poll_seconds")]
    pub poll_interval_seconds: u64,
    /// How long a fingerprint suppresses a repeated signal.
    #[serde(default = "default_dedup_ttl_seconds")]
    pub dedup_ttl_seconds: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    /// Consecutive poll failures before the source enters cooldown.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_cooldown_seconds")]
    pub cooldown_seconds: u64,
}

fn default_ingest_poll_seconds() -> u64 {
    60
}

fn default_dedup_ttl_seconds() -> u64 {
    3600
}

fn default_dedup_capacity() -> usize {
    10_000
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_seconds() -> u64 {
    300
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_ingest_poll_seconds(),
            dedup_ttl_seconds: default_dedup_ttl_seconds(),
            dedup_capacity: default_dedup_capacity(),
            failure_threshold: default_failure_threshold(),
            cooldown_seconds: default_cooldown_seconds(),
        }
    }
}

// ---------------------------------------------------------------------------
// ApprovalConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default = "default_approval_poll_seconds")]
    pub poll_interval_seconds: u64,
    /// Approval window before a pending record is force-rejected.
    #[serde(default = "default_timeout_hours")]
    pub default_timeout_hours: u64,
    /// Per-action-type overrides of the approval window.
    #[serde(default)]
    pub timeout_hours: HashMap<String, u64>,
    /// Approve low-risk records without an operator. Off by default.
    #[serde(default)]
    pub auto_approve_low_risk: bool,
}

fn default_approval_poll_seconds() -> u64 {
    30
}

fn default_timeout_hours() -> u64 {
    24
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_approval_poll_seconds(),
            default_timeout_hours: default_timeout_hours(),
            timeout_hours: HashMap::new(),
            auto_approve_low_risk: false,
        }
    }
}

impl ApprovalConfig {
    pub fn timeout_for(&self, action_type: &str) -> chrono::Duration {
        let hours = self
            .timeout_hours
            .get(action_type)
            .copied()
            .unwrap_or(self.default_timeout_hours);
        chrono::Duration::hours(hours as i64)
    }
}

// ---------------------------------------------------------------------------
// ExecutionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_execution_poll_seconds")]
    pub poll_interval_seconds: u64,
    /// Maximum retries after the first attempt. `3` means up to four
    /// invocations total when every failure is transient.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed delay schedule between attempts, indexed by retry number.
    /// The last entry repeats if retries outnumber entries.
    #[serde(default = "default_retry_delays")]
    pub retry_delays_seconds: Vec<u64>,
    /// In-progress records older than this are failed on startup recovery.
    #[serde(default = "default_stale_seconds")]
    pub stale_after_seconds: u64,
}

fn default_execution_poll_seconds() -> u64 {
    15
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delays() -> Vec<u64> {
    vec![2, 4, 8]
}

fn default_stale_seconds() -> u64 {
    600
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: default_execution_poll_seconds(),
            max_retries: default_max_retries(),
            retry_delays_seconds: default_retry_delays(),
            stale_after_seconds: default_stale_seconds(),
        }
    }
}

impl ExecutionConfig {
    pub fn retry_delay(&self, retry: u32) -> Duration {
        let idx = (retry as usize).min(self.retry_delays_seconds.len().saturating_sub(1));
        Duration::from_secs(self.retry_delays_seconds.get(idx).copied().unwrap_or(2))
    }
}

// ---------------------------------------------------------------------------
// SupervisorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_check_seconds")]
    pub check_interval_seconds: u64,
    #[serde(default = "default_settle_ms")]
    pub settle_delay_ms: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_window_seconds")]
    pub restart_window_seconds: u64,
}

fn default_check_seconds() -> u64 {
    10
}

fn default_settle_ms() -> u64 {
    500
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_window_seconds() -> u64 {
    300
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: default_check_seconds(),
            settle_delay_ms: default_settle_ms(),
            max_restarts: default_max_restarts(),
            restart_window_seconds: default_restart_window_seconds(),
        }
    }
}

// ---------------------------------------------------------------------------
// AuditConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Day files older than this are deleted by retention cleanup.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_retention_days() -> u32 {
    90
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: default_retention_days(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl Config {
    /// Load `.marshal/config.yaml`, falling back to defaults when absent.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        io::atomic_write(&paths::config_path(root), yaml.as_bytes())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
