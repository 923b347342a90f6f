//! ActionRecord data model.
//!
//! An `ActionRecord` is the unit of work moving through the pipeline:
//! created pending by ingestion, risk-scored, gated behind human approval,
//! then executed by the engine. The status field carries the record through
//! an explicit transition table; the `version` field is the optimistic
//! concurrency token checked by `RecordStore` on every write.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ActionStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a record.
///
/// Transitions:
/// `Pending → Approved | Rejected | Timeout`
/// `Approved → InProgress`
/// `InProgress → Completed | Failed | Quarantined`
///
/// Terminal records are archived in place, never deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Pending,
    Approved,
    Rejected,
    Timeout,
    InProgress,
    Completed,
    Failed,
    Quarantined,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Quarantined => "quarantined",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Rejected | Self::Timeout | Self::Completed | Self::Failed | Self::Quarantined
        )
    }

    /// The explicit transition table.
    pub fn can_transition_to(&self, to: ActionStatus) -> bool {
        use ActionStatus::*;
        matches!(
            (self, to),
            (Pending, Approved)
                | (Pending, Rejected)
                | (Pending, Timeout)
                | (Approved, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Quarantined)
        )
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "timeout" => Ok(Self::Timeout),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "quarantined" => Ok(Self::Quarantined),
            other => Err(format!("unknown status: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Risk scoring
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    /// Threshold mapping: score ≤ 20 low, ≤ 50 medium, else high.
    pub fn from_score(score: u8) -> Self {
        match score {
            0..=20 => Self::Low,
            21..=50 => Self::Medium,
            _ => Self::High,
        }
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Boolean risk factors contributing to the weighted score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFactors {
    #[serde(default)]
    pub external_recipient: bool,
    #[serde(default)]
    pub irreversible: bool,
    #[serde(default)]
    pub contains_pii: bool,
    #[serde(default)]
    pub has_cost: bool,
    #[serde(default)]
    pub public_visibility: bool,
    #[serde(default)]
    pub reputational_impact: bool,
    #[serde(default)]
    pub data_loss_potential: bool,
}

impl RiskFactors {
    /// Weighted sum, clamped to [0, 100].
    pub fn score(&self) -> u8 {
        let mut score: u32 = 0;
        if self.external_recipient {
            score += 40;
        }
        if self.irreversible {
            score += 30;
        }
        if self.contains_pii {
            score += 25;
        }
        if self.has_cost {
            score += 20;
        }
        if self.public_visibility {
            score += 15;
        }
        if self.reputational_impact {
            score += 10;
        }
        if self.data_loss_potential {
            score += 35;
        }
        score.min(100) as u8
    }

    pub fn level(&self) -> RiskLevel {
        RiskLevel::from_score(self.score())
    }
}

// ---------------------------------------------------------------------------
// Decision — operator verdict recorded on a pending record
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Reject,
}

/// An operator's verdict, written onto the pending record by `decide()` and
/// applied as a status transition on the gate's next `poll()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub verdict: Verdict,
    pub decided_by: String,
    pub decided_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// ActionRecord
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRecord {
    pub id: Uuid,
    pub action_type: String,
    pub status: ActionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub timeout_at: DateTime<Utc>,
    pub risk_score: u8,
    pub risk_level: RiskLevel,
    pub retry_count: u32,
    /// Optimistic concurrency token, incremented on every store write.
    pub version: u64,
    /// Handler-specific data, opaque to the pipeline.
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<Decision>,
    /// Terminal success output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Terminal failure (or rejection) reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ActionRecord {
    /// Create a new pending record. `timeout` is the approval window.
    pub fn new(
        action_type: impl Into<String>,
        payload: serde_json::Value,
        factors: RiskFactors,
        timeout: Duration,
    ) -> Self {
        let now = Utc::now();
        let score = factors.score();
        Self {
            id: Uuid::new_v4(),
            action_type: action_type.into(),
            status: ActionStatus::Pending,
            created_at: now,
            updated_at: now,
            timeout_at: now + timeout,
            risk_score: score,
            risk_level: RiskLevel::from_score(score),
            retry_count: 0,
            version: 0,
            payload,
            decision: None,
            result: None,
            error: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
