//! Approval state machine.
//!
//! Risky actions wait in `Pending` until an operator records a verdict (or
//! the approval window lapses). The verdict is written onto the record by
//! `decide()`; the status transition itself happens on the gate's next
//! `poll()`, which also force-rejects anything past its `timeout_at`. A
//! record already transitioned no longer matches the pending listing, so
//! re-running `poll()` after a crash is a no-op for it.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{Actor, AuditEvent, AuditLog};
use crate::config::ApprovalConfig;
use crate::error::Result;
use crate::paths;
use crate::record::{ActionRecord, ActionStatus, Decision, RiskFactors, RiskLevel, Verdict};
use crate::runtime::Shutdown;
use crate::store::RecordStore;

// ---------------------------------------------------------------------------
// ApprovalGate
// ---------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ApprovalSweep {
    pub approved: usize,
    pub rejected: usize,
    pub timed_out: usize,
}

pub struct ApprovalGate {
    store: Arc<RecordStore>,
    audit: Arc<AuditLog>,
    config: ApprovalConfig,
}

impl ApprovalGate {
    pub fn new(store: Arc<RecordStore>, audit: Arc<AuditLog>, config: ApprovalConfig) -> Self {
        Self {
            store,
            audit,
            config,
        }
    }

    /// Create a pending request: risk-score the factors, stamp the approval
    /// window, persist, audit.
    pub fn create_request(
        &self,
        action_type: &str,
        payload: serde_json::Value,
        factors: RiskFactors,
    ) -> Result<ActionRecord> {
        paths::validate_action_type(action_type)?;
        let record = ActionRecord::new(
            action_type,
            payload,
            factors,
            self.config.timeout_for(action_type),
        );
        self.store.insert(&record)?;
        info!(
            id = %record.id,
            action_type,
            risk_score = record.risk_score,
            risk_level = %record.risk_level,
            "approval request created"
        );
        self.audit.append(
            &AuditEvent::new(
                record.id.to_string(),
                action_type,
                "approval",
                Actor::system("approval-gate"),
                "requested",
            )
            .with_tag(record.risk_level.as_str()),
        )?;
        Ok(record)
    }

    /// Record an operator verdict on a pending record. The status flip is
    /// applied by the next `poll()`.
    pub fn decide(
        &self,
        id: Uuid,
        verdict: Verdict,
        decided_by: &str,
        reason: Option<String>,
    ) -> Result<ActionRecord> {
        let record = self.store.get(id)?;
        self.store.update(id, record.version, |r| {
            r.decision = Some(Decision {
                verdict,
                decided_by: decided_by.to_string(),
                decided_at: Utc::now(),
                reason,
            });
        })
    }

    /// One sweep over the pending set: apply recorded verdicts, enforce the
    /// timeout, optionally auto-approve low risk. Idempotent.
    pub fn poll(&self) -> Result<ApprovalSweep> {
        let now = Utc::now();
        let mut sweep = ApprovalSweep::default();

        for record in self.store.list_status(ActionStatus::Pending)? {
            match &record.decision {
                Some(decision) => match decision.verdict {
                    Verdict::Approve => {
                        self.apply(&record, ActionStatus::Approved, None)?;
                        sweep.approved += 1;
                    }
                    Verdict::Reject => {
                        let reason = decision
                            .reason
                            .clone()
                            .unwrap_or_else(|| "rejected by operator".into());
                        self.apply(&record, ActionStatus::Rejected, Some(reason))?;
                        sweep.rejected += 1;
                    }
                },
                None if now > record.timeout_at => {
                    let reason = format!(
                        "approval timeout: no decision by {}",
                        record.timeout_at.to_rfc3339()
                    );
                    self.apply(&record, ActionStatus::Rejected, Some(reason))?;
                    sweep.timed_out += 1;
                }
                None if self.config.auto_approve_low_risk
                    && record.risk_level == RiskLevel::Low =>
                {
                    let approved = self.store.update(record.id, record.version, |r| {
                        r.decision = Some(Decision {
                            verdict: Verdict::Approve,
                            decided_by: "auto".into(),
                            decided_at: now,
                            reason: Some("low risk auto-approval".into()),
                        });
                    })?;
                    self.apply(&approved, ActionStatus::Approved, None)?;
                    sweep.approved += 1;
                }
                None => {}
            }
        }
        Ok(sweep)
    }

    fn apply(
        &self,
        record: &ActionRecord,
        to: ActionStatus,
        reason: Option<String>,
    ) -> Result<()> {
        let updated = self
            .store
            .transition(record.id, record.version, to, |r| {
                if let Some(reason) = reason {
                    r.error = Some(reason);
                }
            })?;

        let actor = match &updated.decision {
            Some(d) if d.decided_by != "auto" => Actor::human(d.decided_by.clone()),
            _ => Actor::system("approval-gate"),
        };
        let mut event = AuditEvent::new(
            updated.id.to_string(),
            updated.action_type.clone(),
            "approval",
            actor,
            to.as_str(),
        );
        if let Some(error) = &updated.error {
            event = event.with_error(error.clone());
        }
        self.audit.append(&event)?;
        Ok(())
    }

    /// The component loop.
    pub async fn run(self, mut shutdown: Shutdown) -> Result<()> {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_seconds.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll() {
                        Ok(sweep) if sweep != ApprovalSweep::default() => {
                            info!(
                                approved = sweep.approved,
                                rejected = sweep.rejected,
                                timed_out = sweep.timed_out,
                                "approval sweep"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "approval sweep failed"),
                    }
                }
                _ = shutdown.triggered() => {
                    info!("approval loop stopping");
                    return Ok(());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RiskFactors;
    use tempfile::TempDir;

    fn gate_with(config: ApprovalConfig) -> (TempDir, ApprovalGate, Arc<RecordStore>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RecordStore::open(&dir.path().join("records.redb")).unwrap());
        let audit = Arc::new(AuditLog::new(dir.path().join("audit")));
        let gate = ApprovalGate::new(Arc::clone(&store), audit, config);
        (dir, gate, store)
    }

    fn gate() -> (TempDir, ApprovalGate, Arc<RecordStore>) {
        gate_with(ApprovalConfig::default())
    }

    fn risky() -> RiskFactors {
        RiskFactors {
            external_recipient: true,
            irreversible: true,
            ..Default::default()
        }
    }

    #[test]
    fn create_request_scores_and_persists_pending() {
        let (_dir, gate, store) = gate();
        let record = gate
            .create_request("wire-transfer", serde_json::json!({"amount": 120}), risky())
            .unwrap();
        assert_eq!(record.status, ActionStatus::Pending);
        assert_eq!(record.risk_score, 70);
        assert_eq!(record.risk_level, RiskLevel::High);
        assert_eq!(store.get(record.id).unwrap(), record);
    }

    #[test]
    fn create_request_rejects_bad_action_type() {
        let (_dir, gate, _store) = gate();
        assert!(gate
            .create_request("Not A Slug", serde_json::json!({}), risky())
            .is_err());
    }

    #[test]
    fn approve_is_applied_on_next_poll() {
        let (_dir, gate, store) = gate();
        let record = gate
            .create_request("send-email", serde_json::json!({}), risky())
            .unwrap();

        gate.decide(record.id, Verdict::Approve, "ops", None).unwrap();
        // Still pending until the sweep runs
        assert_eq!(store.get(record.id).unwrap().status, ActionStatus::Pending);

        let sweep = gate.poll().unwrap();
        assert_eq!(sweep.approved, 1);
        let updated = store.get(record.id).unwrap();
        assert_eq!(updated.status, ActionStatus::Approved);
        assert_eq!(updated.decision.as_ref().unwrap().decided_by, "ops");
    }

    #[test]
    fn reject_carries_reason() {
        let (_dir, gate, store) = gate();
        let record = gate
            .create_request("send-email", serde_json::json!({}), risky())
            .unwrap();
        gate.decide(
            record.id,
            Verdict::Reject,
            "ops",
            Some("not during launch week".into()),
        )
        .unwrap();

        let sweep = gate.poll().unwrap();
        assert_eq!(sweep.rejected, 1);
        let updated = store.get(record.id).unwrap();
        assert_eq!(updated.status, ActionStatus::Rejected);
        assert_eq!(updated.error.as_deref(), Some("not during launch week"));
    }

    #[test]
    fn expired_pending_record_is_rejected_with_timeout_reason() {
        let config = ApprovalConfig {
            default_timeout_hours: 0,
            ..Default::default()
        };
        let (_dir, gate, store) = gate_with(config);
        let record = gate
            .create_request("send-email", serde_json::json!({}), risky())
            .unwrap();

        let sweep = gate.poll().unwrap();
        assert_eq!(sweep.timed_out, 1);
        let updated = store.get(record.id).unwrap();
        assert_eq!(updated.status, ActionStatus::Rejected);
        assert!(updated.error.as_deref().unwrap().contains("timeout"));
    }

    #[test]
    fn poll_is_idempotent() {
        let (_dir, gate, store) = gate();
        let record = gate
            .create_request("send-email", serde_json::json!({}), risky())
            .unwrap();
        gate.decide(record.id, Verdict::Approve, "ops", None).unwrap();

        assert_eq!(gate.poll().unwrap().approved, 1);
        // Second sweep sees no pending records and changes nothing
        assert_eq!(gate.poll().unwrap(), ApprovalSweep::default());
        assert_eq!(store.get(record.id).unwrap().status, ActionStatus::Approved);
    }

    #[test]
    fn undecided_unexpired_record_is_untouched() {
        let (_dir, gate, store) = gate();
        let record = gate
            .create_request("send-email", serde_json::json!({}), risky())
            .unwrap();
        assert_eq!(gate.poll().unwrap(), ApprovalSweep::default());
        assert_eq!(store.get(record.id).unwrap().status, ActionStatus::Pending);
    }

    #[test]
    fn auto_approve_low_risk_when_enabled() {
        let config = ApprovalConfig {
            auto_approve_low_risk: true,
            ..Default::default()
        };
        let (_dir, gate, store) = gate_with(config);
        let low = gate
            .create_request("refresh-cache", serde_json::json!({}), RiskFactors::default())
            .unwrap();
        let high = gate
            .create_request("wire-transfer", serde_json::json!({}), risky())
            .unwrap();

        let sweep = gate.poll().unwrap();
        assert_eq!(sweep.approved, 1);
        assert_eq!(store.get(low.id).unwrap().status, ActionStatus::Approved);
        assert_eq!(store.get(high.id).unwrap().status, ActionStatus::Pending);
    }
}
