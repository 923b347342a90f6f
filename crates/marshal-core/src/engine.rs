//! Action execution engine.
//!
//! Sweeps the approved set, claims each record with a CAS transition to
//! `InProgress`, and invokes the registered handler inside a bounded retry
//! loop. Retry eligibility follows the error taxonomy: transient errors
//! retry up to the budget, system errors retry once, everything else is
//! terminal. A financial handler is never auto-retried. Data errors
//! quarantine the record instead of failing it. Every attempt and every
//! terminal outcome is audited under the record's id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::audit::{Actor, AuditEvent, AuditLog};
use crate::config::ExecutionConfig;
use crate::error::{ErrorClass, MarshalError, Result};
use crate::record::{ActionRecord, ActionStatus};
use crate::resilience::{DeadLetterItem, DeadLetterQueue};
use crate::runtime::Shutdown;
use crate::store::RecordStore;

// ---------------------------------------------------------------------------
// HandlerError
// ---------------------------------------------------------------------------

/// A handler failure plus its taxonomy class.
#[derive(Debug, Clone, Error)]
#[error("{class}: {message}")]
pub struct HandlerError {
    pub class: ErrorClass,
    pub message: String,
}

impl HandlerError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Classify from the message when the handler didn't supply a class.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            class: ErrorClass::infer(&message),
            message,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Auth, message)
    }

    pub fn logic(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Logic, message)
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Data, message)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::System, message)
    }
}

// ---------------------------------------------------------------------------
// ActionHandler & registry
// ---------------------------------------------------------------------------

/// One callable bound to one action type. Implementations (mail sender,
/// browser poster, accounting client) live outside the core.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn action_type(&self) -> &str;

    /// Financial handlers are never auto-retried; every failure surfaces
    /// for a human decision.
    fn financial(&self) -> bool {
        false
    }

    async fn handle(
        &self,
        payload: &serde_json::Value,
    ) -> std::result::Result<serde_json::Value, HandlerError>;
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a handler. A second registration for the same type is an error.
    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) -> Result<()> {
        let action_type = handler.action_type().to_string();
        crate::paths::validate_action_type(&action_type)?;
        if self.handlers.contains_key(&action_type) {
            return Err(MarshalError::HandlerDuplicate(action_type));
        }
        self.handlers.insert(action_type, handler);
        Ok(())
    }

    pub fn get(&self, action_type: &str) -> Option<&Arc<dyn ActionHandler>> {
        self.handlers.get(action_type)
    }

    pub fn action_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Startup validation: every required action type must have a handler,
    /// so a missing registration fails at boot rather than mid-pipeline.
    pub fn validate(&self, required: &[&str]) -> Result<()> {
        for action_type in required {
            if !self.handlers.contains_key(*action_type) {
                return Err(MarshalError::HandlerMissing(action_type.to_string()));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ExecutionEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub completed: usize,
    pub failed: usize,
    pub quarantined: usize,
}

enum AttemptPlan {
    Retry(Duration),
    Fail,
    Quarantine,
}

pub struct ExecutionEngine {
    store: Arc<RecordStore>,
    audit: Arc<AuditLog>,
    dlq: Arc<DeadLetterQueue>,
    registry: HandlerRegistry,
    config: ExecutionConfig,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<RecordStore>,
        audit: Arc<AuditLog>,
        dlq: Arc<DeadLetterQueue>,
        registry: HandlerRegistry,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            store,
            audit,
            dlq,
            registry,
            config,
        }
    }

    /// Fail records stuck `InProgress` from a previous process, then audit
    /// them. Called once at loop startup.
    pub fn recover(&self) -> Result<usize> {
        let stale = self
            .store
            .recover_stale_in_progress(Duration::from_secs(self.config.stale_after_seconds))?;
        for record in &stale {
            warn!(id = %record.id, "recovered stale in-progress record");
            self.audit.append(
                &AuditEvent::new(
                    record.id.to_string(),
                    record.action_type.clone(),
                    "execution",
                    Actor::system("execution-engine"),
                    "failed",
                )
                .with_error("recovered from restart"),
            )?;
        }
        Ok(stale.len())
    }

    /// One sweep over the approved set, in listing order. Each record is
    /// claimed, attempted, and written back before the next is considered.
    pub async fn execute_due(&self) -> Result<SweepStats> {
        let mut stats = SweepStats::default();
        for record in self.store.list_status(ActionStatus::Approved)? {
            // Claim. A CAS conflict means another sweeper took it; skip.
            let claimed = match self.store.transition(
                record.id,
                record.version,
                ActionStatus::InProgress,
                |_| {},
            ) {
                Ok(r) => r,
                Err(MarshalError::VersionConflict { id, .. }) => {
                    warn!(%id, "lost claim race, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self.execute_one(claimed).await? {
                ActionStatus::Completed => stats.completed += 1,
                ActionStatus::Quarantined => stats.quarantined += 1,
                _ => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    /// Run one claimed record to a terminal status and return it.
    async fn execute_one(&self, record: ActionRecord) -> Result<ActionStatus> {
        let Some(handler) = self.registry.get(&record.action_type) else {
            // Terminal, non-retryable: nothing registered for this type.
            let error = HandlerError::logic(format!(
                "no handler registered for action type: {}",
                record.action_type
            ));
            return self.finish(record, Err(error), 0);
        };
        let handler = Arc::clone(handler);

        let mut retries: u32 = 0;
        let mut system_retries: u32 = 0;
        loop {
            let started = std::time::Instant::now();
            let outcome = handler.handle(&record.payload).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            self.audit_attempt(&record, retries, duration_ms, outcome.as_ref().err())?;

            match outcome {
                Ok(result) => return self.finish(record, Ok(result), retries),
                Err(error) => {
                    match self.plan(&*handler, &error, retries, system_retries) {
                        AttemptPlan::Retry(delay) => {
                            if error.class == ErrorClass::System {
                                system_retries += 1;
                            }
                            retries += 1;
                            warn!(
                                id = %record.id,
                                retry = retries,
                                class = %error.class,
                                error = %error.message,
                                "handler failed, retrying"
                            );
                            sleep(delay).await;
                        }
                        AttemptPlan::Fail => return self.finish(record, Err(error), retries),
                        AttemptPlan::Quarantine => {
                            return self.quarantine(record, error, retries)
                        }
                    }
                }
            }
        }
    }

    fn plan(
        &self,
        handler: &dyn ActionHandler,
        error: &HandlerError,
        retries: u32,
        system_retries: u32,
    ) -> AttemptPlan {
        // Hard rule: financial operations always surface for a human.
        if handler.financial() {
            return AttemptPlan::Fail;
        }
        match error.class {
            ErrorClass::Transient if retries < self.config.max_retries => {
                AttemptPlan::Retry(self.config.retry_delay(retries))
            }
            ErrorClass::System if system_retries < 1 && retries < self.config.max_retries => {
                AttemptPlan::Retry(self.config.retry_delay(retries))
            }
            ErrorClass::Data => AttemptPlan::Quarantine,
            _ => AttemptPlan::Fail,
        }
    }

    fn finish(
        &self,
        record: ActionRecord,
        outcome: std::result::Result<serde_json::Value, HandlerError>,
        retries: u32,
    ) -> Result<ActionStatus> {
        let (to, result, error) = match outcome {
            Ok(result) => (ActionStatus::Completed, Some(result), None),
            Err(e) => (ActionStatus::Failed, None, Some(e)),
        };
        let updated = self
            .store
            .transition(record.id, record.version, to, |r| {
                r.retry_count = retries;
                r.result = result;
                r.error = error.as_ref().map(|e| e.to_string());
            })?;

        // A retryable failure that spent its budget goes to the dead-letter
        // queue for manual replay.
        if let Some(e) = &error {
            let exhausted_retryable = matches!(
                e.class,
                ErrorClass::Transient | ErrorClass::System
            ) && retries > 0;
            if exhausted_retryable {
                let mut item = DeadLetterItem::new(
                    updated.id.to_string(),
                    updated.action_type.clone(),
                    updated.payload.clone(),
                    e.to_string(),
                );
                item.retry_count = retries;
                self.dlq.push(&item)?;
            }
        }

        let mut event = AuditEvent::new(
            updated.id.to_string(),
            updated.action_type.clone(),
            "execution",
            Actor::system("execution-engine"),
            to.as_str(),
        );
        if let Some(e) = &error {
            event = event.with_error(e.to_string()).with_tag(e.class.as_str());
        }
        self.audit.append(&event)?;
        info!(id = %updated.id, status = %to, retries, "record finished");
        Ok(to)
    }

    fn quarantine(
        &self,
        record: ActionRecord,
        error: HandlerError,
        retries: u32,
    ) -> Result<ActionStatus> {
        let updated =
            self.store
                .transition(record.id, record.version, ActionStatus::Quarantined, |r| {
                    r.retry_count = retries;
                    r.error = Some(error.to_string());
                })?;
        warn!(id = %updated.id, error = %error, "record quarantined");
        self.audit.append(
            &AuditEvent::new(
                updated.id.to_string(),
                updated.action_type.clone(),
                "execution",
                Actor::system("execution-engine"),
                "quarantined",
            )
            .with_error(error.to_string())
            .with_tag(error.class.as_str()),
        )?;
        Ok(ActionStatus::Quarantined)
    }

    fn audit_attempt(
        &self,
        record: &ActionRecord,
        retries: u32,
        duration_ms: u64,
        error: Option<&HandlerError>,
    ) -> Result<()> {
        let mut event = AuditEvent::new(
            record.id.to_string(),
            record.action_type.clone(),
            "execution",
            Actor::system("execution-engine"),
            if error.is_none() {
                "attempt_succeeded"
            } else {
                "attempt_failed"
            },
        )
        .with_duration(duration_ms)
        .with_tag(format!("attempt-{}", retries + 1));
        if let Some(e) = error {
            event = event.with_error(e.to_string());
        }
        self.audit.append(&event)
    }

    /// The component loop. Runs startup recovery once, then sweeps on the
    /// configured interval until shutdown.
    pub async fn run(self, mut shutdown: Shutdown) -> Result<()> {
        match self.recover() {
            Ok(0) => {}
            Ok(n) => info!(recovered = n, "startup recovery complete"),
            Err(e) => warn!(error = %e, "startup recovery failed"),
        }

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_seconds.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.execute_due().await {
                        Ok(stats) if stats != SweepStats::default() => {
                            info!(
                                completed = stats.completed,
                                failed = stats.failed,
                                quarantined = stats.quarantined,
                                "execution sweep"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "execution sweep failed"),
                    }
                }
                _ = shutdown.triggered() => {
                    info!("execution loop stopping");
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
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    /// Handler that fails `failures` times with `error`, then succeeds.
    struct FlakyHandler {
        action_type: String,
        failures: u32,
        error: HandlerError,
        financial: bool,
        calls: AtomicU32,
    }

    impl FlakyHandler {
        fn new(action_type: &str, failures: u32, error: HandlerError) -> Arc<Self> {
            Arc::new(Self {
                action_type: action_type.into(),
                failures,
                error,
                financial: false,
                calls: AtomicU32::new(0),
            })
        }

        fn financial(action_type: &str, failures: u32, error: HandlerError) -> Arc<Self> {
            Arc::new(Self {
                action_type: action_type.into(),
                failures,
                error,
                financial: true,
                calls: AtomicU32::new(0),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ActionHandler for FlakyHandler {
        fn action_type(&self) -> &str {
            &self.action_type
        }

        fn financial(&self) -> bool {
            self.financial
        }

        async fn handle(
            &self,
            _payload: &serde_json::Value,
        ) -> std::result::Result<serde_json::Value, HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.error.clone())
            } else {
                Ok(serde_json::json!({"attempt": n + 1}))
            }
        }
    }

    fn fast_config() -> ExecutionConfig {
        ExecutionConfig {
            max_retries: 3,
            retry_delays_seconds: vec![0],
            ..Default::default()
        }
    }

    fn engine_with(
        handlers: Vec<Arc<dyn ActionHandler>>,
        config: ExecutionConfig,
    ) -> (TempDir, ExecutionEngine, Arc<RecordStore>, Arc<DeadLetterQueue>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RecordStore::open(&dir.path().join("records.redb")).unwrap());
        let audit = Arc::new(AuditLog::new(dir.path().join("audit")));
        let dlq = Arc::new(DeadLetterQueue::open(&dir.path().join("dlq.redb")).unwrap());
        let mut registry = HandlerRegistry::new();
        for handler in handlers {
            registry.register(handler).unwrap();
        }
        let engine = ExecutionEngine::new(
            Arc::clone(&store),
            audit,
            Arc::clone(&dlq),
            registry,
            config,
        );
        (dir, engine, store, dlq)
    }

    fn approved_record(store: &RecordStore, action_type: &str) -> ActionRecord {
        let record = ActionRecord::new(
            action_type,
            serde_json::json!({}),
            RiskFactors::default(),
            chrono::Duration::hours(24),
        );
        store.insert(&record).unwrap();
        store
            .transition(record.id, 0, ActionStatus::Approved, |_| {})
            .unwrap()
    }

    #[tokio::test]
    async fn two_transient_failures_then_success_completes_with_retry_count_2() {
        let handler = FlakyHandler::new("send-email", 2, HandlerError::transient("timeout"));
        let (_dir, engine, store, _dlq) =
            engine_with(vec![handler.clone() as Arc<dyn ActionHandler>], fast_config());
        let record = approved_record(&store, "send-email");

        let stats = engine.execute_due().await.unwrap();
        assert_eq!(stats.completed, 1);

        let updated = store.get(record.id).unwrap();
        assert_eq!(updated.status, ActionStatus::Completed);
        assert_eq!(updated.retry_count, 2);
        assert!(updated.result.is_some());
        assert_eq!(handler.calls(), 3);
    }

    #[tokio::test]
    async fn transient_exhaustion_fails_with_last_error() {
        let handler = FlakyHandler::new("send-email", 10, HandlerError::transient("timeout"));
        let (_dir, engine, store, _dlq) =
            engine_with(vec![handler.clone() as Arc<dyn ActionHandler>], fast_config());
        let record = approved_record(&store, "send-email");

        let stats = engine.execute_due().await.unwrap();
        assert_eq!(stats.failed, 1);

        let updated = store.get(record.id).unwrap();
        assert_eq!(updated.status, ActionStatus::Failed);
        assert_eq!(updated.retry_count, 3);
        assert!(updated.error.as_deref().unwrap().contains("timeout"));
        // max_retries=3 means four invocations total
        assert_eq!(handler.calls(), 4);
    }

    #[tokio::test]
    async fn auth_error_is_not_retried() {
        let handler = FlakyHandler::new("send-email", 10, HandlerError::auth("expired token"));
        let (_dir, engine, store, _dlq) =
            engine_with(vec![handler.clone() as Arc<dyn ActionHandler>], fast_config());
        let record = approved_record(&store, "send-email");

        engine.execute_due().await.unwrap();
        let updated = store.get(record.id).unwrap();
        assert_eq!(updated.status, ActionStatus::Failed);
        assert_eq!(updated.retry_count, 0);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn system_error_is_retried_exactly_once() {
        let handler = FlakyHandler::new("send-email", 10, HandlerError::system("disk full"));
        let (_dir, engine, store, _dlq) =
            engine_with(vec![handler.clone() as Arc<dyn ActionHandler>], fast_config());
        let record = approved_record(&store, "send-email");

        engine.execute_due().await.unwrap();
        let updated = store.get(record.id).unwrap();
        assert_eq!(updated.status, ActionStatus::Failed);
        assert_eq!(handler.calls(), 2);
    }

    #[tokio::test]
    async fn data_error_quarantines() {
        let handler = FlakyHandler::new(
            "send-email",
            10,
            HandlerError::data("malformed payload: missing field 'to'"),
        );
        let (_dir, engine, store, _dlq) =
            engine_with(vec![handler.clone() as Arc<dyn ActionHandler>], fast_config());
        let record = approved_record(&store, "send-email");

        let stats = engine.execute_due().await.unwrap();
        assert_eq!(stats.quarantined, 1);
        let updated = store.get(record.id).unwrap();
        assert_eq!(updated.status, ActionStatus::Quarantined);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn financial_handler_is_never_retried_even_for_transient() {
        let handler =
            FlakyHandler::financial("wire-transfer", 10, HandlerError::transient("timeout"));
        let (_dir, engine, store, _dlq) =
            engine_with(vec![handler.clone() as Arc<dyn ActionHandler>], fast_config());
        let record = approved_record(&store, "wire-transfer");

        engine.execute_due().await.unwrap();
        let updated = store.get(record.id).unwrap();
        assert_eq!(updated.status, ActionStatus::Failed);
        assert_eq!(updated.retry_count, 0);
        assert_eq!(handler.calls(), 1);
    }

    #[tokio::test]
    async fn unregistered_type_fails_without_retry() {
        let (_dir, engine, store, _dlq) = engine_with(vec![], fast_config());
        let record = approved_record(&store, "unknown-action");

        let stats = engine.execute_due().await.unwrap();
        assert_eq!(stats.failed, 1);
        let updated = store.get(record.id).unwrap();
        assert_eq!(updated.status, ActionStatus::Failed);
        assert!(updated
            .error
            .as_deref()
            .unwrap()
            .contains("no handler registered"));
    }

    #[tokio::test]
    async fn sweep_processes_records_in_listing_order() {
        let handler = FlakyHandler::new("send-email", 0, HandlerError::transient("unused"));
        let (_dir, engine, store, _dlq) =
            engine_with(vec![handler as Arc<dyn ActionHandler>], fast_config());
        approved_record(&store, "send-email");
        approved_record(&store, "send-email");
        approved_record(&store, "send-email");

        let stats = engine.execute_due().await.unwrap();
        assert_eq!(stats.completed, 3);
        assert!(store.list_status(ActionStatus::Approved).unwrap().is_empty());
        assert!(store
            .list_status(ActionStatus::InProgress)
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn exhausted_transient_failure_lands_in_dead_letter_queue() {
        let handler = FlakyHandler::new("send-email", 10, HandlerError::transient("timeout"));
        let (_dir, engine, store, dlq) =
            engine_with(vec![handler as Arc<dyn ActionHandler>], fast_config());
        let record = approved_record(&store, "send-email");

        engine.execute_due().await.unwrap();

        let items = dlq.list().unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].operation_id, record.id.to_string());
        assert_eq!(items[0].operation_type, "send-email");
        assert_eq!(items[0].retry_count, 3);
    }

    #[tokio::test]
    async fn non_retryable_failure_stays_out_of_dead_letter_queue() {
        let handler = FlakyHandler::new("send-email", 10, HandlerError::auth("expired token"));
        let (_dir, engine, store, dlq) =
            engine_with(vec![handler as Arc<dyn ActionHandler>], fast_config());
        approved_record(&store, "send-email");

        engine.execute_due().await.unwrap();
        assert!(dlq.is_empty().unwrap());
    }

    #[test]
    fn registry_rejects_duplicates_and_validates_required() {
        let mut registry = HandlerRegistry::new();
        registry
            .register(FlakyHandler::new("send-email", 0, HandlerError::logic("x")))
            .unwrap();
        let err = registry
            .register(FlakyHandler::new("send-email", 0, HandlerError::logic("x")))
            .unwrap_err();
        assert!(matches!(err, MarshalError::HandlerDuplicate(_)));

        registry.validate(&["send-email"]).unwrap();
        let err = registry.validate(&["send-email", "post-update"]).unwrap_err();
        assert!(matches!(err, MarshalError::HandlerMissing(t) if t == "post-update"));
    }
}
