//! `marshal run <component>` — the long-running loops the supervisor keeps
//! alive. Each loop exits 0 on clean (signal-driven) shutdown and non-zero
//! on a fatal startup error.

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::Subcommand;
use marshal_core::approval::ApprovalGate;
use marshal_core::audit::AuditLog;
use marshal_core::config::Config;
use marshal_core::engine::{ActionHandler, ExecutionEngine, HandlerError, HandlerRegistry};
use marshal_core::ingest::{IngestRunner, Signal, SignalSource};
use marshal_core::resilience::{DeadLetterQueue, StateRecovery};
use marshal_core::runtime::{shutdown_channel, Shutdown};
use marshal_core::scheduler::{ScheduleKind, Scheduler};
use marshal_core::supervisor::{ProcessSpec, Supervisor};
use marshal_core::{paths, MarshalError, RecordStore, RiskFactors};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Subcommand)]
pub enum RunComponent {
    /// Poll the signal spool and create pending records
    Ingest,
    /// Apply operator verdicts and approval timeouts
    Approve,
    /// Execute approved records through the handler registry
    Execute,
    /// Fire recurring maintenance tasks
    Schedule,
    /// Keep the other loops alive as child processes
    Supervise,
}

pub fn run(root: &Path, component: RunComponent) -> anyhow::Result<()> {
    if !paths::is_initialized(root) {
        bail!("not initialized: run 'marshal init'");
    }
    let config = Config::load(root).context("failed to load config")?;

    let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
    runtime.block_on(async {
        let (handle, shutdown) = shutdown_channel();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown signal received");
                handle.trigger();
            }
        });

        match component {
            RunComponent::Ingest => run_ingest(root, config, shutdown).await,
            RunComponent::Approve => run_approve(root, config, shutdown).await,
            RunComponent::Execute => run_execute(root, config, shutdown).await,
            RunComponent::Schedule => run_schedule(root, config, shutdown).await,
            RunComponent::Supervise => run_supervise(root, config, shutdown).await,
        }
    })
}

fn open_shared(root: &Path) -> anyhow::Result<(Arc<RecordStore>, Arc<AuditLog>)> {
    let store = Arc::new(RecordStore::open(&paths::records_db_path(root))?);
    let audit = Arc::new(AuditLog::open(root));
    Ok((store, audit))
}

// ---------------------------------------------------------------------------
// ingest — spool-directory signal source
// ---------------------------------------------------------------------------

pub fn spool_dir(root: &Path) -> PathBuf {
    root.join(".marshal/spool")
}

/// On-disk signal format: one JSON file per signal dropped into the spool
/// by external watchers. Ingested files are deleted.
#[derive(Deserialize)]
struct SpoolSignal {
    origin: String,
    topic: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    content: String,
    action_type: String,
    #[serde(default = "empty_object")]
    payload: serde_json::Value,
    #[serde(default)]
    risk: RiskFactors,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

struct SpoolSource {
    dir: PathBuf,
}

#[async_trait]
impl SignalSource for SpoolSource {
    fn name(&self) -> &str {
        "spool"
    }

    async fn poll(&mut self) -> marshal_core::Result<Vec<Signal>> {
        let mut signals = Vec::new();
        if !self.dir.exists() {
            return Ok(signals);
        }
        let entries = std::fs::read_dir(&self.dir).map_err(MarshalError::Io)?;
        for entry in entries {
            let path = entry.map_err(MarshalError::Io)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let content = std::fs::read_to_string(&path).map_err(MarshalError::Io)?;
            let spool: SpoolSignal = match serde_json::from_str(&content) {
                Ok(s) => s,
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping malformed spool file");
                    continue;
                }
            };
            signals.push(Signal {
                origin: spool.origin,
                topic: spool.topic,
                timestamp: spool.timestamp,
                content: spool.content,
                action_type: spool.action_type,
                payload: spool.payload,
                risk: spool.risk,
            });
            std::fs::remove_file(&path).map_err(MarshalError::Io)?;
        }
        Ok(signals)
    }
}

async fn run_ingest(root: &Path, config: Config, shutdown: Shutdown) -> anyhow::Result<()> {
    let (store, audit) = open_shared(root)?;
    let source = Box::new(SpoolSource {
        dir: spool_dir(root),
    });
    let approval_timeout = chrono::Duration::hours(config.approval.default_timeout_hours as i64);
    let runner = IngestRunner::new(source, store, audit, config.ingest, approval_timeout);
    info!("ingest loop started");
    runner.run(shutdown).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// approve / execute
// ---------------------------------------------------------------------------

async fn run_approve(root: &Path, config: Config, shutdown: Shutdown) -> anyhow::Result<()> {
    let (store, audit) = open_shared(root)?;
    let gate = ApprovalGate::new(store, audit, config.approval);
    info!("approval loop started");
    gate.run(shutdown).await?;
    Ok(())
}

/// The built-in handler set. Deployments with real action handlers (mail,
/// browser, accounting) embed marshal-core and register their own; the
/// binary ships `noop` so the pipeline can be driven end to end.
pub(crate) fn builtin_registry() -> anyhow::Result<HandlerRegistry> {
    let mut registry = HandlerRegistry::new();
    registry.register(Arc::new(NoopHandler))?;
    registry.validate(&["noop"])?;
    Ok(registry)
}

struct NoopHandler;

#[async_trait]
impl ActionHandler for NoopHandler {
    fn action_type(&self) -> &str {
        "noop"
    }

    async fn handle(
        &self,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, HandlerError> {
        Ok(serde_json::json!({ "echo": payload }))
    }
}

async fn run_execute(root: &Path, config: Config, shutdown: Shutdown) -> anyhow::Result<()> {
    let (store, audit) = open_shared(root)?;
    let dlq = Arc::new(DeadLetterQueue::open(&paths::dlq_db_path(root))?);
    let registry = builtin_registry()?;
    let engine = ExecutionEngine::new(store, audit, dlq, registry, config.execution);
    info!("execution loop started");
    engine.run(shutdown).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// schedule — recurring maintenance
// ---------------------------------------------------------------------------

async fn run_schedule(root: &Path, config: Config, shutdown: Shutdown) -> anyhow::Result<()> {
    let scheduler = Arc::new(Scheduler::new());
    let recovery = Arc::new(StateRecovery::new(paths::recovery_dir(root)));
    for snap in recovery.list()? {
        warn!(
            operation = %snap.operation_id,
            taken_at = %snap.taken_at,
            "found snapshot from interrupted run"
        );
    }

    let retention_days = config.audit.retention_days;

    let audit_root = root.to_path_buf();
    scheduler.schedule_task(
        "audit-cleanup",
        ScheduleKind::Daily { hour: 3, minute: 10 },
        Arc::new(move || {
            let root = audit_root.clone();
            Box::pin(async move {
                let deleted = AuditLog::open(&root).cleanup(retention_days)?;
                if deleted > 0 {
                    info!(deleted, "audit retention cleanup");
                }
                Ok(())
            })
        }),
    )?;

    // Re-drive approval timeouts even when the approval loop is down; the
    // CAS store makes the overlap safe.
    let sweep_root = root.to_path_buf();
    let approval_config = config.approval.clone();
    scheduler.schedule_task(
        "approval-timeout-sweep",
        ScheduleKind::Interval {
            seconds: config.approval.poll_interval_seconds.max(60),
        },
        Arc::new(move || {
            let root = sweep_root.clone();
            let approval_config = approval_config.clone();
            Box::pin(async move {
                let store = Arc::new(RecordStore::open(&paths::records_db_path(&root))?);
                let audit = Arc::new(AuditLog::open(&root));
                ApprovalGate::new(store, audit, approval_config).poll()?;
                Ok(())
            })
        }),
    )?;

    // Periodic progress snapshot, enumerable after a crash.
    let snap_scheduler = Arc::clone(&scheduler);
    let snap_recovery = Arc::clone(&recovery);
    scheduler.schedule_task(
        "progress-snapshot",
        ScheduleKind::Interval { seconds: 60 },
        Arc::new(move || {
            let scheduler = Arc::clone(&snap_scheduler);
            let recovery = Arc::clone(&snap_recovery);
            Box::pin(async move {
                let stats = scheduler.get_stats();
                recovery.snapshot("scheduler", serde_json::to_value(stats)?)?;
                Ok(())
            })
        }),
    )?;

    info!("scheduler loop started");
    scheduler.run(shutdown, Duration::from_secs(1)).await?;
    // Clean shutdown: the snapshot is only interesting after a crash.
    recovery.clear("scheduler")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// supervise
// ---------------------------------------------------------------------------

async fn run_supervise(root: &Path, config: Config, shutdown: Shutdown) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("cannot locate own binary")?;
    let exe = exe.to_string_lossy().to_string();
    let root_arg = root.to_string_lossy().to_string();

    let mut supervisor = Supervisor::new(Duration::from_millis(config.supervisor.settle_delay_ms));
    for component in ["ingest", "approve", "execute", "schedule"] {
        supervisor.add_process(
            ProcessSpec::new(
                component,
                &exe,
                vec![
                    "--root".into(),
                    root_arg.clone(),
                    "run".into(),
                    component.into(),
                ],
            )
            .with_restart_policy(
                config.supervisor.max_restarts,
                Duration::from_secs(config.supervisor.restart_window_seconds),
            ),
        );
    }

    info!("supervisor started");
    supervisor
        .run(
            shutdown,
            Duration::from_secs(config.supervisor.check_interval_seconds.max(1)),
        )
        .await?;
    Ok(())
}
