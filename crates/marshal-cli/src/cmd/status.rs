use anyhow::bail;
use marshal_core::audit::{AuditLog, AuditQuery};
use marshal_core::resilience::{DeadLetterQueue, StateRecovery};
use marshal_core::{paths, RecordStore};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;

use crate::output;

#[derive(Serialize)]
struct StatusReport {
    records: HashMap<String, usize>,
    dead_letters: usize,
    audit_events_today: usize,
    /// Last progress snapshot from the scheduler loop, if one is running.
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduler: Option<serde_json::Value>,
}

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    if !paths::is_initialized(root) {
        bail!("not initialized: run 'marshal init'");
    }

    let store = RecordStore::open(&paths::records_db_path(root))?;
    let records: HashMap<String, usize> = store
        .counts()?
        .into_iter()
        .map(|(status, n)| (status.to_string(), n))
        .collect();

    let dead_letters = DeadLetterQueue::open(&paths::dlq_db_path(root))?.len()?;

    let today = chrono::Utc::now().date_naive();
    let audit_events_today = AuditLog::open(root)
        .search(&AuditQuery {
            from: Some(today),
            to: Some(today),
            ..Default::default()
        })?
        .len();

    let scheduler = StateRecovery::new(paths::recovery_dir(root))
        .load("scheduler")?
        .map(|snap| snap.progress);

    let report = StatusReport {
        records,
        dead_letters,
        audit_events_today,
        scheduler,
    };

    if json {
        return output::print_json(&report);
    }

    if report.records.is_empty() {
        println!("No records yet.");
    } else {
        let mut rows: Vec<(String, usize)> = report.records.clone().into_iter().collect();
        rows.sort();
        output::print_table(
            &["STATUS", "COUNT"],
            rows.into_iter()
                .map(|(s, n)| vec![s, n.to_string()])
                .collect(),
        );
    }
    println!("\nDead letters: {}", report.dead_letters);
    println!("Audit events today: {}", report.audit_events_today);
    if let Some(scheduler) = &report.scheduler {
        println!(
            "Scheduler: {} task(s), {} run(s), {} error(s)",
            scheduler["tasks"], scheduler["total_runs"], scheduler["total_errors"]
        );
    }
    Ok(())
}
