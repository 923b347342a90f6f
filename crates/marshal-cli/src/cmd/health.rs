use marshal_core::resilience::DeadLetterQueue;
use marshal_core::{paths, ActionStatus, RecordStore};
use serde::Serialize;
use std::path::Path;

use crate::output;

/// Exit codes: 0 healthy, 1 degraded, 2 critical.
#[derive(Debug, Serialize)]
struct HealthReport {
    healthy: bool,
    degraded: bool,
    checks: Vec<HealthCheck>,
}

#[derive(Debug, Serialize)]
struct HealthCheck {
    name: String,
    ok: bool,
    detail: String,
}

fn check(name: &str, ok: bool, detail: impl Into<String>) -> HealthCheck {
    HealthCheck {
        name: name.to_string(),
        ok,
        detail: detail.into(),
    }
}

pub fn run(root: &Path, json: bool) -> anyhow::Result<i32> {
    let mut checks = Vec::new();

    if !paths::is_initialized(root) {
        let report = HealthReport {
            healthy: false,
            degraded: false,
            checks: vec![check("workspace", false, "not initialized")],
        };
        print_report(&report, json)?;
        return Ok(2);
    }
    checks.push(check("workspace", true, "initialized"));

    // Store must open and be readable, otherwise the pipeline is down.
    let store = match RecordStore::open(&paths::records_db_path(root)) {
        Ok(store) => store,
        Err(e) => {
            checks.push(check("store", false, e.to_string()));
            let report = HealthReport {
                healthy: false,
                degraded: false,
                checks,
            };
            print_report(&report, json)?;
            return Ok(2);
        }
    };
    let counts = store.counts()?;
    checks.push(check("store", true, format!("{} record(s)", counts.iter().map(|(_, n)| n).sum::<usize>())));

    let count_of = |status: ActionStatus| {
        counts
            .iter()
            .find(|(s, _)| *s == status)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    };

    let quarantined = count_of(ActionStatus::Quarantined);
    checks.push(check(
        "quarantine",
        quarantined == 0,
        format!("{quarantined} quarantined record(s)"),
    ));

    let dlq_depth = DeadLetterQueue::open(&paths::dlq_db_path(root))?.len()?;
    checks.push(check(
        "dead_letters",
        dlq_depth == 0,
        format!("{dlq_depth} item(s) awaiting manual handling"),
    ));

    let degraded = checks.iter().any(|c| !c.ok);
    let report = HealthReport {
        healthy: !degraded,
        degraded,
        checks,
    };
    print_report(&report, json)?;
    Ok(if degraded { 1 } else { 0 })
}

fn print_report(report: &HealthReport, json: bool) -> anyhow::Result<()> {
    if json {
        return output::print_json(report);
    }
    for c in &report.checks {
        println!("[{}] {} — {}", if c.ok { "ok" } else { "!!" }, c.name, c.detail);
    }
    println!(
        "{}",
        if report.healthy {
            "healthy"
        } else if report.degraded {
            "degraded"
        } else {
            "critical"
        }
    );
    Ok(())
}
