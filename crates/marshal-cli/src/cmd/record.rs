use anyhow::{bail, Context};
use marshal_core::approval::ApprovalGate;
use marshal_core::audit::AuditLog;
use marshal_core::config::Config;
use marshal_core::{paths, ActionStatus, RecordStore, Verdict};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::output;

fn open_store(root: &Path) -> anyhow::Result<Arc<RecordStore>> {
    if !paths::is_initialized(root) {
        bail!("not initialized: run 'marshal init'");
    }
    Ok(Arc::new(RecordStore::open(&paths::records_db_path(root))?))
}

fn parse_id(id: &str) -> anyhow::Result<Uuid> {
    Uuid::parse_str(id).with_context(|| format!("invalid record id: {id}"))
}

pub fn list(root: &Path, status: Option<&str>, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let records = match status {
        Some(s) => {
            let status: ActionStatus = s
                .parse()
                .map_err(|e: String| anyhow::anyhow!(e))?;
            store.list_status(status)?
        }
        None => store.list_all()?,
    };

    if json {
        return output::print_json(&records);
    }
    if records.is_empty() {
        println!("No records.");
        return Ok(());
    }
    let rows = records
        .iter()
        .map(|r| {
            vec![
                r.id.to_string(),
                r.action_type.clone(),
                r.status.to_string(),
                r.risk_level.to_string(),
                r.created_at.format("%Y-%m-%d %H:%M").to_string(),
            ]
        })
        .collect();
    output::print_table(&["ID", "TYPE", "STATUS", "RISK", "CREATED"], rows);
    Ok(())
}

pub fn show(root: &Path, id: &str, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let record = store.get(parse_id(id)?)?;

    if json {
        return output::print_json(&record);
    }
    println!("id:          {}", record.id);
    println!("type:        {}", record.action_type);
    println!("status:      {}", record.status);
    println!("risk:        {} ({})", record.risk_score, record.risk_level);
    println!("created:     {}", record.created_at.to_rfc3339());
    println!("timeout:     {}", record.timeout_at.to_rfc3339());
    println!("retries:     {}", record.retry_count);
    if let Some(decision) = &record.decision {
        println!(
            "decision:    {:?} by {} at {}",
            decision.verdict,
            decision.decided_by,
            decision.decided_at.to_rfc3339()
        );
    }
    if let Some(result) = &record.result {
        println!("result:      {result}");
    }
    if let Some(error) = &record.error {
        println!("error:       {error}");
    }
    println!("payload:     {}", record.payload);
    Ok(())
}

fn decide(root: &Path, id: &str, verdict: Verdict, by: &str, reason: Option<String>, json: bool) -> anyhow::Result<()> {
    let store = open_store(root)?;
    let audit = Arc::new(AuditLog::open(root));
    let config = Config::load(root)?;
    let gate = ApprovalGate::new(store, audit, config.approval);

    let record_id = parse_id(id)?;
    let record = gate.decide(record_id, verdict, by, reason)?;

    if json {
        output::print_json(&record)?;
    } else {
        let verb = match verdict {
            Verdict::Approve => "Approved",
            Verdict::Reject => "Rejected",
        };
        println!(
            "{verb} {} — applied on the approval loop's next sweep",
            record.id
        );
    }
    Ok(())
}

pub fn approve(root: &Path, id: &str, by: &str, json: bool) -> anyhow::Result<()> {
    decide(root, id, Verdict::Approve, by, None, json)
}

pub fn reject(
    root: &Path,
    id: &str,
    reason: Option<String>,
    by: &str,
    json: bool,
) -> anyhow::Result<()> {
    decide(root, id, Verdict::Reject, by, reason, json)
}
