use anyhow::{bail, Context};
use clap::Args;
use marshal_core::approval::ApprovalGate;
use marshal_core::audit::AuditLog;
use marshal_core::config::Config;
use marshal_core::{paths, RecordStore, RiskFactors};
use std::path::Path;
use std::sync::Arc;

use crate::output;

#[derive(Args)]
pub struct SubmitArgs {
    /// Action type (lowercase kebab-case, must match a registered handler)
    #[arg(long = "type")]
    pub action_type: String,

    /// Handler payload as a JSON object
    #[arg(long, default_value = "{}")]
    pub payload: String,

    /// Risk factors of this action
    #[arg(long)]
    pub external_recipient: bool,
    #[arg(long)]
    pub irreversible: bool,
    #[arg(long)]
    pub contains_pii: bool,
    #[arg(long)]
    pub has_cost: bool,
    #[arg(long)]
    pub public_visibility: bool,
    #[arg(long)]
    pub reputational_impact: bool,
    #[arg(long)]
    pub data_loss_potential: bool,
}

pub fn run(root: &Path, args: SubmitArgs, json: bool) -> anyhow::Result<()> {
    if !paths::is_initialized(root) {
        bail!("not initialized: run 'marshal init'");
    }

    let payload: serde_json::Value =
        serde_json::from_str(&args.payload).context("payload must be valid JSON")?;
    if !payload.is_object() {
        bail!("payload must be a JSON object");
    }

    let factors = RiskFactors {
        external_recipient: args.external_recipient,
        irreversible: args.irreversible,
        contains_pii: args.contains_pii,
        has_cost: args.has_cost,
        public_visibility: args.public_visibility,
        reputational_impact: args.reputational_impact,
        data_loss_potential: args.data_loss_potential,
    };

    let config = Config::load(root)?;
    let store = Arc::new(RecordStore::open(&paths::records_db_path(root))?);
    let audit = Arc::new(AuditLog::open(root));
    let gate = ApprovalGate::new(store, audit, config.approval);

    let record = gate.create_request(&args.action_type, payload, factors)?;

    if json {
        output::print_json(&record)?;
    } else {
        println!(
            "Created {} ({}, risk {} / {})\nAwaiting approval until {}",
            record.id,
            record.action_type,
            record.risk_score,
            record.risk_level,
            record.timeout_at.to_rfc3339()
        );
    }
    Ok(())
}
