use anyhow::Context;
use chrono::NaiveDate;
use clap::Subcommand;
use marshal_core::audit::{AuditLog, AuditQuery};
use marshal_core::config::Config;
use std::path::Path;

use crate::output;

#[derive(Subcommand)]
pub enum AuditSubcommand {
    /// Search audit events over a date range
    Search {
        /// Start date (YYYY-MM-DD, default: 7 days ago)
        #[arg(long)]
        from: Option<String>,
        /// End date (YYYY-MM-DD, default: today)
        #[arg(long)]
        to: Option<String>,
        #[arg(long = "type")]
        action_type: Option<String>,
        #[arg(long)]
        actor: Option<String>,
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        domain: Option<String>,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Delete day files older than the retention horizon
    Cleanup,
}

fn parse_date(s: &str) -> anyhow::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date: {s}"))
}

pub fn run(root: &Path, subcommand: AuditSubcommand, json: bool) -> anyhow::Result<()> {
    let log = AuditLog::open(root);
    match subcommand {
        AuditSubcommand::Search {
            from,
            to,
            action_type,
            actor,
            status,
            domain,
            tag,
        } => {
            let query = AuditQuery {
                from: from.as_deref().map(parse_date).transpose()?,
                to: to.as_deref().map(parse_date).transpose()?,
                action_type,
                actor_id: actor,
                status,
                domain,
                tag,
            };
            let events = log.search(&query)?;
            if json {
                return output::print_json(&events);
            }
            if events.is_empty() {
                println!("No matching audit events.");
                return Ok(());
            }
            let rows = events
                .iter()
                .map(|e| {
                    vec![
                        e.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                        e.action_id.clone(),
                        e.action_type.clone(),
                        e.status.clone(),
                        e.actor.id.clone(),
                        e.error.clone().unwrap_or_default(),
                    ]
                })
                .collect();
            output::print_table(
                &["TIME", "ACTION", "TYPE", "STATUS", "ACTOR", "ERROR"],
                rows,
            );
        }
        AuditSubcommand::Cleanup => {
            let config = Config::load(root)?;
            let deleted = log.cleanup(config.audit.retention_days)?;
            println!(
                "Deleted {deleted} day file(s) older than {} days",
                config.audit.retention_days
            );
        }
    }
    Ok(())
}
