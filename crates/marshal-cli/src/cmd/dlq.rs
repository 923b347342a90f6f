use anyhow::bail;
use clap::Subcommand;
use marshal_core::paths;
use marshal_core::resilience::DeadLetterQueue;
use std::path::Path;

use crate::output;

#[derive(Subcommand)]
pub enum DlqSubcommand {
    /// List dead-lettered operations
    List,
    /// Replay every item through the handler registry
    Retry,
    /// Remove one item by operation id
    Remove { operation_id: String },
}

pub fn run(root: &Path, subcommand: DlqSubcommand, json: bool) -> anyhow::Result<()> {
    if !paths::is_initialized(root) {
        bail!("not initialized: run 'marshal init'");
    }
    let dlq = DeadLetterQueue::open(&paths::dlq_db_path(root))?;

    match subcommand {
        DlqSubcommand::List => {
            let items = dlq.list()?;
            if json {
                return output::print_json(&items);
            }
            if items.is_empty() {
                println!("Dead-letter queue is empty.");
                return Ok(());
            }
            let rows = items
                .iter()
                .map(|i| {
                    vec![
                        i.operation_id.clone(),
                        i.operation_type.clone(),
                        i.retry_count.to_string(),
                        i.timestamp.format("%Y-%m-%d %H:%M").to_string(),
                        i.error.clone(),
                    ]
                })
                .collect();
            output::print_table(&["OPERATION", "TYPE", "RETRIES", "WHEN", "ERROR"], rows);
        }
        DlqSubcommand::Retry => {
            let registry = crate::cmd::run::builtin_registry()?;
            let runtime = tokio::runtime::Runtime::new()?;
            let outcome = dlq.retry_all(|item| {
                let Some(handler) = registry.get(&item.operation_type) else {
                    return Err(format!(
                        "no handler registered for action type: {}",
                        item.operation_type
                    ));
                };
                runtime
                    .block_on(handler.handle(&item.payload))
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            })?;
            println!(
                "Replayed {} item(s): {} succeeded, {} failed",
                outcome.succeeded + outcome.failed,
                outcome.succeeded,
                outcome.failed
            );
        }
        DlqSubcommand::Remove { operation_id } => {
            if dlq.remove(&operation_id)? {
                println!("Removed {operation_id}");
            } else {
                bail!("no dead-letter item with id {operation_id}");
            }
        }
    }
    Ok(())
}
