use anyhow::Context;
use marshal_core::config::Config;
use marshal_core::{io, paths};
use std::path::Path;

/// Scaffold the `.marshal/` workspace: state directories, default config,
/// and the record/DLQ databases. Idempotent.
pub fn run(root: &Path) -> anyhow::Result<()> {
    io::ensure_dir(&paths::marshal_dir(root))?;
    io::ensure_dir(&paths::audit_dir(root))?;
    io::ensure_dir(&paths::recovery_dir(root))?;
    io::ensure_dir(&paths::cache_dir(root))?;
    io::ensure_dir(&crate::cmd::run::spool_dir(root))?;

    let config_path = paths::config_path(root);
    if !config_path.exists() {
        Config::default()
            .save(root)
            .context("failed to write default config")?;
    }

    // Create the databases eagerly so later commands never race on creation.
    marshal_core::RecordStore::open(&paths::records_db_path(root))
        .context("failed to create record store")?;
    marshal_core::resilience::DeadLetterQueue::open(&paths::dlq_db_path(root))
        .context("failed to create dead-letter queue")?;

    println!("Initialized marshal workspace at {}", root.display());
    Ok(())
}
