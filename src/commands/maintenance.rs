use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;

use pubcrawl::storage::{open_ledger, DatasetLock, DatasetPaths};

/// Requeue InProgress tasks not updated for `older_than_secs`
pub fn requeue_stale(dataset: PathBuf, older_than_secs: u64) -> Result<()> {
    let paths = DatasetPaths::new(&dataset);
    let _lock = DatasetLock::acquire(&paths.root).context("Dataset is locked by a running crawl")?;

    let ledger = open_ledger(paths.ledger())
        .with_context(|| format!("Failed to open ledger: {}", paths.ledger().display()))?;
    let requeued = ledger.requeue_stale(Duration::from_secs(older_than_secs))?;

    println!("Requeued {requeued} stale tasks");
    Ok(())
}

/// Remove a lock left behind by a crashed crawl
pub fn unlock(dataset: PathBuf) -> Result<()> {
    match DatasetLock::force_release(&dataset)? {
        Some(holder) => {
            tracing::warn!(holder = %holder.describe(), "Removed dataset lock");
            println!("Removed lock held by {}", holder.describe());
        }
        None => println!("Dataset {} is not locked", dataset.display()),
    }
    Ok(())
}
