use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use pubcrawl::storage::{load_seeds, open_ledger, DatasetLock, DatasetPaths, SeedFormat};

/// Insert seeds into the dataset ledger, creating the dataset if needed
///
/// Seeding is idempotent: identifiers already in the ledger keep their state.
pub fn seed(dataset: PathBuf, input: &Path, format: SeedFormat) -> Result<()> {
    let paths = DatasetPaths::new(&dataset);
    std::fs::create_dir_all(&paths.root)
        .with_context(|| format!("Failed to create dataset directory: {}", paths.root.display()))?;

    let _lock = DatasetLock::acquire(&paths.root).context("Dataset is locked by another process")?;

    let seeds = load_seeds(input, format)?;
    let ledger = open_ledger(paths.ledger())
        .with_context(|| format!("Failed to open ledger: {}", paths.ledger().display()))?;
    let inserted = ledger.seed(&seeds)?;

    tracing::info!(
        input = %input.display(),
        read = seeds.len(),
        inserted = inserted,
        "Seeded ledger"
    );

    println!("Read {} seeds from {}", seeds.len(), input.display());
    println!(
        "Inserted {inserted} new tasks ({} already present)",
        seeds.len() - inserted
    );
    println!("Ledger total: {}", ledger.stats()?.total());
    Ok(())
}
