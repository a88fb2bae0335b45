use anyhow::{Context, Result};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use pubcrawl::models::TaskStatus;
use pubcrawl::storage::{open_ledger, DatasetPaths};

/// Write tasks with `status` as JSON lines to `output` (stdout when `None`)
pub fn export(
    dataset: PathBuf,
    status: TaskStatus,
    output: Option<PathBuf>,
    limit: Option<usize>,
) -> Result<()> {
    let paths = DatasetPaths::new(&dataset);
    if !paths.ledger().exists() {
        anyhow::bail!("Ledger not found: {}", paths.ledger().display());
    }

    let ledger = open_ledger(paths.ledger())?;
    let tasks = ledger.list_by_status(status, limit)?;

    let writer: Box<dyn Write> = match &output {
        Some(path) => Box::new(
            std::fs::File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path.display()))?,
        ),
        None => Box::new(std::io::stdout().lock()),
    };
    let mut writer = BufWriter::new(writer);

    for task in &tasks {
        serde_json::to_writer(&mut writer, task)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;

    tracing::info!(status = %status, count = tasks.len(), "Exported tasks");
    if let Some(path) = output {
        eprintln!("Exported {} {status} tasks to {}", tasks.len(), path.display());
    }
    Ok(())
}
