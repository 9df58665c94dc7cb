use anyhow::{Context, Result};
use athanor::{AthanorDb, EventStore};
use std::path::PathBuf;

pub async fn execute(db_path: PathBuf, shard: Option<String>, limit: usize) -> Result<()> {
    let store = AthanorDb::open_store(&db_path).context("Failed to open database")?;

    let records = store
        .dead_letters(shard.as_deref(), limit)
        .await
        .context("Failed to read dead letters")?;

    if records.is_empty() {
        println!("✓ No dead letters");
        return Ok(());
    }

    println!("\nDead letters ({})", records.len());
    println!("{}", "=".repeat(60));
    for record in &records {
        println!(
            "#{} {} [{}] {}",
            record.event_sequence,
            record.event_type,
            record.shard_name,
            record.recorded_at.to_rfc3339()
        );
        println!("    {}: {}", record.exception_type, record.exception_message);
    }
    Ok(())
}
