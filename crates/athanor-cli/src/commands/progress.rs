use anyhow::{Context, Result};
use athanor::{AthanorDb, CancellationToken, EventStore};
use std::path::PathBuf;

pub async fn execute(db_path: PathBuf, shard: String) -> Result<()> {
    let store = AthanorDb::open_store(&db_path).context("Failed to open database")?;

    let Some(state) = store
        .load_progress(&shard)
        .await
        .context("Failed to read shard progress")?
    else {
        println!("{} has no committed progress", shard);
        return Ok(());
    };
    let scan = store
        .detect_high_water(state.sequence, &CancellationToken::new())
        .await
        .context("Failed to read the high-water mark")?;

    println!("\nShard: {}", state.shard_name);
    println!("{}", "=".repeat(60));
    println!("Sequence:   {}", state.sequence);
    println!("Database:   {}", state.database);
    println!("Updated at: {}", state.updated_at.to_rfc3339());
    println!(
        "Lag:        {}",
        scan.contiguous_through.saturating_sub(state.sequence)
    );
    Ok(())
}
