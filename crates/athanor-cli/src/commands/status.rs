use anyhow::{Context, Result};
use athanor::{AthanorDb, CancellationToken, EventStore};
use std::path::PathBuf;

pub async fn execute(db_path: PathBuf) -> Result<()> {
    tracing::info!("Opening database at: {}", db_path.display());
    let store = AthanorDb::open_store(&db_path).context("Failed to open database")?;

    let scan = store
        .detect_high_water(0, &CancellationToken::new())
        .await
        .context("Failed to read the high-water mark")?;
    let shards = store
        .all_progress()
        .await
        .context("Failed to read shard progress")?;
    let dead_letters = store
        .dead_letters(None, usize::MAX)
        .await
        .context("Failed to read dead letters")?;

    println!("\nDatabase Status");
    println!("{}", "=".repeat(60));
    println!("Path: {}", db_path.display());
    println!("Highest sequence: {}", scan.highest_sequence);
    println!("Committed through: {}", scan.contiguous_through);
    if scan.contiguous_through < scan.highest_sequence {
        println!(
            "⚠️  Gap after sequence {} (uncommitted or abandoned append)",
            scan.contiguous_through
        );
    }

    println!("\nShards ({})", shards.len());
    println!("{}", "-".repeat(60));
    if shards.is_empty() {
        println!("No shard has committed progress yet");
    }
    for shard in &shards {
        let lag = scan.contiguous_through.saturating_sub(shard.sequence);
        let marker = if lag == 0 { "✓" } else { "⚠️ " };
        println!(
            "{} {:<30} at {:>8}  lag {:>6}  [{}]",
            marker, shard.shard_name, shard.sequence, lag, shard.database
        );
    }

    println!("\nDead letters: {}", dead_letters.len());
    println!();
    Ok(())
}
