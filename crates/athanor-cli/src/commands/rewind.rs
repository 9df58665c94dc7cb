use anyhow::{bail, Context, Result};
use athanor::{AthanorDb, EventStore, RewindTarget};
use chrono::{DateTime, Utc};
use std::path::PathBuf;

const DEFAULT_DATABASE: &str = "Default";

pub fn parse_target(sequence: Option<u64>, time: Option<&str>) -> Result<RewindTarget> {
    match (sequence, time) {
        (Some(sequence), None) => Ok(RewindTarget::Sequence(sequence)),
        (None, Some(time)) => {
            let instant = DateTime::parse_from_rfc3339(time)
                .with_context(|| format!("Invalid RFC 3339 time: {}", time))?;
            Ok(RewindTarget::Time(instant.with_timezone(&Utc)))
        }
        _ => bail!("Specify exactly one of --sequence or --time"),
    }
}

/// Offline rewind: takes effect the next time the shard starts
pub async fn execute(
    db_path: PathBuf,
    shard: String,
    target: RewindTarget,
    teardown: Vec<String>,
) -> Result<()> {
    let store = AthanorDb::open_store(&db_path).context("Failed to open database")?;

    let floor = match target {
        RewindTarget::Sequence(sequence) => sequence,
        RewindTarget::Time(instant) => store
            .sequence_before(instant)
            .await
            .context("Failed to resolve rewind time")?,
    };
    if !teardown.is_empty() && floor != 0 {
        bail!("Teardown is only allowed when rewinding to sequence 0");
    }

    let existing = store
        .load_progress(&shard)
        .await
        .context("Failed to read shard progress")?;
    let current = existing.as_ref().map(|state| state.sequence).unwrap_or(0);
    if floor > current {
        bail!(
            "{} is at {}; a rewind cannot move it forward to {}",
            shard,
            current,
            floor
        );
    }
    let database = existing
        .as_ref()
        .map(|state| state.database.clone())
        .unwrap_or_else(|| DEFAULT_DATABASE.to_string());

    tracing::info!(shard = %shard, floor, "Rewinding shard");
    store
        .reset_progress(&shard, &database, floor, &teardown)
        .await
        .context("Failed to reset progress")?;

    match existing {
        Some(state) => println!("✓ {} rewound from {} to {}", shard, state.sequence, floor),
        None => println!("✓ {} will start after {}", shard, floor),
    }
    if !teardown.is_empty() {
        println!("  Truncated: {}", teardown.join(", "));
    }
    println!("⚠️  A daemon already running this shard will halt on its next commit; restart it");
    Ok(())
}
