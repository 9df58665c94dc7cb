//! Athanor CLI - Inspect and repair athanor databases offline

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

#[derive(Parser)]
#[command(name = "athanor")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to the database directory
    #[arg(short, long, default_value = "./data")]
    db_path: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// High-water mark, shard progress and lag
    Status,

    /// Progress of one shard
    Progress {
        /// Shard identity, e.g. "Trips:All"
        shard: String,
    },

    /// Reset a shard's progress so it replays on the next daemon start
    Rewind {
        /// Shard identity, e.g. "Trips:All"
        shard: String,

        /// Replay everything after this sequence
        #[arg(long, conflicts_with = "time", required_unless_present = "time")]
        sequence: Option<u64>,

        /// Replay everything appended at or after this RFC 3339 instant
        #[arg(long)]
        time: Option<String>,

        /// Collections to truncate in the same transaction (rewind to 0 only)
        #[arg(long = "teardown")]
        teardown: Vec<String>,
    },

    /// List recorded dead letters, most recent first
    DeadLetters {
        /// Only this shard
        #[arg(short, long)]
        shard: Option<String>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    match cli.command {
        Commands::Status => {
            commands::status::execute(cli.db_path).await?;
        }
        Commands::Progress { shard } => {
            commands::progress::execute(cli.db_path, shard).await?;
        }
        Commands::Rewind {
            shard,
            sequence,
            time,
            teardown,
        } => {
            let target = commands::rewind::parse_target(sequence, time.as_deref())?;
            commands::rewind::execute(cli.db_path, shard, target, teardown).await?;
        }
        Commands::DeadLetters { shard, limit } => {
            commands::dead_letters::execute(cli.db_path, shard, limit).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rewind_requires_a_target() {
        assert!(Cli::try_parse_from(["athanor", "rewind", "Trips:All"]).is_err());
        assert!(Cli::try_parse_from([
            "athanor", "rewind", "Trips:All", "--sequence", "4", "--time", "2024-01-01T00:00:00Z"
        ])
        .is_err());

        let cli = Cli::try_parse_from(["athanor", "rewind", "Trips:All", "--sequence", "4"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Rewind {
                sequence: Some(4),
                ..
            }
        ));
    }
}
