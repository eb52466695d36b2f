//! `tristore-sync` operator CLI.
//!
//! ```bash
//! tristore-sync --config tristore.toml check <id>...
//! tristore-sync check --all    # every queued, parked or cached id
//! tristore-sync reconcile <id>...
//! tristore-sync reconcile --dry-run <id>...
//! tristore-sync review
//! tristore-sync release <id>
//! tristore-sync health
//! tristore-sync run            # scheduler until Ctrl-C
//! ```
//!
//! Output is JSON on stdout; logs go to stderr (`RUST_LOG`, default `info`).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tristore_sync::{SyncConfig, SyncEngine};

#[derive(Parser, Debug)]
#[command(name = "tristore-sync", version, about = "Operate the three-store sync engine")]
struct Cli {
    /// TOML configuration file
    #[arg(long, short, env = "TRISTORE_CONFIG", default_value = "tristore.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read-only consistency reports
    Check {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        ids: Vec<String>,
        /// Every id in the retry queue, the review list or the local cache
        #[arg(long)]
        all: bool,
    },
    /// Check and repair records now
    Reconcile {
        #[arg(required = true)]
        ids: Vec<String>,
        /// Report what would be repaired, and from where, without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// List records parked for manual review
    Review,
    /// Return a parked record to automatic reconciliation
    Release { id: String },
    /// Probe every store and the ledger
    Health,
    /// Run scheduler passes until Ctrl-C
    Run,
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let engine = Arc::new(SyncEngine::connect(config).await.context("connecting to stores")?);

    match cli.command {
        Command::Check { ids, all } => {
            let ids = if all { engine.known_ids().await? } else { ids };
            match ids.as_slice() {
                [id] => print_json(&engine.consistency_report(id).await)?,
                _ => print_json(&engine.check_many(&ids).await)?,
            }
        }
        Command::Reconcile { ids, dry_run: true } => print_json(&engine.reconcile_dry_run(&ids).await)?,
        Command::Reconcile { ids, dry_run: false } => {
            let mut outcomes = Vec::with_capacity(ids.len());
            for id in ids {
                let outcome = engine.reconcile_now(&id).await?;
                outcomes.push(serde_json::json!({ "id": id, "result": outcome }));
            }
            print_json(&outcomes)?;
        }
        Command::Review => print_json(&engine.review_list().await?)?,
        Command::Release { id } => {
            let released = engine.release_review(&id).await?;
            print_json(&serde_json::json!({ "id": id, "released": released }))?;
        }
        Command::Health => {
            let report = engine.health_check().await;
            print_json(&report)?;
            if !report.healthy {
                std::process::exit(1);
            }
        }
        Command::Run => {
            let runner = engine.clone();
            let scheduler = tokio::spawn(async move { runner.run().await });
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("Ctrl-C received");
            engine.shutdown();
            scheduler.await.context("scheduler task panicked")?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_takes_ids_or_all() {
        let cli = Cli::try_parse_from(["tristore-sync", "check", "a", "b"]).unwrap();
        assert!(matches!(cli.command, Command::Check { ref ids, all: false } if ids.len() == 2));

        let cli = Cli::try_parse_from(["tristore-sync", "check", "--all"]).unwrap();
        assert!(matches!(cli.command, Command::Check { all: true, .. }));

        assert!(Cli::try_parse_from(["tristore-sync", "check"]).is_err());
        assert!(Cli::try_parse_from(["tristore-sync", "check", "a", "--all"]).is_err());
    }

    #[test]
    fn test_reconcile_dry_run_flag() {
        let cli = Cli::try_parse_from(["tristore-sync", "reconcile", "--dry-run", "a"]).unwrap();
        assert!(matches!(cli.command, Command::Reconcile { dry_run: true, .. }));

        let cli = Cli::try_parse_from(["tristore-sync", "reconcile", "a"]).unwrap();
        assert!(matches!(cli.command, Command::Reconcile { dry_run: false, .. }));
        assert!(Cli::try_parse_from(["tristore-sync", "reconcile"]).is_err());
    }
}
