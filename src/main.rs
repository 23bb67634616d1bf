//! Tally Store Daemon
//!
//! Keeps the local tree database migrated and mirrored from Firestore.
//!
//! ## Usage
//!
//! ```bash
//! # Migrate, then mirror every 5 minutes until Ctrl-C
//! tally-store serve --project-id carbontally
//!
//! # Bring the schema up to date and exit
//! tally-store migrate
//!
//! # One reconciliation pass
//! FIRESTORE_TOKEN=... tally-store sync-once --project-id carbontally
//!
//! # Allocate an identifier for a submission
//! tally-store allocate --name "Jane Dunn" --key 6f1c...
//!
//! # Record a planting or a monitoring visit from JSON (file or stdin)
//! tally-store record planting.json
//! cat visit.json | tally-store monitor
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use tally_store::{Config, MonitoringSubmission, PlantingSubmission, TallyService};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tally-store")]
#[command(about = "Local SQLite mirror for CarbonTally records")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "TALLY_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// Firestore project id
    #[arg(long, env = "FIRESTORE_PROJECT_ID")]
    project_id: Option<String>,

    /// OAuth bearer token for Firestore
    #[arg(long, env = "FIRESTORE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Seconds between sync passes
    #[arg(long)]
    sync_interval: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Migrate the schema and run the periodic sync until interrupted
    Serve,
    /// Migrate the schema and exit
    Migrate,
    /// Run a single sync pass
    SyncOnce,
    /// Allocate (or look up) an identifier for a submission
    Allocate {
        /// Submitter's full name
        #[arg(long)]
        name: String,
        /// External submission key, e.g. the form UUID
        #[arg(long)]
        key: String,
    },
    /// Record a planting submission given as JSON
    Record {
        /// JSON file; stdin when omitted or `-`
        file: Option<PathBuf>,
    },
    /// Record a monitoring submission given as JSON
    Monitor {
        /// JSON file; stdin when omitted or `-`
        file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tally_store=info".parse()?))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;

    info!(
        storage_dir = %config.storage_dir.display(),
        database = %config.database_path().display(),
        "Starting tally-store"
    );

    let service = TallyService::open(config).context("Failed to open local store")?;

    let config_path = service.config().config_path();
    if !config_path.exists() {
        service.config().save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    // Every command runs against an up-to-date schema
    let outcomes = service.prepare_store().context("Schema migration failed")?;

    match args.command {
        Command::Migrate => {
            for (table, outcome) in &outcomes {
                println!("{:<20} {:?}", table, outcome);
            }
            for stats in service.store().stats()? {
                println!("{:<20} {} rows", stats.table, stats.rows);
            }
        }
        Command::Allocate { name, key } => {
            let allocator = service.allocator().clone();
            let identifier = tokio::task::spawn_blocking(move || allocator.allocate(&name, &key)).await??;
            println!("{}", identifier);
        }
        Command::Record { file } => {
            let submission: PlantingSubmission = read_json(file.as_deref())?;
            let recorder = service.planting_recorder(None);
            let planted = tokio::task::spawn_blocking(move || recorder.record(&submission)).await??;
            println!("{}", serde_json::to_string_pretty(&planted)?);
        }
        Command::Monitor { file } => {
            let submission: MonitoringSubmission = read_json(file.as_deref())?;
            let recorder = service.monitoring_recorder(None);
            let outcome = tokio::task::spawn_blocking(move || recorder.record(&submission)).await??;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::SyncOnce => {
            let Some(remote) = service.remote_from_config()? else {
                bail!("No Firestore project configured (--project-id or FIRESTORE_PROJECT_ID)");
            };
            let reports = service.sync_once(remote).await?;
            let mut failed = 0;
            for report in &reports {
                match &report.result {
                    Ok(c) => println!(
                        "{:<15} inserted={} updated={} skipped={}",
                        report.collection, c.inserted, c.updated, c.skipped
                    ),
                    Err(e) => {
                        failed += 1;
                        println!("{:<15} failed: {}", report.collection, e);
                    }
                }
            }
            if failed > 0 {
                bail!("{} of {} collections failed to sync", failed, reports.len());
            }
        }
        Command::Serve => serve(&service).await?,
    }

    Ok(())
}

async fn serve(service: &TallyService) -> anyhow::Result<()> {
    let scheduler = match service.remote_from_config()? {
        Some(remote) => {
            let scheduler = service.scheduler(remote)?;
            scheduler.start().await;
            Some(scheduler)
        }
        None => {
            warn!("No Firestore project configured, sync disabled");
            None
        }
    };

    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down");

    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
        let status = scheduler.status();
        info!(passes = status.passes, failed = status.failed_passes, "Sync scheduler finished");
    }
    Ok(())
}

/// Parse a JSON document from `file`, or from stdin for `None` and `-`
fn read_json<T: DeserializeOwned>(file: Option<&Path>) -> anyhow::Result<T> {
    let raw = match file.filter(|p| *p != Path::new("-")) {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut raw = String::new();
            std::io::stdin().read_to_string(&mut raw).context("Failed to read stdin")?;
            raw
        }
    };
    serde_json::from_str(&raw).context("Invalid submission JSON")
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let default_path = args
        .storage_dir
        .clone()
        .unwrap_or_else(tally_store::config::default_storage_dir)
        .join("config.toml");

    let mut config = match &args.config {
        Some(path) => Config::load(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None if default_path.exists() => Config::load(&default_path)
            .with_context(|| format!("Failed to load {}", default_path.display()))?,
        None => Config::default(),
    };

    // CLI overrides
    if let Some(dir) = &args.storage_dir {
        config.storage_dir = dir.clone();
    }
    if let Some(project_id) = &args.project_id {
        config.firestore.project_id = Some(project_id.clone());
    }
    if let Some(token) = &args.token {
        config.firestore.token = Some(token.clone());
    }
    if let Some(secs) = args.sync_interval {
        config.sync_interval_secs = secs;
    }
    Ok(config)
}
