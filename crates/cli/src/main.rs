//! packsync CLI - replay backend traffic through the progress engine.

mod script;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use packsync_progress::{Engine, EngineConfig, InMemoryBackend, ProgressChanged, ProgressStore, Tracker};
use packsync_storage::{JsonSnapshotStore, SnapshotStore};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::script::Script;

#[derive(Parser)]
#[command(name = "packsync")]
#[command(about = "Pack progress reconciliation", long_about = None)]
struct Cli {
    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a replay script against the engine
    Replay {
        /// Script file
        script: PathBuf,
        /// State directory
        #[arg(long, default_value = ".packsync")]
        state: PathBuf,
        /// Engine config file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Show the saved progress snapshot
    Inspect {
        /// State directory
        #[arg(long, default_value = ".packsync")]
        state: PathBuf,
    },
    /// Delete the saved progress snapshot
    Clear {
        /// State directory
        #[arg(long, default_value = ".packsync")]
        state: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.verbose { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Replay { script, state, config } => replay(&script, &state, config.as_deref()).await?,
        Commands::Inspect { state } => inspect(&state).await?,
        Commands::Clear { state } => {
            let store = open_store(&state).await?;
            store.clear().await.context("Failed to clear snapshot")?;
            println!("Cleared {}", store.path().display());
        }
    }

    Ok(())
}

async fn open_store(state: &Path) -> Result<JsonSnapshotStore> {
    JsonSnapshotStore::new(state)
        .await
        .with_context(|| format!("Failed to open state directory {}", state.display()))
}

async fn replay(script_path: &Path, state: &Path, config_path: Option<&Path>) -> Result<()> {
    let script = Script::from_file(script_path)?;
    let config = match config_path {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    let backend = InMemoryBackend::new();
    script.backend.apply(&backend).await;
    let snapshots = open_store(state).await?;

    let tracker = Tracker::new(config).with_inventory(script.inventory.clone(), Utc::now());
    let (engine, handle) = Engine::new(tracker, Arc::new(backend.clone()), Arc::new(snapshots));

    let started = Instant::now();
    let mut changes = handle.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => print_change(started.elapsed(), &change),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} progress updates", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });
    let running = tokio::spawn(engine.run());

    info!("Replaying {} steps from {}", script.steps.len(), script_path.display());
    for step in script.steps {
        tokio::time::sleep(Duration::from_millis(step.after_ms)).await;
        info!("Step: {}", step.action.as_str());
        if !step.action.perform(&handle, &backend).await {
            warn!("Engine stopped before the script finished");
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(script.settle_ms)).await;

    println!();
    for pack in &script.inventory {
        if let Some(overview) = handle.overview(pack.id.clone()).await {
            println!("{}", serde_json::to_string(&overview)?);
        }
    }

    handle.persist().await.context("Final persist failed")?;
    handle.shutdown();
    running.await.context("Engine task failed")?;
    drop(handle);
    printer.await.context("Printer task failed")?;
    Ok(())
}

fn print_change(elapsed: Duration, change: &ProgressChanged) {
    let at = elapsed.as_millis();
    match &change.record {
        Some(record) => println!(
            "[{:>6}ms] {} {:>3}% {}/{} mods{}",
            at,
            change.pack_id,
            record.progress,
            record.completed_mods,
            record.total_mods,
            if record.downloading { "" } else { " (done)" },
        ),
        None => println!("[{:>6}ms] {} removed", at, change.pack_id),
    }
}

async fn inspect(state: &Path) -> Result<()> {
    let snapshots = open_store(state).await?;
    let mut store = ProgressStore::new(EngineConfig::default().persist_debounce());
    let report = store
        .restore(&snapshots)
        .await
        .with_context(|| format!("Failed to load snapshot from {}", snapshots.path().display()))?;

    if store.is_empty() {
        println!("No progress saved in {}", state.display());
        return Ok(());
    }
    for id in &report.repaired {
        println!("Repaired: {}", id);
    }

    println!("Progress ({})", store.len());
    for (id, record) in store.iter() {
        println!(
            "  {} | {:>3}% | {}/{} mods | {} pending | {} | {} at {}",
            id,
            record.progress,
            record.completed_mods,
            record.total_mods,
            record.pending_mods.len(),
            if record.downloading { "downloading" } else { "idle" },
            record.last_update_source.as_str(),
            record.last_update_time.to_rfc3339(),
        );
    }
    Ok(())
}
