//! blackhole-ingest - operator command line
//!
//! Replays ingest scripts, runs the reconciler and queries take status
//! against the configured archive and database. `init-config` writes the
//! effective configuration out as a starting point.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use blackhole_common::config::{self, LoggingConfig, TomlConfig};
use blackhole_ingest::models::{OpenTakeRequest, RawSample, SampleBatch};
use blackhole_ingest::timecode::FrameRate;
use blackhole_ingest::{IngestEngine, IngestError};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for blackhole-ingest
#[derive(Parser, Debug)]
#[command(name = "blackhole-ingest")]
#[command(about = "Camera-tracking take ingestion")]
#[command(version)]
struct Args {
    /// Root folder holding the archive and database
    #[arg(short, long)]
    root_folder: Option<PathBuf>,

    /// Config file (default ~/.config/blackhole/blackhole.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay an ingest script: open the take, append its batches, finalize
    Ingest {
        /// JSON script file
        script: PathBuf,

        /// Finalize deadline in milliseconds
        #[arg(long)]
        deadline_ms: Option<u64>,
    },
    /// Check the database against the archive and resolve divergence
    Reconcile,
    /// Show the status of a take
    Status { take_id: String },
    /// Write the effective configuration to a TOML file
    InitConfig {
        /// Destination (default ~/.config/blackhole/blackhole.toml)
        path: Option<PathBuf>,

        /// Replace an existing file
        #[arg(long)]
        force: bool,
    },
}

/// `{"open": {...}, "batches": [{"rate": "24", "samples": [...]}], "finalize": true}`
#[derive(Debug, Deserialize)]
struct IngestScript {
    open: OpenTakeRequest,
    #[serde(default)]
    batches: Vec<ScriptBatch>,
    #[serde(default = "default_finalize")]
    finalize: bool,
}

#[derive(Debug, Deserialize)]
struct ScriptBatch {
    #[serde(default)]
    rate: Option<FrameRate>,
    samples: Vec<RawSample>,
}

fn default_finalize() -> bool {
    true
}

fn init_logging(logging: &LoggingConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| logging.level.as_str().into());
    let registry = tracing_subscriber::registry().with(filter);

    match &logging.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            registry
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .init();
        }
        None => {
            registry
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print the structured error and turn it into a process failure
fn report_failure(err: IngestError) -> anyhow::Error {
    if let Ok(json) = serde_json::to_string_pretty(&err.report()) {
        println!("{}", json);
    }
    anyhow::Error::new(err)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let toml_config: TomlConfig = config::load_or_default(args.config.as_deref())
        .context("Failed to load configuration")?;
    init_logging(&toml_config.logging)?;

    let root = config::resolve_root_folder(args.root_folder.as_deref(), &toml_config);

    match args.command {
        Command::Ingest { script, deadline_ms } => {
            let engine = open_engine(&toml_config, &root).await?;
            run_script(&engine, &script, deadline_ms.map(Duration::from_millis)).await
        }
        Command::Reconcile => {
            let engine = open_engine(&toml_config, &root).await?;
            let report = engine.reconciler.reconcile().await.map_err(report_failure)?;
            print_json(&report)
        }
        Command::Status { take_id } => {
            let engine = open_engine(&toml_config, &root).await?;
            let status = engine.sessions.status(&take_id).await.map_err(report_failure)?;
            print_json(&status)
        }
        Command::InitConfig { path, force } => init_config(&toml_config, path.as_deref(), force),
    }
}

async fn open_engine(toml_config: &TomlConfig, root: &Path) -> Result<IngestEngine> {
    let archive_dir = toml_config.archive_dir(root);
    let database_path = toml_config.database_path(root);
    info!(root = %root.display(), archive = %archive_dir.display(), database = %database_path.display(), "Starting blackhole-ingest");

    IngestEngine::open(&archive_dir, &database_path, toml_config.ingest.clone())
        .await
        .context("Failed to initialize ingest engine")
}

fn init_config(toml_config: &TomlConfig, path: Option<&Path>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => config::default_config_path().context("No per-user config directory on this system")?,
    };
    if path.exists() && !force {
        bail!("{} already exists (use --force to replace it)", path.display());
    }

    config::write_toml_config(toml_config, &path)
        .with_context(|| format!("Failed to write config {}", path.display()))?;
    info!(path = %path.display(), "Wrote configuration");
    println!("{}", path.display());
    Ok(())
}

async fn run_script(engine: &IngestEngine, path: &Path, deadline: Option<Duration>) -> Result<()> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))?;
    let script: IngestScript = serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse script {}", path.display()))?;

    let sessions = &engine.sessions;
    let handle = sessions.open_take(script.open).await.map_err(report_failure)?;
    info!(take_id = %handle.take_id, batches = script.batches.len(), "Replaying script");

    for (index, batch) in script.batches.into_iter().enumerate() {
        let batch = SampleBatch {
            take_id: handle.take_id.clone(),
            rate: batch.rate,
            samples: batch.samples,
        };
        match sessions.append_samples(&handle, batch).await {
            Ok(outcome) => print_json(&outcome)?,
            Err(e) => {
                let _ = sessions.abort_take(&handle).await;
                return Err(report_failure(e)).with_context(|| format!("Batch {} rejected, take aborted", index));
            }
        }
    }

    if script.finalize {
        let committed = sessions
            .finalize_take(&handle, deadline)
            .await
            .map_err(report_failure)?;
        print_json(&committed)?;
    } else {
        let aborted = sessions.abort_take(&handle).await.map_err(report_failure)?;
        print_json(&aborted)?;
    }
    Ok(())
}
