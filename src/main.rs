//! # Trace Pipeline CLI (`tpipe`)
//!
//! Runs the ingestion and vectorization stages against the configured
//! store and embedding service.
//!
//! ## Usage
//!
//! ```bash
//! tpipe --config ./config/tpipe.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `tpipe init` | Create the SQLite schema (no-op for other backends) |
//! | `tpipe ingest <file>...` | Ingest batch payload files under a new trace id |
//! | `tpipe vectorize --trace-id <id>` | Embed and store vectors for one trace |
//! | `tpipe run <file>...` | Ingest, then vectorize the new trace |
//!
//! Stage output JSON goes to stdout, logs and stage errors to stderr.
//! The exit code is `0` for `completed`, `2` for `partial` and `1` for
//! `failed`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use trace_pipeline::config::{self, Config};
use trace_pipeline::pipeline::Pipeline;
use trace_pipeline::{db, logging, migrate};
use trace_pipeline_core::outcome::{StageOutcome, StageStatus};
use trace_pipeline_core::payload::IngestPayload;

/// Trace Pipeline CLI: trace-anchored ingestion and vectorization.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/tpipe.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "tpipe",
    about = "Trace-anchored ingestion and vectorization stages over a keyed table store",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/tpipe.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the store schema.
    ///
    /// Creates the SQLite database file and the `items` table. Idempotent.
    /// Other backends need no local schema.
    Init,

    /// Ingest batch payload files (JSON array or NDJSON) under a new trace id.
    Ingest {
        /// Payload files.
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Embed every record stored under a trace id and store the vectors.
    Vectorize {
        #[arg(long)]
        trace_id: String,
    },

    /// Ingest payload files, then vectorize the minted trace id.
    Run {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let cfg = config::load_config(&cli.config)?;
    logging::init(&cfg.logging)?;

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    match cli.command {
        Commands::Init => {
            init(&cfg).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Ingest { files } => {
            let payloads = read_payloads(&files)?;
            let pipeline = Pipeline::from_config(&cfg).await?;
            let outcome = pipeline.ingest(payloads, &cancel).await;
            print_json(&json!(outcome.output()))?;
            report_error(&outcome);
            Ok(exit_code(outcome.status()))
        }
        Commands::Vectorize { trace_id } => {
            let pipeline = Pipeline::from_config(&cfg).await?;
            let outcome = pipeline.vectorize(&trace_id, &cancel).await;
            print_json(&json!(outcome.output()))?;
            report_error(&outcome);
            Ok(exit_code(outcome.status()))
        }
        Commands::Run { files } => {
            let payloads = read_payloads(&files)?;
            let pipeline = Pipeline::from_config(&cfg).await?;
            let (ingested, vectorized) = pipeline.run(payloads, &cancel).await;

            print_json(&json!({
                "ingestion": ingested.output(),
                "vectorization": vectorized.as_ref().and_then(StageOutcome::output),
            }))?;
            report_error(&ingested);
            if let Some(ref outcome) = vectorized {
                report_error(outcome);
            }

            let status = match vectorized {
                Some(outcome) => worst(ingested.status(), outcome.status()),
                None => ingested.status(),
            };
            Ok(exit_code(status))
        }
    }
}

async fn init(cfg: &Config) -> Result<()> {
    match (cfg.store.backend.as_str(), &cfg.store.sqlite) {
        ("sqlite", Some(sqlite)) => {
            let pool = db::connect(&sqlite.path).await?;
            migrate::run_migrations(&pool).await?;
            pool.close().await;
            println!("Database initialized at {}", sqlite.path.display());
        }
        (backend, _) => {
            println!("Nothing to initialize for the '{}' backend", backend);
        }
    }
    Ok(())
}

fn read_payloads(files: &[PathBuf]) -> Result<Vec<IngestPayload>> {
    files
        .iter()
        .map(|path| {
            let data = std::fs::read(path)
                .with_context(|| format!("Failed to read payload file: {}", path.display()))?;
            Ok(IngestPayload::new(object_key(path), data))
        })
        .collect()
}

fn object_key(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling in-flight work");
            cancel.cancel();
        }
    });
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn report_error(outcome: &StageOutcome) {
    if let Some(error) = outcome.error() {
        eprintln!("error: {}", error);
    }
}

fn worst(a: StageStatus, b: StageStatus) -> StageStatus {
    match (a, b) {
        (StageStatus::Failed, _) | (_, StageStatus::Failed) => StageStatus::Failed,
        (StageStatus::Partial, _) | (_, StageStatus::Partial) => StageStatus::Partial,
        _ => StageStatus::Completed,
    }
}

fn exit_code(status: StageStatus) -> ExitCode {
    match status {
        StageStatus::Completed => ExitCode::SUCCESS,
        StageStatus::Partial => ExitCode::from(2),
        StageStatus::Failed => ExitCode::from(1),
    }
}
