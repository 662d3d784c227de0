//! candex: operator command line for the candex identity pipeline.
//!
//! Every command prints a single JSON envelope `{success, data | error,
//! message}` on stdout. Logs go to stderr, or to `LOG_FILE` when set.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::{json, Value as JsonValue};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use candex_core::defaults::SIMILAR_LIMIT;
use candex_core::{
    ApiEnvelope, CandidateSource, EmbeddingBackend, Error, JobKind, LifecycleStatus,
    PipelineConfig,
};
use candex_db::{Database, PoolConfig};
use candex_inference::{MockEmbeddingBackend, OllamaBackend};
use candex_jobs::{BatchProcessor, JobQueue, JobWorker, ProcessorConfig, WorkerConfig};
use candex_pipeline::{
    BackfillOptions, IngestRequest, IngestService, ReconcileOptions, RepairDriver,
};

#[derive(Parser)]
#[command(name = "candex")]
#[command(author, version, about = "Candidate identity resolution and embedding pipeline")]
#[command(propagate_version = true)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL", global = true, hide_env_values = true)]
    database_url: Option<String>,

    /// Use a process-local store instead of PostgreSQL. Nothing persists.
    #[arg(long, global = true)]
    in_memory: bool,

    /// Use the deterministic mock embedding backend instead of Ollama
    #[arg(long, global = true)]
    mock_embeddings: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,

    /// Ingest raw payloads from a JSON file (one object or an array)
    Ingest {
        /// Source the payloads came from (scraped_network, ats, cv_upload, manual)
        #[arg(short, long)]
        source: CandidateSource,

        /// File holding the payloads
        #[arg(short, long)]
        file: PathBuf,

        /// External run identifier (default: generated)
        #[arg(long)]
        run_id: Option<String>,

        /// Caller identity for rate limiting (default: the source name)
        #[arg(long)]
        caller: Option<String>,

        /// Process the queued embedding jobs right after ingesting
        #[arg(long)]
        process: bool,
    },

    /// Process embedding jobs
    Work {
        /// Run a single bounded invocation instead of a long-running worker
        #[arg(long)]
        once: bool,
    },

    /// Replay stored payloads onto candidates with missing fields
    Backfill {
        /// Maximum candidates examined (default: REPAIR_SCAN_LIMIT)
        #[arg(long)]
        limit: Option<i64>,

        /// Overwrite populated fields and scan every linked candidate
        #[arg(long)]
        force_rewrite: bool,

        /// Resume after this candidate id
        #[arg(long)]
        after: Option<Uuid>,
    },

    /// Collapse duplicate jobs and enqueue work for uncovered candidates
    Reconcile {
        /// Maximum candidates examined (default: REPAIR_SCAN_LIMIT)
        #[arg(long)]
        limit: Option<i64>,

        /// Resume after this candidate id
        #[arg(long)]
        after: Option<Uuid>,
    },

    /// Reset in-progress jobs older than JOB_STALE_AFTER_SECS to pending
    ReclaimStale,

    /// Enqueue one embedding job for a candidate
    Enqueue {
        candidate: Uuid,

        #[arg(long, default_value = "profile")]
        kind: JobKind,

        /// Priority (default: JOB_BASE_PRIORITY)
        #[arg(long)]
        priority: Option<i32>,
    },

    /// Queue and embedding status counts
    Stats,

    /// Show a candidate with its jobs, vectors and raw payload receipts
    Show { candidate: Uuid },

    /// Take a candidate out of identity resolution
    Deactivate { candidate: Uuid },

    /// Return a candidate to identity resolution
    Activate { candidate: Uuid },

    /// Find candidates whose embeddings are nearest to a candidate's
    Similar {
        candidate: Uuid,

        #[arg(long, default_value = "profile")]
        kind: JobKind,

        #[arg(long, default_value_t = SIMILAR_LIMIT)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let _file_guard = init_tracing();

    let (envelope, code) = match run(cli).await {
        Ok((data, message)) => (ApiEnvelope::ok(data).with_message(message), ExitCode::SUCCESS),
        Err(e) => (failure_envelope(&e), ExitCode::FAILURE),
    };

    match serde_json::to_string_pretty(&envelope) {
        Ok(out) => println!("{}", out),
        Err(e) => {
            eprintln!("Error: failed to serialize result: {}", e);
            return ExitCode::FAILURE;
        }
    }
    code
}

/// Initialize tracing with configurable output.
///
/// Environment variables:
///   LOG_FORMAT  - "json" or "text" (default: "text")
///   LOG_FILE    - path to log file (optional, enables daily-rotated file logging)
///   LOG_ANSI    - "true"/"false" override ANSI colors (auto-detected by default)
///   RUST_LOG    - standard env filter (default: "candex=info,...")
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let log_file = std::env::var("LOG_FILE").ok();
    let log_ansi = std::env::var("LOG_ANSI")
        .ok()
        .map(|v| v == "true" || v == "1");

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        "candex=info,candex_pipeline=info,candex_jobs=info,candex_db=warn,candex_inference=info"
            .into()
    });

    let registry = tracing_subscriber::registry().with(env_filter);

    let guard = if let Some(ref path) = log_file {
        let file_dir = Path::new(path).parent().unwrap_or(Path::new("."));
        let file_name = Path::new(path)
            .file_name()
            .and_then(|f| f.to_str())
            .unwrap_or("candex.log");
        let file_appender = tracing_appender::rolling::daily(file_dir, file_name);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking),
                )
                .init();
        } else {
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(log_ansi.unwrap_or(false)); // no ANSI in files
            registry.with(layer).init();
        }
        Some(guard)
    } else {
        // stdout carries the result envelope
        if log_format == "json" {
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(std::io::stderr),
                )
                .init();
        } else {
            let mut layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
            if let Some(ansi) = log_ansi {
                layer = layer.with_ansi(ansi);
            }
            registry.with(layer).init();
        }
        None
    };

    info!(
        log_format = %log_format,
        log_file = log_file.as_deref().unwrap_or("(stderr)"),
        "Logging initialized"
    );
    guard
}

fn failure_envelope(error: &anyhow::Error) -> ApiEnvelope<JsonValue> {
    match error.downcast_ref::<Error>() {
        Some(e) => ApiEnvelope::from_error(e),
        None => ApiEnvelope::err(format!("{:#}", error)).with_message("internal"),
    }
}

async fn open_database(cli: &Cli) -> anyhow::Result<Database> {
    if cli.in_memory {
        info!("Using in-memory store");
        return Ok(Database::in_memory());
    }
    let url = cli
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set (pass --database-url or --in-memory)")?;
    Ok(Database::connect(url, PoolConfig::from_env()).await?)
}

fn embedding_backend(cli: &Cli) -> anyhow::Result<Arc<dyn EmbeddingBackend>> {
    if cli.mock_embeddings {
        return Ok(Arc::new(MockEmbeddingBackend::new()));
    }
    Ok(Arc::new(OllamaBackend::from_env()?))
}

fn to_json<T: serde::Serialize>(value: &T) -> anyhow::Result<JsonValue> {
    Ok(serde_json::to_value(value)?)
}

async fn run(cli: Cli) -> anyhow::Result<(JsonValue, String)> {
    let db = open_database(&cli).await?;
    let config = PipelineConfig::from_env();

    match &cli.command {
        Commands::Migrate => {
            db.migrate().await?;
            Ok((json!({"migrated": true}), "Migrations applied".into()))
        }

        Commands::Ingest {
            source,
            file,
            run_id,
            caller,
            process,
        } => {
            let payloads = read_payloads(file)?;
            let service = IngestService::from_config(db.clone(), config);
            let summary = service
                .ingest_batch(IngestRequest {
                    source: *source,
                    external_run_id: run_id
                        .clone()
                        .unwrap_or_else(|| format!("cli-{}", Uuid::now_v7())),
                    caller: caller.clone(),
                    payloads,
                })
                .await?;

            let message = format!(
                "{} created, {} updated, {} duplicate, {} failed",
                summary.created, summary.updated, summary.duplicates, summary.failed
            );
            let mut data = json!({ "ingest": to_json(&summary)? });
            if *process {
                let processor =
                    BatchProcessor::new(db, embedding_backend(&cli)?, ProcessorConfig::from_env());
                data["process"] = to_json(&processor.run_once().await?)?;
            }
            Ok((data, message))
        }

        Commands::Work { once } => {
            let processor =
                BatchProcessor::new(db, embedding_backend(&cli)?, ProcessorConfig::from_env());
            if *once {
                let report = processor.run_once().await?;
                let message = format!(
                    "{} completed, {} skipped, {} failed",
                    report.completed, report.skipped, report.failed
                );
                return Ok((to_json(&report)?, message));
            }

            let handle = JobWorker::new(processor, WorkerConfig::from_env()).start();
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
            info!("Shutdown requested");
            handle.shutdown().await?;
            handle.join().await?;
            Ok((json!({"stopped": true}), "Worker stopped".into()))
        }

        Commands::Backfill {
            limit,
            force_rewrite,
            after,
        } => {
            let limit = limit.unwrap_or(config.repair_scan_limit);
            let driver = RepairDriver::from_config(db, config);
            let report = driver
                .run_merge_backfill(
                    BackfillOptions::new(limit)
                        .force_rewrite(*force_rewrite)
                        .after(*after),
                )
                .await?;
            let message = format!("{} of {} candidates updated", report.updated, report.scanned);
            Ok((to_json(&report)?, message))
        }

        Commands::Reconcile { limit, after } => {
            let limit = limit.unwrap_or(config.repair_scan_limit);
            let driver = RepairDriver::from_config(db, config);
            let report = driver
                .run_queue_reconciliation(ReconcileOptions::new(limit).after(*after))
                .await?;
            let message = format!(
                "{} queued, {} duplicates removed, {} skipped",
                report.queued, report.updated, report.skipped
            );
            Ok((to_json(&report)?, message))
        }

        Commands::ReclaimStale => {
            let driver = RepairDriver::from_config(db, config);
            let reclaimed = driver.reclaim_stale().await?;
            let message = format!("{} jobs reclaimed", reclaimed.len());
            Ok((to_json(&reclaimed)?, message))
        }

        Commands::Enqueue {
            candidate,
            kind,
            priority,
        } => {
            db.candidates
                .get(*candidate)
                .await?
                .ok_or(Error::CandidateNotFound(*candidate))?;
            let queue = JobQueue::new(db);
            let outcome = queue
                .enqueue(*candidate, *kind, priority.unwrap_or(config.base_priority))
                .await?;
            let message = if outcome.is_new() {
                "Job queued"
            } else {
                "Job already outstanding"
            };
            Ok((to_json(&outcome)?, message.into()))
        }

        Commands::Stats => {
            let queue = db.jobs.queue_stats().await?;
            let candidates: BTreeMap<String, i64> = db
                .candidates
                .count_by_embedding_status()
                .await?
                .into_iter()
                .map(|(status, count)| (status.to_string(), count))
                .collect();
            if let Some(pool) = db.pool() {
                candex_db::log_pool_metrics(pool);
            }
            Ok((
                json!({ "queue": queue, "embedding_status": candidates }),
                "Statistics".into(),
            ))
        }

        Commands::Show { candidate } => {
            let record = db
                .candidates
                .get(*candidate)
                .await?
                .ok_or(Error::CandidateNotFound(*candidate))?;
            let jobs = db.jobs.list_for_candidate(*candidate).await?;
            let vectors = db.vectors.list_for_candidate(*candidate).await?;
            let raw = db.raw_ingest.list_for_candidate(*candidate).await?;
            Ok((
                json!({
                    "candidate": record,
                    "jobs": jobs,
                    "vectors": to_json(&vectors)?,
                    "raw_records": raw,
                }),
                "Candidate".into(),
            ))
        }

        Commands::Deactivate { candidate } => {
            db.candidates
                .set_lifecycle(*candidate, LifecycleStatus::Inactive)
                .await?;
            Ok((
                json!({"candidate_id": candidate, "lifecycle": LifecycleStatus::Inactive}),
                "Candidate deactivated".into(),
            ))
        }

        Commands::Activate { candidate } => {
            db.candidates
                .set_lifecycle(*candidate, LifecycleStatus::Active)
                .await?;
            Ok((
                json!({"candidate_id": candidate, "lifecycle": LifecycleStatus::Active}),
                "Candidate activated".into(),
            ))
        }

        Commands::Similar {
            candidate,
            kind,
            limit,
        } => {
            let vector = db.vectors.get(*candidate, *kind).await?.ok_or_else(|| {
                Error::NotFound(format!("{} embedding for candidate {}", kind, candidate))
            })?;
            let hits: Vec<_> = db
                .vectors
                .find_similar(&vector.vector, *kind, limit + 1)
                .await?
                .into_iter()
                .filter(|hit| hit.candidate_id != *candidate)
                .take((*limit).max(0) as usize)
                .collect();
            let message = format!("{} similar candidates", hits.len());
            Ok((to_json(&hits)?, message))
        }
    }
}

/// Read a JSON file holding either one payload object or an array of them.
fn read_payloads(path: &Path) -> anyhow::Result<Vec<JsonValue>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let value: JsonValue = serde_json::from_str(&text)
        .map_err(|e| Error::InvalidInput(format!("{} is not valid JSON: {}", path.display(), e)))?;
    Ok(match value {
        JsonValue::Array(items) => items,
        other => vec![other],
    })
}
