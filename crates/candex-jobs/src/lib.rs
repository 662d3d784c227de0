//! # candex-jobs
//!
//! Embedding job pipeline for candex.
//!
//! This crate provides:
//! - Priority scoring and job-kind selection
//! - Idempotent enqueue that keeps candidate embedding status in step
//! - Kind-specific embedding text assembly
//! - A batch processor that claims, embeds and settles jobs
//! - A long-running worker with broadcast events and graceful shutdown
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use candex_db::Database;
//! use candex_inference::OllamaBackend;
//! use candex_jobs::{BatchProcessor, JobWorker, ProcessorConfig, WorkerConfig};
//!
//! let db = Database::connect("postgres://...", Default::default()).await?;
//! let backend = Arc::new(OllamaBackend::from_env()?);
//! let processor = BatchProcessor::new(db, backend, ProcessorConfig::from_env());
//!
//! let handle = JobWorker::new(processor, WorkerConfig::from_env()).start();
//! let mut events = handle.events();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//! handle.shutdown().await?;
//! ```

pub mod priority;
pub mod processor;
pub mod queue;
pub mod text;
pub mod worker;

// Re-export core types
pub use candex_core::*;

pub use priority::{determine_job_kind, score_priority, source_weight};
pub use processor::{BatchProcessor, JobOutcome, JobOutcomeStatus, ProcessReport, ProcessorConfig};
pub use queue::{JobQueue, QueuedJob};
pub use text::{build_input, EmbeddingInput};
pub use worker::{JobWorker, WorkerConfig, WorkerEvent, WorkerHandle};

/// Default polling interval for the worker when the queue is empty (milliseconds).
pub const DEFAULT_POLL_INTERVAL_MS: u64 = candex_core::defaults::JOB_POLL_INTERVAL_MS;
