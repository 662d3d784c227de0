//! # candex-pipeline
//!
//! Identity resolution pipeline for candex.
//!
//! Raw source payloads flow through the [`adapter`] into normalized
//! attributes, the [`resolver`] finds the canonical candidate they belong
//! to, and the [`merge`] engine computes field-level changes. The
//! [`ingest`] service ties these together with raw-payload receipts, rate
//! limiting and job enqueue. The [`repair`] driver replays stored payloads
//! and reconciles the job queue.

pub mod adapter;
pub mod ingest;
pub mod merge;
pub mod repair;
pub mod resolver;

// Re-export core types
pub use candex_core::*;

pub use adapter::{adapt, content_hash, AdaptedRecord, RawPayload};
pub use ingest::{IngestAction, IngestItemResult, IngestRequest, IngestService, IngestSummary};
pub use merge::{MergeAction, MergeOutcome};
pub use repair::{BackfillOptions, ReconcileOptions, RepairDriver, SweepError, SweepReport};
pub use resolver::{IdentityResolver, MatchRule, Resolution};
