//! Core traits for candex abstractions.
//!
//! These traits define the interfaces that concrete stores and providers
//! must satisfy. The PostgreSQL and in-memory stores in `candex-db` both
//! implement the repository traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::error::Result;
use crate::models::*;

// =============================================================================
// CANDIDATE REPOSITORY
// =============================================================================

/// Which candidates a merge backfill should examine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillScope {
    /// Active candidates with at least one empty identity field.
    MissingIdentity,
    /// Every active candidate.
    All,
}

/// Storage for canonical candidates.
#[async_trait]
pub trait CandidateRepository: Send + Sync {
    /// Get a candidate by id.
    async fn get(&self, id: Uuid) -> Result<Option<CanonicalCandidate>>;

    /// Look up the candidate holding an external id for a source.
    async fn find_by_external_id(
        &self,
        source: CandidateSource,
        external_id: &str,
    ) -> Result<Option<CanonicalCandidate>>;

    /// Active candidates with this normalized email.
    async fn find_active_by_email(&self, email: &str) -> Result<Vec<CanonicalCandidate>>;

    /// Active candidates with this normalized professional-network URL.
    async fn find_active_by_linkedin_url(&self, url: &str) -> Result<Vec<CanonicalCandidate>>;

    /// Insert a new candidate with its external ids.
    ///
    /// Fails with `Error::Conflict` if the email is held by another active
    /// candidate or an external id is already taken.
    async fn insert(&self, candidate: &CanonicalCandidate) -> Result<()>;

    /// Apply field-level conditional changes and return the stored result.
    async fn apply_patch(
        &self,
        id: Uuid,
        patch: &CandidatePatch,
        now: DateTime<Utc>,
    ) -> Result<CanonicalCandidate>;

    /// Set only the embedding status column.
    async fn set_embedding_status(&self, id: Uuid, status: EmbeddingStatus) -> Result<()>;

    /// Soft activation/deactivation. Candidates are never hard-deleted.
    async fn set_lifecycle(&self, id: Uuid, lifecycle: LifecycleStatus) -> Result<()>;

    /// Active candidates ordered by id, starting after `after`.
    async fn list_active(&self, after: Option<Uuid>, limit: i64) -> Result<Vec<CanonicalCandidate>>;

    /// Active candidates that have linked raw payloads, filtered by scope,
    /// ordered by id and starting after `after`.
    async fn list_backfill_targets(
        &self,
        scope: BackfillScope,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<CanonicalCandidate>>;

    /// Count candidates per embedding status.
    async fn count_by_embedding_status(&self) -> Result<Vec<(EmbeddingStatus, i64)>>;
}

// =============================================================================
// RAW INGEST REPOSITORY
// =============================================================================

/// Storage for ingest runs and raw payload receipts.
#[async_trait]
pub trait RawIngestRepository: Send + Sync {
    /// Get or create the run for (source, external run id).
    async fn start_run(
        &self,
        source: CandidateSource,
        external_run_id: &str,
        caller: Option<&str>,
    ) -> Result<IngestRun>;

    /// Persist a payload receipt with status `received`.
    async fn record(
        &self,
        run_id: Uuid,
        source: CandidateSource,
        payload: &JsonValue,
        content_hash: &str,
    ) -> Result<RawIngestRecord>;

    /// An earlier receipt of byte-identical content that resolved to a candidate.
    async fn find_resolved_by_hash(
        &self,
        source: CandidateSource,
        content_hash: &str,
    ) -> Result<Option<RawIngestRecord>>;

    /// Record the resolution outcome of a receipt.
    async fn mark_resolved(
        &self,
        id: Uuid,
        candidate_id: Uuid,
        status: RawIngestStatus,
    ) -> Result<()>;

    /// Record that a receipt could not be processed.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()>;

    /// Receipts linked to a candidate, oldest first.
    async fn list_for_candidate(&self, candidate_id: Uuid) -> Result<Vec<RawIngestRecord>>;
}

// =============================================================================
// JOB REPOSITORY
// =============================================================================

/// Priority queue of embedding jobs.
#[async_trait]
pub trait EmbeddingJobRepository: Send + Sync {
    /// Idempotent enqueue keyed by (candidate, kind).
    async fn enqueue(
        &self,
        candidate_id: Uuid,
        kind: JobKind,
        priority: i32,
    ) -> Result<EnqueueOutcome>;

    /// Atomically claim up to `limit` pending jobs, highest priority first,
    /// oldest first within a priority. Claimed jobs are `in_progress`.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<EmbeddingJob>>;

    /// Mark a claimed job completed with an optional result summary.
    ///
    /// Only applies while the job is still `in_progress` under the same
    /// claim (`started_at` unchanged); otherwise fails with
    /// [`Error::JobNotClaimed`](crate::Error::JobNotClaimed) and leaves the
    /// row alone.
    async fn complete(&self, claim: &EmbeddingJob, result: Option<JsonValue>) -> Result<()>;

    /// Mark a claimed job failed. No retry is scheduled. Same claim check
    /// as [`complete`](Self::complete).
    async fn fail(&self, claim: &EmbeddingJob, error: &str) -> Result<()>;

    /// Get job by id.
    async fn get(&self, job_id: Uuid) -> Result<Option<EmbeddingJob>>;

    /// All jobs for a candidate, oldest first.
    async fn list_for_candidate(&self, candidate_id: Uuid) -> Result<Vec<EmbeddingJob>>;

    /// Whether any pending/in-progress job of the given kinds exists.
    async fn has_outstanding(&self, candidate_id: Uuid, kinds: &[JobKind]) -> Result<bool>;

    /// Delete duplicate outstanding jobs per (candidate, kind), keeping the
    /// in-progress job if any, else the oldest pending one. Returns the
    /// number removed.
    async fn collapse_duplicates(&self) -> Result<u64>;

    /// Reset in-progress jobs started before `started_before` to pending.
    async fn reclaim_stale(&self, started_before: DateTime<Utc>) -> Result<Vec<EmbeddingJob>>;

    /// Queue statistics.
    async fn queue_stats(&self) -> Result<QueueStats>;
}

// =============================================================================
// VECTOR REPOSITORY
// =============================================================================

/// Storage and read access for candidate embeddings.
#[async_trait]
pub trait EmbeddingVectorRepository: Send + Sync {
    /// Insert or atomically replace the vector for (candidate, kind).
    async fn upsert(&self, vector: &EmbeddingVector) -> Result<()>;

    async fn get(&self, candidate_id: Uuid, kind: JobKind) -> Result<Option<EmbeddingVector>>;

    async fn list_for_candidate(&self, candidate_id: Uuid) -> Result<Vec<EmbeddingVector>>;

    /// Nearest active candidates by cosine similarity for one kind.
    async fn find_similar(
        &self,
        query: &Vector,
        kind: JobKind,
        limit: i64,
    ) -> Result<Vec<SimilarCandidate>>;
}

// =============================================================================
// EMBEDDING BACKEND
// =============================================================================

/// Backend for generating text embeddings.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    /// Generate embeddings for the given texts.
    ///
    /// Returns a vector of embedding vectors, one per input text.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vector>>;

    /// Get the expected dimension of embedding vectors.
    fn dimension(&self) -> usize;

    /// Get the model name being used.
    fn model_name(&self) -> &str;
}
