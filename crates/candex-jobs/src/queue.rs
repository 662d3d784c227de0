//! Idempotent embedding job enqueue.

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use candex_core::{
    CandidateAttributes, CandidateSource, EmbeddingStatus, EnqueueOutcome, JobKind, Result,
};
use candex_db::Database;

use crate::priority::{determine_job_kind, score_priority};

/// One enqueue performed on behalf of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueuedJob {
    pub kind: JobKind,
    pub priority: i32,
    pub outcome: EnqueueOutcome,
}

/// Front door to the embedding job queue.
///
/// Wraps the job repository so that enqueueing a status-bearing kind also
/// moves the candidate's embedding status back to `pending`.
#[derive(Clone)]
pub struct JobQueue {
    db: Database,
}

impl JobQueue {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Enqueue one job. A no-op returning the existing id when a pending or
    /// in-progress job already exists for (candidate, kind).
    pub async fn enqueue(
        &self,
        candidate_id: Uuid,
        kind: JobKind,
        priority: i32,
    ) -> Result<EnqueueOutcome> {
        let outcome = self.db.jobs.enqueue(candidate_id, kind, priority).await?;

        match outcome {
            EnqueueOutcome::Queued(job_id) => {
                if kind.completes_candidate() {
                    self.db
                        .candidates
                        .set_embedding_status(candidate_id, EmbeddingStatus::Pending)
                        .await?;
                }
                info!(
                    subsystem = "jobs",
                    op = "enqueue",
                    %candidate_id,
                    %job_id,
                    job_kind = %kind,
                    priority,
                    "Embedding job queued"
                );
            }
            EnqueueOutcome::AlreadyQueued(job_id) => {
                debug!(
                    subsystem = "jobs",
                    op = "enqueue",
                    %candidate_id,
                    %job_id,
                    job_kind = %kind,
                    "Embedding job already outstanding"
                );
            }
        }

        Ok(outcome)
    }

    /// Enqueue the right work for a candidate's current attributes.
    ///
    /// Picks the kind and priority from the attributes and the ingesting
    /// source. A partial kind (one that does not complete the candidate) is
    /// accompanied by a `profile` job so the candidate can still reach
    /// `completed`.
    pub async fn enqueue_for_candidate(
        &self,
        candidate_id: Uuid,
        attrs: &CandidateAttributes,
        source: CandidateSource,
        base_priority: i32,
    ) -> Result<Vec<QueuedJob>> {
        let kind = determine_job_kind(attrs, source);
        let priority = score_priority(base_priority, attrs, source);

        let mut queued = Vec::with_capacity(2);
        let outcome = self.enqueue(candidate_id, kind, priority).await?;
        queued.push(QueuedJob {
            kind,
            priority,
            outcome,
        });

        if !kind.completes_candidate() {
            let outcome = self
                .enqueue(candidate_id, JobKind::Profile, priority)
                .await?;
            queued.push(QueuedJob {
                kind: JobKind::Profile,
                priority,
                outcome,
            });
        }

        Ok(queued)
    }
}
