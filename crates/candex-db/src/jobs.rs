//! Embedding job repository implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use tracing::debug;
use uuid::Uuid;

use candex_core::{
    new_v7, EmbeddingJob, EmbeddingJobRepository, EnqueueOutcome, Error, JobKind, QueueStats,
    Result,
};

const JOB_COLUMNS: &str = "id, candidate_id, kind, status, priority, error_message, result, \
     created_at, started_at, completed_at";

/// Attempts at insert-or-find before giving up on a racing enqueue.
const ENQUEUE_ATTEMPTS: usize = 3;

/// PostgreSQL implementation of EmbeddingJobRepository.
pub struct PgEmbeddingJobRepository {
    pool: Pool<Postgres>,
}

impl PgEmbeddingJobRepository {
    /// Create a new PgEmbeddingJobRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Parse a job row into an EmbeddingJob.
    fn parse_job_row(row: &PgRow) -> Result<EmbeddingJob> {
        let kind: String = row.get("kind");
        let status: String = row.get("status");
        Ok(EmbeddingJob {
            id: row.get("id"),
            candidate_id: row.get("candidate_id"),
            kind: kind.parse()?,
            status: status.parse()?,
            priority: row.get("priority"),
            error_message: row.get("error_message"),
            result: row.get("result"),
            created_at: row.get("created_at"),
            started_at: row.get("started_at"),
            completed_at: row.get("completed_at"),
        })
    }

    fn parse_rows(rows: &[PgRow]) -> Result<Vec<EmbeddingJob>> {
        rows.iter().map(Self::parse_job_row).collect()
    }

    /// Explain a settle that matched no row: the job is gone, or another
    /// claim (or the stale sweep) has moved it on.
    async fn lost_claim(&self, job_id: Uuid) -> Error {
        let exists = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM embedding_job WHERE id = $1)",
        )
        .bind(job_id)
        .fetch_one(&self.pool)
        .await;
        match exists {
            Ok(false) => Error::JobNotFound(job_id),
            Ok(true) => {
                debug!(job_id = %job_id, "Settle skipped; job no longer held by this claim");
                Error::JobNotClaimed(job_id)
            }
            Err(e) => Error::Database(e),
        }
    }
}

#[async_trait]
impl EmbeddingJobRepository for PgEmbeddingJobRepository {
    async fn enqueue(
        &self,
        candidate_id: Uuid,
        kind: JobKind,
        priority: i32,
    ) -> Result<EnqueueOutcome> {
        for _ in 0..ENQUEUE_ATTEMPTS {
            // The partial unique index on outstanding (candidate, kind) makes
            // this a no-op while equivalent work is pending or running.
            let inserted = sqlx::query_scalar::<_, Uuid>(
                "INSERT INTO embedding_job (id, candidate_id, kind, status, priority, created_at)
                 VALUES ($1, $2, $3, 'pending', $4, $5)
                 ON CONFLICT (candidate_id, kind) WHERE status IN ('pending', 'in_progress')
                 DO NOTHING
                 RETURNING id",
            )
            .bind(new_v7())
            .bind(candidate_id)
            .bind(kind.as_str())
            .bind(priority)
            .bind(Utc::now())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::from)?;

            if let Some(id) = inserted {
                return Ok(EnqueueOutcome::Queued(id));
            }

            let existing = sqlx::query_scalar::<_, Uuid>(
                "SELECT id FROM embedding_job
                 WHERE candidate_id = $1 AND kind = $2 AND status IN ('pending', 'in_progress')
                 ORDER BY created_at ASC
                 LIMIT 1",
            )
            .bind(candidate_id)
            .bind(kind.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;

            if let Some(id) = existing {
                return Ok(EnqueueOutcome::AlreadyQueued(id));
            }

            // The conflicting job finished between the insert and the lookup.
            debug!(
                subsystem = "jobs",
                component = "queue",
                %candidate_id,
                job_kind = kind.as_str(),
                "Outstanding job vanished during enqueue, retrying"
            );
        }

        Err(Error::Conflict(format!(
            "enqueue of {} for {} kept racing",
            kind, candidate_id
        )))
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<EmbeddingJob>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        // FOR UPDATE SKIP LOCKED lets concurrent workers claim disjoint sets;
        // the outer status check keeps the transition conditional.
        let rows = sqlx::query(&format!(
            "UPDATE embedding_job
             SET status = 'in_progress', started_at = $1
             WHERE id IN (
                 SELECT id FROM embedding_job
                 WHERE status = 'pending'
                 ORDER BY priority DESC, created_at ASC, id ASC
                 LIMIT $2
                 FOR UPDATE SKIP LOCKED
             )
             AND status = 'pending'
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(Utc::now())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        let mut jobs = Self::parse_rows(&rows)?;
        // RETURNING order is unspecified.
        jobs.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_at.cmp(&b.created_at))
                .then(a.id.cmp(&b.id))
        });
        Ok(jobs)
    }

    async fn complete(&self, claim: &EmbeddingJob, result: Option<JsonValue>) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE embedding_job
             SET status = 'completed', completed_at = $1, result = $2, error_message = NULL
             WHERE id = $3 AND status = 'in_progress' AND started_at IS NOT DISTINCT FROM $4",
        )
        .bind(Utc::now())
        .bind(&result)
        .bind(claim.id)
        .bind(claim.started_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if updated.rows_affected() == 0 {
            return Err(self.lost_claim(claim.id).await);
        }
        Ok(())
    }

    async fn fail(&self, claim: &EmbeddingJob, error: &str) -> Result<()> {
        let updated = sqlx::query(
            "UPDATE embedding_job
             SET status = 'failed', completed_at = $1, error_message = $2
             WHERE id = $3 AND status = 'in_progress' AND started_at IS NOT DISTINCT FROM $4",
        )
        .bind(Utc::now())
        .bind(error)
        .bind(claim.id)
        .bind(claim.started_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        if updated.rows_affected() == 0 {
            return Err(self.lost_claim(claim.id).await);
        }
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<EmbeddingJob>> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM embedding_job WHERE id = $1"
        ))
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn list_for_candidate(&self, candidate_id: Uuid) -> Result<Vec<EmbeddingJob>> {
        let rows = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM embedding_job
             WHERE candidate_id = $1
             ORDER BY created_at ASC, id ASC"
        ))
        .bind(candidate_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_rows(&rows)
    }

    async fn has_outstanding(&self, candidate_id: Uuid, kinds: &[JobKind]) -> Result<bool> {
        let kinds: Vec<String> = kinds.iter().map(|k| k.as_str().to_string()).collect();
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (
                 SELECT 1 FROM embedding_job
                 WHERE candidate_id = $1
                   AND status IN ('pending', 'in_progress')
                   AND (cardinality($2::text[]) = 0 OR kind = ANY($2))
             )",
        )
        .bind(candidate_id)
        .bind(&kinds)
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(exists)
    }

    async fn collapse_duplicates(&self) -> Result<u64> {
        let result = sqlx::query(
            "WITH ranked AS (
                 SELECT id, status,
                        ROW_NUMBER() OVER (
                            PARTITION BY candidate_id, kind
                            ORDER BY (status = 'in_progress') DESC, created_at ASC, id ASC
                        ) AS rn
                 FROM embedding_job
                 WHERE status IN ('pending', 'in_progress')
             )
             DELETE FROM embedding_job
             WHERE id IN (SELECT id FROM ranked WHERE rn > 1 AND status = 'pending')",
        )
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(result.rows_affected())
    }

    async fn reclaim_stale(&self, started_before: DateTime<Utc>) -> Result<Vec<EmbeddingJob>> {
        let rows = sqlx::query(&format!(
            "UPDATE embedding_job
             SET status = 'pending', started_at = NULL
             WHERE status = 'in_progress' AND started_at < $1
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(started_before)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_rows(&rows)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let row = sqlx::query(
            "SELECT
                 COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                 COUNT(*) FILTER (WHERE status = 'in_progress') AS in_progress,
                 COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                 COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                 COUNT(*) AS total
             FROM embedding_job",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(QueueStats {
            pending: row.get("pending"),
            in_progress: row.get("in_progress"),
            completed: row.get("completed"),
            failed: row.get("failed"),
            total: row.get("total"),
        })
    }
}
