//! Raw ingest receipt repository implementation.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use candex_core::{
    new_v7, CandidateSource, Error, IngestRun, RawIngestRecord, RawIngestRepository,
    RawIngestStatus, Result,
};

const RECORD_COLUMNS: &str = "id, run_id, source, payload, content_hash, status, candidate_id, \
     error_message, received_at, resolved_at";

/// PostgreSQL implementation of RawIngestRepository.
pub struct PgRawIngestRepository {
    pool: Pool<Postgres>,
}

impl PgRawIngestRepository {
    /// Create a new PgRawIngestRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_record_row(row: &PgRow) -> Result<RawIngestRecord> {
        let source: String = row.get("source");
        let status: String = row.get("status");
        Ok(RawIngestRecord {
            id: row.get("id"),
            run_id: row.get("run_id"),
            source: source.parse()?,
            payload: row.get("payload"),
            content_hash: row.get("content_hash"),
            status: status.parse()?,
            candidate_id: row.get("candidate_id"),
            error_message: row.get("error_message"),
            received_at: row.get("received_at"),
            resolved_at: row.get("resolved_at"),
        })
    }
}

#[async_trait]
impl RawIngestRepository for PgRawIngestRepository {
    async fn start_run(
        &self,
        source: CandidateSource,
        external_run_id: &str,
        caller: Option<&str>,
    ) -> Result<IngestRun> {
        // No-op update on conflict so RETURNING yields the existing row.
        let row = sqlx::query(
            "INSERT INTO ingest_run (id, source, external_run_id, caller, started_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (source, external_run_id)
             DO UPDATE SET source = EXCLUDED.source
             RETURNING id, source, external_run_id, caller, started_at",
        )
        .bind(new_v7())
        .bind(source.as_str())
        .bind(external_run_id)
        .bind(caller)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        let source: String = row.get("source");
        Ok(IngestRun {
            id: row.get("id"),
            source: source.parse()?,
            external_run_id: row.get("external_run_id"),
            caller: row.get("caller"),
            started_at: row.get("started_at"),
        })
    }

    async fn record(
        &self,
        run_id: Uuid,
        source: CandidateSource,
        payload: &JsonValue,
        content_hash: &str,
    ) -> Result<RawIngestRecord> {
        let row = sqlx::query(&format!(
            "INSERT INTO raw_ingest_record (id, run_id, source, payload, content_hash, status, received_at)
             VALUES ($1, $2, $3, $4, $5, 'received', $6)
             RETURNING {RECORD_COLUMNS}"
        ))
        .bind(new_v7())
        .bind(run_id)
        .bind(source.as_str())
        .bind(payload)
        .bind(content_hash)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(Error::Database)?;

        Self::parse_record_row(&row)
    }

    async fn find_resolved_by_hash(
        &self,
        source: CandidateSource,
        content_hash: &str,
    ) -> Result<Option<RawIngestRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM raw_ingest_record
             WHERE source = $1 AND content_hash = $2
               AND status IN ('resolved', 'duplicate') AND candidate_id IS NOT NULL
             ORDER BY received_at ASC
             LIMIT 1"
        ))
        .bind(source.as_str())
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_record_row).transpose()
    }

    async fn mark_resolved(
        &self,
        id: Uuid,
        candidate_id: Uuid,
        status: RawIngestStatus,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE raw_ingest_record
             SET status = $1, candidate_id = $2, resolved_at = $3, error_message = NULL
             WHERE id = $4",
        )
        .bind(status.as_str())
        .bind(candidate_id)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        sqlx::query(
            "UPDATE raw_ingest_record
             SET status = 'failed', error_message = $1, resolved_at = $2
             WHERE id = $3",
        )
        .bind(error)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn list_for_candidate(&self, candidate_id: Uuid) -> Result<Vec<RawIngestRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM raw_ingest_record
             WHERE candidate_id = $1
             ORDER BY received_at ASC, id ASC"
        ))
        .bind(candidate_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_record_row).collect()
    }
}
