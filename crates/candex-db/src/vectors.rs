//! Embedding vector repository implementation.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{Pool, Postgres, Row};
use uuid::Uuid;

use candex_core::{
    EmbeddingVector, EmbeddingVectorRepository, Error, JobKind, Result, SimilarCandidate, Vector,
};

/// PostgreSQL + pgvector implementation of EmbeddingVectorRepository.
pub struct PgEmbeddingVectorRepository {
    pool: Pool<Postgres>,
}

impl PgEmbeddingVectorRepository {
    /// Create a new PgEmbeddingVectorRepository with the given connection pool.
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    fn parse_vector_row(row: &PgRow) -> Result<EmbeddingVector> {
        let kind: String = row.get("kind");
        Ok(EmbeddingVector {
            candidate_id: row.get("candidate_id"),
            kind: kind.parse()?,
            vector: row.get("vector"),
            content_hash: row.get("content_hash"),
            model: row.get("model"),
            generated_at: row.get("generated_at"),
        })
    }
}

#[async_trait]
impl EmbeddingVectorRepository for PgEmbeddingVectorRepository {
    async fn upsert(&self, vector: &EmbeddingVector) -> Result<()> {
        sqlx::query(
            "INSERT INTO embedding_vector (candidate_id, kind, vector, content_hash, model, generated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (candidate_id, kind) DO UPDATE
             SET vector = EXCLUDED.vector,
                 content_hash = EXCLUDED.content_hash,
                 model = EXCLUDED.model,
                 generated_at = EXCLUDED.generated_at",
        )
        .bind(vector.candidate_id)
        .bind(vector.kind.as_str())
        .bind(&vector.vector)
        .bind(&vector.content_hash)
        .bind(&vector.model)
        .bind(vector.generated_at)
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get(&self, candidate_id: Uuid, kind: JobKind) -> Result<Option<EmbeddingVector>> {
        let row = sqlx::query(
            "SELECT candidate_id, kind, vector, content_hash, model, generated_at
             FROM embedding_vector WHERE candidate_id = $1 AND kind = $2",
        )
        .bind(candidate_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        row.as_ref().map(Self::parse_vector_row).transpose()
    }

    async fn list_for_candidate(&self, candidate_id: Uuid) -> Result<Vec<EmbeddingVector>> {
        let rows = sqlx::query(
            "SELECT candidate_id, kind, vector, content_hash, model, generated_at
             FROM embedding_vector WHERE candidate_id = $1 ORDER BY kind",
        )
        .bind(candidate_id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        rows.iter().map(Self::parse_vector_row).collect()
    }

    async fn find_similar(
        &self,
        query: &Vector,
        kind: JobKind,
        limit: i64,
    ) -> Result<Vec<SimilarCandidate>> {
        let rows = sqlx::query(
            "SELECT v.candidate_id, (1 - (v.vector <=> $1))::real AS score
             FROM embedding_vector v
             JOIN candidate c ON c.id = v.candidate_id
             WHERE v.kind = $2 AND c.lifecycle = 'active'
             ORDER BY v.vector <=> $1
             LIMIT $3",
        )
        .bind(query)
        .bind(kind.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| SimilarCandidate {
                candidate_id: row.get("candidate_id"),
                kind,
                score: row.get("score"),
            })
            .collect())
    }
}
