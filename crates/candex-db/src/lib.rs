//! # candex-db
//!
//! Storage layer for the candex identity pipeline.
//!
//! This crate provides:
//! - Connection pool management
//! - PostgreSQL + pgvector repositories for candidates, raw ingest
//!   receipts, embedding jobs and vectors
//! - An in-memory store with the same uniqueness semantics, for tests and
//!   dry runs
//!
//! ## Example
//!
//! ```rust,ignore
//! use candex_db::{Database, PoolConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = Database::connect("postgres://localhost/candex", PoolConfig::default()).await?;
//!     let stats = db.jobs.queue_stats().await?;
//!     println!("pending jobs: {}", stats.pending);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

pub mod candidates;
pub mod jobs;
pub mod memory;
pub mod pool;
pub mod raw_ingest;
pub mod vectors;

// Test fixtures for integration tests
pub mod test_fixtures;

// Re-export core types
pub use candex_core::*;

pub use candidates::PgCandidateRepository;
pub use jobs::PgEmbeddingJobRepository;
pub use memory::InMemoryStore;
pub use pool::{create_pool, log_pool_metrics, PoolConfig};
pub use raw_ingest::PgRawIngestRepository;
pub use vectors::PgEmbeddingVectorRepository;

/// Combined storage context with all repositories.
///
/// Cheap to clone; every field is shared.
#[derive(Clone)]
pub struct Database {
    /// Canonical candidate storage.
    pub candidates: Arc<dyn CandidateRepository>,
    /// Ingest runs and raw payload receipts.
    pub raw_ingest: Arc<dyn RawIngestRepository>,
    /// Embedding job queue.
    pub jobs: Arc<dyn EmbeddingJobRepository>,
    /// Embedding vectors.
    pub vectors: Arc<dyn EmbeddingVectorRepository>,
    pool: Option<sqlx::Pool<sqlx::Postgres>>,
}

impl Database {
    /// Create a new Database instance from a connection pool.
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            candidates: Arc::new(PgCandidateRepository::new(pool.clone())),
            raw_ingest: Arc::new(PgRawIngestRepository::new(pool.clone())),
            jobs: Arc::new(PgEmbeddingJobRepository::new(pool.clone())),
            vectors: Arc::new(PgEmbeddingVectorRepository::new(pool.clone())),
            pool: Some(pool),
        }
    }

    /// Create a Database backed by a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self::from_memory(Arc::new(InMemoryStore::new()))
    }

    /// Create a Database backed by an existing in-memory store, so callers
    /// can keep a handle for seeding and inspection.
    pub fn from_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            candidates: store.clone(),
            raw_ingest: store.clone(),
            jobs: store.clone(),
            vectors: store,
            pool: None,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Run pending migrations. A no-op for the in-memory store.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        if let Some(pool) = &self.pool {
            sqlx::migrate!("../../migrations")
                .run(pool)
                .await
                .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
        }
        Ok(())
    }

    /// Get the underlying connection pool, if backed by PostgreSQL.
    pub fn pool(&self) -> Option<&sqlx::Pool<sqlx::Postgres>> {
        self.pool.as_ref()
    }
}
