//! Centralized default constants for candex.
//!
//! Crates and the CLI reference these instead of defining their own magic
//! numbers. Anything an operator may want to tune is also readable from the
//! environment (see [`crate::config`]).

// =============================================================================
// NORMALIZATION
// =============================================================================

/// Country calling code applied to national phone numbers.
pub const DEFAULT_COUNTRY_CODE: &str = "+44";

// =============================================================================
// EMBEDDING
// =============================================================================

/// Default embedding model name (Ollama).
pub const EMBED_MODEL: &str = "nomic-embed-text";

/// Default embedding vector dimension for nomic-embed-text.
pub const EMBED_DIMENSION: usize = 768;

/// Provider input limit in characters; longer text is truncated.
pub const EMBED_MAX_INPUT_CHARS: usize = 8000;

/// Characters per CV chunk for `cv_chunks` jobs.
pub const CV_CHUNK_CHARS: usize = 1500;

/// Chunks embedded per CV; text past the last chunk is ignored.
pub const CV_MAX_CHUNKS: usize = 32;

/// Default Ollama endpoint.
pub const OLLAMA_URL: &str = "http://127.0.0.1:11434";

/// Embedding request timeout in seconds.
pub const EMBED_TIMEOUT_SECS: u64 = 30;

// =============================================================================
// JOB QUEUE
// =============================================================================

/// Base priority before completeness bonuses and source weight.
pub const JOB_BASE_PRIORITY: i32 = 50;

/// Upper clamp for computed priorities.
pub const JOB_MAX_PRIORITY: i32 = 100;

/// Jobs claimed and processed concurrently per sub-batch.
pub const JOB_BATCH_SIZE: usize = 5;

/// Jobs processed per processor invocation.
pub const JOB_MAX_PER_INVOCATION: usize = 50;

/// Pause between sub-batches, in milliseconds.
pub const JOB_BATCH_PAUSE_MS: u64 = 500;

/// In-progress jobs older than this are considered abandoned.
pub const JOB_STALE_AFTER_SECS: u64 = 900;

/// Worker poll interval when the queue is empty.
pub const JOB_POLL_INTERVAL_MS: u64 = 5000;

// =============================================================================
// PRIORITY SCORING
// =============================================================================

pub const PRIORITY_BONUS_BIO: i32 = 10;
pub const PRIORITY_BONUS_DETAILED_HISTORY: i32 = 10;
pub const PRIORITY_BONUS_CV_TEXT: i32 = 15;
pub const PRIORITY_BONUS_EMPLOYMENT: i32 = 10;
pub const PRIORITY_BONUS_SKILLS: i32 = 5;

/// Source weights: curated data first.
pub const PRIORITY_WEIGHT_MANUAL: i32 = 20;
pub const PRIORITY_WEIGHT_CV_UPLOAD: i32 = 20;
pub const PRIORITY_WEIGHT_ATS: i32 = 10;
pub const PRIORITY_WEIGHT_SCRAPED: i32 = 0;

// =============================================================================
// INGEST
// =============================================================================

/// Requests allowed per caller per window.
pub const INGEST_RATE_LIMIT_REQUESTS: u32 = 60;

/// Rate limit window in seconds.
pub const INGEST_RATE_LIMIT_PERIOD_SECS: u64 = 60;

// =============================================================================
// REPAIR
// =============================================================================

/// Rows examined per repair sweep invocation.
pub const REPAIR_SCAN_LIMIT: i64 = 500;

// =============================================================================
// PAGINATION
// =============================================================================

/// Default page size for list operations.
pub const PAGE_LIMIT: i64 = 50;

/// Default number of similarity hits.
pub const SIMILAR_LIMIT: i64 = 10;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_priority_within_clamp() {
        assert!(JOB_BASE_PRIORITY <= JOB_MAX_PRIORITY);
    }

    #[test]
    fn test_curated_sources_outweigh_scraped() {
        assert!(PRIORITY_WEIGHT_MANUAL > PRIORITY_WEIGHT_ATS);
        assert!(PRIORITY_WEIGHT_CV_UPLOAD > PRIORITY_WEIGHT_ATS);
        assert!(PRIORITY_WEIGHT_ATS > PRIORITY_WEIGHT_SCRAPED);
    }
}
