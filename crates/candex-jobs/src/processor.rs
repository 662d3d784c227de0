//! Batch processing of claimed embedding jobs.
//!
//! One invocation claims jobs in sub-batches, embeds each job's text,
//! upserts the resulting vector and settles the job. Jobs within a
//! sub-batch run concurrently; a pause separates sub-batches.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use candex_core::config::env_or;
use candex_core::defaults;
use candex_core::{
    EmbeddingBackend, EmbeddingJob, EmbeddingStatus, EmbeddingVector, Error, JobKind, Result,
    Vector,
};
use candex_db::Database;

use crate::text::{build_input, EmbeddingInput};

/// Bounds for one processing invocation.
///
/// | Variable | Default | Description |
/// |----------|---------|-------------|
/// | `JOB_BATCH_SIZE` | `5` | Jobs claimed per sub-batch |
/// | `JOB_MAX_PER_INVOCATION` | `50` | Jobs processed per invocation |
/// | `JOB_BATCH_PAUSE_MS` | `500` | Pause between sub-batches |
/// | `EMBED_MAX_INPUT_CHARS` | `8000` | Provider input limit |
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub batch_size: usize,
    pub max_jobs: usize,
    pub pause: Duration,
    pub max_input_chars: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::JOB_BATCH_SIZE,
            max_jobs: defaults::JOB_MAX_PER_INVOCATION,
            pause: Duration::from_millis(defaults::JOB_BATCH_PAUSE_MS),
            max_input_chars: defaults::EMBED_MAX_INPUT_CHARS,
        }
    }
}

impl ProcessorConfig {
    /// Create config from environment variables (with defaults).
    pub fn from_env() -> Self {
        Self {
            batch_size: env_or("JOB_BATCH_SIZE", defaults::JOB_BATCH_SIZE).max(1),
            max_jobs: env_or("JOB_MAX_PER_INVOCATION", defaults::JOB_MAX_PER_INVOCATION),
            pause: Duration::from_millis(env_or(
                "JOB_BATCH_PAUSE_MS",
                defaults::JOB_BATCH_PAUSE_MS,
            )),
            max_input_chars: env_or("EMBED_MAX_INPUT_CHARS", defaults::EMBED_MAX_INPUT_CHARS)
                .max(1),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_pause(mut self, pause: Duration) -> Self {
        self.pause = pause;
        self
    }

    pub fn with_max_input_chars(mut self, max_input_chars: usize) -> Self {
        self.max_input_chars = max_input_chars.max(1);
        self
    }
}

/// Final state of one processed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobOutcomeStatus {
    Completed,
    /// Completed without calling the provider; stored text was unchanged.
    Skipped,
    Failed,
}

/// Per-job record in a [`ProcessReport`].
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub job_id: Uuid,
    pub candidate_id: Uuid,
    pub kind: JobKind,
    pub status: JobOutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of one processing invocation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProcessReport {
    pub claimed: usize,
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub batches: usize,
    pub outcomes: Vec<JobOutcome>,
}

impl ProcessReport {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome.status {
            JobOutcomeStatus::Completed => self.completed += 1,
            JobOutcomeStatus::Skipped => self.skipped += 1,
            JobOutcomeStatus::Failed => self.failed += 1,
        }
        self.outcomes.push(outcome);
    }
}

enum Processed {
    Embedded(JsonValue),
    Unchanged,
}

/// Claims and processes embedding jobs against a backend.
#[derive(Clone)]
pub struct BatchProcessor {
    db: Database,
    backend: Arc<dyn EmbeddingBackend>,
    config: ProcessorConfig,
}

impl BatchProcessor {
    pub fn new(db: Database, backend: Arc<dyn EmbeddingBackend>, config: ProcessorConfig) -> Self {
        Self {
            db,
            backend,
            config,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Run one bounded invocation.
    ///
    /// Job-level failures are recorded on the job and in the report, as are
    /// jobs that could not be settled (for example because the stale sweep
    /// reclaimed them meanwhile). Only a store-unavailable error aborts the
    /// invocation; jobs claimed in the aborted sub-batch stay `in_progress`
    /// for the stale-job sweep.
    pub async fn run_once(&self) -> Result<ProcessReport> {
        let start = Instant::now();
        let mut report = ProcessReport::default();

        while report.claimed < self.config.max_jobs {
            let want = self
                .config
                .batch_size
                .min(self.config.max_jobs - report.claimed);
            if report.batches > 0 && !self.config.pause.is_zero() {
                tokio::time::sleep(self.config.pause).await;
            }

            let jobs = self.db.jobs.claim_batch(want).await?;
            if jobs.is_empty() {
                break;
            }
            report.claimed += jobs.len();
            report.batches += 1;
            debug!(
                subsystem = "jobs",
                component = "processor",
                claimed = jobs.len(),
                batch = report.batches,
                "Claimed job batch"
            );

            self.mark_candidates_in_progress(&jobs).await;

            let results =
                futures::future::join_all(jobs.iter().map(|job| self.process_job(job))).await;

            let mut abort = None;
            for (job, result) in jobs.iter().zip(results) {
                match result {
                    Err(e) if e.is_store_unavailable() => {
                        error!(
                            job_id = %job.id,
                            error = %e,
                            "Store unavailable while processing job"
                        );
                        abort.get_or_insert(e);
                    }
                    other => match self.settle(job, other).await {
                        Ok(outcome) => report.record(outcome),
                        Err(e) if e.is_store_unavailable() => {
                            error!(
                                job_id = %job.id,
                                error = %e,
                                "Store unavailable while settling job"
                            );
                            abort.get_or_insert(e);
                        }
                        Err(e) => {
                            warn!(
                                job_id = %job.id,
                                candidate_id = %job.candidate_id,
                                job_kind = %job.kind,
                                error = %e,
                                "Could not settle job"
                            );
                            report.record(JobOutcome {
                                job_id: job.id,
                                candidate_id: job.candidate_id,
                                kind: job.kind,
                                status: JobOutcomeStatus::Failed,
                                error: Some(e.to_string()),
                            });
                        }
                    },
                }
            }
            if let Some(e) = abort {
                return Err(e);
            }

            if jobs.len() < want {
                break;
            }
        }

        if report.claimed > 0 {
            info!(
                subsystem = "jobs",
                component = "processor",
                op = "run_once",
                claimed = report.claimed,
                completed = report.completed,
                skipped = report.skipped,
                failed = report.failed,
                duration_ms = start.elapsed().as_millis() as u64,
                "Processing invocation finished"
            );
        }
        Ok(report)
    }

    async fn mark_candidates_in_progress(&self, jobs: &[EmbeddingJob]) {
        for job in jobs.iter().filter(|j| j.kind.completes_candidate()) {
            if let Err(e) = self
                .db
                .candidates
                .set_embedding_status(job.candidate_id, EmbeddingStatus::InProgress)
                .await
            {
                warn!(
                    candidate_id = %job.candidate_id,
                    error = %e,
                    "Failed to mark candidate in progress"
                );
            }
        }
    }

    /// Record the job's terminal state and the candidate status it implies.
    async fn settle(&self, job: &EmbeddingJob, result: Result<Processed>) -> Result<JobOutcome> {
        let mut outcome = JobOutcome {
            job_id: job.id,
            candidate_id: job.candidate_id,
            kind: job.kind,
            status: JobOutcomeStatus::Completed,
            error: None,
        };

        match result {
            Ok(processed) => {
                let summary = match processed {
                    Processed::Embedded(summary) => summary,
                    Processed::Unchanged => {
                        outcome.status = JobOutcomeStatus::Skipped;
                        json!({ "skipped": "unchanged" })
                    }
                };
                self.db.jobs.complete(job, Some(summary)).await?;
                if job.kind.completes_candidate() {
                    if let Err(e) = self
                        .db
                        .candidates
                        .set_embedding_status(job.candidate_id, EmbeddingStatus::Completed)
                        .await
                    {
                        if e.is_store_unavailable() {
                            return Err(e);
                        }
                        warn!(
                            candidate_id = %job.candidate_id,
                            error = %e,
                            "Could not mark candidate completed"
                        );
                    }
                }
                debug!(
                    job_id = %job.id,
                    job_kind = %job.kind,
                    status = ?outcome.status,
                    "Job completed"
                );
            }
            Err(e) => {
                let message = e.to_string();
                self.db.jobs.fail(job, &message).await?;
                if job.kind.completes_candidate() {
                    if let Err(status_err) = self
                        .db
                        .candidates
                        .set_embedding_status(job.candidate_id, EmbeddingStatus::Failed)
                        .await
                    {
                        // Candidate may be gone; the job failure is what matters.
                        debug!(
                            candidate_id = %job.candidate_id,
                            error = %status_err,
                            "Could not mark candidate failed"
                        );
                    }
                }
                warn!(
                    job_id = %job.id,
                    candidate_id = %job.candidate_id,
                    job_kind = %job.kind,
                    error = %message,
                    "Job failed"
                );
                outcome.status = JobOutcomeStatus::Failed;
                outcome.error = Some(message);
            }
        }

        Ok(outcome)
    }

    async fn process_job(&self, job: &EmbeddingJob) -> Result<Processed> {
        let candidate = self
            .db
            .candidates
            .get(job.candidate_id)
            .await?
            .ok_or(Error::CandidateNotFound(job.candidate_id))?;
        let attrs = &candidate.attributes;
        let max_chars = self.config.max_input_chars;

        let input = build_input(job.kind, attrs, max_chars)?;
        // Full reindex refreshes the profile vector alongside its own.
        let profile = match job.kind {
            JobKind::FullReindex => build_input(JobKind::Profile, attrs, max_chars).ok(),
            _ => None,
        };

        let profile_unchanged = match &profile {
            Some(p) => self.is_unchanged(job.candidate_id, JobKind::Profile, p).await?,
            None => true,
        };
        if profile_unchanged && self.is_unchanged(job.candidate_id, job.kind, &input).await? {
            debug!(
                job_id = %job.id,
                job_kind = %job.kind,
                "Embedding text unchanged, skipping provider"
            );
            return Ok(Processed::Unchanged);
        }

        let mut texts = input.texts.clone();
        if let Some(p) = &profile {
            texts.extend(p.texts.iter().cloned());
        }
        let mut vectors = self.embed(&texts).await?;

        let profile_vector = match &profile {
            Some(_) => vectors.pop(),
            None => None,
        };
        let vector = match job.kind {
            JobKind::CvChunks => mean_pool(&vectors)?,
            _ => vectors
                .into_iter()
                .next()
                .ok_or_else(|| Error::Embedding("Provider returned no vectors".to_string()))?,
        };

        let dimension = vector.as_slice().len();
        self.store(job.candidate_id, job.kind, vector, &input.content_hash)
            .await?;
        if let (Some(p), Some(v)) = (&profile, profile_vector) {
            self.store(job.candidate_id, JobKind::Profile, v, &p.content_hash)
                .await?;
        }

        Ok(Processed::Embedded(json!({
            "dimension": dimension,
            "model": self.backend.model_name(),
            "texts": texts.len(),
        })))
    }

    async fn is_unchanged(
        &self,
        candidate_id: Uuid,
        kind: JobKind,
        input: &EmbeddingInput,
    ) -> Result<bool> {
        Ok(self
            .db
            .vectors
            .get(candidate_id, kind)
            .await?
            .is_some_and(|existing| existing.content_hash == input.content_hash))
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vector>> {
        let vectors = self.backend.embed_texts(texts).await?;
        if vectors.len() != texts.len() {
            return Err(Error::Embedding(format!(
                "Expected {} embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        let expected = self.backend.dimension();
        if let Some(bad) = vectors.iter().find(|v| v.as_slice().len() != expected) {
            return Err(Error::Embedding(format!(
                "Dimension mismatch: got {}, expected {}",
                bad.as_slice().len(),
                expected
            )));
        }
        Ok(vectors)
    }

    async fn store(
        &self,
        candidate_id: Uuid,
        kind: JobKind,
        vector: Vector,
        content_hash: &str,
    ) -> Result<()> {
        self.db
            .vectors
            .upsert(&EmbeddingVector {
                candidate_id,
                kind,
                vector,
                content_hash: content_hash.to_string(),
                model: self.backend.model_name().to_string(),
                generated_at: Utc::now(),
            })
            .await
    }
}

/// Element-wise mean of the chunk vectors, scaled to unit length.
fn mean_pool(vectors: &[Vector]) -> Result<Vector> {
    let first = vectors
        .first()
        .ok_or_else(|| Error::Embedding("No chunk vectors to pool".to_string()))?;
    let mut sum = vec![0.0f32; first.as_slice().len()];
    for v in vectors {
        for (acc, x) in sum.iter_mut().zip(v.as_slice()) {
            *acc += x;
        }
    }
    let count = vectors.len() as f32;
    for acc in sum.iter_mut() {
        *acc /= count;
    }
    let norm = sum.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for acc in sum.iter_mut() {
            *acc /= norm;
        }
    }
    Ok(Vector::from(sum))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_pool_is_unit_length() {
        let pooled = mean_pool(&[
            Vector::from(vec![1.0, 0.0]),
            Vector::from(vec![0.0, 1.0]),
        ])
        .unwrap();
        let v = pooled.as_slice();
        assert!((v[0] - v[1]).abs() < 1e-6);
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_mean_pool_rejects_empty() {
        assert!(mean_pool(&[]).is_err());
    }

    #[test]
    fn test_config_builders_clamp() {
        let config = ProcessorConfig::default()
            .with_batch_size(0)
            .with_max_input_chars(0);
        assert_eq!(config.batch_size, 1);
        assert_eq!(config.max_input_chars, 1);
    }
}
