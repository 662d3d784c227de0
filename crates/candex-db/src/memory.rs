//! In-memory store implementing every repository trait.
//!
//! Used by tests and by `candex --in-memory` dry runs. It enforces the same
//! uniqueness rules as the PostgreSQL schema (active email, external id per
//! source, one outstanding job per candidate and kind) so the pipeline sees
//! identical conflict behavior.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use candex_core::{
    new_v7, BackfillScope, CandidatePatch, CandidateRepository, CandidateSource,
    CanonicalCandidate, EmbeddingJob, EmbeddingJobRepository, EmbeddingStatus, EmbeddingVector,
    EmbeddingVectorRepository, EnqueueOutcome, Error, IngestRun, JobKind, JobStatus,
    LifecycleStatus, QueueStats, RawIngestRecord, RawIngestRepository, RawIngestStatus, Result,
    SimilarCandidate, Vector,
};

#[derive(Default)]
struct State {
    candidates: BTreeMap<Uuid, CanonicalCandidate>,
    runs: Vec<IngestRun>,
    raw: Vec<RawIngestRecord>,
    /// Insertion order doubles as the creation-order tiebreak.
    jobs: Vec<EmbeddingJob>,
    vectors: HashMap<(Uuid, JobKind), EmbeddingVector>,
}

impl State {
    /// Email held by another active candidate.
    fn email_taken(&self, email: &str, except: Uuid) -> bool {
        self.candidates.values().any(|c| {
            c.id != except && c.is_active() && c.attributes.email.as_deref() == Some(email)
        })
    }

    fn external_id_owner(&self, source: CandidateSource, external_id: &str) -> Option<Uuid> {
        self.candidates
            .values()
            .find(|c| c.external_ids.get(&source).map(String::as_str) == Some(external_id))
            .map(|c| c.id)
    }

    fn outstanding(&self, candidate_id: Uuid, kind: JobKind) -> Option<&EmbeddingJob> {
        self.jobs
            .iter()
            .find(|j| j.candidate_id == candidate_id && j.kind == kind && j.status.is_outstanding())
    }

    fn job_mut(&mut self, job_id: Uuid) -> Result<&mut EmbeddingJob> {
        self.jobs
            .iter_mut()
            .find(|j| j.id == job_id)
            .ok_or(Error::JobNotFound(job_id))
    }

    /// The job, if it is still in progress under `claim`.
    fn claimed_job_mut(&mut self, claim: &EmbeddingJob) -> Result<&mut EmbeddingJob> {
        let job = self.job_mut(claim.id)?;
        if job.status != JobStatus::InProgress || job.started_at != claim.started_at {
            return Err(Error::JobNotClaimed(claim.id));
        }
        Ok(job)
    }

    fn has_raw(&self, candidate_id: Uuid) -> bool {
        self.raw.iter().any(|r| r.candidate_id == Some(candidate_id))
    }
}

/// Process-local store for tests and dry runs.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a job as-is, bypassing enqueue deduplication.
    ///
    /// Lets tests reproduce queue drift that the enqueue path never creates.
    pub fn seed_job(&self, job: EmbeddingJob) {
        self.lock().jobs.push(job);
    }

    /// Snapshot of every job in creation order.
    pub fn all_jobs(&self) -> Vec<EmbeddingJob> {
        self.lock().jobs.clone()
    }

    /// Snapshot of every raw receipt in arrival order.
    pub fn all_raw_records(&self) -> Vec<RawIngestRecord> {
        self.lock().raw.clone()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl CandidateRepository for InMemoryStore {
    async fn get(&self, id: Uuid) -> Result<Option<CanonicalCandidate>> {
        Ok(self.lock().candidates.get(&id).cloned())
    }

    async fn find_by_external_id(
        &self,
        source: CandidateSource,
        external_id: &str,
    ) -> Result<Option<CanonicalCandidate>> {
        let state = self.lock();
        Ok(state
            .external_id_owner(source, external_id)
            .and_then(|id| state.candidates.get(&id).cloned()))
    }

    async fn find_active_by_email(&self, email: &str) -> Result<Vec<CanonicalCandidate>> {
        let mut found: Vec<_> = self
            .lock()
            .candidates
            .values()
            .filter(|c| c.is_active() && c.attributes.email.as_deref() == Some(email))
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        Ok(found)
    }

    async fn find_active_by_linkedin_url(&self, url: &str) -> Result<Vec<CanonicalCandidate>> {
        let mut found: Vec<_> = self
            .lock()
            .candidates
            .values()
            .filter(|c| c.is_active() && c.attributes.linkedin_url.as_deref() == Some(url))
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        Ok(found)
    }

    async fn insert(&self, candidate: &CanonicalCandidate) -> Result<()> {
        let mut state = self.lock();
        if state.candidates.contains_key(&candidate.id) {
            return Err(Error::Conflict(format!("candidate {} exists", candidate.id)));
        }
        if let Some(email) = &candidate.attributes.email {
            if candidate.is_active() && state.email_taken(email, candidate.id) {
                return Err(Error::Conflict(format!(
                    "candidate_email_active_key: {}",
                    email
                )));
            }
        }
        for (source, external_id) in &candidate.external_ids {
            if state.external_id_owner(*source, external_id).is_some() {
                return Err(Error::Conflict(format!(
                    "candidate_external_id_source_key: {}/{}",
                    source, external_id
                )));
            }
        }
        state.candidates.insert(candidate.id, candidate.clone());
        Ok(())
    }

    async fn apply_patch(
        &self,
        id: Uuid,
        patch: &CandidatePatch,
        now: DateTime<Utc>,
    ) -> Result<CanonicalCandidate> {
        let mut state = self.lock();
        let mut candidate = state
            .candidates
            .get(&id)
            .cloned()
            .ok_or(Error::CandidateNotFound(id))?;

        candidate.apply_patch(patch, now);

        if let Some(email) = &candidate.attributes.email {
            if candidate.is_active() && state.email_taken(email, id) {
                return Err(Error::Conflict(format!(
                    "candidate_email_active_key: {}",
                    email
                )));
            }
        }
        if let Some((source, external_id)) = &patch.external_id {
            if let Some(owner) = state.external_id_owner(*source, external_id) {
                if owner != id {
                    return Err(Error::Conflict(format!(
                        "candidate_external_id_source_key: {}/{}",
                        source, external_id
                    )));
                }
            }
        }

        state.candidates.insert(id, candidate.clone());
        Ok(candidate)
    }

    async fn set_embedding_status(&self, id: Uuid, status: EmbeddingStatus) -> Result<()> {
        let mut state = self.lock();
        let candidate = state
            .candidates
            .get_mut(&id)
            .ok_or(Error::CandidateNotFound(id))?;
        candidate.embedding_status = status;
        candidate.updated_at = Utc::now();
        Ok(())
    }

    async fn set_lifecycle(&self, id: Uuid, lifecycle: LifecycleStatus) -> Result<()> {
        let mut state = self.lock();
        let email = state
            .candidates
            .get(&id)
            .ok_or(Error::CandidateNotFound(id))?
            .attributes
            .email
            .clone();
        if lifecycle == LifecycleStatus::Active {
            if let Some(email) = email {
                if state.email_taken(&email, id) {
                    return Err(Error::Conflict(format!(
                        "candidate_email_active_key: {}",
                        email
                    )));
                }
            }
        }
        if let Some(candidate) = state.candidates.get_mut(&id) {
            candidate.lifecycle = lifecycle;
            candidate.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_active(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<CanonicalCandidate>> {
        Ok(self
            .lock()
            .candidates
            .values()
            .filter(|c| c.is_active() && after.map_or(true, |a| c.id > a))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn list_backfill_targets(
        &self,
        scope: BackfillScope,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<CanonicalCandidate>> {
        let state = self.lock();
        Ok(state
            .candidates
            .values()
            .filter(|c| c.is_active() && after.map_or(true, |a| c.id > a))
            .filter(|c| {
                scope == BackfillScope::All || !c.attributes.missing_identity_fields().is_empty()
            })
            .filter(|c| state.has_raw(c.id))
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_by_embedding_status(&self) -> Result<Vec<(EmbeddingStatus, i64)>> {
        let state = self.lock();
        Ok(EmbeddingStatus::ALL
            .iter()
            .map(|status| {
                let count = state
                    .candidates
                    .values()
                    .filter(|c| c.embedding_status == *status)
                    .count() as i64;
                (*status, count)
            })
            .filter(|(_, count)| *count > 0)
            .collect())
    }
}

#[async_trait]
impl RawIngestRepository for InMemoryStore {
    async fn start_run(
        &self,
        source: CandidateSource,
        external_run_id: &str,
        caller: Option<&str>,
    ) -> Result<IngestRun> {
        let mut state = self.lock();
        if let Some(run) = state
            .runs
            .iter()
            .find(|r| r.source == source && r.external_run_id == external_run_id)
        {
            return Ok(run.clone());
        }
        let run = IngestRun {
            id: new_v7(),
            source,
            external_run_id: external_run_id.to_string(),
            caller: caller.map(str::to_string),
            started_at: Utc::now(),
        };
        state.runs.push(run.clone());
        Ok(run)
    }

    async fn record(
        &self,
        run_id: Uuid,
        source: CandidateSource,
        payload: &JsonValue,
        content_hash: &str,
    ) -> Result<RawIngestRecord> {
        let mut state = self.lock();
        if !state.runs.iter().any(|r| r.id == run_id) {
            return Err(Error::NotFound(format!("ingest run {}", run_id)));
        }
        let record = RawIngestRecord {
            id: new_v7(),
            run_id,
            source,
            payload: payload.clone(),
            content_hash: content_hash.to_string(),
            status: RawIngestStatus::Received,
            candidate_id: None,
            error_message: None,
            received_at: Utc::now(),
            resolved_at: None,
        };
        state.raw.push(record.clone());
        Ok(record)
    }

    async fn find_resolved_by_hash(
        &self,
        source: CandidateSource,
        content_hash: &str,
    ) -> Result<Option<RawIngestRecord>> {
        Ok(self
            .lock()
            .raw
            .iter()
            .find(|r| {
                r.source == source
                    && r.content_hash == content_hash
                    && r.candidate_id.is_some()
                    && matches!(
                        r.status,
                        RawIngestStatus::Resolved | RawIngestStatus::Duplicate
                    )
            })
            .cloned())
    }

    async fn mark_resolved(
        &self,
        id: Uuid,
        candidate_id: Uuid,
        status: RawIngestStatus,
    ) -> Result<()> {
        let mut state = self.lock();
        let record = state
            .raw
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::NotFound(format!("raw ingest record {}", id)))?;
        record.status = status;
        record.candidate_id = Some(candidate_id);
        record.error_message = None;
        record.resolved_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<()> {
        let mut state = self.lock();
        let record = state
            .raw
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::NotFound(format!("raw ingest record {}", id)))?;
        record.status = RawIngestStatus::Failed;
        record.error_message = Some(error.to_string());
        record.resolved_at = Some(Utc::now());
        Ok(())
    }

    async fn list_for_candidate(&self, candidate_id: Uuid) -> Result<Vec<RawIngestRecord>> {
        Ok(self
            .lock()
            .raw
            .iter()
            .filter(|r| r.candidate_id == Some(candidate_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EmbeddingJobRepository for InMemoryStore {
    async fn enqueue(
        &self,
        candidate_id: Uuid,
        kind: JobKind,
        priority: i32,
    ) -> Result<EnqueueOutcome> {
        let mut state = self.lock();
        if !state.candidates.contains_key(&candidate_id) {
            return Err(Error::CandidateNotFound(candidate_id));
        }
        if let Some(existing) = state.outstanding(candidate_id, kind) {
            return Ok(EnqueueOutcome::AlreadyQueued(existing.id));
        }
        let job = EmbeddingJob {
            id: new_v7(),
            candidate_id,
            kind,
            status: JobStatus::Pending,
            priority,
            error_message: None,
            result: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };
        let id = job.id;
        state.jobs.push(job);
        Ok(EnqueueOutcome::Queued(id))
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<EmbeddingJob>> {
        let mut state = self.lock();
        let mut pending: Vec<usize> = state
            .jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.status == JobStatus::Pending)
            .map(|(i, _)| i)
            .collect();
        // Stable sort keeps insertion order for equal (priority, created_at).
        pending.sort_by(|&a, &b| {
            let (ja, jb) = (&state.jobs[a], &state.jobs[b]);
            jb.priority
                .cmp(&ja.priority)
                .then(ja.created_at.cmp(&jb.created_at))
        });

        let now = Utc::now();
        let mut claimed = Vec::new();
        for index in pending.into_iter().take(limit) {
            let job = &mut state.jobs[index];
            job.status = JobStatus::InProgress;
            job.started_at = Some(now);
            claimed.push(job.clone());
        }
        Ok(claimed)
    }

    async fn complete(&self, claim: &EmbeddingJob, result: Option<JsonValue>) -> Result<()> {
        let mut state = self.lock();
        let job = state.claimed_job_mut(claim)?;
        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.result = result;
        job.error_message = None;
        Ok(())
    }

    async fn fail(&self, claim: &EmbeddingJob, error: &str) -> Result<()> {
        let mut state = self.lock();
        let job = state.claimed_job_mut(claim)?;
        job.status = JobStatus::Failed;
        job.completed_at = Some(Utc::now());
        job.error_message = Some(error.to_string());
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<EmbeddingJob>> {
        Ok(self.lock().jobs.iter().find(|j| j.id == job_id).cloned())
    }

    async fn list_for_candidate(&self, candidate_id: Uuid) -> Result<Vec<EmbeddingJob>> {
        Ok(self
            .lock()
            .jobs
            .iter()
            .filter(|j| j.candidate_id == candidate_id)
            .cloned()
            .collect())
    }

    async fn has_outstanding(&self, candidate_id: Uuid, kinds: &[JobKind]) -> Result<bool> {
        Ok(self.lock().jobs.iter().any(|j| {
            j.candidate_id == candidate_id
                && j.status.is_outstanding()
                && (kinds.is_empty() || kinds.contains(&j.kind))
        }))
    }

    async fn collapse_duplicates(&self) -> Result<u64> {
        let mut state = self.lock();

        let mut keep: HashMap<(Uuid, JobKind), usize> = HashMap::new();
        for (index, job) in state.jobs.iter().enumerate() {
            if !job.status.is_outstanding() {
                continue;
            }
            let key = (job.candidate_id, job.kind);
            match keep.get(&key) {
                None => {
                    keep.insert(key, index);
                }
                Some(&kept) => {
                    let kept_job = &state.jobs[kept];
                    let better = (job.status == JobStatus::InProgress
                        && kept_job.status != JobStatus::InProgress)
                        || (job.status == kept_job.status
                            && job.created_at < kept_job.created_at);
                    if better {
                        keep.insert(key, index);
                    }
                }
            }
        }

        let before = state.jobs.len();
        let mut index = 0;
        state.jobs.retain(|job| {
            let i = index;
            index += 1;
            !(job.status == JobStatus::Pending
                && keep
                    .get(&(job.candidate_id, job.kind))
                    .is_some_and(|&kept| kept != i))
        });
        Ok((before - state.jobs.len()) as u64)
    }

    async fn reclaim_stale(&self, started_before: DateTime<Utc>) -> Result<Vec<EmbeddingJob>> {
        let mut state = self.lock();
        let mut reclaimed = Vec::new();
        for job in state.jobs.iter_mut() {
            if job.status == JobStatus::InProgress
                && job.started_at.is_some_and(|s| s < started_before)
            {
                job.status = JobStatus::Pending;
                job.started_at = None;
                reclaimed.push(job.clone());
            }
        }
        Ok(reclaimed)
    }

    async fn queue_stats(&self) -> Result<QueueStats> {
        let state = self.lock();
        let count = |status: JobStatus| {
            state.jobs.iter().filter(|j| j.status == status).count() as i64
        };
        Ok(QueueStats {
            pending: count(JobStatus::Pending),
            in_progress: count(JobStatus::InProgress),
            completed: count(JobStatus::Completed),
            failed: count(JobStatus::Failed),
            total: state.jobs.len() as i64,
        })
    }
}

#[async_trait]
impl EmbeddingVectorRepository for InMemoryStore {
    async fn upsert(&self, vector: &EmbeddingVector) -> Result<()> {
        self.lock()
            .vectors
            .insert((vector.candidate_id, vector.kind), vector.clone());
        Ok(())
    }

    async fn get(&self, candidate_id: Uuid, kind: JobKind) -> Result<Option<EmbeddingVector>> {
        Ok(self.lock().vectors.get(&(candidate_id, kind)).cloned())
    }

    async fn list_for_candidate(&self, candidate_id: Uuid) -> Result<Vec<EmbeddingVector>> {
        let mut vectors: Vec<_> = self
            .lock()
            .vectors
            .values()
            .filter(|v| v.candidate_id == candidate_id)
            .cloned()
            .collect();
        vectors.sort_by_key(|v| v.kind);
        Ok(vectors)
    }

    async fn find_similar(
        &self,
        query: &Vector,
        kind: JobKind,
        limit: i64,
    ) -> Result<Vec<SimilarCandidate>> {
        let state = self.lock();
        let query = query.as_slice();
        let mut hits: Vec<SimilarCandidate> = state
            .vectors
            .values()
            .filter(|v| v.kind == kind)
            .filter(|v| {
                state
                    .candidates
                    .get(&v.candidate_id)
                    .is_some_and(|c| c.is_active())
            })
            .map(|v| SimilarCandidate {
                candidate_id: v.candidate_id,
                kind,
                score: cosine(query, v.vector.as_slice()),
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit.max(0) as usize);
        Ok(hits)
    }
}
