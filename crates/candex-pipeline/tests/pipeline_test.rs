//! End-to-end pipeline tests: ingest, resolution, repair sweeps and the
//! hand-off to the embedding processor, all against the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use uuid::Uuid;

use candex_db::test_fixtures::CandidateBuilder;
use candex_db::{Database, InMemoryStore};
use candex_inference::MockEmbeddingBackend;
use candex_jobs::{BatchProcessor, ProcessorConfig};
use candex_pipeline::{
    BackfillOptions, BackfillScope, CandidatePatch, CandidateRepository, CandidateSource,
    CanonicalCandidate, Clock, EmbeddingJob, EmbeddingStatus, Error, IngestAction,
    IngestRequest, IngestService, JobKind, JobStatus, LifecycleStatus, ManualClock, MatchRule,
    PipelineConfig, RateLimiter, RawIngestStatus, ReconcileOptions, RepairDriver, Result,
};

struct Harness {
    store: Arc<InMemoryStore>,
    db: Database,
    clock: ManualClock,
    ingest: IngestService,
    repair: RepairDriver,
}

fn harness_with(config: PipelineConfig) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let db = Database::from_memory(store.clone());
    harness_over(store, db, config)
}

fn harness_over(store: Arc<InMemoryStore>, db: Database, config: PipelineConfig) -> Harness {
    let clock = ManualClock::default();
    let shared: Arc<dyn Clock> = Arc::new(clock.clone());
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limit_requests,
        config.rate_limit_period,
        shared.clone(),
    ));
    Harness {
        ingest: IngestService::new(db.clone(), config.clone(), limiter, shared.clone()),
        repair: RepairDriver::new(db.clone(), config, shared),
        store,
        db,
        clock,
    }
}

fn harness() -> Harness {
    harness_with(PipelineConfig::default())
}

fn request(source: CandidateSource, payloads: Vec<JsonValue>) -> IngestRequest {
    IngestRequest {
        source,
        external_run_id: format!("run-{}", Uuid::new_v4()),
        caller: Some("test-suite".to_string()),
        payloads,
    }
}

fn seeded_job(candidate_id: Uuid, kind: JobKind, status: JobStatus) -> EmbeddingJob {
    EmbeddingJob {
        id: Uuid::new_v4(),
        candidate_id,
        kind,
        status,
        priority: 50,
        error_message: None,
        result: None,
        created_at: Utc::now(),
        started_at: None,
        completed_at: None,
    }
}

#[tokio::test]
async fn test_cross_source_email_resolves_to_same_candidate() {
    let h = harness();

    let first = h
        .ingest
        .ingest_batch(request(
            CandidateSource::ScrapedNetwork,
            vec![json!({
                "public_identifier": "jane-doe",
                "full_name": "Jane Doe",
                "emails": [{"value": "Jane.Doe@Example.com "}]
            })],
        ))
        .await
        .unwrap();
    assert_eq!(first.created, 1);
    let candidate_id = first.items[0].candidate_id.unwrap();

    let created = h.db.candidates.get(candidate_id).await.unwrap().unwrap();
    assert_eq!(created.attributes.email.as_deref(), Some("jane.doe@example.com"));

    let second = h
        .ingest
        .ingest_batch(request(
            CandidateSource::Ats,
            vec![json!({"id": 99, "email": "jane.doe@example.com"})],
        ))
        .await
        .unwrap();
    assert_eq!(second.items[0].action, IngestAction::Updated);
    assert_eq!(second.items[0].candidate_id, Some(candidate_id));

    let merged = h.db.candidates.get(candidate_id).await.unwrap().unwrap();
    assert_eq!(merged.attributes.email.as_deref(), Some("jane.doe@example.com"));
    assert_eq!(
        merged.external_ids.get(&CandidateSource::Ats).map(String::as_str),
        Some("99")
    );
    assert_eq!(
        merged
            .external_ids
            .get(&CandidateSource::ScrapedNetwork)
            .map(String::as_str),
        Some("jane-doe")
    );
    assert_eq!(merged.source, CandidateSource::ScrapedNetwork);
}

#[tokio::test]
async fn test_new_candidate_is_queued_for_profile() {
    let h = harness();
    let summary = h
        .ingest
        .ingest_batch(request(
            CandidateSource::Manual,
            vec![json!({"name": "Sam Lee", "email": "sam@x.com", "bio": "Backend engineer"})],
        ))
        .await
        .unwrap();

    let item = &summary.items[0];
    assert_eq!(item.jobs.len(), 1);
    assert_eq!(item.jobs[0].kind, JobKind::Profile);
    // 50 base + 20 manual weight + 10 bio bonus
    assert_eq!(item.jobs[0].priority, 80);

    let candidate = h
        .db
        .candidates
        .get(item.candidate_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(candidate.embedding_status, EmbeddingStatus::Pending);
}

#[tokio::test]
async fn test_identical_payload_is_a_duplicate() {
    let h = harness();
    let payload = json!({"id": "m-1", "email": "dup@x.com", "bio": "Same text"});

    let first = h
        .ingest
        .ingest_batch(request(CandidateSource::Manual, vec![payload.clone()]))
        .await
        .unwrap();
    let second = h
        .ingest
        .ingest_batch(request(CandidateSource::Manual, vec![payload]))
        .await
        .unwrap();

    assert_eq!(second.duplicates, 1);
    assert_eq!(second.items[0].action, IngestAction::Duplicate);
    assert_eq!(second.items[0].candidate_id, first.items[0].candidate_id);

    let statuses: Vec<RawIngestStatus> = h
        .store
        .all_raw_records()
        .iter()
        .map(|r| r.status)
        .collect();
    assert_eq!(
        statuses,
        vec![RawIngestStatus::Resolved, RawIngestStatus::Duplicate]
    );
    assert_eq!(h.store.all_jobs().len(), 1);
}

#[tokio::test]
async fn test_bad_payload_fails_alone() {
    let h = harness();
    let summary = h
        .ingest
        .ingest_batch(request(
            CandidateSource::Ats,
            vec![
                json!({"id": "1", "email": "one@x.com"}),
                json!(["not", "an", "object"]),
                json!({"id": "3", "email": "three@x.com"}),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(summary.total, 3);
    assert_eq!(summary.created, 2);
    assert_eq!(summary.failed, 1);
    let failed = &summary.items[1];
    assert_eq!(failed.index, 1);
    assert_eq!(failed.action, IngestAction::Failed);
    assert!(failed.error.is_some());

    let raw = h.store.all_raw_records();
    assert_eq!(raw.len(), 3);
    assert_eq!(raw[1].status, RawIngestStatus::Failed);
    assert!(raw[1].error_message.is_some());
}

/// Candidate storage whose next `conflicts` inserts lose a uniqueness race.
/// The first lost race can also land a rival writer's candidate first.
struct RacingInserts {
    store: Arc<InMemoryStore>,
    conflicts: AtomicUsize,
    rival: Mutex<Option<CanonicalCandidate>>,
}

impl RacingInserts {
    fn new(store: Arc<InMemoryStore>, conflicts: usize, rival: Option<CanonicalCandidate>) -> Self {
        Self {
            store,
            conflicts: AtomicUsize::new(conflicts),
            rival: Mutex::new(rival),
        }
    }
}

#[async_trait]
impl CandidateRepository for RacingInserts {
    async fn get(&self, id: Uuid) -> Result<Option<CanonicalCandidate>> {
        self.store.get(id).await
    }

    async fn find_by_external_id(
        &self,
        source: CandidateSource,
        external_id: &str,
    ) -> Result<Option<CanonicalCandidate>> {
        self.store.find_by_external_id(source, external_id).await
    }

    async fn find_active_by_email(&self, email: &str) -> Result<Vec<CanonicalCandidate>> {
        self.store.find_active_by_email(email).await
    }

    async fn find_active_by_linkedin_url(&self, url: &str) -> Result<Vec<CanonicalCandidate>> {
        self.store.find_active_by_linkedin_url(url).await
    }

    async fn insert(&self, candidate: &CanonicalCandidate) -> Result<()> {
        let lost = self
            .conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if !lost {
            return self.store.insert(candidate).await;
        }
        let rival = self.rival.lock().unwrap().take();
        if let Some(rival) = rival {
            self.store.insert(&rival).await?;
        }
        Err(Error::Conflict("candidate_email_active_key".to_string()))
    }

    async fn apply_patch(
        &self,
        id: Uuid,
        patch: &CandidatePatch,
        now: DateTime<Utc>,
    ) -> Result<CanonicalCandidate> {
        self.store.apply_patch(id, patch, now).await
    }

    async fn set_embedding_status(&self, id: Uuid, status: EmbeddingStatus) -> Result<()> {
        self.store.set_embedding_status(id, status).await
    }

    async fn set_lifecycle(&self, id: Uuid, lifecycle: LifecycleStatus) -> Result<()> {
        self.store.set_lifecycle(id, lifecycle).await
    }

    async fn list_active(&self, after: Option<Uuid>, limit: i64) -> Result<Vec<CanonicalCandidate>> {
        self.store.list_active(after, limit).await
    }

    async fn list_backfill_targets(
        &self,
        scope: BackfillScope,
        after: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<CanonicalCandidate>> {
        self.store.list_backfill_targets(scope, after, limit).await
    }

    async fn count_by_embedding_status(&self) -> Result<Vec<(EmbeddingStatus, i64)>> {
        self.store.count_by_embedding_status().await
    }
}

fn racing_harness(conflicts: usize, rival: Option<CanonicalCandidate>) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let mut db = Database::from_memory(store.clone());
    db.candidates = Arc::new(RacingInserts::new(store.clone(), conflicts, rival));
    harness_over(store, db, PipelineConfig::default())
}

#[tokio::test]
async fn test_lost_insert_race_retries_onto_winner() {
    let rival = CandidateBuilder::new(CandidateSource::Ats)
        .name("Jane", "Doe")
        .email("jane@example.com")
        .build();
    let rival_id = rival.id;
    let h = racing_harness(1, Some(rival));

    let summary = h
        .ingest
        .ingest_batch(request(
            CandidateSource::Manual,
            vec![json!({
                "full_name": "Jane Doe",
                "email": "jane@example.com",
                "current_title": "Staff Engineer"
            })],
        ))
        .await
        .unwrap();

    assert_eq!(summary.failed, 0);
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.items[0].action, IngestAction::Updated);
    assert_eq!(summary.items[0].candidate_id, Some(rival_id));

    let merged = h.db.candidates.get(rival_id).await.unwrap().unwrap();
    assert_eq!(
        merged.attributes.current_title.as_deref(),
        Some("Staff Engineer")
    );
    assert_eq!(h.store.list_active(None, 10).await.unwrap().len(), 1);
    assert_eq!(
        h.store.all_raw_records()[0].status,
        RawIngestStatus::Resolved
    );
}

#[tokio::test]
async fn test_repeated_conflict_fails_item_and_batch_continues() {
    let h = racing_harness(2, None);

    let summary = h
        .ingest
        .ingest_batch(request(
            CandidateSource::Manual,
            vec![
                json!({"full_name": "Sam Poe", "email": "sam@example.com"}),
                json!({"full_name": "Ada Roe", "email": "ada@example.com"}),
            ],
        ))
        .await
        .unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(summary.created, 1);
    let failed = &summary.items[0];
    assert_eq!(failed.action, IngestAction::Failed);
    assert!(failed.error.as_deref().unwrap().contains("Conflict"));
    assert_eq!(summary.items[1].action, IngestAction::Created);

    let raw = h.store.all_raw_records();
    assert_eq!(raw[0].status, RawIngestStatus::Failed);
    assert_eq!(raw[1].status, RawIngestStatus::Resolved);
    let active = h.store.list_active(None, 10).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].attributes.email.as_deref(), Some("ada@example.com"));
}

#[tokio::test]
async fn test_ambiguous_url_creates_separate_record() {
    let h = harness();
    let url = "https://www.linkedin.com/in/shared";
    for source in [CandidateSource::Manual, CandidateSource::Ats] {
        let c = CandidateBuilder::new(source).linkedin_url(url).build();
        h.db.candidates.insert(&c).await.unwrap();
    }

    let summary = h
        .ingest
        .ingest_batch(request(
            CandidateSource::ScrapedNetwork,
            vec![json!({"full_name": "Alex Kim", "profile_url": url})],
        ))
        .await
        .unwrap();

    assert_eq!(summary.ambiguous, 1);
    let item = &summary.items[0];
    assert_eq!(item.action, IngestAction::Created);
    assert_eq!(item.ambiguous, Some(MatchRule::LinkedinUrl));

    let created = h
        .db
        .candidates
        .get(item.candidate_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(created.attributes.linkedin_url, None);
    assert_eq!(created.attributes.first_name.as_deref(), Some("Alex"));
}

#[tokio::test]
async fn test_email_held_by_another_candidate_is_not_filled() {
    let h = harness();
    let holder = CandidateBuilder::new(CandidateSource::Manual)
        .email("taken@x.com")
        .build();
    h.db.candidates.insert(&holder).await.unwrap();

    let first = h
        .ingest
        .ingest_batch(request(
            CandidateSource::Ats,
            vec![json!({"id": "7", "first_name": "Ana"})],
        ))
        .await
        .unwrap();
    let candidate_id = first.items[0].candidate_id.unwrap();

    let second = h
        .ingest
        .ingest_batch(request(
            CandidateSource::Ats,
            vec![json!({"id": "7", "email": "taken@x.com", "bio": "Analyst"})],
        ))
        .await
        .unwrap();
    assert_eq!(second.items[0].action, IngestAction::Updated);
    assert_eq!(second.items[0].candidate_id, Some(candidate_id));

    let stored = h.db.candidates.get(candidate_id).await.unwrap().unwrap();
    assert_eq!(stored.attributes.email, None);
    assert_eq!(stored.attributes.bio.as_deref(), Some("Analyst"));
}

#[tokio::test]
async fn test_rate_limit_per_caller() {
    let h = harness_with(PipelineConfig::default().with_rate_limit(1, Duration::from_secs(60)));
    let payload = || vec![json!({"email": format!("{}@x.com", Uuid::new_v4().simple())})];

    h.ingest
        .ingest_batch(request(CandidateSource::Manual, payload()))
        .await
        .unwrap();

    let err = h
        .ingest
        .ingest_batch(request(CandidateSource::Manual, payload()))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RateLimited { .. }));

    h.clock.advance(Duration::from_secs(61));
    h.ingest
        .ingest_batch(request(CandidateSource::Manual, payload()))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_ingest_then_process_completes_candidate() {
    let h = harness();
    let summary = h
        .ingest
        .ingest_batch(request(
            CandidateSource::Manual,
            vec![json!({"name": "Priya Shah", "title": "Data Engineer", "skills": ["SQL"]})],
        ))
        .await
        .unwrap();
    let candidate_id = summary.items[0].candidate_id.unwrap();

    let backend = MockEmbeddingBackend::new().with_dimension(8);
    let processor = BatchProcessor::new(
        h.db.clone(),
        Arc::new(backend.clone()),
        ProcessorConfig::default().with_pause(Duration::ZERO),
    );
    let report = processor.run_once().await.unwrap();
    assert_eq!(report.completed, 1);

    let candidate = h.db.candidates.get(candidate_id).await.unwrap().unwrap();
    assert_eq!(candidate.embedding_status, EmbeddingStatus::Completed);
    let vector = h
        .db
        .vectors
        .get(candidate_id, JobKind::Profile)
        .await
        .unwrap();
    assert!(vector.is_some());
}

#[tokio::test]
async fn test_reconciliation_scenario() {
    let h = harness();

    let completed = CandidateBuilder::new(CandidateSource::Manual)
        .bio("Done")
        .embedding_status(EmbeddingStatus::Completed)
        .build();
    let missing_job = CandidateBuilder::new(CandidateSource::Manual)
        .bio("Never queued")
        .build();
    let duplicated = CandidateBuilder::new(CandidateSource::Manual)
        .bio("Queued twice")
        .build();
    for c in [&completed, &missing_job, &duplicated] {
        h.db.candidates.insert(c).await.unwrap();
    }
    h.store
        .seed_job(seeded_job(duplicated.id, JobKind::Profile, JobStatus::Pending));
    h.store
        .seed_job(seeded_job(duplicated.id, JobKind::Profile, JobStatus::Pending));

    let report = h
        .repair
        .run_queue_reconciliation(ReconcileOptions::new(100))
        .await
        .unwrap();

    assert_eq!(report.scanned, 3);
    assert_eq!(report.queued, 1);
    assert_eq!(report.updated, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.outstanding, 1);
    assert_eq!(report.errored, 0);

    let jobs = h.db.jobs.list_for_candidate(missing_job.id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].kind, JobKind::Profile);
    assert_eq!(h.db.jobs.list_for_candidate(duplicated.id).await.unwrap().len(), 1);

    // Second pass has nothing left to do.
    let again = h
        .repair
        .run_queue_reconciliation(ReconcileOptions::new(100))
        .await
        .unwrap();
    assert_eq!(again.queued, 0);
    assert_eq!(again.updated, 0);
    assert_eq!(again.outstanding, 2);
}

#[tokio::test]
async fn test_reconciliation_pages_with_cursor() {
    let h = harness();
    for _ in 0..3 {
        let c = CandidateBuilder::new(CandidateSource::Manual).bio("x").build();
        h.db.candidates.insert(&c).await.unwrap();
    }

    let first = h
        .repair
        .run_queue_reconciliation(ReconcileOptions::new(2))
        .await
        .unwrap();
    assert_eq!(first.scanned, 2);
    assert!(first.next_cursor.is_some());

    let rest = h
        .repair
        .run_queue_reconciliation(ReconcileOptions::new(2).after(first.next_cursor))
        .await
        .unwrap();
    assert_eq!(rest.scanned, 1);
    assert_eq!(rest.next_cursor, None);
}

/// Candidate stored without fields that its linked raw payload carries.
async fn misingested(h: &Harness, title: &str) -> Uuid {
    let candidate = CandidateBuilder::new(CandidateSource::Ats)
        .name("Jo", "Bloggs")
        .email("jo@x.com")
        .title(title)
        .build();
    h.db.candidates.insert(&candidate).await.unwrap();

    let payload = json!({
        "id": "ats-5",
        "first_name": "Jo",
        "last_name": "Bloggs",
        "email": "jo@x.com",
        "phone": "07700 900456",
        "title": "Staff Engineer"
    });
    let run = h
        .db
        .raw_ingest
        .start_run(CandidateSource::Ats, "sync-1", None)
        .await
        .unwrap();
    let record = h
        .db
        .raw_ingest
        .record(run.id, CandidateSource::Ats, &payload, "sha256:test")
        .await
        .unwrap();
    h.db.raw_ingest
        .mark_resolved(record.id, candidate.id, RawIngestStatus::Resolved)
        .await
        .unwrap();
    candidate.id
}

#[tokio::test]
async fn test_merge_backfill_converges() {
    let h = harness();
    let candidate_id = misingested(&h, "Engineer").await;

    let report = h
        .repair
        .run_merge_backfill(BackfillOptions::new(100))
        .await
        .unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.updated, 1);
    // Phone is not embedded, so nothing to re-queue.
    assert_eq!(report.queued, 0);

    let stored = h.db.candidates.get(candidate_id).await.unwrap().unwrap();
    assert_eq!(stored.attributes.phone.as_deref(), Some("+447700900456"));
    assert_eq!(stored.attributes.current_title.as_deref(), Some("Engineer"));

    // Still missing a URL, so it is scanned again but nothing changes.
    let again = h
        .repair
        .run_merge_backfill(BackfillOptions::new(100))
        .await
        .unwrap();
    assert_eq!(again.scanned, 1);
    assert_eq!(again.updated, 0);
    assert_eq!(again.skipped, 1);
}

#[tokio::test]
async fn test_force_rewrite_overwrites_populated_fields() {
    let h = harness();
    let candidate_id = misingested(&h, "Wrong Title").await;

    let report = h
        .repair
        .run_merge_backfill(BackfillOptions::new(100).force_rewrite(true))
        .await
        .unwrap();
    assert_eq!(report.updated, 1);
    assert_eq!(report.queued, 1);

    let stored = h.db.candidates.get(candidate_id).await.unwrap().unwrap();
    assert_eq!(
        stored.attributes.current_title.as_deref(),
        Some("Staff Engineer")
    );

    let again = h
        .repair
        .run_merge_backfill(BackfillOptions::new(100).force_rewrite(true))
        .await
        .unwrap();
    assert_eq!(again.updated, 0);
}

#[tokio::test]
async fn test_reclaim_stale_uses_threshold() {
    let h = harness_with(PipelineConfig::default().with_stale_after(Duration::from_secs(600)));
    let candidate = CandidateBuilder::new(CandidateSource::Manual).build();
    h.db.candidates.insert(&candidate).await.unwrap();

    let mut stuck = seeded_job(candidate.id, JobKind::Profile, JobStatus::InProgress);
    stuck.started_at = Some(h.clock.now() - chrono::Duration::minutes(30));
    let mut fresh = seeded_job(candidate.id, JobKind::Skills, JobStatus::InProgress);
    fresh.started_at = Some(h.clock.now() - chrono::Duration::minutes(1));
    h.store.seed_job(stuck.clone());
    h.store.seed_job(fresh.clone());

    let reclaimed = h.repair.reclaim_stale().await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].id, stuck.id);

    let fresh_now = h.db.jobs.get(fresh.id).await.unwrap().unwrap();
    assert_eq!(fresh_now.status, JobStatus::InProgress);
}
