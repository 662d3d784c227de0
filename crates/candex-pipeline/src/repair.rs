//! Repair sweeps over already-stored data.
//!
//! Both sweeps are bounded per invocation, safe to re-run, and tally
//! per-item failures instead of stopping. Re-invoke until `updated` (for
//! the backfill) reaches zero.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use candex_core::{
    BackfillScope, CandidateField, CandidatePatch, CanonicalCandidate, Clock, EmbeddingJob,
    EmbeddingStatus, JobKind, PipelineConfig, RawIngestStatus, Result, SystemClock,
};
use candex_db::Database;
use candex_jobs::JobQueue;

use crate::adapter::{adapt, RawPayload};
use crate::ingest::{email_held_elsewhere, without_field};
use crate::merge::{self, MergeAction};

/// Options for [`RepairDriver::run_merge_backfill`].
#[derive(Debug, Clone)]
pub struct BackfillOptions {
    /// Maximum candidates examined.
    pub limit: i64,
    /// Overwrite populated fields from stored payloads, and scan every
    /// candidate with linked payloads instead of only incomplete ones.
    pub force_rewrite: bool,
    /// Resume after this candidate id.
    pub after: Option<Uuid>,
}

impl BackfillOptions {
    pub fn new(limit: i64) -> Self {
        Self {
            limit,
            force_rewrite: false,
            after: None,
        }
    }

    pub fn force_rewrite(mut self, force: bool) -> Self {
        self.force_rewrite = force;
        self
    }

    pub fn after(mut self, after: Option<Uuid>) -> Self {
        self.after = after;
        self
    }
}

/// Options for [`RepairDriver::run_queue_reconciliation`].
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    pub limit: i64,
    pub after: Option<Uuid>,
}

impl ReconcileOptions {
    pub fn new(limit: i64) -> Self {
        Self { limit, after: None }
    }

    pub fn after(mut self, after: Option<Uuid>) -> Self {
        self.after = after;
        self
    }
}

/// A single item that failed during a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepError {
    pub candidate_id: Uuid,
    pub error: String,
}

/// Tallies from one sweep invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    /// Backfill: candidates changed. Reconciliation: duplicate jobs removed.
    pub updated: u64,
    /// New jobs enqueued.
    pub queued: usize,
    pub skipped: usize,
    /// Reconciliation: candidates already covered by an outstanding job.
    pub outstanding: usize,
    pub errored: usize,
    pub errors: Vec<SweepError>,
    /// Pass as `after` to continue when the page was full.
    pub next_cursor: Option<Uuid>,
}

impl SweepReport {
    fn record_error(&mut self, candidate_id: Uuid, error: String) {
        self.errored += 1;
        self.errors.push(SweepError {
            candidate_id,
            error,
        });
    }

    fn page(&mut self, page: &[CanonicalCandidate], limit: i64) {
        if limit > 0 && page.len() as i64 >= limit {
            self.next_cursor = page.last().map(|c| c.id);
        }
    }
}

/// Merge backfill, queue reconciliation and stale-job reclamation.
#[derive(Clone)]
pub struct RepairDriver {
    db: Database,
    queue: JobQueue,
    config: PipelineConfig,
    clock: Arc<dyn Clock>,
}

impl RepairDriver {
    pub fn new(db: Database, config: PipelineConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            queue: JobQueue::new(db.clone()),
            db,
            config,
            clock,
        }
    }

    /// Build a driver on the wall clock.
    pub fn from_config(db: Database, config: PipelineConfig) -> Self {
        Self::new(db, config, Arc::new(SystemClock))
    }

    /// Re-run the adapter over each candidate's stored payloads and fill
    /// whatever is still empty (or overwrite, with `force_rewrite`).
    ///
    /// Converges: once every payload has been applied, further runs change
    /// nothing and report every scanned candidate as skipped.
    #[instrument(
        skip(self, options),
        fields(
            subsystem = "repair",
            op = "merge_backfill",
            limit = options.limit,
            force_rewrite = options.force_rewrite
        )
    )]
    pub async fn run_merge_backfill(&self, options: BackfillOptions) -> Result<SweepReport> {
        let start = Instant::now();
        let scope = if options.force_rewrite {
            BackfillScope::All
        } else {
            BackfillScope::MissingIdentity
        };
        let targets = self
            .db
            .candidates
            .list_backfill_targets(scope, options.after, options.limit)
            .await?;

        let mut report = SweepReport::default();
        report.page(&targets, options.limit);

        for candidate in &targets {
            report.scanned += 1;
            match self.backfill_one(candidate, options.force_rewrite).await {
                Ok(None) => report.skipped += 1,
                Ok(Some(queued)) => {
                    report.updated += 1;
                    report.queued += queued;
                }
                Err(e) if e.is_store_unavailable() => return Err(e),
                Err(e) => {
                    warn!(
                        candidate_id = %candidate.id,
                        error = %e,
                        "Backfill failed for candidate"
                    );
                    report.record_error(candidate.id, e.to_string());
                }
            }
        }

        info!(
            scanned = report.scanned,
            updated = report.updated,
            queued = report.queued,
            skipped = report.skipped,
            errored = report.errored,
            duration_ms = start.elapsed().as_millis() as u64,
            "Merge backfill finished"
        );
        Ok(report)
    }

    /// Returns `None` when nothing changed, else the number of new jobs.
    async fn backfill_one(
        &self,
        candidate: &CanonicalCandidate,
        force_rewrite: bool,
    ) -> Result<Option<usize>> {
        let mut records = self.db.raw_ingest.list_for_candidate(candidate.id).await?;
        records.retain(|r| {
            matches!(
                r.status,
                RawIngestStatus::Resolved | RawIngestStatus::Duplicate
            )
        });
        // Most trusted, then most recent, payload first; first change per field wins.
        records.sort_by(|a, b| {
            b.source
                .rank()
                .cmp(&a.source.rank())
                .then(b.received_at.cmp(&a.received_at))
        });

        let mut patch = CandidatePatch::default();
        let mut seen: HashSet<CandidateField> = HashSet::new();
        for record in &records {
            let raw = match RawPayload::parse(record.source, &record.payload) {
                Ok(raw) => raw,
                Err(e) => {
                    debug!(raw_record_id = %record.id, error = %e, "Skipping unreadable payload");
                    continue;
                }
            };
            let adapted = adapt(&raw, &self.config.normalizer);
            let replay =
                merge::replay_patch(candidate, &adapted.attrs, record.source, force_rewrite);
            for change in replay.changes {
                if change.field == CandidateField::Skills || seen.insert(change.field) {
                    patch.changes.push(change);
                }
            }
        }

        let now = self.clock.now();
        let mut outcome = merge::preview(candidate, patch, MergeAction::Updated, now);
        if email_held_elsewhere(&self.db, &outcome.patch, candidate.id).await? {
            outcome = without_field(candidate, outcome, CandidateField::Email, now);
        }
        if outcome.changed_fields.is_empty() {
            return Ok(None);
        }

        let stored = self
            .db
            .candidates
            .apply_patch(candidate.id, &outcome.patch, now)
            .await?;
        debug!(
            candidate_id = %candidate.id,
            changed = ?outcome.changed_fields,
            "Backfilled candidate"
        );

        if !outcome.content_changed {
            return Ok(Some(0));
        }
        let jobs = self
            .queue
            .enqueue_for_candidate(
                stored.id,
                &stored.attributes,
                stored.source,
                self.config.base_priority,
            )
            .await?;
        Ok(Some(jobs.iter().filter(|j| j.outcome.is_new()).count()))
    }

    /// Bring the job queue back in line with candidate state.
    ///
    /// First collapses duplicate outstanding jobs. Then, for each scanned
    /// active candidate: `completed` is skipped, one already covered by a
    /// pending or in-progress status-bearing job is left alone, and anything
    /// else gets the job kind its attributes call for.
    #[instrument(
        skip(self, options),
        fields(subsystem = "repair", op = "queue_reconciliation", limit = options.limit)
    )]
    pub async fn run_queue_reconciliation(
        &self,
        options: ReconcileOptions,
    ) -> Result<SweepReport> {
        let start = Instant::now();
        let mut report = SweepReport {
            updated: self.db.jobs.collapse_duplicates().await?,
            ..Default::default()
        };

        let candidates = self
            .db
            .candidates
            .list_active(options.after, options.limit)
            .await?;
        report.page(&candidates, options.limit);

        for candidate in &candidates {
            report.scanned += 1;
            if candidate.embedding_status == EmbeddingStatus::Completed {
                report.skipped += 1;
                continue;
            }

            match self.reconcile_one(candidate).await {
                Ok(None) => report.outstanding += 1,
                Ok(Some(queued)) => report.queued += queued,
                Err(e) if e.is_store_unavailable() => return Err(e),
                Err(e) => {
                    warn!(
                        candidate_id = %candidate.id,
                        error = %e,
                        "Reconciliation failed for candidate"
                    );
                    report.record_error(candidate.id, e.to_string());
                }
            }
        }

        info!(
            scanned = report.scanned,
            removed = report.updated,
            queued = report.queued,
            skipped = report.skipped,
            outstanding = report.outstanding,
            errored = report.errored,
            duration_ms = start.elapsed().as_millis() as u64,
            "Queue reconciliation finished"
        );
        Ok(report)
    }

    /// Returns `None` when an outstanding job already covers the candidate.
    async fn reconcile_one(&self, candidate: &CanonicalCandidate) -> Result<Option<usize>> {
        if self
            .db
            .jobs
            .has_outstanding(candidate.id, JobKind::STATUS_BEARING)
            .await?
        {
            return Ok(None);
        }
        let jobs = self
            .queue
            .enqueue_for_candidate(
                candidate.id,
                &candidate.attributes,
                candidate.source,
                self.config.base_priority,
            )
            .await?;
        Ok(Some(jobs.iter().filter(|j| j.outcome.is_new()).count()))
    }

    /// Reset in-progress jobs older than the configured staleness threshold
    /// back to pending.
    #[instrument(skip(self), fields(subsystem = "repair", op = "reclaim_stale"))]
    pub async fn reclaim_stale(&self) -> Result<Vec<EmbeddingJob>> {
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or(chrono::Duration::zero());
        let cutoff = self.clock.now() - stale_after;
        let reclaimed = self.db.jobs.reclaim_stale(cutoff).await?;
        if !reclaimed.is_empty() {
            warn!(
                count = reclaimed.len(),
                %cutoff,
                "Reclaimed stale in-progress jobs"
            );
        }
        Ok(reclaimed)
    }
}
