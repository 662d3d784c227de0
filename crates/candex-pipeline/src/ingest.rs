//! Ingest service: raw payload in, canonical candidate out.
//!
//! Every payload is recorded before anything else happens, so a payload
//! that later fails to parse or merge can still be replayed by the merge
//! backfill. Items in a batch are independent: one bad payload yields a
//! failed item, not a failed batch. Only an unreachable store aborts.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use candex_core::{
    CandidateField, CandidatePatch, CandidateSource, CanonicalCandidate, Clock, FieldValue,
    IngestRun, PipelineConfig, RateLimiter, RawIngestStatus, Result, SystemClock,
};
use candex_db::Database;
use candex_jobs::{JobQueue, QueuedJob};

use crate::adapter::{adapt, content_hash, AdaptedRecord, RawPayload};
use crate::merge::{self, MergeAction, MergeOutcome};
use crate::resolver::{IdentityResolver, MatchRule, Resolution};

/// One ingest call: payloads from a single source and run.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub source: CandidateSource,
    /// Run identifier from the delivering system (actor run id, sync id).
    pub external_run_id: String,
    /// Caller identity for rate limiting. Falls back to the source name.
    pub caller: Option<String>,
    pub payloads: Vec<JsonValue>,
}

/// What happened to one payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestAction {
    Created,
    Updated,
    /// Identical content was already resolved; nothing merged.
    Duplicate,
    Failed,
}

/// Per-payload result.
#[derive(Debug, Clone, Serialize)]
pub struct IngestItemResult {
    pub index: usize,
    pub action: IngestAction,
    pub candidate_id: Option<Uuid>,
    pub raw_record_id: Option<Uuid>,
    /// The identifier that matched several active candidates, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ambiguous: Option<MatchRule>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<QueuedJob>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestItemResult {
    fn failed(index: usize, raw_record_id: Option<Uuid>, error: String) -> Self {
        Self {
            index,
            action: IngestAction::Failed,
            candidate_id: None,
            raw_record_id,
            ambiguous: None,
            jobs: Vec::new(),
            error: Some(error),
        }
    }
}

/// Tallies for one ingest call.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub run_id: Uuid,
    pub total: usize,
    pub created: usize,
    pub updated: usize,
    pub duplicates: usize,
    pub failed: usize,
    pub ambiguous: usize,
    pub items: Vec<IngestItemResult>,
}

impl IngestSummary {
    fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            ..Default::default()
        }
    }

    fn push(&mut self, item: IngestItemResult) {
        self.total += 1;
        match item.action {
            IngestAction::Created => self.created += 1,
            IngestAction::Updated => self.updated += 1,
            IngestAction::Duplicate => self.duplicates += 1,
            IngestAction::Failed => self.failed += 1,
        }
        if item.ambiguous.is_some() {
            self.ambiguous += 1;
        }
        self.items.push(item);
    }
}

/// Adapter, resolver, merge and enqueue wired together.
#[derive(Clone)]
pub struct IngestService {
    db: Database,
    queue: JobQueue,
    resolver: IdentityResolver,
    config: PipelineConfig,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
}

impl IngestService {
    pub fn new(
        db: Database,
        config: PipelineConfig,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            queue: JobQueue::new(db.clone()),
            resolver: IdentityResolver::new(db.candidates.clone()),
            db,
            config,
            limiter,
            clock,
        }
    }

    /// Build a service on the wall clock with a limiter sized from `config`.
    pub fn from_config(db: Database, config: PipelineConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit_requests,
            config.rate_limit_period,
            clock.clone(),
        ));
        Self::new(db, config, limiter, clock)
    }

    /// Ingest a batch of payloads for one run.
    ///
    /// Fails up front with [`candex_core::Error::RateLimited`] when the caller is over
    /// budget; otherwise every payload gets an item in the summary.
    #[instrument(
        skip(self, request),
        fields(
            subsystem = "ingest",
            component = "service",
            op = "ingest_batch",
            source = %request.source,
            run = %request.external_run_id,
            items = request.payloads.len()
        )
    )]
    pub async fn ingest_batch(&self, request: IngestRequest) -> Result<IngestSummary> {
        let caller = request
            .caller
            .as_deref()
            .unwrap_or(request.source.as_str());
        self.limiter.check(caller)?;

        let start = Instant::now();
        let run = self
            .db
            .raw_ingest
            .start_run(
                request.source,
                &request.external_run_id,
                request.caller.as_deref(),
            )
            .await?;

        let mut summary = IngestSummary::new(run.id);
        for (index, payload) in request.payloads.iter().enumerate() {
            let item = self.ingest_item(index, &run, request.source, payload).await?;
            summary.push(item);
        }

        info!(
            run_id = %run.id,
            total = summary.total,
            created = summary.created,
            updated = summary.updated,
            duplicates = summary.duplicates,
            failed = summary.failed,
            ambiguous = summary.ambiguous,
            duration_ms = start.elapsed().as_millis() as u64,
            "Ingest batch finished"
        );
        Ok(summary)
    }

    /// Ingest one payload into an existing run.
    pub async fn ingest(
        &self,
        run: &IngestRun,
        source: CandidateSource,
        payload: &JsonValue,
    ) -> Result<IngestItemResult> {
        self.ingest_item(0, run, source, payload).await
    }

    async fn ingest_item(
        &self,
        index: usize,
        run: &IngestRun,
        source: CandidateSource,
        payload: &JsonValue,
    ) -> Result<IngestItemResult> {
        let hash = content_hash(payload);
        let record = self
            .db
            .raw_ingest
            .record(run.id, source, payload, &hash)
            .await?;

        if let Some(prior) = self
            .db
            .raw_ingest
            .find_resolved_by_hash(source, &hash)
            .await?
        {
            if let Some(candidate_id) = prior.candidate_id {
                self.db
                    .raw_ingest
                    .mark_resolved(record.id, candidate_id, RawIngestStatus::Duplicate)
                    .await?;
                debug!(
                    subsystem = "ingest",
                    raw_record_id = %record.id,
                    %candidate_id,
                    "Payload already ingested"
                );
                return Ok(IngestItemResult {
                    index,
                    action: IngestAction::Duplicate,
                    candidate_id: Some(candidate_id),
                    raw_record_id: Some(record.id),
                    ambiguous: None,
                    jobs: Vec::new(),
                    error: None,
                });
            }
        }

        match self.merge_record(index, record.id, source, payload).await {
            Ok(item) => Ok(item),
            Err(e) if e.is_store_unavailable() => Err(e),
            Err(e) => {
                warn!(
                    subsystem = "ingest",
                    raw_record_id = %record.id,
                    %source,
                    error = %e,
                    "Payload failed to ingest"
                );
                self.db
                    .raw_ingest
                    .mark_failed(record.id, &e.to_string())
                    .await?;
                Ok(IngestItemResult::failed(
                    index,
                    Some(record.id),
                    e.to_string(),
                ))
            }
        }
    }

    async fn merge_record(
        &self,
        index: usize,
        raw_record_id: Uuid,
        source: CandidateSource,
        payload: &JsonValue,
    ) -> Result<IngestItemResult> {
        let raw = RawPayload::parse(source, payload)?;
        let adapted = adapt(&raw, &self.config.normalizer);

        let (outcome, ambiguous) = match self.resolve_and_merge(&adapted).await {
            Err(e) if e.is_conflict() => {
                debug!(
                    subsystem = "ingest",
                    %raw_record_id,
                    error = %e,
                    "Write conflict, retrying resolve and merge"
                );
                self.resolve_and_merge(&adapted).await?
            }
            other => other?,
        };

        let candidate = &outcome.candidate;
        self.db
            .raw_ingest
            .mark_resolved(raw_record_id, candidate.id, RawIngestStatus::Resolved)
            .await?;

        let jobs = if outcome.content_changed && candidate.is_active() {
            self.queue
                .enqueue_for_candidate(
                    candidate.id,
                    &candidate.attributes,
                    source,
                    self.config.base_priority,
                )
                .await?
        } else {
            Vec::new()
        };

        let action = match outcome.action {
            MergeAction::Created => IngestAction::Created,
            MergeAction::Updated => IngestAction::Updated,
        };
        info!(
            subsystem = "ingest",
            candidate_id = %candidate.id,
            %raw_record_id,
            %source,
            action = ?action,
            changed = outcome.changed_fields.len(),
            queued = jobs.iter().filter(|j| j.outcome.is_new()).count(),
            "Payload ingested"
        );

        Ok(IngestItemResult {
            index,
            action,
            candidate_id: Some(candidate.id),
            raw_record_id: Some(raw_record_id),
            ambiguous,
            jobs,
            error: None,
        })
    }

    /// One resolve → merge → write cycle. Returns the stored outcome and the
    /// rule that was ambiguous, if any.
    async fn resolve_and_merge(
        &self,
        adapted: &AdaptedRecord,
    ) -> Result<(MergeOutcome, Option<MatchRule>)> {
        let source = adapted.source;
        let external_id = adapted.external_id.as_deref();
        let now = self.clock.now();

        match self
            .resolver
            .resolve(&adapted.attrs, source, external_id)
            .await?
        {
            Resolution::Matched { candidate, .. } => {
                let candidate = *candidate;
                let mut outcome =
                    merge::apply(Some(&candidate), &adapted.attrs, source, external_id, now);
                if email_held_elsewhere(&self.db, &outcome.patch, candidate.id).await? {
                    outcome = without_field(&candidate, outcome, CandidateField::Email, now);
                }
                outcome.candidate = self
                    .db
                    .candidates
                    .apply_patch(candidate.id, &outcome.patch, now)
                    .await?;
                Ok((outcome, None))
            }
            Resolution::NoMatch => {
                let outcome = merge::apply(None, &adapted.attrs, source, external_id, now);
                self.db.candidates.insert(&outcome.candidate).await?;
                Ok((outcome, None))
            }
            Resolution::Ambiguous { rule, .. } => {
                // Start a separate record without the contested identifier.
                let mut attrs = adapted.attrs.clone();
                match rule {
                    MatchRule::Email => attrs.email = None,
                    MatchRule::LinkedinUrl => attrs.linkedin_url = None,
                    MatchRule::ExternalId => {}
                }
                let outcome = merge::apply(None, &attrs, source, external_id, now);
                self.db.candidates.insert(&outcome.candidate).await?;
                Ok((outcome, Some(rule)))
            }
        }
    }
}

/// Whether the patch fills an email that another active candidate holds.
pub(crate) async fn email_held_elsewhere(
    db: &Database,
    patch: &CandidatePatch,
    candidate_id: Uuid,
) -> Result<bool> {
    let Some(email) = email_fill(patch) else {
        return Ok(false);
    };
    let holders = db.candidates.find_active_by_email(email).await?;
    Ok(holders.iter().any(|c| c.id != candidate_id))
}

/// The email value a patch would write, if any.
pub(crate) fn email_fill(patch: &CandidatePatch) -> Option<&str> {
    patch
        .changes
        .iter()
        .find(|c| c.field == CandidateField::Email)
        .and_then(|c| match &c.value {
            FieldValue::Text(email) => Some(email.as_str()),
            _ => None,
        })
}

/// Re-derive an outcome with every change to `field` dropped.
pub(crate) fn without_field(
    existing: &CanonicalCandidate,
    outcome: MergeOutcome,
    field: CandidateField,
    now: DateTime<Utc>,
) -> MergeOutcome {
    let mut patch = outcome.patch;
    if patch.remove_field(field) {
        debug!(
            subsystem = "ingest",
            candidate_id = %existing.id,
            %field,
            "Dropping change to identifier held by another candidate"
        );
    }
    merge::preview(existing, patch, outcome.action, now)
}
