//! Core data models for candex.
//!
//! These types are shared across all candex crates and represent
//! the core domain entities.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub use pgvector::Vector;

use crate::error::Error;
use crate::normalize::normalize_skill_key;

/// Implements `as_str`, `Display` and `FromStr` for a unit enum backed by a
/// text column.
macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            /// Every variant, in declaration order.
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            /// Database/wire representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => Err(Error::InvalidInput(format!(
                        "unknown {} value: {}",
                        stringify!($ty),
                        other
                    ))),
                }
            }
        }
    };
}

// =============================================================================
// SOURCES
// =============================================================================

/// Where a candidate record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    /// Professional-network scraping actors
    ScrapedNetwork,
    /// Third-party applicant tracking system
    Ats,
    /// Parsed CV upload
    CvUpload,
    /// Manual entry by a recruiter
    Manual,
}

text_enum!(CandidateSource {
    ScrapedNetwork => "scraped_network",
    Ats => "ats",
    CvUpload => "cv_upload",
    Manual => "manual",
});

impl CandidateSource {
    /// Trust rank used to arbitrate professional-field conflicts.
    ///
    /// Manual entry and CV uploads tie at the top.
    pub fn rank(&self) -> u8 {
        match self {
            CandidateSource::Manual | CandidateSource::CvUpload => 3,
            CandidateSource::Ats => 2,
            CandidateSource::ScrapedNetwork => 1,
        }
    }
}

// =============================================================================
// CANDIDATE TYPES
// =============================================================================

/// Whether a candidate participates in identity resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStatus {
    #[default]
    Active,
    Inactive,
}

text_enum!(LifecycleStatus {
    Active => "active",
    Inactive => "inactive",
});

/// Progress of a candidate's searchable embedding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingStatus {
    #[default]
    None,
    Pending,
    InProgress,
    Completed,
    Failed,
}

text_enum!(EmbeddingStatus {
    None => "none",
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
});

/// One position in a candidate's employment history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmploymentEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl EmploymentEntry {
    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.company.is_none() && self.description.is_none()
    }
}

/// One entry in a candidate's education history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EducationEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub degree: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_of_study: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
}

impl EducationEntry {
    pub fn is_empty(&self) -> bool {
        self.institution.is_none() && self.degree.is_none() && self.field_of_study.is_none()
    }
}

/// Normalized attributes extracted from one source payload.
///
/// Every field is optional; absence never signals an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateAttributes {
    // Identity
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub linkedin_url: Option<String>,
    // Professional
    pub current_title: Option<String>,
    pub current_company: Option<String>,
    pub headline: Option<String>,
    pub bio: Option<String>,
    /// Long-form career narrative (e.g. ATS enhancement summary).
    pub detailed_history: Option<String>,
    /// Plain text parsed out of an uploaded CV.
    pub cv_text: Option<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub employment_history: Vec<EmploymentEntry>,
    #[serde(default)]
    pub education_history: Vec<EducationEntry>,
    /// The payload carried ATS enhancement data.
    #[serde(default)]
    pub ats_enhanced: bool,
}

impl CandidateAttributes {
    /// Read a single field as a patch value. `None` when the field is empty.
    pub fn field_value(&self, field: CandidateField) -> Option<FieldValue> {
        let text = |v: &Option<String>| v.clone().map(FieldValue::Text);
        match field {
            CandidateField::FirstName => text(&self.first_name),
            CandidateField::LastName => text(&self.last_name),
            CandidateField::Email => text(&self.email),
            CandidateField::Phone => text(&self.phone),
            CandidateField::LinkedinUrl => text(&self.linkedin_url),
            CandidateField::CurrentTitle => text(&self.current_title),
            CandidateField::CurrentCompany => text(&self.current_company),
            CandidateField::Headline => text(&self.headline),
            CandidateField::Bio => text(&self.bio),
            CandidateField::DetailedHistory => text(&self.detailed_history),
            CandidateField::CvText => text(&self.cv_text),
            CandidateField::Skills => {
                (!self.skills.is_empty()).then(|| FieldValue::Skills(self.skills.clone()))
            }
            CandidateField::EmploymentHistory => (!self.employment_history.is_empty())
                .then(|| FieldValue::Employment(self.employment_history.clone())),
            CandidateField::EducationHistory => (!self.education_history.is_empty())
                .then(|| FieldValue::Education(self.education_history.clone())),
            CandidateField::AtsEnhanced => self.ats_enhanced.then_some(FieldValue::Flag(true)),
        }
    }

    /// Whether the field currently holds a value.
    pub fn has(&self, field: CandidateField) -> bool {
        self.field_value(field).is_some()
    }

    /// Write a single field. Mismatched value shapes are ignored.
    pub fn set_field(&mut self, field: CandidateField, value: FieldValue) {
        match (field, value) {
            (CandidateField::FirstName, FieldValue::Text(v)) => self.first_name = Some(v),
            (CandidateField::LastName, FieldValue::Text(v)) => self.last_name = Some(v),
            (CandidateField::Email, FieldValue::Text(v)) => self.email = Some(v),
            (CandidateField::Phone, FieldValue::Text(v)) => self.phone = Some(v),
            (CandidateField::LinkedinUrl, FieldValue::Text(v)) => self.linkedin_url = Some(v),
            (CandidateField::CurrentTitle, FieldValue::Text(v)) => self.current_title = Some(v),
            (CandidateField::CurrentCompany, FieldValue::Text(v)) => {
                self.current_company = Some(v)
            }
            (CandidateField::Headline, FieldValue::Text(v)) => self.headline = Some(v),
            (CandidateField::Bio, FieldValue::Text(v)) => self.bio = Some(v),
            (CandidateField::DetailedHistory, FieldValue::Text(v)) => {
                self.detailed_history = Some(v)
            }
            (CandidateField::CvText, FieldValue::Text(v)) => self.cv_text = Some(v),
            (CandidateField::Skills, FieldValue::Skills(v)) => self.skills = v,
            (CandidateField::EmploymentHistory, FieldValue::Employment(v)) => {
                self.employment_history = v
            }
            (CandidateField::EducationHistory, FieldValue::Education(v)) => {
                self.education_history = v
            }
            (CandidateField::AtsEnhanced, FieldValue::Flag(v)) => self.ats_enhanced = v,
            _ => {}
        }
    }

    /// Identity fields that are still empty.
    pub fn missing_identity_fields(&self) -> Vec<CandidateField> {
        CandidateField::IDENTITY
            .iter()
            .copied()
            .filter(|f| !self.has(*f))
            .collect()
    }
}

/// Addressable candidate field, grouped by merge policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateField {
    FirstName,
    LastName,
    Email,
    Phone,
    LinkedinUrl,
    CurrentTitle,
    CurrentCompany,
    Headline,
    Bio,
    DetailedHistory,
    CvText,
    Skills,
    EmploymentHistory,
    EducationHistory,
    AtsEnhanced,
}

text_enum!(CandidateField {
    FirstName => "first_name",
    LastName => "last_name",
    Email => "email",
    Phone => "phone",
    LinkedinUrl => "linkedin_url",
    CurrentTitle => "current_title",
    CurrentCompany => "current_company",
    Headline => "headline",
    Bio => "bio",
    DetailedHistory => "detailed_history",
    CvText => "cv_text",
    Skills => "skills",
    EmploymentHistory => "employment_history",
    EducationHistory => "education_history",
    AtsEnhanced => "ats_enhanced",
});

impl CandidateField {
    /// Fill-if-absent fields.
    pub const IDENTITY: &'static [CandidateField] = &[
        CandidateField::FirstName,
        CandidateField::LastName,
        CandidateField::Email,
        CandidateField::Phone,
        CandidateField::LinkedinUrl,
    ];

    /// Source-rank overwrite fields.
    pub const PROFESSIONAL: &'static [CandidateField] = &[
        CandidateField::CurrentTitle,
        CandidateField::CurrentCompany,
        CandidateField::Headline,
        CandidateField::Bio,
        CandidateField::DetailedHistory,
        CandidateField::CvText,
        CandidateField::EmploymentHistory,
        CandidateField::EducationHistory,
    ];

    pub fn is_identity(&self) -> bool {
        Self::IDENTITY.contains(self)
    }

    /// Whether a change to this field alters embedding input text.
    pub fn is_embeddable(&self) -> bool {
        !matches!(
            self,
            CandidateField::Email
                | CandidateField::Phone
                | CandidateField::LinkedinUrl
                | CandidateField::AtsEnhanced
        )
    }
}

/// Typed value carried by a field change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    Text(String),
    Skills(Vec<String>),
    Employment(Vec<EmploymentEntry>),
    Education(Vec<EducationEntry>),
    Flag(bool),
}

/// How a field change is applied by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeMode {
    /// Write only if the stored field is still empty.
    Fill,
    /// Replace whatever is stored.
    Overwrite,
    /// Set-union into a list, preserving first-seen order.
    Append,
}

/// A single field-level conditional write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: CandidateField,
    pub mode: ChangeMode,
    pub value: FieldValue,
    /// Source credited with the value (recorded as provenance).
    pub source: CandidateSource,
}

/// Field-level changes to apply to one stored candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePatch {
    pub changes: Vec<FieldChange>,
    /// External id to attach, if the candidate has none for that source yet.
    pub external_id: Option<(CandidateSource, String)>,
}

impl CandidatePatch {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.external_id.is_none()
    }

    /// Drop all changes to `field`. Returns true if anything was removed.
    pub fn remove_field(&mut self, field: CandidateField) -> bool {
        let before = self.changes.len();
        self.changes.retain(|c| c.field != field);
        before != self.changes.len()
    }
}

/// The single merged record representing one real person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalCandidate {
    pub id: Uuid,
    /// Primary source: the source that created the record.
    pub source: CandidateSource,
    /// At most one external id per source.
    pub external_ids: BTreeMap<CandidateSource, String>,
    #[serde(flatten)]
    pub attributes: CandidateAttributes,
    /// Source that last wrote each professional field.
    pub field_sources: BTreeMap<CandidateField, CandidateSource>,
    pub lifecycle: LifecycleStatus,
    pub embedding_status: EmbeddingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CanonicalCandidate {
    /// Source credited with a field; falls back to the primary source.
    pub fn field_source(&self, field: CandidateField) -> CandidateSource {
        self.field_sources.get(&field).copied().unwrap_or(self.source)
    }

    pub fn is_active(&self) -> bool {
        self.lifecycle == LifecycleStatus::Active
    }

    /// Apply a patch in place, honoring each change's mode.
    ///
    /// An `Overwrite` of a professional field from a source ranked below the
    /// field's current owner only fills. The rank is checked against the
    /// stored row, so a patch computed from an older snapshot cannot
    /// replace a value a more trusted source wrote in between.
    ///
    /// Returns the fields that actually changed. `updated_at` is stamped
    /// whether or not anything changed.
    pub fn apply_patch(&mut self, patch: &CandidatePatch, now: DateTime<Utc>) -> Vec<CandidateField> {
        let mut changed = Vec::new();

        for change in &patch.changes {
            let mode = match change.mode {
                ChangeMode::Overwrite
                    if !change.field.is_identity()
                        && change.source.rank() < self.field_source(change.field).rank() =>
                {
                    ChangeMode::Fill
                }
                mode => mode,
            };
            let applied = match mode {
                ChangeMode::Fill => {
                    if self.attributes.has(change.field) {
                        false
                    } else {
                        self.attributes.set_field(change.field, change.value.clone());
                        true
                    }
                }
                ChangeMode::Overwrite => {
                    let current = self.attributes.field_value(change.field);
                    if current.as_ref() == Some(&change.value) {
                        false
                    } else {
                        self.attributes.set_field(change.field, change.value.clone());
                        true
                    }
                }
                ChangeMode::Append => match &change.value {
                    FieldValue::Skills(incoming) => {
                        let merged = union_skills(&self.attributes.skills, incoming);
                        if merged.len() != self.attributes.skills.len() {
                            self.attributes.skills = merged;
                            true
                        } else {
                            false
                        }
                    }
                    _ => false,
                },
            };

            if applied {
                if !change.field.is_identity() {
                    self.field_sources.insert(change.field, change.source);
                }
                changed.push(change.field);
            }
        }

        if let Some((source, external_id)) = &patch.external_id {
            self.external_ids
                .entry(*source)
                .or_insert_with(|| external_id.clone());
        }

        self.updated_at = now;
        changed
    }
}

/// Set-union of skills keeping first-seen order; case-insensitive.
pub fn union_skills(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut seen: std::collections::HashSet<String> =
        existing.iter().map(|s| normalize_skill_key(s)).collect();
    let mut merged = existing.to_vec();
    for skill in incoming {
        if seen.insert(normalize_skill_key(skill)) {
            merged.push(skill.clone());
        }
    }
    merged
}

// =============================================================================
// RAW INGEST TYPES
// =============================================================================

/// Processing state of a raw payload receipt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawIngestStatus {
    #[default]
    Received,
    Resolved,
    /// Byte-identical payload already resolved earlier.
    Duplicate,
    Failed,
}

text_enum!(RawIngestStatus {
    Received => "received",
    Resolved => "resolved",
    Duplicate => "duplicate",
    Failed => "failed",
});

/// One ingestion run (an actor run, an ATS sync, a manual upload session).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRun {
    pub id: Uuid,
    pub source: CandidateSource,
    pub external_run_id: String,
    pub caller: Option<String>,
    pub started_at: DateTime<Utc>,
}

/// Immutable receipt of one payload, written before resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawIngestRecord {
    pub id: Uuid,
    pub run_id: Uuid,
    pub source: CandidateSource,
    pub payload: JsonValue,
    pub content_hash: String,
    pub status: RawIngestStatus,
    pub candidate_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub received_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

// =============================================================================
// JOB TYPES
// =============================================================================

/// Flavor of embedding work; decides which fields feed the embedding text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Names, headline, current role, bio, skills
    Profile,
    /// Employment history
    Experience,
    /// Skills only
    Skills,
    /// Chunked CV text, mean-pooled
    CvChunks,
    /// Everything, including detailed history and CV text
    FullReindex,
}

text_enum!(JobKind {
    Profile => "profile",
    Experience => "experience",
    Skills => "skills",
    CvChunks => "cv_chunks",
    FullReindex => "full_reindex",
});

impl JobKind {
    /// Whether finishing this kind marks the candidate's embedding completed.
    pub fn completes_candidate(&self) -> bool {
        matches!(self, JobKind::Profile | JobKind::FullReindex)
    }

    /// Kinds whose completion sets candidate embedding status.
    pub const STATUS_BEARING: &'static [JobKind] = &[JobKind::Profile, JobKind::FullReindex];
}

/// Status of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

text_enum!(JobStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
});

impl JobStatus {
    /// Pending or in progress.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::InProgress)
    }
}

/// A unit of embedding work for one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingJob {
    pub id: Uuid,
    pub candidate_id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub priority: i32,
    pub error_message: Option<String>,
    pub result: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome of an idempotent enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "job_id", rename_all = "snake_case")]
pub enum EnqueueOutcome {
    /// A new pending job was created.
    Queued(Uuid),
    /// Equivalent work was already outstanding; nothing was written.
    AlreadyQueued(Uuid),
}

impl EnqueueOutcome {
    pub fn job_id(&self) -> Uuid {
        match self {
            EnqueueOutcome::Queued(id) | EnqueueOutcome::AlreadyQueued(id) => *id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, EnqueueOutcome::Queued(_))
    }
}

/// Queue statistics summary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub total: i64,
}

// =============================================================================
// VECTOR TYPES
// =============================================================================

/// Stored embedding for one (candidate, kind).
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingVector {
    pub candidate_id: Uuid,
    pub kind: JobKind,
    #[serde(skip)]
    pub vector: Vector,
    /// Hash of the text the vector was generated from.
    pub content_hash: String,
    pub model: String,
    pub generated_at: DateTime<Utc>,
}

/// A similarity hit from vector search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarCandidate {
    pub candidate_id: Uuid,
    pub kind: JobKind,
    /// Cosine similarity in [-1, 1].
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> CanonicalCandidate {
        let now = Utc::now();
        CanonicalCandidate {
            id: Uuid::nil(),
            source: CandidateSource::ScrapedNetwork,
            external_ids: BTreeMap::new(),
            attributes: CandidateAttributes::default(),
            field_sources: BTreeMap::new(),
            lifecycle: LifecycleStatus::Active,
            embedding_status: EmbeddingStatus::None,
            created_at: now,
            updated_at: now,
        }
    }

    fn change(field: CandidateField, mode: ChangeMode, value: &str) -> FieldChange {
        FieldChange {
            field,
            mode,
            value: FieldValue::Text(value.to_string()),
            source: CandidateSource::Ats,
        }
    }

    #[test]
    fn test_source_rank_ordering() {
        assert_eq!(CandidateSource::Manual.rank(), CandidateSource::CvUpload.rank());
        assert!(CandidateSource::CvUpload.rank() > CandidateSource::Ats.rank());
        assert!(CandidateSource::Ats.rank() > CandidateSource::ScrapedNetwork.rank());
    }

    #[test]
    fn test_text_enum_round_trip() {
        for kind in JobKind::ALL {
            assert_eq!(kind.as_str().parse::<JobKind>().unwrap(), *kind);
        }
        assert_eq!(
            "cv_upload".parse::<CandidateSource>().unwrap(),
            CandidateSource::CvUpload
        );
        assert!("linkedin".parse::<CandidateSource>().is_err());
    }

    #[test]
    fn test_serde_matches_as_str() {
        let json = serde_json::to_string(&EmbeddingStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let json = serde_json::to_string(&CandidateSource::ScrapedNetwork).unwrap();
        assert_eq!(json, "\"scraped_network\"");
    }

    #[test]
    fn test_completes_candidate() {
        assert!(JobKind::Profile.completes_candidate());
        assert!(JobKind::FullReindex.completes_candidate());
        assert!(!JobKind::Experience.completes_candidate());
        assert!(!JobKind::Skills.completes_candidate());
        assert!(!JobKind::CvChunks.completes_candidate());
    }

    #[test]
    fn test_fill_does_not_replace_existing_value() {
        let mut c = candidate();
        c.attributes.email = Some("jane@x.com".to_string());
        let patch = CandidatePatch {
            changes: vec![change(CandidateField::Email, ChangeMode::Fill, "other@x.com")],
            external_id: None,
        };

        let changed = c.apply_patch(&patch, Utc::now());

        assert!(changed.is_empty());
        assert_eq!(c.attributes.email.as_deref(), Some("jane@x.com"));
    }

    #[test]
    fn test_overwrite_records_provenance() {
        let mut c = candidate();
        c.attributes.current_title = Some("Engineer".to_string());
        let patch = CandidatePatch {
            changes: vec![change(
                CandidateField::CurrentTitle,
                ChangeMode::Overwrite,
                "Staff Engineer",
            )],
            external_id: None,
        };

        let changed = c.apply_patch(&patch, Utc::now());

        assert_eq!(changed, vec![CandidateField::CurrentTitle]);
        assert_eq!(c.field_source(CandidateField::CurrentTitle), CandidateSource::Ats);
        assert_eq!(c.field_source(CandidateField::Bio), CandidateSource::ScrapedNetwork);
    }

    #[test]
    fn test_stale_lower_rank_overwrite_does_not_replace_manual_value() {
        let mut c = candidate();
        c.attributes.current_title = Some("Scraped Title".to_string());
        c.field_sources
            .insert(CandidateField::CurrentTitle, CandidateSource::ScrapedNetwork);

        // ATS patch computed while the scraped value was still current.
        let stale = CandidatePatch {
            changes: vec![change(CandidateField::CurrentTitle, ChangeMode::Overwrite, "ATS Title")],
            external_id: None,
        };
        let manual = CandidatePatch {
            changes: vec![FieldChange {
                source: CandidateSource::Manual,
                ..change(CandidateField::CurrentTitle, ChangeMode::Overwrite, "Manual Title")
            }],
            external_id: None,
        };

        assert_eq!(
            c.apply_patch(&manual, Utc::now()),
            vec![CandidateField::CurrentTitle]
        );
        assert!(c.apply_patch(&stale, Utc::now()).is_empty());
        assert_eq!(c.attributes.current_title.as_deref(), Some("Manual Title"));
        assert_eq!(
            c.field_source(CandidateField::CurrentTitle),
            CandidateSource::Manual
        );
    }

    #[test]
    fn test_lower_rank_overwrite_still_fills_empty_field() {
        let mut c = candidate();
        c.source = CandidateSource::Manual;
        let patch = CandidatePatch {
            changes: vec![change(CandidateField::Headline, ChangeMode::Overwrite, "Builder")],
            external_id: None,
        };

        assert_eq!(c.apply_patch(&patch, Utc::now()), vec![CandidateField::Headline]);
        assert_eq!(c.field_source(CandidateField::Headline), CandidateSource::Ats);
    }

    #[test]
    fn test_append_skills_preserves_order_and_dedupes() {
        let mut c = candidate();
        c.attributes.skills = vec!["Rust".to_string(), "SQL".to_string()];
        let patch = CandidatePatch {
            changes: vec![FieldChange {
                field: CandidateField::Skills,
                mode: ChangeMode::Append,
                value: FieldValue::Skills(vec![
                    "sql".to_string(),
                    "Go".to_string(),
                    "Rust".to_string(),
                ]),
                source: CandidateSource::Manual,
            }],
            external_id: None,
        };

        c.apply_patch(&patch, Utc::now());

        assert_eq!(c.attributes.skills, vec!["Rust", "SQL", "Go"]);
    }

    #[test]
    fn test_external_id_attached_once_per_source() {
        let mut c = candidate();
        c.external_ids
            .insert(CandidateSource::Ats, "ats-1".to_string());
        let patch = CandidatePatch {
            changes: vec![],
            external_id: Some((CandidateSource::Ats, "ats-2".to_string())),
        };

        c.apply_patch(&patch, Utc::now());

        assert_eq!(c.external_ids[&CandidateSource::Ats], "ats-1");
    }

    #[test]
    fn test_missing_identity_fields() {
        let attrs = CandidateAttributes {
            first_name: Some("Jane".to_string()),
            email: Some("jane@x.com".to_string()),
            ..Default::default()
        };
        assert_eq!(
            attrs.missing_identity_fields(),
            vec![
                CandidateField::LastName,
                CandidateField::Phone,
                CandidateField::LinkedinUrl
            ]
        );
    }

    #[test]
    fn test_candidate_serializes_flat() {
        let mut c = candidate();
        c.attributes.first_name = Some("Jane".to_string());
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["first_name"], "Jane");
        assert_eq!(json["embedding_status"], "none");
    }
}
