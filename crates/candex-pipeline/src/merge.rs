//! Field-level merge of an adapted record into a canonical candidate.
//!
//! Pure: nothing here touches storage. The result is a [`CandidatePatch`]
//! of conditional field changes that the store applies atomically, plus a
//! preview of the candidate after the patch.
//!
//! Policy per field group:
//! - identity fields are only ever filled when empty;
//! - professional fields are overwritten by a source of equal or higher
//!   rank, and only filled when empty by a lower-ranked source;
//! - skills are set-unioned regardless of rank.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use candex_core::{
    new_v7, CandidateAttributes, CandidateField, CandidatePatch, CandidateSource,
    CanonicalCandidate, ChangeMode, EmbeddingStatus, FieldChange, FieldValue, LifecycleStatus,
};

/// Whether the merge created a record or updated an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeAction {
    Created,
    Updated,
}

/// Result of merging one record.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// The candidate as it looks once `patch` is applied.
    pub candidate: CanonicalCandidate,
    pub action: MergeAction,
    pub patch: CandidatePatch,
    /// Fields that the patch changes on `candidate`.
    pub changed_fields: Vec<CandidateField>,
    /// An embeddable field changed, so the embedding is stale.
    pub content_changed: bool,
}

/// Merge `attrs` from `source` into `existing`, or build a new candidate.
pub fn apply(
    existing: Option<&CanonicalCandidate>,
    attrs: &CandidateAttributes,
    source: CandidateSource,
    external_id: Option<&str>,
    now: DateTime<Utc>,
) -> MergeOutcome {
    match existing {
        None => create(attrs, source, external_id, now),
        Some(existing) => update(existing, attrs, source, external_id, now),
    }
}

fn create(
    attrs: &CandidateAttributes,
    source: CandidateSource,
    external_id: Option<&str>,
    now: DateTime<Utc>,
) -> MergeOutcome {
    let mut external_ids = BTreeMap::new();
    if let Some(id) = external_id {
        external_ids.insert(source, id.to_string());
    }

    let changed_fields: Vec<CandidateField> = CandidateField::ALL
        .iter()
        .copied()
        .filter(|f| attrs.has(*f))
        .collect();
    let field_sources = changed_fields
        .iter()
        .filter(|f| !f.is_identity())
        .map(|f| (*f, source))
        .collect();

    let patch = CandidatePatch {
        changes: changed_fields
            .iter()
            .filter_map(|f| {
                attrs.field_value(*f).map(|value| FieldChange {
                    field: *f,
                    mode: ChangeMode::Fill,
                    value,
                    source,
                })
            })
            .collect(),
        external_id: external_id.map(|id| (source, id.to_string())),
    };

    let candidate = CanonicalCandidate {
        id: new_v7(),
        source,
        external_ids,
        attributes: attrs.clone(),
        field_sources,
        lifecycle: LifecycleStatus::Active,
        embedding_status: EmbeddingStatus::Pending,
        created_at: now,
        updated_at: now,
    };

    MergeOutcome {
        candidate,
        action: MergeAction::Created,
        patch,
        changed_fields,
        content_changed: true,
    }
}

fn update(
    existing: &CanonicalCandidate,
    attrs: &CandidateAttributes,
    source: CandidateSource,
    external_id: Option<&str>,
    now: DateTime<Utc>,
) -> MergeOutcome {
    let mut changes = Vec::new();

    for field in CandidateField::IDENTITY {
        if existing.attributes.has(*field) {
            continue;
        }
        if let Some(value) = attrs.field_value(*field) {
            changes.push(change(*field, ChangeMode::Fill, value, source));
        }
    }

    for field in CandidateField::PROFESSIONAL {
        let Some(value) = attrs.field_value(*field) else {
            continue;
        };
        match existing.attributes.field_value(*field) {
            None => changes.push(change(*field, ChangeMode::Fill, value, source)),
            Some(current) => {
                let outranks = source.rank() >= existing.field_source(*field).rank();
                if outranks && current != value {
                    changes.push(change(*field, ChangeMode::Overwrite, value, source));
                }
            }
        }
    }

    if !attrs.skills.is_empty() {
        changes.push(change(
            CandidateField::Skills,
            ChangeMode::Append,
            FieldValue::Skills(attrs.skills.clone()),
            source,
        ));
    }

    if attrs.ats_enhanced && !existing.attributes.ats_enhanced {
        changes.push(change(
            CandidateField::AtsEnhanced,
            ChangeMode::Fill,
            FieldValue::Flag(true),
            source,
        ));
    }

    let patch = CandidatePatch {
        changes,
        external_id: external_id
            .filter(|_| !existing.external_ids.contains_key(&source))
            .map(|id| (source, id.to_string())),
    };

    preview(existing, patch, MergeAction::Updated, now)
}

/// Patch used by the merge backfill when replaying a stored payload.
///
/// Fills every empty field. With `force_rewrite` every populated field the
/// payload carries is overwritten instead, regardless of rank. Skills are
/// always unioned.
pub fn replay_patch(
    existing: &CanonicalCandidate,
    attrs: &CandidateAttributes,
    source: CandidateSource,
    force_rewrite: bool,
) -> CandidatePatch {
    let mut changes = Vec::new();
    let fields = CandidateField::IDENTITY
        .iter()
        .chain(CandidateField::PROFESSIONAL)
        .chain(std::iter::once(&CandidateField::AtsEnhanced));

    for field in fields {
        let Some(value) = attrs.field_value(*field) else {
            continue;
        };
        let mode = if force_rewrite {
            ChangeMode::Overwrite
        } else {
            ChangeMode::Fill
        };
        if mode == ChangeMode::Fill && existing.attributes.has(*field) {
            continue;
        }
        changes.push(change(*field, mode, value, source));
    }

    if !attrs.skills.is_empty() {
        changes.push(change(
            CandidateField::Skills,
            ChangeMode::Append,
            FieldValue::Skills(attrs.skills.clone()),
            source,
        ));
    }

    CandidatePatch {
        changes,
        external_id: None,
    }
}

/// Apply `patch` to a copy of `existing` and report what it changes.
pub fn preview(
    existing: &CanonicalCandidate,
    patch: CandidatePatch,
    action: MergeAction,
    now: DateTime<Utc>,
) -> MergeOutcome {
    let mut candidate = existing.clone();
    let changed_fields = candidate.apply_patch(&patch, now);
    let content_changed = changed_fields.iter().any(CandidateField::is_embeddable);
    MergeOutcome {
        candidate,
        action,
        patch,
        changed_fields,
        content_changed,
    }
}

fn change(
    field: CandidateField,
    mode: ChangeMode,
    value: FieldValue,
    source: CandidateSource,
) -> FieldChange {
    FieldChange {
        field,
        mode,
        value,
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn existing(source: CandidateSource) -> CanonicalCandidate {
        apply(
            None,
            &CandidateAttributes {
                first_name: Some("Jane".into()),
                last_name: Some("Doe".into()),
                email: Some("jane.doe@example.com".into()),
                current_title: Some("Engineer".into()),
                skills: vec!["SQL".into()],
                ..Default::default()
            },
            source,
            Some("a-1"),
            Utc::now(),
        )
        .candidate
    }

    #[test]
    fn test_create_records_everything() {
        let outcome = apply(
            None,
            &CandidateAttributes {
                email: Some("a@b.com".into()),
                bio: Some("Bio".into()),
                ..Default::default()
            },
            CandidateSource::Ats,
            Some("42"),
            Utc::now(),
        );

        assert_eq!(outcome.action, MergeAction::Created);
        assert!(outcome.content_changed);
        let c = outcome.candidate;
        assert_eq!(c.embedding_status, EmbeddingStatus::Pending);
        assert_eq!(c.lifecycle, LifecycleStatus::Active);
        assert_eq!(c.external_ids.get(&CandidateSource::Ats).map(String::as_str), Some("42"));
        assert_eq!(c.field_source(CandidateField::Bio), CandidateSource::Ats);
        assert_eq!(outcome.changed_fields, vec![CandidateField::Email, CandidateField::Bio]);
    }

    #[test]
    fn test_identity_fields_never_overwritten() {
        let current = existing(CandidateSource::ScrapedNetwork);
        let outcome = apply(
            Some(&current),
            &CandidateAttributes {
                email: Some("other@example.com".into()),
                phone: Some("+15550100".into()),
                ..Default::default()
            },
            CandidateSource::Manual,
            None,
            Utc::now(),
        );

        assert_eq!(
            outcome.candidate.attributes.email.as_deref(),
            Some("jane.doe@example.com")
        );
        assert_eq!(outcome.candidate.attributes.phone.as_deref(), Some("+15550100"));
        assert_eq!(outcome.changed_fields, vec![CandidateField::Phone]);
        // Contact details are not embedded.
        assert!(!outcome.content_changed);
    }

    #[test]
    fn test_professional_overwrite_follows_rank() {
        let current = existing(CandidateSource::Ats);
        let title = |t: &str| CandidateAttributes {
            current_title: Some(t.into()),
            ..Default::default()
        };

        let lower = apply(
            Some(&current),
            &title("Intern"),
            CandidateSource::ScrapedNetwork,
            None,
            Utc::now(),
        );
        assert!(lower.patch.changes.is_empty());
        assert_eq!(
            lower.candidate.attributes.current_title.as_deref(),
            Some("Engineer")
        );

        let equal = apply(Some(&current), &title("Lead"), CandidateSource::Ats, None, Utc::now());
        assert_eq!(equal.candidate.attributes.current_title.as_deref(), Some("Lead"));

        let higher = apply(
            Some(&current),
            &title("Principal"),
            CandidateSource::Manual,
            None,
            Utc::now(),
        );
        assert_eq!(
            higher.candidate.attributes.current_title.as_deref(),
            Some("Principal")
        );
        assert_eq!(
            higher.candidate.field_source(CandidateField::CurrentTitle),
            CandidateSource::Manual
        );
        assert!(higher.content_changed);
    }

    #[test]
    fn test_lower_rank_fills_empty_professional_field() {
        let current = existing(CandidateSource::Manual);
        let outcome = apply(
            Some(&current),
            &CandidateAttributes {
                headline: Some("Data person".into()),
                ..Default::default()
            },
            CandidateSource::ScrapedNetwork,
            None,
            Utc::now(),
        );
        assert_eq!(outcome.patch.changes[0].mode, ChangeMode::Fill);
        assert_eq!(
            outcome.candidate.attributes.headline.as_deref(),
            Some("Data person")
        );
    }

    #[test]
    fn test_skills_union_any_rank() {
        let current = existing(CandidateSource::Manual);
        let outcome = apply(
            Some(&current),
            &CandidateAttributes {
                skills: vec!["sql".into(), "Rust".into()],
                ..Default::default()
            },
            CandidateSource::ScrapedNetwork,
            None,
            Utc::now(),
        );
        assert_eq!(outcome.candidate.attributes.skills, vec!["SQL", "Rust"]);
        assert!(outcome.content_changed);
    }

    #[test]
    fn test_external_id_attached_once_per_source() {
        let current = existing(CandidateSource::ScrapedNetwork);

        let outcome = apply(
            Some(&current),
            &CandidateAttributes::default(),
            CandidateSource::Ats,
            Some("99"),
            Utc::now(),
        );
        assert_eq!(outcome.patch.external_id, Some((CandidateSource::Ats, "99".to_string())));
        assert!(!outcome.content_changed);

        let same_source = apply(
            Some(&current),
            &CandidateAttributes::default(),
            CandidateSource::ScrapedNetwork,
            Some("a-2"),
            Utc::now(),
        );
        assert_eq!(same_source.patch.external_id, None);
    }

    #[test]
    fn test_identical_record_changes_nothing() {
        let current = existing(CandidateSource::Ats);
        let outcome = apply(
            Some(&current),
            &current.attributes,
            CandidateSource::Ats,
            Some("a-1"),
            Utc::now(),
        );
        assert!(outcome.changed_fields.is_empty());
        assert!(!outcome.content_changed);
    }

    #[test]
    fn test_replay_patch_fill_vs_force() {
        let current = existing(CandidateSource::Ats);
        let attrs = CandidateAttributes {
            phone: Some("+447700900123".into()),
            current_title: Some("Staff Engineer".into()),
            ..Default::default()
        };

        let fill = replay_patch(&current, &attrs, CandidateSource::Ats, false);
        let fields: Vec<_> = fill.changes.iter().map(|c| c.field).collect();
        assert_eq!(fields, vec![CandidateField::Phone]);

        let force = replay_patch(&current, &attrs, CandidateSource::Ats, true);
        assert_eq!(force.changes.len(), 2);
        assert!(force.changes.iter().all(|c| c.mode == ChangeMode::Overwrite));
    }
}
