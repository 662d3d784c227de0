//! Job priority scoring and job-kind selection.
//!
//! Both functions are pure: the same attributes and source always produce
//! the same score and kind.

use candex_core::defaults::{
    JOB_MAX_PRIORITY, PRIORITY_BONUS_BIO, PRIORITY_BONUS_CV_TEXT, PRIORITY_BONUS_DETAILED_HISTORY,
    PRIORITY_BONUS_EMPLOYMENT, PRIORITY_BONUS_SKILLS, PRIORITY_WEIGHT_ATS,
    PRIORITY_WEIGHT_CV_UPLOAD, PRIORITY_WEIGHT_MANUAL, PRIORITY_WEIGHT_SCRAPED,
};
use candex_core::{CandidateAttributes, CandidateSource, JobKind};

/// Priority weight contributed by the ingesting source.
pub fn source_weight(source: CandidateSource) -> i32 {
    match source {
        CandidateSource::Manual => PRIORITY_WEIGHT_MANUAL,
        CandidateSource::CvUpload => PRIORITY_WEIGHT_CV_UPLOAD,
        CandidateSource::Ats => PRIORITY_WEIGHT_ATS,
        CandidateSource::ScrapedNetwork => PRIORITY_WEIGHT_SCRAPED,
    }
}

/// Score a job: base priority plus completeness bonuses plus source weight,
/// clamped to `[0, JOB_MAX_PRIORITY]`.
pub fn score_priority(base: i32, attrs: &CandidateAttributes, source: CandidateSource) -> i32 {
    let mut score = base.saturating_add(source_weight(source));

    let bonuses = [
        (attrs.bio.is_some(), PRIORITY_BONUS_BIO),
        (attrs.detailed_history.is_some(), PRIORITY_BONUS_DETAILED_HISTORY),
        (attrs.cv_text.is_some(), PRIORITY_BONUS_CV_TEXT),
        (!attrs.employment_history.is_empty(), PRIORITY_BONUS_EMPLOYMENT),
        (!attrs.skills.is_empty(), PRIORITY_BONUS_SKILLS),
    ];
    for (present, bonus) in bonuses {
        if present {
            score = score.saturating_add(bonus);
        }
    }

    score.clamp(0, JOB_MAX_PRIORITY)
}

/// Pick the embedding job kind for a candidate's data.
///
/// CV uploads with parsed text get chunked CV embeddings; ATS payloads with
/// enhancement data get a full reindex; everything else gets a profile job.
pub fn determine_job_kind(attrs: &CandidateAttributes, source: CandidateSource) -> JobKind {
    match source {
        CandidateSource::CvUpload if attrs.cv_text.is_some() => JobKind::CvChunks,
        CandidateSource::Ats if attrs.ats_enhanced => JobKind::FullReindex,
        _ => JobKind::Profile,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candex_core::EmploymentEntry;

    fn rich() -> CandidateAttributes {
        CandidateAttributes {
            bio: Some("Builds things".into()),
            detailed_history: Some("Ten years of platform work".into()),
            cv_text: Some("CV".into()),
            employment_history: vec![EmploymentEntry {
                title: Some("Engineer".into()),
                ..Default::default()
            }],
            skills: vec!["Rust".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_attributes_score_base_plus_weight() {
        let attrs = CandidateAttributes::default();
        assert_eq!(score_priority(50, &attrs, CandidateSource::ScrapedNetwork), 50);
        assert_eq!(score_priority(50, &attrs, CandidateSource::Ats), 60);
        assert_eq!(score_priority(50, &attrs, CandidateSource::Manual), 70);
    }

    #[test]
    fn test_bonuses_accumulate() {
        let attrs = CandidateAttributes {
            bio: Some("bio".into()),
            skills: vec!["SQL".into()],
            ..Default::default()
        };
        assert_eq!(score_priority(20, &attrs, CandidateSource::ScrapedNetwork), 35);
    }

    #[test]
    fn test_score_is_clamped() {
        assert_eq!(score_priority(90, &rich(), CandidateSource::Manual), JOB_MAX_PRIORITY);
        assert_eq!(
            score_priority(-500, &CandidateAttributes::default(), CandidateSource::Ats),
            0
        );
        assert_eq!(score_priority(i32::MAX, &rich(), CandidateSource::Manual), JOB_MAX_PRIORITY);
    }

    #[test]
    fn test_source_weight_ordering() {
        assert_eq!(
            source_weight(CandidateSource::Manual),
            source_weight(CandidateSource::CvUpload)
        );
        assert!(source_weight(CandidateSource::CvUpload) > source_weight(CandidateSource::Ats));
        assert!(
            source_weight(CandidateSource::Ats) > source_weight(CandidateSource::ScrapedNetwork)
        );
    }

    #[test]
    fn test_determine_job_kind() {
        let with_cv = CandidateAttributes {
            cv_text: Some("Jane Doe, engineer".into()),
            ..Default::default()
        };
        let enhanced = CandidateAttributes {
            ats_enhanced: true,
            ..Default::default()
        };

        assert_eq!(determine_job_kind(&with_cv, CandidateSource::CvUpload), JobKind::CvChunks);
        assert_eq!(determine_job_kind(&with_cv, CandidateSource::Manual), JobKind::Profile);
        assert_eq!(
            determine_job_kind(&CandidateAttributes::default(), CandidateSource::CvUpload),
            JobKind::Profile
        );
        assert_eq!(determine_job_kind(&enhanced, CandidateSource::Ats), JobKind::FullReindex);
        assert_eq!(
            determine_job_kind(&enhanced, CandidateSource::ScrapedNetwork),
            JobKind::Profile
        );
    }
}
