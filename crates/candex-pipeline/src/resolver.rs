//! Identity resolution: which canonical candidate does a record belong to.
//!
//! Cascade, first hit wins: (source, external id), then normalized email,
//! then normalized professional-network URL. Phone numbers are never used.
//! More than one active hit on email or URL is ambiguous and never merged.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use candex_core::{
    CandidateAttributes, CandidateRepository, CandidateSource, CanonicalCandidate, Result,
};

/// Identifier that produced a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchRule {
    ExternalId,
    Email,
    LinkedinUrl,
}

impl MatchRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchRule::ExternalId => "external_id",
            MatchRule::Email => "email",
            MatchRule::LinkedinUrl => "linkedin_url",
        }
    }
}

impl std::fmt::Display for MatchRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of resolving one adapted record.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Matched {
        candidate: Box<CanonicalCandidate>,
        rule: MatchRule,
    },
    NoMatch,
    /// Several active candidates share the identifier. Treated as no match.
    Ambiguous {
        rule: MatchRule,
        candidate_ids: Vec<Uuid>,
    },
}

impl Resolution {
    pub fn candidate(&self) -> Option<&CanonicalCandidate> {
        match self {
            Resolution::Matched { candidate, .. } => Some(candidate.as_ref()),
            _ => None,
        }
    }

    pub fn is_ambiguous(&self) -> bool {
        matches!(self, Resolution::Ambiguous { .. })
    }
}

/// Looks up existing candidates for incoming records.
#[derive(Clone)]
pub struct IdentityResolver {
    candidates: Arc<dyn CandidateRepository>,
}

impl IdentityResolver {
    pub fn new(candidates: Arc<dyn CandidateRepository>) -> Self {
        Self { candidates }
    }

    /// Resolve a record to at most one canonical candidate.
    ///
    /// An external-id hit is returned even when that candidate is inactive:
    /// the id is owned by the record regardless of lifecycle.
    pub async fn resolve(
        &self,
        attrs: &CandidateAttributes,
        source: CandidateSource,
        external_id: Option<&str>,
    ) -> Result<Resolution> {
        if let Some(external_id) = external_id {
            if let Some(candidate) = self
                .candidates
                .find_by_external_id(source, external_id)
                .await?
            {
                debug!(
                    subsystem = "ingest",
                    component = "resolver",
                    candidate_id = %candidate.id,
                    rule = "external_id",
                    "Resolved candidate"
                );
                return Ok(Resolution::Matched {
                    candidate: Box::new(candidate),
                    rule: MatchRule::ExternalId,
                });
            }
        }

        if let Some(email) = attrs.email.as_deref() {
            let hits = self.candidates.find_active_by_email(email).await?;
            if let Some(resolution) = Self::pick(hits, MatchRule::Email, source) {
                return Ok(resolution);
            }
        }

        if let Some(url) = attrs.linkedin_url.as_deref() {
            let hits = self.candidates.find_active_by_linkedin_url(url).await?;
            if let Some(resolution) = Self::pick(hits, MatchRule::LinkedinUrl, source) {
                return Ok(resolution);
            }
        }

        Ok(Resolution::NoMatch)
    }

    fn pick(
        mut hits: Vec<CanonicalCandidate>,
        rule: MatchRule,
        source: CandidateSource,
    ) -> Option<Resolution> {
        match hits.len() {
            0 => None,
            1 => {
                let candidate = hits.remove(0);
                debug!(
                    subsystem = "ingest",
                    component = "resolver",
                    candidate_id = %candidate.id,
                    %rule,
                    "Resolved candidate"
                );
                Some(Resolution::Matched {
                    candidate: Box::new(candidate),
                    rule,
                })
            }
            n => {
                let candidate_ids: Vec<Uuid> = hits.iter().map(|c| c.id).collect();
                warn!(
                    subsystem = "ingest",
                    component = "resolver",
                    %rule,
                    %source,
                    matches = n,
                    candidate_ids = ?candidate_ids,
                    "Ambiguous identity, refusing to merge"
                );
                Some(Resolution::Ambiguous {
                    rule,
                    candidate_ids,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candex_core::LifecycleStatus;
    use candex_db::test_fixtures::CandidateBuilder;
    use candex_db::Database;

    fn attrs(email: Option<&str>, url: Option<&str>) -> CandidateAttributes {
        CandidateAttributes {
            email: email.map(str::to_string),
            linkedin_url: url.map(str::to_string),
            phone: Some("+447700900123".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_external_id_wins_over_email() {
        let db = Database::in_memory();
        let by_id = CandidateBuilder::new(CandidateSource::Ats)
            .external_id("99")
            .email("one@x.com")
            .build();
        let by_email = CandidateBuilder::new(CandidateSource::Manual)
            .email("two@x.com")
            .build();
        db.candidates.insert(&by_id).await.unwrap();
        db.candidates.insert(&by_email).await.unwrap();

        let resolver = IdentityResolver::new(db.candidates.clone());
        let resolution = resolver
            .resolve(&attrs(Some("two@x.com"), None), CandidateSource::Ats, Some("99"))
            .await
            .unwrap();

        assert_eq!(resolution.candidate().map(|c| c.id), Some(by_id.id));
        assert!(matches!(
            resolution,
            Resolution::Matched {
                rule: MatchRule::ExternalId,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_email_then_url_cascade() {
        let db = Database::in_memory();
        let c = CandidateBuilder::new(CandidateSource::ScrapedNetwork)
            .linkedin_url("https://www.linkedin.com/in/jane")
            .build();
        db.candidates.insert(&c).await.unwrap();

        let resolver = IdentityResolver::new(db.candidates.clone());
        let resolution = resolver
            .resolve(
                &attrs(Some("nobody@x.com"), Some("https://www.linkedin.com/in/jane")),
                CandidateSource::Manual,
                None,
            )
            .await
            .unwrap();
        assert!(matches!(
            resolution,
            Resolution::Matched {
                rule: MatchRule::LinkedinUrl,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_phone_alone_never_matches() {
        let db = Database::in_memory();
        let mut c = CandidateBuilder::new(CandidateSource::Manual).build();
        c.attributes.phone = Some("+447700900123".into());
        db.candidates.insert(&c).await.unwrap();

        let resolver = IdentityResolver::new(db.candidates.clone());
        let resolution = resolver
            .resolve(&attrs(None, None), CandidateSource::Ats, None)
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::NoMatch);
    }

    #[tokio::test]
    async fn test_shared_url_is_ambiguous() {
        let db = Database::in_memory();
        let url = "https://www.linkedin.com/in/shared";
        let a = CandidateBuilder::new(CandidateSource::Manual)
            .linkedin_url(url)
            .build();
        let b = CandidateBuilder::new(CandidateSource::Ats)
            .linkedin_url(url)
            .build();
        db.candidates.insert(&a).await.unwrap();
        db.candidates.insert(&b).await.unwrap();

        let resolver = IdentityResolver::new(db.candidates.clone());
        let resolution = resolver
            .resolve(&attrs(None, Some(url)), CandidateSource::Manual, None)
            .await
            .unwrap();

        match resolution {
            Resolution::Ambiguous {
                rule,
                candidate_ids,
            } => {
                assert_eq!(rule, MatchRule::LinkedinUrl);
                assert_eq!(candidate_ids.len(), 2);
            }
            other => panic!("expected ambiguous, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_inactive_candidates_do_not_match_by_email() {
        let db = Database::in_memory();
        let c = CandidateBuilder::new(CandidateSource::Manual)
            .email("gone@x.com")
            .build();
        db.candidates.insert(&c).await.unwrap();
        db.candidates
            .set_lifecycle(c.id, LifecycleStatus::Inactive)
            .await
            .unwrap();

        let resolver = IdentityResolver::new(db.candidates.clone());
        let resolution = resolver
            .resolve(&attrs(Some("gone@x.com"), None), CandidateSource::Manual, None)
            .await
            .unwrap();
        assert_eq!(resolution, Resolution::NoMatch);
    }
}
