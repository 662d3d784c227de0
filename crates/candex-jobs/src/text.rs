//! Embedding text assembly per job kind.
//!
//! Empty fields are dropped, the rest joined with newlines and truncated to
//! the provider input limit. The content hash covers the exact texts sent
//! to the provider, so an unchanged candidate hashes identically.

use candex_core::defaults::{CV_CHUNK_CHARS, CV_MAX_CHUNKS};
use candex_core::{hash_content, CandidateAttributes, Error, JobKind, Result};

/// Texts to embed for one job, plus the hash they are stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbeddingInput {
    pub texts: Vec<String>,
    pub content_hash: String,
}

/// Build the provider input for `kind`.
///
/// Fails with [`Error::Job`] when the candidate has nothing to embed for
/// that kind.
pub fn build_input(
    kind: JobKind,
    attrs: &CandidateAttributes,
    max_chars: usize,
) -> Result<EmbeddingInput> {
    let texts = match kind {
        JobKind::CvChunks => attrs
            .cv_text
            .as_deref()
            .map(|cv| cv_chunks(cv, CV_CHUNK_CHARS.min(max_chars.max(1)), CV_MAX_CHUNKS))
            .unwrap_or_default(),
        _ => {
            let text = truncate_chars(&kind_text(kind, attrs), max_chars);
            if text.is_empty() {
                Vec::new()
            } else {
                vec![text]
            }
        }
    };

    if texts.is_empty() {
        return Err(Error::Job(format!("No embeddable text for {} job", kind)));
    }

    let content_hash = hash_content(&texts.join("\n\u{1e}\n"));
    Ok(EmbeddingInput {
        texts,
        content_hash,
    })
}

fn kind_text(kind: JobKind, attrs: &CandidateAttributes) -> String {
    match kind {
        JobKind::Profile => join_parts(profile_parts(attrs)),
        JobKind::Experience => join_parts(experience_parts(attrs)),
        JobKind::Skills => join_parts(vec![skills_line(attrs)]),
        JobKind::CvChunks => attrs.cv_text.clone().unwrap_or_default(),
        JobKind::FullReindex => {
            let mut parts = profile_parts(attrs);
            parts.push(attrs.detailed_history.clone());
            parts.extend(experience_parts(attrs));
            parts.extend(education_parts(attrs));
            parts.push(attrs.cv_text.clone());
            join_parts(parts)
        }
    }
}

fn profile_parts(attrs: &CandidateAttributes) -> Vec<Option<String>> {
    let name = join_words([attrs.first_name.as_deref(), attrs.last_name.as_deref()]);
    let role = match (&attrs.current_title, &attrs.current_company) {
        (Some(title), Some(company)) => Some(format!("{} at {}", title, company)),
        (Some(title), None) => Some(title.clone()),
        (None, Some(company)) => Some(company.clone()),
        (None, None) => None,
    };
    vec![
        name,
        attrs.headline.clone(),
        role,
        attrs.bio.clone(),
        skills_line(attrs),
    ]
}

fn experience_parts(attrs: &CandidateAttributes) -> Vec<Option<String>> {
    attrs
        .employment_history
        .iter()
        .map(|e| {
            let head = join_words([
                e.title.as_deref(),
                e.title.as_ref().and(e.company.as_ref()).map(|_| "at"),
                e.company.as_deref(),
            ]);
            let dates = match (&e.start_date, &e.end_date) {
                (Some(start), Some(end)) => Some(format!("({} - {})", start, end)),
                (Some(start), None) => Some(format!("({} - present)", start)),
                _ => None,
            };
            join_words([head.as_deref(), dates.as_deref(), e.description.as_deref()])
        })
        .collect()
}

fn education_parts(attrs: &CandidateAttributes) -> Vec<Option<String>> {
    attrs
        .education_history
        .iter()
        .map(|e| {
            join_words([
                e.degree.as_deref(),
                e.field_of_study.as_deref(),
                e.institution.as_deref(),
            ])
        })
        .collect()
}

fn skills_line(attrs: &CandidateAttributes) -> Option<String> {
    if attrs.skills.is_empty() {
        None
    } else {
        Some(format!("Skills: {}", attrs.skills.join(", ")))
    }
}

fn join_words<'a>(words: impl IntoIterator<Item = Option<&'a str>>) -> Option<String> {
    let joined = words
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|w| !w.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    (!joined.is_empty()).then_some(joined)
}

fn join_parts(parts: Vec<Option<String>>) -> String {
    parts
        .into_iter()
        .flatten()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}

/// Chunk a CV, keeping at most `max_chunks` chunks from the start.
pub fn cv_chunks(cv: &str, chunk_chars: usize, max_chunks: usize) -> Vec<String> {
    let head = truncate_chars(cv, chunk_chars.max(1).saturating_mul(max_chunks));
    let mut chunks = chunk_text(&head, chunk_chars);
    chunks.truncate(max_chunks);
    chunks
}

/// Split text into chunks of at most `chunk_chars` characters, breaking on
/// whitespace. A single word longer than a chunk is split mid-word.
pub fn chunk_text(text: &str, chunk_chars: usize) -> Vec<String> {
    let chunk_chars = chunk_chars.max(1);
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0usize;

    for word in text.split_whitespace() {
        let mut word = word.to_string();
        let mut word_len = word.chars().count();

        while word_len > chunk_chars {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
                current_len = 0;
            }
            let head = truncate_chars(&word, chunk_chars);
            word = word[head.len()..].to_string();
            word_len -= chunk_chars;
            chunks.push(head);
        }
        if word.is_empty() {
            continue;
        }

        let needed = if current.is_empty() { word_len } else { word_len + 1 };
        if current_len + needed > chunk_chars {
            chunks.push(std::mem::take(&mut current));
            current_len = 0;
        }
        if !current.is_empty() {
            current.push(' ');
            current_len += 1;
        }
        current.push_str(&word);
        current_len += word_len;
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use candex_core::{EducationEntry, EmploymentEntry};

    fn jane() -> CandidateAttributes {
        CandidateAttributes {
            first_name: Some("Jane".into()),
            last_name: Some("Doe".into()),
            email: Some("jane@x.com".into()),
            current_title: Some("Data Engineer".into()),
            current_company: Some("Acme".into()),
            bio: Some("Pipelines and warehouses.".into()),
            skills: vec!["SQL".into(), "Rust".into()],
            employment_history: vec![EmploymentEntry {
                title: Some("Analyst".into()),
                company: Some("Initech".into()),
                start_date: Some("2018".into()),
                end_date: None,
                description: None,
            }],
            education_history: vec![EducationEntry {
                institution: Some("MIT".into()),
                degree: Some("BSc".into()),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_profile_text_skips_missing_fields() {
        let input = build_input(JobKind::Profile, &jane(), 8000).unwrap();
        assert_eq!(
            input.texts,
            vec!["Jane Doe\nData Engineer at Acme\nPipelines and warehouses.\nSkills: SQL, Rust"]
        );
        assert!(input.content_hash.starts_with("sha256:"));
    }

    #[test]
    fn test_contact_fields_are_not_embedded() {
        let input = build_input(JobKind::FullReindex, &jane(), 8000).unwrap();
        assert!(!input.texts[0].contains("jane@x.com"));
        assert!(input.texts[0].contains("Analyst at Initech (2018 - present)"));
        assert!(input.texts[0].contains("BSc MIT"));
    }

    #[test]
    fn test_empty_kind_is_an_error() {
        let attrs = CandidateAttributes {
            email: Some("only@contact.com".into()),
            ..Default::default()
        };
        assert!(matches!(
            build_input(JobKind::Profile, &attrs, 8000),
            Err(Error::Job(_))
        ));
        assert!(build_input(JobKind::CvChunks, &attrs, 8000).is_err());
    }

    #[test]
    fn test_hash_tracks_content() {
        let a = build_input(JobKind::Skills, &jane(), 8000).unwrap();
        let mut changed = jane();
        changed.skills.push("Go".into());
        let b = build_input(JobKind::Skills, &changed, 8000).unwrap();
        assert_ne!(a.content_hash, b.content_hash);
        assert_eq!(a, build_input(JobKind::Skills, &jane(), 8000).unwrap());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("abc", 10), "abc");
        assert_eq!(truncate_chars("abc", 0), "");
    }

    #[test]
    fn test_chunk_text_breaks_on_whitespace() {
        let chunks = chunk_text("aaa bbb ccc ddd", 7);
        assert_eq!(chunks, vec!["aaa bbb", "ccc ddd"]);
        assert!(chunk_text("   ", 10).is_empty());
    }

    #[test]
    fn test_cv_chunk_count_is_capped() {
        let cv = "word ".repeat(10_000);
        let chunks = cv_chunks(&cv, 20, 3);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.chars().count() <= 20));

        let huge = CandidateAttributes {
            cv_text: Some("experience ".repeat(50_000)),
            ..Default::default()
        };
        let input = build_input(JobKind::CvChunks, &huge, 8000).unwrap();
        assert_eq!(input.texts.len(), CV_MAX_CHUNKS);
    }

    #[test]
    fn test_short_cv_is_not_padded() {
        assert_eq!(cv_chunks("one two", 20, 3), vec!["one two"]);
    }

    #[test]
    fn test_chunk_text_splits_long_words() {
        let chunks = chunk_text("abcdefghij xy", 4);
        assert_eq!(chunks, vec!["abcd", "efgh", "ij", "xy"]);
        assert!(chunks.iter().all(|c| c.chars().count() <= 4));
    }
}
