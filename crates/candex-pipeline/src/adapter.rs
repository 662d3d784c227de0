//! Source adapters: source-native JSON into normalized attributes.
//!
//! Each source has its own payload shape. Every field is optional and read
//! leniently: a missing, null or wrong-typed field adapts to an absent
//! value, and a list keeps only the elements it can read. Sources spell some
//! fields more than one way; each spelling is its own field and the first
//! usable one wins. Only a payload that is not a JSON object fails.

use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use candex_core::normalize::{
    normalize_email, normalize_phone, normalize_skills, normalize_text, normalize_url,
    split_full_name,
};
use candex_core::{
    hash_json, CandidateAttributes, CandidateSource, EducationEntry, EmploymentEntry, Error,
    NormalizerConfig, Result,
};

/// Read a field as `T`, or `T::default()` when it has the wrong shape.
fn lenient<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).unwrap_or_default())
}

/// Read a list, keeping the readable elements. A lone value counts as a
/// one-element list; null is empty.
fn lenient_list<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        JsonValue::Null => Vec::new(),
        other => serde_json::from_value(other).ok().into_iter().collect(),
    })
}

/// External ids arrive as strings from some systems and numbers from others.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ExternalId {
    Text(String),
    Number(i64),
}

impl ExternalId {
    fn normalized(&self) -> Option<String> {
        match self {
            ExternalId::Text(s) => normalize_text(s),
            ExternalId::Number(n) => Some(n.to_string()),
        }
    }
}

/// `{ "value": "..." }` wrapper used by scraped contact arrays.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ContactValue {
    #[serde(deserialize_with = "lenient")]
    pub value: Option<String>,
}

/// Skills arrive either as bare strings or `{ "name": "..." }` objects.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SkillItem {
    Name(String),
    Object {
        #[serde(default, deserialize_with = "lenient")]
        name: Option<String>,
    },
}

impl SkillItem {
    fn name(&self) -> &str {
        match self {
            SkillItem::Name(s) => s,
            SkillItem::Object { name } => name.as_deref().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PositionPayload {
    #[serde(deserialize_with = "lenient")]
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub position: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub company: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub company_name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub employer: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub start_date: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub from: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub end_date: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub to: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub description: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SchoolPayload {
    #[serde(deserialize_with = "lenient")]
    pub institution: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub school: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub school_name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub degree: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub field_of_study: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub field: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub start_date: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub from: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub end_date: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub to: Option<String>,
}

/// Professional-network scrape: contacts nested in `{value}` arrays.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ScrapedNetworkPayload {
    #[serde(deserialize_with = "lenient")]
    pub id: Option<ExternalId>,
    #[serde(deserialize_with = "lenient")]
    pub public_identifier: Option<ExternalId>,
    #[serde(deserialize_with = "lenient")]
    pub profile_id: Option<ExternalId>,
    #[serde(deserialize_with = "lenient")]
    pub first_name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub last_name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub full_name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub headline: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub about: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub summary: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub profile_url: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub url: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub linkedin_url: Option<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub emails: Vec<ContactValue>,
    #[serde(deserialize_with = "lenient_list")]
    pub phones: Vec<ContactValue>,
    #[serde(deserialize_with = "lenient")]
    pub current_title: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub job_title: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub current_company: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub company: Option<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub skills: Vec<SkillItem>,
    #[serde(deserialize_with = "lenient_list")]
    pub experiences: Vec<PositionPayload>,
    #[serde(deserialize_with = "lenient_list")]
    pub positions: Vec<PositionPayload>,
    #[serde(deserialize_with = "lenient_list")]
    pub educations: Vec<SchoolPayload>,
    #[serde(deserialize_with = "lenient_list")]
    pub education: Vec<SchoolPayload>,
}

/// ATS enhancement block; its presence marks the record as enhanced.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AtsEnhancement {
    #[serde(deserialize_with = "lenient")]
    pub summary: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub detailed_history: Option<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub skills: Vec<SkillItem>,
}

/// ATS record: flat fields.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AtsPayload {
    #[serde(deserialize_with = "lenient")]
    pub id: Option<ExternalId>,
    #[serde(deserialize_with = "lenient")]
    pub candidate_id: Option<ExternalId>,
    #[serde(deserialize_with = "lenient")]
    pub first_name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub last_name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub full_name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub email: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub phone: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub linkedin_url: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub linkedin: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub current_title: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub current_company: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub company: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub headline: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub bio: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub summary: Option<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub skills: Vec<SkillItem>,
    #[serde(deserialize_with = "lenient_list")]
    pub employment_history: Vec<PositionPayload>,
    #[serde(deserialize_with = "lenient_list")]
    pub employment: Vec<PositionPayload>,
    #[serde(deserialize_with = "lenient_list")]
    pub education_history: Vec<SchoolPayload>,
    #[serde(deserialize_with = "lenient_list")]
    pub education: Vec<SchoolPayload>,
    #[serde(deserialize_with = "lenient")]
    pub enhancement: Option<AtsEnhancement>,
}

/// Fields a CV parser extracted.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ParsedCv {
    #[serde(deserialize_with = "lenient")]
    pub first_name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub last_name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub full_name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub email: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub phone: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub linkedin: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub linkedin_url: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub current_title: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub company: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub current_company: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub summary: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub bio: Option<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub skills: Vec<SkillItem>,
    #[serde(deserialize_with = "lenient_list")]
    pub experience: Vec<PositionPayload>,
    #[serde(deserialize_with = "lenient_list")]
    pub employment_history: Vec<PositionPayload>,
    #[serde(deserialize_with = "lenient_list")]
    pub education: Vec<SchoolPayload>,
    #[serde(deserialize_with = "lenient_list")]
    pub education_history: Vec<SchoolPayload>,
}

/// CV upload: parsed fields nested under `parsed`, full text alongside.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct CvUploadPayload {
    #[serde(deserialize_with = "lenient")]
    pub upload_id: Option<ExternalId>,
    #[serde(deserialize_with = "lenient")]
    pub id: Option<ExternalId>,
    #[serde(deserialize_with = "lenient")]
    pub parsed: ParsedCv,
    #[serde(deserialize_with = "lenient")]
    pub text: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub cv_text: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub raw_text: Option<String>,
}

/// Manual entry by a recruiter: flat fields.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ManualPayload {
    #[serde(deserialize_with = "lenient")]
    pub id: Option<ExternalId>,
    #[serde(deserialize_with = "lenient")]
    pub first_name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub last_name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub full_name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub email: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub phone: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub linkedin_url: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub current_title: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub title: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub current_company: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub company: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub headline: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub bio: Option<String>,
    #[serde(deserialize_with = "lenient_list")]
    pub skills: Vec<SkillItem>,
}

/// A raw payload, tagged by the source it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", content = "payload", rename_all = "snake_case")]
pub enum RawPayload {
    ScrapedNetwork(ScrapedNetworkPayload),
    Ats(AtsPayload),
    CvUpload(CvUploadPayload),
    Manual(ManualPayload),
}

impl RawPayload {
    /// Read a source-native JSON payload.
    pub fn parse(source: CandidateSource, json: &JsonValue) -> Result<Self> {
        if !json.is_object() {
            return Err(Error::InvalidInput(format!(
                "{} payload must be a JSON object",
                source
            )));
        }
        let parsed = match source {
            CandidateSource::ScrapedNetwork => {
                ScrapedNetworkPayload::deserialize(json).map(RawPayload::ScrapedNetwork)
            }
            CandidateSource::Ats => AtsPayload::deserialize(json).map(RawPayload::Ats),
            CandidateSource::CvUpload => {
                CvUploadPayload::deserialize(json).map(RawPayload::CvUpload)
            }
            CandidateSource::Manual => ManualPayload::deserialize(json).map(RawPayload::Manual),
        };
        parsed.map_err(|e| Error::InvalidInput(format!("Unreadable {} payload: {}", source, e)))
    }

    pub fn source(&self) -> CandidateSource {
        match self {
            RawPayload::ScrapedNetwork(_) => CandidateSource::ScrapedNetwork,
            RawPayload::Ats(_) => CandidateSource::Ats,
            RawPayload::CvUpload(_) => CandidateSource::CvUpload,
            RawPayload::Manual(_) => CandidateSource::Manual,
        }
    }
}

/// Normalized output of one adapted payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdaptedRecord {
    pub source: CandidateSource,
    pub external_id: Option<String>,
    pub attrs: CandidateAttributes,
}

/// Deterministic `sha256:<hex>` over the key-sorted JSON serialization.
pub fn content_hash(payload: &JsonValue) -> String {
    hash_json(payload)
}

/// Map a raw payload onto normalized candidate attributes.
pub fn adapt(payload: &RawPayload, config: &NormalizerConfig) -> AdaptedRecord {
    let source = payload.source();
    let (external_id, attrs) = match payload {
        RawPayload::ScrapedNetwork(p) => (
            id([&p.id, &p.public_identifier, &p.profile_id]),
            adapt_scraped(p, config),
        ),
        RawPayload::Ats(p) => (id([&p.id, &p.candidate_id]), adapt_ats(p, config)),
        RawPayload::CvUpload(p) => (id([&p.upload_id, &p.id]), adapt_cv(p, config)),
        RawPayload::Manual(p) => (id([&p.id]), adapt_manual(p, config)),
    };
    AdaptedRecord {
        source,
        external_id,
        attrs,
    }
}

fn adapt_scraped(p: &ScrapedNetworkPayload, config: &NormalizerConfig) -> CandidateAttributes {
    let (first_name, last_name) = names(&p.first_name, &p.last_name, [&p.full_name, &p.name]);
    let employment_history = positions(list([&p.experiences, &p.positions]));
    let current = employment_history.first();

    CandidateAttributes {
        first_name,
        last_name,
        email: first_valid(&p.emails, normalize_email),
        phone: first_valid(&p.phones, |raw| normalize_phone(raw, config)),
        linkedin_url: pick([&p.profile_url, &p.url, &p.linkedin_url], normalize_url),
        current_title: pick([&p.current_title, &p.job_title], normalize_text)
            .or_else(|| current.and_then(|e| e.title.clone())),
        current_company: pick([&p.current_company, &p.company], normalize_text)
            .or_else(|| current.and_then(|e| e.company.clone())),
        headline: pick([&p.headline], normalize_text),
        bio: pick([&p.about, &p.summary], normalize_text),
        skills: skills(&p.skills),
        education_history: schools(list([&p.educations, &p.education])),
        employment_history,
        ..Default::default()
    }
}

fn adapt_ats(p: &AtsPayload, config: &NormalizerConfig) -> CandidateAttributes {
    let (first_name, last_name) = names(&p.first_name, &p.last_name, [&p.full_name]);
    let mut skill_items: Vec<&SkillItem> = p.skills.iter().collect();
    if let Some(enhancement) = &p.enhancement {
        skill_items.extend(enhancement.skills.iter());
    }

    CandidateAttributes {
        first_name,
        last_name,
        email: pick([&p.email], normalize_email),
        phone: pick([&p.phone], |raw| normalize_phone(raw, config)),
        linkedin_url: pick([&p.linkedin_url, &p.linkedin], normalize_url),
        current_title: pick([&p.current_title, &p.title], normalize_text),
        current_company: pick([&p.current_company, &p.company], normalize_text),
        headline: pick([&p.headline], normalize_text),
        bio: pick([&p.bio, &p.summary], normalize_text),
        detailed_history: p
            .enhancement
            .as_ref()
            .and_then(|e| pick([&e.summary, &e.detailed_history], normalize_text)),
        skills: normalize_skills(skill_items.into_iter().map(SkillItem::name)),
        employment_history: positions(list([&p.employment_history, &p.employment])),
        education_history: schools(list([&p.education_history, &p.education])),
        ats_enhanced: p.enhancement.is_some(),
        ..Default::default()
    }
}

fn adapt_cv(p: &CvUploadPayload, config: &NormalizerConfig) -> CandidateAttributes {
    let cv = &p.parsed;
    let (first_name, last_name) = names(&cv.first_name, &cv.last_name, [&cv.full_name, &cv.name]);

    CandidateAttributes {
        first_name,
        last_name,
        email: pick([&cv.email], normalize_email),
        phone: pick([&cv.phone], |raw| normalize_phone(raw, config)),
        linkedin_url: pick([&cv.linkedin, &cv.linkedin_url], normalize_url),
        current_title: pick([&cv.title, &cv.current_title], normalize_text),
        current_company: pick([&cv.company, &cv.current_company], normalize_text),
        bio: pick([&cv.summary, &cv.bio], normalize_text),
        cv_text: pick([&p.text, &p.cv_text, &p.raw_text], normalize_text),
        skills: skills(&cv.skills),
        employment_history: positions(list([&cv.experience, &cv.employment_history])),
        education_history: schools(list([&cv.education, &cv.education_history])),
        ..Default::default()
    }
}

fn adapt_manual(p: &ManualPayload, config: &NormalizerConfig) -> CandidateAttributes {
    let (first_name, last_name) = names(&p.first_name, &p.last_name, [&p.full_name, &p.name]);

    CandidateAttributes {
        first_name,
        last_name,
        email: pick([&p.email], normalize_email),
        phone: pick([&p.phone], |raw| normalize_phone(raw, config)),
        linkedin_url: pick([&p.linkedin_url], normalize_url),
        current_title: pick([&p.current_title, &p.title], normalize_text),
        current_company: pick([&p.current_company, &p.company], normalize_text),
        headline: pick([&p.headline], normalize_text),
        bio: pick([&p.bio], normalize_text),
        skills: skills(&p.skills),
        ..Default::default()
    }
}

/// First spelling that survives normalization.
fn pick<const N: usize>(
    values: [&Option<String>; N],
    normalize: impl Fn(&str) -> Option<String>,
) -> Option<String> {
    values
        .into_iter()
        .find_map(|value| value.as_deref().and_then(|raw| normalize(raw)))
}

fn id<const N: usize>(values: [&Option<ExternalId>; N]) -> Option<String> {
    values
        .into_iter()
        .flatten()
        .find_map(ExternalId::normalized)
}

/// First non-empty list among alternate spellings.
fn list<'a, T, const N: usize>(values: [&'a Vec<T>; N]) -> &'a [T] {
    values
        .into_iter()
        .find(|items| !items.is_empty())
        .map(Vec::as_slice)
        .unwrap_or_default()
}

fn names<const N: usize>(
    first: &Option<String>,
    last: &Option<String>,
    full: [&Option<String>; N],
) -> (Option<String>, Option<String>) {
    let full = pick(full, normalize_text);
    split_full_name(first.as_deref(), last.as_deref(), full.as_deref())
}

/// First contact value that survives normalization.
fn first_valid(
    values: &[ContactValue],
    normalize: impl Fn(&str) -> Option<String>,
) -> Option<String> {
    values
        .iter()
        .filter_map(|c| c.value.as_deref())
        .find_map(normalize)
}

fn skills(items: &[SkillItem]) -> Vec<String> {
    normalize_skills(items.iter().map(SkillItem::name))
}

fn positions(items: &[PositionPayload]) -> Vec<EmploymentEntry> {
    items
        .iter()
        .map(|p| EmploymentEntry {
            title: pick([&p.title, &p.position], normalize_text),
            company: pick([&p.company, &p.company_name, &p.employer], normalize_text),
            start_date: pick([&p.start_date, &p.from], normalize_text),
            end_date: pick([&p.end_date, &p.to], normalize_text),
            description: pick([&p.description, &p.summary], normalize_text),
        })
        .filter(|e| !e.is_empty())
        .collect()
}

fn schools(items: &[SchoolPayload]) -> Vec<EducationEntry> {
    items
        .iter()
        .map(|s| EducationEntry {
            institution: pick([&s.institution, &s.school, &s.school_name], normalize_text),
            degree: pick([&s.degree], normalize_text),
            field_of_study: pick([&s.field_of_study, &s.field], normalize_text),
            start_date: pick([&s.start_date, &s.from], normalize_text),
            end_date: pick([&s.end_date, &s.to], normalize_text),
        })
        .filter(|e| !e.is_empty())
        .collect()
}
