//! Field normalization.
//!
//! Pure, total functions that turn raw contact fields from any source into
//! comparable canonical forms. Every function is idempotent: feeding a
//! normalized value back in returns it unchanged.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::defaults;

static EMAIL_RE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[^\s@]+@[^\s@.]+(\.[^\s@.]+)+$").ok());

/// Settings that vary per deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizerConfig {
    /// Country calling code applied to national numbers, with leading `+`.
    pub default_country_code: String,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            default_country_code: defaults::DEFAULT_COUNTRY_CODE.to_string(),
        }
    }
}

impl NormalizerConfig {
    /// Build a config, accepting the country code with or without `+`.
    pub fn new(default_country_code: &str) -> Self {
        let digits: String = default_country_code
            .chars()
            .filter(|c| c.is_ascii_digit())
            .collect();
        let default_country_code = if digits.is_empty() {
            defaults::DEFAULT_COUNTRY_CODE.to_string()
        } else {
            format!("+{}", digits)
        };
        Self {
            default_country_code,
        }
    }
}

/// Trim and lowercase; reject anything that is not `local@domain.tld`.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    if email.is_empty() {
        return None;
    }
    match EMAIL_RE.as_ref() {
        Some(re) if re.is_match(&email) => Some(email),
        _ => None,
    }
}

/// Reduce a phone number to `+<digits>`.
///
/// Only digits and `+` survive; the number is international when the
/// first surviving character is `+`. Numbers already in international
/// form are kept; a national trunk `0` is replaced by the default country
/// code; anything else gets the default country code prefixed.
pub fn normalize_phone(raw: &str, config: &NormalizerConfig) -> Option<String> {
    let stripped: String = raw
        .chars()
        .filter(|c| *c == '+' || c.is_ascii_digit())
        .collect();
    let digits: String = stripped.chars().filter(|c| c.is_ascii_digit()).collect();

    if stripped.starts_with('+') {
        if digits.is_empty() {
            return None;
        }
        return Some(format!("+{}", digits));
    }

    let national = digits.strip_prefix('0').unwrap_or(&digits);
    if national.is_empty() {
        return None;
    }
    Some(format!("{}{}", config.default_country_code, national))
}

/// Trim and drop trailing slashes. Purely syntactic; reachability is not checked.
pub fn normalize_url(raw: &str) -> Option<String> {
    let url = raw.trim().trim_end_matches('/');
    if url.is_empty() {
        None
    } else {
        Some(url.to_string())
    }
}

/// Trim free text; whitespace-only becomes absent.
pub fn normalize_text(raw: &str) -> Option<String> {
    let text = raw.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Apply [`normalize_text`] to an optional value.
pub fn normalize_opt_text(raw: Option<&str>) -> Option<String> {
    raw.and_then(normalize_text)
}

/// Case-insensitive dedupe key for a skill.
pub fn normalize_skill_key(skill: &str) -> String {
    skill.trim().to_lowercase()
}

/// Trim skills and drop empties and case-insensitive duplicates, keeping
/// first-seen order.
pub fn normalize_skills<I, S>(raw: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = std::collections::HashSet::new();
    raw.into_iter()
        .filter_map(|s| normalize_text(s.as_ref()))
        .filter(|s| seen.insert(normalize_skill_key(s)))
        .collect()
}

/// Resolve first/last name from either explicit parts or a full name.
///
/// Explicit parts win when either is present. Otherwise the full name is
/// split on whitespace: the last token is the surname, the rest the first
/// name. A single token becomes the first name only.
pub fn split_full_name(
    first: Option<&str>,
    last: Option<&str>,
    full: Option<&str>,
) -> (Option<String>, Option<String>) {
    let first = normalize_opt_text(first);
    let last = normalize_opt_text(last);
    if first.is_some() || last.is_some() {
        return (first, last);
    }

    let tokens: Vec<&str> = full.unwrap_or_default().split_whitespace().collect();
    match tokens.as_slice() {
        [] => (None, None),
        [only] => (Some(only.to_string()), None),
        [rest @ .., surname] => (Some(rest.join(" ")), Some(surname.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uk() -> NormalizerConfig {
        NormalizerConfig::new("+44")
    }

    #[test]
    fn test_email_trim_and_lowercase() {
        assert_eq!(
            normalize_email("  Jane.Doe@X.com "),
            Some("jane.doe@x.com".to_string())
        );
    }

    #[test]
    fn test_email_rejects_malformed() {
        assert_eq!(normalize_email(""), None);
        assert_eq!(normalize_email("jane"), None);
        assert_eq!(normalize_email("jane@x"), None);
        assert_eq!(normalize_email("jane doe@x.com"), None);
        assert_eq!(normalize_email("@x.com"), None);
    }

    #[test]
    fn test_phone_international_kept() {
        assert_eq!(
            normalize_phone("+44 (7911) 123-456", &uk()),
            Some("+447911123456".to_string())
        );
    }

    #[test]
    fn test_phone_plus_inside_punctuation_is_international() {
        assert_eq!(
            normalize_phone("(+44) 7911 123456", &uk()),
            Some("+447911123456".to_string())
        );
        assert_eq!(
            normalize_phone(" [+1] 415-555-0100", &uk()),
            Some("+14155550100".to_string())
        );
    }

    #[test]
    fn test_phone_trunk_prefix_replaced() {
        assert_eq!(
            normalize_phone("07911 123456", &uk()),
            Some("+447911123456".to_string())
        );
    }

    #[test]
    fn test_phone_without_prefix_gets_country_code() {
        assert_eq!(
            normalize_phone("7911 123456", &uk()),
            Some("+447911123456".to_string())
        );
    }

    #[test]
    fn test_phone_empty_or_garbage_is_none() {
        assert_eq!(normalize_phone("", &uk()), None);
        assert_eq!(normalize_phone("n/a", &uk()), None);
        assert_eq!(normalize_phone("+", &uk()), None);
        assert_eq!(normalize_phone("0", &uk()), None);
    }

    #[test]
    fn test_config_accepts_bare_digits() {
        assert_eq!(NormalizerConfig::new("1").default_country_code, "+1");
        assert_eq!(
            NormalizerConfig::new("").default_country_code,
            defaults::DEFAULT_COUNTRY_CODE
        );
    }

    #[test]
    fn test_url_trailing_slash() {
        assert_eq!(
            normalize_url(" https://linkedin.com/in/jane/ "),
            Some("https://linkedin.com/in/jane".to_string())
        );
        assert_eq!(normalize_url("   "), None);
        assert_eq!(normalize_url("/"), None);
    }

    #[test]
    fn test_split_full_name() {
        assert_eq!(
            split_full_name(None, None, Some("Mary Jane Watson")),
            (Some("Mary Jane".to_string()), Some("Watson".to_string()))
        );
        assert_eq!(
            split_full_name(None, None, Some("Cher")),
            (Some("Cher".to_string()), None)
        );
        assert_eq!(split_full_name(None, None, Some("   ")), (None, None));
        assert_eq!(
            split_full_name(Some("Jane"), None, Some("Someone Else")),
            (Some("Jane".to_string()), None)
        );
    }

    #[test]
    fn test_skills_dedupe_case_insensitive() {
        assert_eq!(
            normalize_skills(["Rust", " rust ", "", "SQL"]),
            vec!["Rust".to_string(), "SQL".to_string()]
        );
    }

    #[test]
    fn test_normalization_is_idempotent() {
        let config = uk();
        let emails = ["  A@B.co ", "jane.doe@x.com", "bad", "", "X@Y.Z.org"];
        for raw in emails {
            if let Some(once) = normalize_email(raw) {
                assert_eq!(normalize_email(&once), Some(once.clone()));
            }
        }

        let phones = ["+1 555 0100", "020 7946 0958", "7946", "+", "abc", "00 44 1"];
        for raw in phones {
            if let Some(once) = normalize_phone(raw, &config) {
                assert_eq!(normalize_phone(&once, &config), Some(once.clone()));
            }
        }

        let urls = ["https://x.com/a//", " y ", "", "https://x.com"];
        for raw in urls {
            if let Some(once) = normalize_url(raw) {
                assert_eq!(normalize_url(&once), Some(once.clone()));
            }
        }
    }
}
