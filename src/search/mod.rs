//! # Driftmail Core - Search Query Translator
//!
//! Parses the Gmail-like query syntax typed into the search box
//! (`from:alice after:2025-01-01 "status report"`) into a typed filter,
//! and translates that filter into a server-side IMAP SEARCH command.
//! Free text is delegated to the server's content search; no OR/NOT
//! syntax is supported.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Search query parse errors. These are user-input errors, never retried.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("Filter '{0}:' requires a value")]
    EmptyValue(String),

    #[error("Invalid date '{1}' for '{0}:' (expected YYYY-MM-DD)")]
    InvalidDate(String, String),
}

/// One typed search predicate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum Predicate {
    From(String),
    To(String),
    Subject(String),
    /// Inclusive from 00:00:00 of the given day
    After(NaiveDate),
    /// Inclusive through 23:59:59 of the given day
    Before(NaiveDate),
    Folder(String),
    Text(String),
}

/// A parsed search query: an ordered set of predicates combined with
/// implicit AND. Ephemeral; never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    pub predicates: Vec<Predicate>,
}

impl SearchFilter {
    /// Parse a raw query string.
    ///
    /// An empty query is valid and means "no filter"; a query that fails
    /// to parse is an error, the two are never conflated.
    pub fn parse(raw: &str) -> Result<Self, QueryError> {
        let mut predicates = Vec::new();

        for token in tokenize(raw) {
            let predicate = match token.split_once(':') {
                Some((key, value)) if is_filter_key(key) => {
                    let key = key.to_ascii_lowercase();
                    if value.is_empty() {
                        return Err(QueryError::EmptyValue(key));
                    }
                    match key.as_str() {
                        "from" => Predicate::From(value.to_string()),
                        "to" => Predicate::To(value.to_string()),
                        "subject" => Predicate::Subject(value.to_string()),
                        "after" => Predicate::After(parse_date(&key, value)?),
                        "before" => Predicate::Before(parse_date(&key, value)?),
                        // "label" is an alias for "folder"
                        _ => Predicate::Folder(value.to_string()),
                    }
                }
                // Unrecognized key:value shapes and bare words are free text
                _ => Predicate::Text(token),
            };
            predicates.push(predicate);
        }

        Ok(Self { predicates })
    }

    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    /// The folder this query is scoped to, when one was given
    pub fn folder(&self) -> Option<&str> {
        self.predicates.iter().find_map(|p| match p {
            Predicate::Folder(folder) => Some(folder.as_str()),
            _ => None,
        })
    }

    /// Translate into an IMAP SEARCH command string.
    ///
    /// IMAP's BEFORE is exclusive of the given date, so the inclusive
    /// `before:` day boundary maps to the following day. The folder
    /// predicate contributes scope, not query text.
    pub fn to_imap_query(&self) -> String {
        let mut parts = Vec::new();

        for predicate in &self.predicates {
            match predicate {
                Predicate::From(v) => parts.push(format!("FROM \"{}\"", sanitize_value(v))),
                Predicate::To(v) => parts.push(format!("TO \"{}\"", sanitize_value(v))),
                Predicate::Subject(v) => parts.push(format!("SUBJECT \"{}\"", sanitize_value(v))),
                Predicate::After(d) => parts.push(format!("SINCE {}", imap_date(*d))),
                Predicate::Before(d) => {
                    let next = d.succ_opt().unwrap_or(*d);
                    parts.push(format!("BEFORE {}", imap_date(next)));
                }
                Predicate::Folder(_) => {}
                Predicate::Text(v) => parts.push(format!("TEXT \"{}\"", sanitize_value(v))),
            }
        }

        if parts.is_empty() {
            "ALL".to_string()
        } else {
            parts.join(" ")
        }
    }

    /// Inclusive [start, end] timestamp bounds from the date predicates
    pub fn date_bounds(&self) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        let mut start = None;
        let mut end = None;

        for predicate in &self.predicates {
            match predicate {
                Predicate::After(d) => {
                    start = d
                        .and_hms_opt(0, 0, 0)
                        .map(|dt| Utc.from_utc_datetime(&dt));
                }
                Predicate::Before(d) => {
                    end = d
                        .and_hms_opt(23, 59, 59)
                        .map(|dt| Utc.from_utc_datetime(&dt));
                }
                _ => {}
            }
        }

        (start, end)
    }

    /// Whether a message timestamp falls inside the date predicates
    pub fn matches_timestamp(&self, ts: DateTime<Utc>) -> bool {
        let (start, end) = self.date_bounds();
        if let Some(start) = start {
            if ts < start {
                return false;
            }
        }
        if let Some(end) = end {
            if ts > end {
                return false;
            }
        }
        true
    }
}

fn is_filter_key(key: &str) -> bool {
    matches!(
        key.to_ascii_lowercase().as_str(),
        "from" | "to" | "subject" | "after" | "before" | "folder" | "label"
    )
}

fn parse_date(key: &str, value: &str) -> Result<NaiveDate, QueryError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| QueryError::InvalidDate(key.to_string(), value.to_string()))
}

/// Split a raw query into tokens, honoring double quotes both for bare
/// phrases and for `key:"quoted value"` pairs. Quotes are stripped; an
/// unterminated quote runs to the end of the input.
fn tokenize(raw: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in raw.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            c if c.is_whitespace() && !in_quotes => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }

    tokens
}

/// Strip characters that could break out of a quoted IMAP search string
fn sanitize_value(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '"' | '\\' | '\r' | '\n' | '\0'))
        .collect()
}

/// RFC 3501 date format: 1-Jan-2025
fn imap_date(date: NaiveDate) -> String {
    use chrono::Datelike;
    format!("{}-{}-{}", date.day(), date.format("%b"), date.year())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_query_is_no_filter() {
        let filter = SearchFilter::parse("").unwrap();
        assert!(filter.is_empty());
        assert_eq!(filter.to_imap_query(), "ALL");

        let filter = SearchFilter::parse("   ").unwrap();
        assert!(filter.is_empty());
    }

    #[test]
    fn test_bare_words_are_free_text() {
        let filter = SearchFilter::parse("status report").unwrap();
        assert_eq!(
            filter.predicates,
            vec![
                Predicate::Text("status".into()),
                Predicate::Text("report".into())
            ]
        );
        assert_eq!(filter.to_imap_query(), "TEXT \"status\" TEXT \"report\"");
    }

    #[test]
    fn test_quoted_phrase_is_one_token() {
        let filter = SearchFilter::parse("\"status report\"").unwrap();
        assert_eq!(filter.predicates, vec![Predicate::Text("status report".into())]);
    }

    #[test]
    fn test_quoted_filter_value() {
        let filter = SearchFilter::parse("from:\"Jane Doe\"").unwrap();
        assert_eq!(filter.predicates, vec![Predicate::From("Jane Doe".into())]);
    }

    #[test]
    fn test_empty_filter_value_is_error() {
        assert_eq!(
            SearchFilter::parse("from:"),
            Err(QueryError::EmptyValue("from".into()))
        );
        assert_eq!(
            SearchFilter::parse("subject:\"\""),
            Err(QueryError::EmptyValue("subject".into()))
        );
    }

    #[test]
    fn test_label_is_folder_alias() {
        let by_folder = SearchFilter::parse("folder:Archive").unwrap();
        let by_label = SearchFilter::parse("label:Archive").unwrap();
        assert_eq!(by_folder.folder(), Some("Archive"));
        assert_eq!(by_label.folder(), Some("Archive"));
    }

    #[test]
    fn test_unknown_key_is_free_text() {
        let filter = SearchFilter::parse("size:100").unwrap();
        assert_eq!(filter.predicates, vec![Predicate::Text("size:100".into())]);
    }

    #[test]
    fn test_invalid_date_is_error() {
        assert_eq!(
            SearchFilter::parse("after:tomorrow"),
            Err(QueryError::InvalidDate("after".into(), "tomorrow".into()))
        );
        assert_eq!(
            SearchFilter::parse("before:2025-13-01"),
            Err(QueryError::InvalidDate("before".into(), "2025-13-01".into()))
        );
    }

    #[test]
    fn test_mixed_query_translation() {
        let filter =
            SearchFilter::parse("from:alice@example.com subject:invoice overdue").unwrap();
        assert_eq!(
            filter.to_imap_query(),
            "FROM \"alice@example.com\" SUBJECT \"invoice\" TEXT \"overdue\""
        );
    }

    #[test]
    fn test_after_maps_to_inclusive_since() {
        let filter = SearchFilter::parse("after:2025-01-01").unwrap();
        assert_eq!(filter.to_imap_query(), "SINCE 1-Jan-2025");
    }

    #[test]
    fn test_before_maps_to_next_day_exclusive() {
        // IMAP BEFORE excludes its date; inclusive-through-23:59:59 means
        // the following day goes on the wire
        let filter = SearchFilter::parse("before:2025-12-31").unwrap();
        assert_eq!(filter.to_imap_query(), "BEFORE 1-Jan-2026");
    }

    #[test]
    fn test_after_boundary_is_midnight_inclusive() {
        let filter = SearchFilter::parse("after:2025-01-01").unwrap();
        let midnight = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let just_before = Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        assert!(filter.matches_timestamp(midnight));
        assert!(!filter.matches_timestamp(just_before));
    }

    #[test]
    fn test_before_boundary_is_end_of_day_inclusive() {
        let filter = SearchFilter::parse("before:2025-12-31").unwrap();
        let last_second = Utc.with_ymd_and_hms(2025, 12, 31, 23, 59, 59).unwrap();
        let next_day = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert!(filter.matches_timestamp(last_second));
        assert!(!filter.matches_timestamp(next_day));
    }

    #[test]
    fn test_folder_not_in_wire_query() {
        let filter = SearchFilter::parse("folder:Archive report").unwrap();
        assert_eq!(filter.to_imap_query(), "TEXT \"report\"");
    }

    #[test]
    fn test_values_are_sanitized() {
        let filter = SearchFilter::parse("from:\"a\\\"b\"").unwrap();
        assert_eq!(filter.to_imap_query(), "FROM \"ab\"");
    }

    #[test]
    fn test_keys_are_case_insensitive() {
        let filter = SearchFilter::parse("FROM:alice").unwrap();
        assert_eq!(filter.predicates, vec![Predicate::From("alice".into())]);
    }
}
