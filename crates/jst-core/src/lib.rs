//! Core record model and provenance types for tracker consolidation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "jst-core";

/// A single cell read from a legacy table, typed by SQLite's runtime storage class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SqlValue::Null => "NULL",
            SqlValue::Integer(_) => "INTEGER",
            SqlValue::Real(_) => "REAL",
            SqlValue::Text(_) => "TEXT",
            SqlValue::Blob(_) => "BLOB",
        }
    }

    /// Text view of the value. Blank strings and blobs read as absent.
    pub fn as_text(&self) -> Option<String> {
        match self {
            SqlValue::Null | SqlValue::Blob(_) => None,
            SqlValue::Integer(v) => Some(v.to_string()),
            SqlValue::Real(v) => Some(v.to_string()),
            SqlValue::Text(v) => {
                let trimmed = v.trim();
                if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                }
            }
        }
    }

    /// Integer view. Accepts salary-style text such as `$200,000` or `180k`.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(v) => Some(*v),
            SqlValue::Real(v) => float_to_i64(*v),
            SqlValue::Text(v) => parse_amount(v).and_then(float_to_i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Integer(v) => Some(*v as f64),
            SqlValue::Real(v) => Some(*v),
            SqlValue::Text(v) => parse_amount(v),
            _ => None,
        }
    }

    /// Boolean view for the many `applied`/`is_remote` style columns.
    pub fn as_flag(&self) -> Option<bool> {
        match self {
            SqlValue::Integer(v) => Some(*v != 0),
            SqlValue::Real(v) => Some(*v != 0.0),
            SqlValue::Text(v) => match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "y" | "t" => Some(true),
                "0" | "false" | "no" | "n" | "f" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Rounds to the nearest integer; NaN, infinities and values outside `i64` yield `None`.
fn float_to_i64(value: f64) -> Option<i64> {
    let rounded = value.round();
    // `i64::MAX as f64` is 2^63, one past the largest representable value.
    (rounded.is_finite() && rounded >= i64::MIN as f64 && rounded < i64::MAX as f64)
        .then_some(rounded as i64)
}

fn parse_amount(input: &str) -> Option<f64> {
    let cleaned: String = input
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | '_' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    let (digits, multiplier) = match cleaned.strip_suffix(['k', 'K']) {
        Some(rest) => (rest, 1000.0),
        None => (cleaned.as_str(), 1.0),
    };
    digits.parse::<f64>().ok().map(|v| v * multiplier)
}

/// Parses the handful of timestamp layouts the legacy trackers wrote.
pub fn parse_timestamp(input: &str) -> Option<NaiveDateTime> {
    let input = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Some(ts.naive_utc());
    }
    for layout in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(input, layout) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

/// The six tables of the unified schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetTable {
    Jobs,
    Applications,
    Responses,
    Contacts,
    Metrics,
    Profile,
}

impl TargetTable {
    pub const ALL: [TargetTable; 6] = [
        TargetTable::Jobs,
        TargetTable::Applications,
        TargetTable::Responses,
        TargetTable::Contacts,
        TargetTable::Metrics,
        TargetTable::Profile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TargetTable::Jobs => "jobs",
            TargetTable::Applications => "applications",
            TargetTable::Responses => "responses",
            TargetTable::Contacts => "contacts",
            TargetTable::Metrics => "metrics",
            TargetTable::Profile => "profile",
        }
    }

    /// Columns that identify a row for deduplication.
    pub fn key_columns(&self) -> &'static [&'static str] {
        match self {
            TargetTable::Jobs => &["company", "title"],
            TargetTable::Applications => &["company", "position", "applied_date"],
            TargetTable::Responses => &["company", "subject", "received_date"],
            TargetTable::Contacts => &["company", "name"],
            TargetTable::Metrics => &["name", "recorded_at"],
            TargetTable::Profile => &["field"],
        }
    }
}

impl fmt::Display for TargetTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TargetTable::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown target table `{s}`"))
    }
}

/// Provenance pointer from a staged record back to the legacy row it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub database: String,
    pub table: String,
    pub row_index: usize,
}

impl fmt::Display for SourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}#{}", self.database, self.table, self.row_index)
    }
}

/// A mapped record paired with the row it was read from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Staged<T> {
    pub record: T,
    pub source: SourceRef,
}

/// A non-null value that lost to another non-null value during a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub kept: String,
    pub discarded: String,
}

/// Shared behaviour of the typed rows of the unified schema.
pub trait UnifiedRecord: Clone {
    const TABLE: TargetTable;

    /// Exact-match identity; `None` key parts compare equal to each other.
    fn key(&self) -> Vec<Option<String>>;

    /// Timestamp used to decide which of two conflicting records is newer.
    fn timestamp(&self) -> Option<&str> {
        None
    }

    /// Folds `other` into `self`. Non-null beats null; on two non-null values
    /// `other` wins when `other_wins` is set. Returns every discarded value.
    fn merge_from(&mut self, other: Self, other_wins: bool) -> Vec<FieldConflict>;
}

fn merge_opt<T>(
    field: &str,
    current: &mut Option<T>,
    incoming: Option<T>,
    incoming_wins: bool,
    conflicts: &mut Vec<FieldConflict>,
) where
    T: PartialEq + ToString,
{
    let Some(incoming) = incoming else {
        return;
    };
    match current {
        None => *current = Some(incoming),
        Some(existing) if *existing == incoming => {}
        Some(existing) => {
            let (kept, discarded) = if incoming_wins {
                let old = std::mem::replace(existing, incoming);
                (existing.to_string(), old.to_string())
            } else {
                (existing.to_string(), incoming.to_string())
            };
            conflicts.push(FieldConflict {
                field: field.to_string(),
                kept,
                discarded,
            });
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub company: String,
    pub title: String,
    pub location: Option<String>,
    pub remote: Option<bool>,
    pub salary_min: Option<i64>,
    pub salary_max: Option<i64>,
    pub url: Option<String>,
    pub source: Option<String>,
    pub discovered_date: Option<String>,
    pub relevance_score: Option<f64>,
    pub applied: bool,
    pub applied_date: Option<String>,
}

impl Job {
    pub fn new(company: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            company: company.into(),
            title: title.into(),
            location: None,
            remote: None,
            salary_min: None,
            salary_max: None,
            url: None,
            source: None,
            discovered_date: None,
            relevance_score: None,
            applied: false,
            applied_date: None,
        }
    }
}

impl UnifiedRecord for Job {
    const TABLE: TargetTable = TargetTable::Jobs;

    fn key(&self) -> Vec<Option<String>> {
        vec![Some(self.company.clone()), Some(self.title.clone())]
    }

    fn timestamp(&self) -> Option<&str> {
        self.discovered_date.as_deref()
    }

    fn merge_from(&mut self, other: Self, other_wins: bool) -> Vec<FieldConflict> {
        let mut c = Vec::new();
        merge_opt("location", &mut self.location, other.location, other_wins, &mut c);
        merge_opt("remote", &mut self.remote, other.remote, other_wins, &mut c);
        merge_opt("salary_min", &mut self.salary_min, other.salary_min, other_wins, &mut c);
        merge_opt("salary_max", &mut self.salary_max, other.salary_max, other_wins, &mut c);
        merge_opt("url", &mut self.url, other.url, other_wins, &mut c);
        merge_opt("source", &mut self.source, other.source, other_wins, &mut c);
        merge_opt(
            "discovered_date",
            &mut self.discovered_date,
            other.discovered_date,
            other_wins,
            &mut c,
        );
        merge_opt(
            "relevance_score",
            &mut self.relevance_score,
            other.relevance_score,
            other_wins,
            &mut c,
        );
        self.applied |= other.applied;
        merge_opt("applied_date", &mut self.applied_date, other.applied_date, other_wins, &mut c);
        c
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Application {
    pub company: String,
    pub position: String,
    pub applied_date: Option<String>,
    pub method: Option<String>,
    pub resume_version: Option<String>,
    pub status: Option<String>,
    pub response_received: bool,
}

impl UnifiedRecord for Application {
    const TABLE: TargetTable = TargetTable::Applications;

    fn key(&self) -> Vec<Option<String>> {
        vec![
            Some(self.company.clone()),
            Some(self.position.clone()),
            self.applied_date.clone(),
        ]
    }

    fn timestamp(&self) -> Option<&str> {
        self.applied_date.as_deref()
    }

    fn merge_from(&mut self, other: Self, other_wins: bool) -> Vec<FieldConflict> {
        let mut c = Vec::new();
        merge_opt("method", &mut self.method, other.method, other_wins, &mut c);
        merge_opt(
            "resume_version",
            &mut self.resume_version,
            other.resume_version,
            other_wins,
            &mut c,
        );
        merge_opt("status", &mut self.status, other.status, other_wins, &mut c);
        self.response_received |= other.response_received;
        c
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub company: String,
    pub subject: Option<String>,
    pub received_date: Option<String>,
    pub response_type: Option<String>,
    pub content: Option<String>,
}

impl UnifiedRecord for Response {
    const TABLE: TargetTable = TargetTable::Responses;

    fn key(&self) -> Vec<Option<String>> {
        vec![
            Some(self.company.clone()),
            self.subject.clone(),
            self.received_date.clone(),
        ]
    }

    fn timestamp(&self) -> Option<&str> {
        self.received_date.as_deref()
    }

    fn merge_from(&mut self, other: Self, other_wins: bool) -> Vec<FieldConflict> {
        let mut c = Vec::new();
        merge_opt(
            "response_type",
            &mut self.response_type,
            other.response_type,
            other_wins,
            &mut c,
        );
        merge_opt("content", &mut self.content, other.content, other_wins, &mut c);
        c
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub company: String,
    pub name: String,
    pub title: Option<String>,
    pub email: Option<String>,
    pub linkedin: Option<String>,
    pub contacted: bool,
}

impl UnifiedRecord for Contact {
    const TABLE: TargetTable = TargetTable::Contacts;

    fn key(&self) -> Vec<Option<String>> {
        vec![Some(self.company.clone()), Some(self.name.clone())]
    }

    fn merge_from(&mut self, other: Self, other_wins: bool) -> Vec<FieldConflict> {
        let mut c = Vec::new();
        merge_opt("title", &mut self.title, other.title, other_wins, &mut c);
        merge_opt("email", &mut self.email, other.email, other_wins, &mut c);
        merge_opt("linkedin", &mut self.linkedin, other.linkedin, other_wins, &mut c);
        self.contacted |= other.contacted;
        c
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    pub value: Option<f64>,
    pub verified: bool,
    pub recorded_at: Option<String>,
}

impl UnifiedRecord for Metric {
    const TABLE: TargetTable = TargetTable::Metrics;

    fn key(&self) -> Vec<Option<String>> {
        vec![Some(self.name.clone()), self.recorded_at.clone()]
    }

    fn timestamp(&self) -> Option<&str> {
        self.recorded_at.as_deref()
    }

    fn merge_from(&mut self, other: Self, other_wins: bool) -> Vec<FieldConflict> {
        let mut c = Vec::new();
        merge_opt("value", &mut self.value, other.value, other_wins, &mut c);
        self.verified |= other.verified;
        c
    }
}

/// One `field`/`value` pair of the candidate profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileEntry {
    pub field: String,
    pub value: Option<String>,
}

impl UnifiedRecord for ProfileEntry {
    const TABLE: TargetTable = TargetTable::Profile;

    fn key(&self) -> Vec<Option<String>> {
        vec![Some(self.field.clone())]
    }

    fn merge_from(&mut self, other: Self, other_wins: bool) -> Vec<FieldConflict> {
        let mut c = Vec::new();
        merge_opt("value", &mut self.value, other.value, other_wins, &mut c);
        c
    }
}

/// Coarse response classes, scored from subject and body keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    Interview,
    Rejection,
    Offer,
    Acknowledgement,
    Other,
}

const RESPONSE_KEYWORDS: &[(ResponseKind, &[&str])] = &[
    (
        ResponseKind::Offer,
        &["offer letter", "pleased to offer", "extend an offer", "compensation package"],
    ),
    (
        ResponseKind::Interview,
        &[
            "interview",
            "schedule a call",
            "phone screen",
            "availability",
            "next steps",
            "meet the team",
        ],
    ),
    (
        ResponseKind::Rejection,
        &[
            "unfortunately",
            "not moving forward",
            "other candidates",
            "not selected",
            "regret to inform",
            "decided to pursue",
        ],
    ),
    (
        ResponseKind::Acknowledgement,
        &[
            "thank you for applying",
            "received your application",
            "application received",
            "thanks for your interest",
        ],
    ),
];

impl ResponseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseKind::Interview => "interview",
            ResponseKind::Rejection => "rejection",
            ResponseKind::Offer => "offer",
            ResponseKind::Acknowledgement => "acknowledgement",
            ResponseKind::Other => "other",
        }
    }

    /// Highest keyword hit count wins; ties go to the earlier class in
    /// offer, interview, rejection, acknowledgement order.
    pub fn classify(subject: Option<&str>, content: Option<&str>) -> Self {
        let text = format!("{} {}", subject.unwrap_or_default(), content.unwrap_or_default())
            .to_ascii_lowercase();
        let mut best = (ResponseKind::Other, 0usize);
        for (kind, needles) in RESPONSE_KEYWORDS {
            let hits = needles.iter().filter(|n| text.contains(*n)).count();
            if hits > best.1 {
                best = (*kind, hits);
            }
        }
        best.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salary_text_parses_as_integer() {
        assert_eq!(SqlValue::Text("$200,000".into()).as_i64(), Some(200_000));
        assert_eq!(SqlValue::Text("180k".into()).as_i64(), Some(180_000));
        assert_eq!(SqlValue::Real(1234.6).as_i64(), Some(1235));
        assert_eq!(SqlValue::Text("competitive".into()).as_i64(), None);
    }

    #[test]
    fn out_of_range_amounts_are_not_clamped() {
        assert_eq!(SqlValue::Text("1e30".into()).as_i64(), None);
        assert_eq!(SqlValue::Real(-1e19).as_i64(), None);
        assert_eq!(SqlValue::Real(f64::NAN).as_i64(), None);
        assert_eq!(SqlValue::Real(9.0e18).as_i64(), Some(9_000_000_000_000_000_000));
    }

    #[test]
    fn flags_accept_common_spellings() {
        assert_eq!(SqlValue::Text("Yes".into()).as_flag(), Some(true));
        assert_eq!(SqlValue::Integer(0).as_flag(), Some(false));
        assert_eq!(SqlValue::Text("maybe".into()).as_flag(), None);
        assert_eq!(SqlValue::Null.as_flag(), None);
    }

    #[test]
    fn blank_text_reads_as_absent() {
        assert_eq!(SqlValue::Text("   ".into()).as_text(), None);
        assert_eq!(SqlValue::Text(" OpenAI ".into()).as_text().as_deref(), Some("OpenAI"));
    }

    #[test]
    fn timestamps_in_several_layouts_parse() {
        assert!(parse_timestamp("2024-03-01").is_some());
        assert!(parse_timestamp("2024-03-01 10:15:00").is_some());
        assert!(parse_timestamp("2024-03-01T10:15:00.123").is_some());
        assert!(parse_timestamp("2024-03-01T10:15:00Z").is_some());
        assert!(parse_timestamp("last tuesday").is_none());
    }

    #[test]
    fn merge_prefers_non_null_then_incoming_on_conflict() {
        let mut first = Job::new("OpenAI", "ML Engineer");
        first.salary_min = Some(200_000);
        first.location = Some("SF".into());

        let mut second = Job::new("OpenAI", "ML Engineer");
        second.salary_min = Some(210_000);
        second.url = Some("https://openai.com/careers".into());
        second.applied = true;

        let conflicts = first.merge_from(second, true);
        assert_eq!(first.salary_min, Some(210_000));
        assert_eq!(first.location.as_deref(), Some("SF"));
        assert_eq!(first.url.as_deref(), Some("https://openai.com/careers"));
        assert!(first.applied);
        assert_eq!(
            conflicts,
            vec![FieldConflict {
                field: "salary_min".into(),
                kept: "210000".into(),
                discarded: "200000".into(),
            }]
        );
    }

    #[test]
    fn merge_keeps_current_when_incoming_loses() {
        let mut first = Contact {
            company: "Anthropic".into(),
            name: "Jane Doe".into(),
            title: Some("CEO".into()),
            email: None,
            linkedin: None,
            contacted: false,
        };
        let second = Contact {
            title: Some("Founder".into()),
            email: Some("jane@example.com".into()),
            ..first.clone()
        };
        let conflicts = first.merge_from(second, false);
        assert_eq!(first.title.as_deref(), Some("CEO"));
        assert_eq!(first.email.as_deref(), Some("jane@example.com"));
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].discarded, "Founder");
    }

    #[test]
    fn response_kind_scoring() {
        assert_eq!(
            ResponseKind::classify(
                Some("Interview invitation"),
                Some("Please share your availability")
            ),
            ResponseKind::Interview
        );
        assert_eq!(
            ResponseKind::classify(
                Some("Your application"),
                Some("Unfortunately we are not moving forward")
            ),
            ResponseKind::Rejection
        );
        assert_eq!(ResponseKind::classify(None, None), ResponseKind::Other);
    }

    #[test]
    fn target_table_names_round_trip() {
        for table in TargetTable::ALL {
            assert_eq!(table.as_str().parse::<TargetTable>(), Ok(table));
        }
        assert!("widgets".parse::<TargetTable>().is_err());
    }
}
