//! Core domain model for jobview: job-posting records, duplicate groups and
//! the posted-timestamp parsing policy shared by every consumer.

use std::fmt;

use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const CRATE_NAME: &str = "jobview-core";

/// Document keys written by the ingestion process.
pub mod keys {
    pub const JOB_ID: &str = "job_id";
    pub const TITLE: &str = "job_title";
    pub const COMPANY: &str = "company_name";
    pub const LOCATION: &str = "location_full";
    pub const POSTED: &str = "timestamp_added";
    pub const URL: &str = "job_url";
}

/// Store-assigned identifier. Monotonic in creation order, so it doubles as a
/// recency proxy: a greater id is a newer record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One stored job posting. Immutable once read from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(rename = "id")]
    pub record_id: RecordId,
    /// Natural key used for duplicate detection. `None` is never a duplicate.
    pub job_id: Option<String>,
    #[serde(rename = "job_title")]
    pub title: String,
    pub company_name: String,
    #[serde(rename = "location_full")]
    pub location: String,
    #[serde(rename = "timestamp_added")]
    pub posted_at_text: String,
    #[serde(rename = "job_url")]
    pub source_url: String,
}

/// Result of leniently decoding an ingested document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub record: JobRecord,
    /// Expected text fields that were missing or not representable as text.
    pub missing_fields: Vec<&'static str>,
}

impl DecodedRecord {
    pub fn is_malformed(&self) -> bool {
        !self.missing_fields.is_empty()
    }
}

impl JobRecord {
    /// Decode an ingested document. Never fails: absent or ill-typed fields
    /// degrade to empty values and are reported in `missing_fields`.
    pub fn from_document(record_id: RecordId, document: &JsonValue) -> DecodedRecord {
        let mut missing_fields = Vec::new();
        let mut text = |key: &'static str| match document.get(key).and_then(scalar_text) {
            Some(value) => value,
            None => {
                missing_fields.push(key);
                String::new()
            }
        };

        let title = text(keys::TITLE);
        let company_name = text(keys::COMPANY);
        let location = text(keys::LOCATION);
        let posted_at_text = text(keys::POSTED);
        let source_url = text(keys::URL);

        let job_id = document.get(keys::JOB_ID).and_then(identifier_text);

        DecodedRecord {
            record: JobRecord {
                record_id,
                job_id,
                title,
                company_name,
                location,
                posted_at_text,
                source_url,
            },
            missing_fields,
        }
    }

    /// Effective posted timestamp in local wall-clock time; `None` when the
    /// text cannot be parsed, which orders before every real timestamp.
    pub fn posted_at(&self) -> Option<NaiveDateTime> {
        parse_posted_timestamp(&self.posted_at_text)
    }
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// Identifiers arrive as strings or numbers depending on the ingester; both
// compare by their string form. Only null/missing means "no identifier".
fn identifier_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Records sharing one non-absent `job_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub job_id: String,
    pub members: Vec<RecordId>,
}

impl DuplicateGroup {
    /// The retained member: greatest record id.
    pub fn survivor(&self) -> Option<RecordId> {
        self.members.iter().copied().max()
    }

    /// Every member except the survivor.
    pub fn redundant(&self) -> Vec<RecordId> {
        let survivor = self.survivor();
        self.members
            .iter()
            .copied()
            .filter(|id| Some(*id) != survivor)
            .collect()
    }

    pub fn has_duplicates(&self) -> bool {
        self.members.len() > 1
    }
}

/// Aggregate counts over one snapshot and its deduplicated projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct JobStats {
    pub total_jobs: usize,
    pub total_documents: usize,
    pub duplicate_count: usize,
    pub total_companies: usize,
}

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
    "%B %d, %Y %I:%M %p",
    "%B %d, %Y %I:%M:%S %p",
    "%B %d, %Y %H:%M",
    "%d %B %Y %H:%M",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%B %d, %Y", "%d %B %Y", "%m/%d/%Y", "%Y/%m/%d"];

/// Parse a free-form posted timestamp.
///
/// A bare `YYYY-MM-DD` is local midnight. Anything else has a trailing
/// parenthetical annotation such as `(CST)` stripped before generic parsing.
/// Offset-bearing forms are converted to local time; naive forms are taken as
/// local wall-clock time.
pub fn parse_posted_timestamp(text: &str) -> Option<NaiveDateTime> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if is_iso_calendar_date(text) {
        return NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .ok()
            .map(|d| d.and_time(NaiveTime::MIN));
    }

    let cleaned = strip_trailing_annotation(text);

    if let Ok(dt) = DateTime::parse_from_rfc3339(cleaned) {
        return Some(dt.with_timezone(&Local).naive_local());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(cleaned) {
        return Some(dt.with_timezone(&Local).naive_local());
    }
    if let Some(dt) = DATE_TIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(cleaned, fmt).ok())
    {
        return Some(dt);
    }
    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(cleaned, fmt).ok())
        .map(|d| d.and_time(NaiveTime::MIN))
}

fn is_iso_calendar_date(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(i, b)| match i {
            4 | 7 => *b == b'-',
            _ => b.is_ascii_digit(),
        })
}

fn strip_trailing_annotation(text: &str) -> &str {
    if !text.ends_with(')') {
        return text;
    }
    match text.rfind('(') {
        Some(open) if !text[open + 1..text.len() - 1].contains(')') => text[..open].trim_end(),
        _ => text,
    }
}
