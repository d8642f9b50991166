//! Raw provider records → canonical entities.
//!
//! Each provider has a mapper implementing [`RecordMapper`]; [`normalize_batch`]
//! runs it over a fetched batch, keeping good records and collecting rejects.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::error::{Result, TrunchbullError};
use crate::models::{
    assignment::Assignment,
    common::{DataType, Source},
    course::Course,
    event::Event,
    grade::Grade,
    message::Message,
};
use crate::providers::powerschool::mapper::PowerSchoolMapper;
use crate::providers::schoology::mapper::SchoologyMapper;
use crate::providers::RawRecord;

/// Canonical entities of a single data type, ready to persist.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedRecords {
    Courses(Vec<Course>),
    Assignments(Vec<Assignment>),
    Grades(Vec<Grade>),
    Events(Vec<Event>),
    Messages(Vec<Message>),
}

impl NormalizedRecords {
    pub fn empty(data_type: DataType) -> Self {
        match data_type {
            DataType::Courses => Self::Courses(Vec::new()),
            DataType::Assignments => Self::Assignments(Vec::new()),
            DataType::Grades => Self::Grades(Vec::new()),
            DataType::Events => Self::Events(Vec::new()),
            DataType::Messages => Self::Messages(Vec::new()),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Self::Courses(_) => DataType::Courses,
            Self::Assignments(_) => DataType::Assignments,
            Self::Grades(_) => DataType::Grades,
            Self::Events(_) => DataType::Events,
            Self::Messages(_) => DataType::Messages,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Courses(v) => v.len(),
            Self::Assignments(v) => v.len(),
            Self::Grades(v) => v.len(),
            Self::Events(v) => v.len(),
            Self::Messages(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A raw record the mapper refused.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    pub index: usize,
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBatch {
    pub entities: NormalizedRecords,
    pub rejected: Vec<RejectedRecord>,
}

impl NormalizedBatch {
    pub fn total(&self) -> usize {
        self.entities.len() + self.rejected.len()
    }

    /// True when the share of rejected records reaches `threshold`
    /// (1.0 = every record failed). Empty batches never fail.
    pub fn exceeds_reject_threshold(&self, threshold: f64) -> bool {
        let total = self.total();
        if total == 0 || self.rejected.is_empty() {
            return false;
        }
        self.rejected.len() as f64 / total as f64 >= threshold
    }
}

/// Provider-specific mapping from raw records to canonical entities. Every
/// function is pure: the same input always yields the same entity.
pub trait RecordMapper {
    const SOURCE: Source;

    fn course(student_id: &str, raw: &RawRecord) -> Result<Course>;
    fn assignment(student_id: &str, raw: &RawRecord) -> Result<Assignment>;
    fn grade(student_id: &str, raw: &RawRecord) -> Result<Grade>;
    fn event(raw: &RawRecord) -> Result<Event>;
    fn message(student_id: &str, raw: &RawRecord) -> Result<Message>;
}

pub fn normalize_batch(
    student_id: &str,
    source: Source,
    data_type: DataType,
    raw: &[RawRecord],
) -> NormalizedBatch {
    match source {
        Source::Schoology => normalize_with::<SchoologyMapper>(student_id, data_type, raw),
        Source::PowerSchool => normalize_with::<PowerSchoolMapper>(student_id, data_type, raw),
    }
}

fn normalize_with<M: RecordMapper>(
    student_id: &str,
    data_type: DataType,
    raw: &[RawRecord],
) -> NormalizedBatch {
    let mut rejected = Vec::new();
    let entities = match data_type {
        DataType::Courses => NormalizedRecords::Courses(collect(raw, &mut rejected, |r| {
            M::course(student_id, r)
        })),
        DataType::Assignments => {
            NormalizedRecords::Assignments(collect(raw, &mut rejected, |r| {
                M::assignment(student_id, r)
            }))
        }
        DataType::Grades => NormalizedRecords::Grades(collect(raw, &mut rejected, |r| {
            M::grade(student_id, r)
        })),
        DataType::Events => NormalizedRecords::Events(collect(raw, &mut rejected, M::event)),
        DataType::Messages => NormalizedRecords::Messages(collect(raw, &mut rejected, |r| {
            M::message(student_id, r)
        })),
    };

    for r in &rejected {
        warn!(
            student_id,
            source = %M::SOURCE,
            data_type = %data_type,
            index = r.index,
            field = %r.field,
            error = %r.message,
            "Skipping malformed record"
        );
    }

    NormalizedBatch { entities, rejected }
}

fn collect<T, F>(raw: &[RawRecord], rejected: &mut Vec<RejectedRecord>, map: F) -> Vec<T>
where
    F: Fn(&RawRecord) -> Result<T>,
{
    let mut out = Vec::with_capacity(raw.len());
    for (index, record) in raw.iter().enumerate() {
        match map(record) {
            Ok(entity) => out.push(entity),
            Err(TrunchbullError::MalformedResponse { field, message }) => {
                rejected.push(RejectedRecord {
                    index,
                    field,
                    message,
                })
            }
            Err(other) => rejected.push(RejectedRecord {
                index,
                field: "record".to_string(),
                message: other.to_string(),
            }),
        }
    }
    out
}

// -- Helpers shared by the provider mappers --

/// Deserialize a raw record into a typed provider model, reporting the
/// offending field when serde names one.
pub(crate) fn decode<T: DeserializeOwned>(raw: &RawRecord) -> Result<T> {
    T::deserialize(raw).map_err(|e| {
        let message = e.to_string();
        TrunchbullError::malformed(field_from_serde_message(&message), message)
    })
}

fn field_from_serde_message(message: &str) -> String {
    // serde reports e.g. "missing field `title`".
    message
        .split('`')
        .nth(1)
        .filter(|f| !f.is_empty())
        .unwrap_or("record")
        .to_string()
}

/// A required, non-blank string.
pub(crate) fn required(field: &str, value: Option<String>) -> Result<String> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(TrunchbullError::malformed(field, "required value is missing")),
    }
}

/// Blank strings become `None`.
pub(crate) fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS` (treated as UTC) and bare dates.
pub(crate) fn parse_timestamp(field: &str, value: &str) -> Result<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    Err(TrunchbullError::malformed(
        field,
        format!("unrecognized timestamp \"{value}\""),
    ))
}

pub(crate) fn parse_opt_timestamp(field: &str, value: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(v) => parse_timestamp(field, v).map(Some),
        None => Ok(None),
    }
}

pub(crate) fn from_unix(field: &str, secs: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| TrunchbullError::malformed(field, format!("timestamp {secs} out of range")))
}
