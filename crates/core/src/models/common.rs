use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TrunchbullError;

/// Upstream school-information system a record was pulled from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// LMS-style provider (assignments, events, messages).
    Schoology,
    /// SIS-style provider (schedule, final grades).
    #[serde(rename = "powerschool")]
    PowerSchool,
}

impl Source {
    pub const ALL: [Source; 2] = [Source::Schoology, Source::PowerSchool];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Schoology => "schoology",
            Source::PowerSchool => "powerschool",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = TrunchbullError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schoology" => Ok(Source::Schoology),
            "powerschool" => Ok(Source::PowerSchool),
            other => Err(TrunchbullError::NotFound(format!("provider '{other}'"))),
        }
    }
}

/// Kind of data synchronized per (student, source).
///
/// The declaration order is the sync order: courses must land before the
/// assignments and grades that reference them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Courses,
    Assignments,
    Grades,
    Events,
    Messages,
}

impl DataType {
    pub const ALL: [DataType; 5] = [
        DataType::Courses,
        DataType::Assignments,
        DataType::Grades,
        DataType::Events,
        DataType::Messages,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Courses => "courses",
            DataType::Assignments => "assignments",
            DataType::Grades => "grades",
            DataType::Events => "events",
            DataType::Messages => "messages",
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = TrunchbullError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DataType::ALL
            .into_iter()
            .find(|dt| dt.as_str() == s)
            .ok_or_else(|| TrunchbullError::NotFound(format!("data type '{s}'")))
    }
}

/// Stable local id for a student-scoped record.
///
/// Derived from the natural key so that re-syncing the same upstream record
/// always yields the same id.
pub fn entity_id(student_id: &str, source: Source, kind: &str, external_id: &str) -> String {
    let name = format!("{student_id}/{source}/{kind}/{external_id}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Stable local id for a record shared across students (calendar events).
pub fn shared_entity_id(source: Source, kind: &str, external_id: &str) -> String {
    let name = format!("{source}/{kind}/{external_id}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}
