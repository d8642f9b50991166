//! Wire shapes of the Schoology REST API (v1).

use serde::Deserialize;
use serde_json::Value;

use crate::providers::{de_flag, de_id, de_opt_f64, de_opt_id};

/// Pagination links attached to every collection response.
#[derive(Debug, Default, Deserialize)]
pub struct Links {
    #[serde(default)]
    pub next: Option<String>,
}

/// A collection page: `{"<key>": [...], "total": n, "links": {...}}`.
#[derive(Debug, Default, Deserialize)]
pub struct Page {
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub links: Links,
}

#[derive(Debug, Deserialize)]
pub struct SchoologySection {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub course_title: Option<String>,
    #[serde(default)]
    pub section_title: Option<String>,
    #[serde(default)]
    pub instructor: Option<String>,
    #[serde(default)]
    pub period: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SchoologyAssignment {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    /// Injected by the client when walking per-section assignment lists.
    #[serde(deserialize_with = "de_id")]
    pub section_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub due: Option<String>,
    #[serde(default, deserialize_with = "de_flag")]
    pub completed: bool,
    #[serde(default, deserialize_with = "de_flag")]
    pub graded: bool,
    #[serde(default)]
    pub status: Option<String>,
}

/// One row of the flattened `/users/{id}/grades` tree.
#[derive(Debug, Deserialize)]
pub struct SchoologyGrade {
    #[serde(deserialize_with = "de_id")]
    pub section_id: String,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub assignment_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub period_id: Option<String>,
    #[serde(default)]
    pub period_title: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub grade: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub max_points: Option<f64>,
    #[serde(default)]
    pub letter_grade: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SchoologyEvent {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SchoologyMessage {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub author_id: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_email: Option<String>,
    #[serde(default)]
    pub last_updated: Option<i64>,
    #[serde(default)]
    pub message_status: Option<String>,
}

/// Final and per-assignment grades for one section, as nested by the API.
#[derive(Debug, Deserialize)]
pub struct SectionGrades {
    #[serde(deserialize_with = "de_id")]
    pub section_id: String,
    #[serde(default)]
    pub period: Vec<PeriodGrades>,
    #[serde(default)]
    pub final_grade: Vec<Value>,
}

#[derive(Debug, Deserialize)]
pub struct PeriodGrades {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub period_id: Option<String>,
    #[serde(default)]
    pub period_title: Option<String>,
    #[serde(default)]
    pub assignment: Vec<Value>,
}
