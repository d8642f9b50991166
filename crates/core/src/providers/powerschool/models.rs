//! Wire shapes of the PowerSchool student API (`/ws/v1`).

use serde::Deserialize;

use crate::providers::{de_flag, de_id, de_opt_id, de_opt_f64};

#[derive(Debug, Deserialize)]
pub struct PsSection {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub course_name: Option<String>,
    #[serde(default)]
    pub teacher_name: Option<String>,
    /// Period/day expression, e.g. `2(A)`.
    #[serde(default)]
    pub expression: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PsAssignment {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(deserialize_with = "de_id")]
    pub section_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PsGrade {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(deserialize_with = "de_id")]
    pub section_id: String,
    #[serde(default, deserialize_with = "de_opt_id")]
    pub assignment_id: Option<String>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub score: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub points_possible: Option<f64>,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub percent: Option<f64>,
    #[serde(default)]
    pub letter_grade: Option<String>,
    /// Grading term code, e.g. `Q1` or `S1`.
    #[serde(default)]
    pub store_code: Option<String>,
    #[serde(default)]
    pub date_stored: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PsEvent {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default, rename = "type")]
    pub event_type: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PsNotification {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub from_email: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub sent_at: Option<String>,
    #[serde(default, deserialize_with = "de_flag")]
    pub read: bool,
}
