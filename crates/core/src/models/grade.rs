use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::common::Source;

/// A recorded score, either for one assignment or a period/course average.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Grade {
    pub id: String,
    pub student_id: String,
    pub course_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub letter_grade: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grading_period: Option<String>,
    pub source: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Grade {
    /// Course-level grades carry no assignment link.
    pub fn is_course_level(&self) -> bool {
        self.assignment_id.is_none()
    }
}

/// `score / max_score * 100`, or `None` when there is no positive maximum.
pub fn percentage(score: Option<f64>, max_score: Option<f64>) -> Option<f64> {
    match (score, max_score) {
        (Some(s), Some(m)) if m > 0.0 => Some(s / m * 100.0),
        _ => None,
    }
}

/// Filter for listing a student's grades.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GradeFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grading_period: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
}
