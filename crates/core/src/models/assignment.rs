use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::common::Source;

/// Canonical assignment state across providers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AssignmentStatus {
    Assigned,
    Submitted,
    Graded,
    Missing,
    Late,
    Excused,
}

impl AssignmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentStatus::Assigned => "assigned",
            AssignmentStatus::Submitted => "submitted",
            AssignmentStatus::Graded => "graded",
            AssignmentStatus::Missing => "missing",
            AssignmentStatus::Late => "late",
            AssignmentStatus::Excused => "excused",
        }
    }

    /// Parse a stored or provider status; `None` for unrecognised values.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "assigned" | "open" | "not_submitted" | "notsubmitted" => Some(Self::Assigned),
            "submitted" | "turned_in" | "turnedin" | "collected" => Some(Self::Submitted),
            "graded" | "scored" => Some(Self::Graded),
            "missing" => Some(Self::Missing),
            "late" => Some(Self::Late),
            "excused" | "exempt" => Some(Self::Excused),
            _ => None,
        }
    }

    /// Work the student still owes.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, Self::Assigned | Self::Missing | Self::Late)
    }
}

/// A piece of coursework.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assignment {
    pub id: String,
    pub student_id: String,
    pub course_id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub due_date: Option<DateTime<Utc>>,
    pub status: AssignmentStatus,
    pub source: Source,
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Filter for listing a student's assignments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AssignmentFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AssignmentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_after: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_before: Option<DateTime<Utc>>,
}
