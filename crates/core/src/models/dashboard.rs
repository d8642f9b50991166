use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    assignment::Assignment, event::Event, grade::Grade, message::Message, student::Student,
    sync::SyncStatusRecord,
};

/// Headline numbers for a student's dashboard.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DashboardSummary {
    pub outstanding_assignments: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_gpa: Option<f64>,
    pub unread_messages: i64,
    pub upcoming_events: i64,
}

/// Unified read-only view assembled from the local store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Dashboard {
    pub student: Student,
    pub summary: DashboardSummary,
    pub assignments: Vec<Assignment>,
    pub grades: Vec<Grade>,
    pub events: Vec<Event>,
    pub messages: Vec<Message>,
    pub sync_status: Vec<SyncStatusRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
}
