use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::common::{DataType, Source};

/// Lifecycle of one (student, source, data type) sync slot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    NeverSynced,
    InProgress,
    Success,
    Failed,
}

impl SyncState {
    pub const ALL: [SyncState; 4] = [
        SyncState::NeverSynced,
        SyncState::InProgress,
        SyncState::Success,
        SyncState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::NeverSynced => "never_synced",
            SyncState::InProgress => "in_progress",
            SyncState::Success => "success",
            SyncState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "in_progress" => SyncState::InProgress,
            "success" => SyncState::Success,
            "failed" => SyncState::Failed,
            _ => SyncState::NeverSynced,
        }
    }

    /// Allowed moves: never_synced/success/failed -> in_progress,
    /// in_progress -> success/failed.
    pub fn can_transition_to(&self, next: SyncState) -> bool {
        use SyncState::*;
        matches!(
            (self, next),
            (NeverSynced, InProgress)
                | (Success, InProgress)
                | (Failed, InProgress)
                | (InProgress, Success)
                | (InProgress, Failed)
        )
    }
}

/// Identity of a sync slot; also the single-flight key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SyncKey {
    pub student_id: String,
    pub source: Source,
    pub data_type: DataType,
}

impl SyncKey {
    pub fn new(student_id: impl Into<String>, source: Source, data_type: DataType) -> Self {
        Self {
            student_id: student_id.into(),
            source,
            data_type,
        }
    }
}

impl fmt::Display for SyncKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.student_id, self.source, self.data_type)
    }
}

/// Persisted freshness record, exactly one per [`SyncKey`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncStatusRecord {
    pub student_id: String,
    pub source: Source,
    pub data_type: DataType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<DateTime<Utc>>,
    pub status: SyncState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl SyncStatusRecord {
    /// Placeholder for a slot with no row yet.
    pub fn never_synced(key: &SyncKey) -> Self {
        Self {
            student_id: key.student_id.clone(),
            source: key.source,
            data_type: key.data_type,
            last_sync: None,
            status: SyncState::NeverSynced,
            error_message: None,
        }
    }

    /// Whether the last successful sync is younger than `ttl`.
    pub fn is_fresh(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        if self.status != SyncState::Success {
            return false;
        }
        match self.last_sync {
            Some(last) => now - last < ttl,
            None => false,
        }
    }
}
