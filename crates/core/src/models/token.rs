//! OAuth credential model for per-student provider access.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::common::Source;

/// An OAuth access token issued by a provider on behalf of a student.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OAuthToken {
    pub student_id: String,
    pub source: Source,
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl OAuthToken {
    /// Treat tokens within `skew` of expiry as already expired.
    pub fn is_expired(&self, now: DateTime<Utc>, skew: chrono::Duration) -> bool {
        match self.expires_at {
            Some(exp) => exp - skew <= now,
            None => false,
        }
    }
}
