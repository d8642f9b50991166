use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::common::Source;

/// A course section a student is enrolled in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Course {
    pub id: String,
    pub student_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub teacher: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
    pub source: Source,
    pub external_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn course_optional_fields_omitted() {
        let course = Course {
            id: "c-1".to_string(),
            student_id: "S1".to_string(),
            name: "Algebra I".to_string(),
            teacher: None,
            period: None,
            source: Source::PowerSchool,
            external_id: "sec-9".to_string(),
            updated_at: None,
        };
        let json = serde_json::to_string(&course).unwrap();
        assert!(!json.contains("teacher"));
        assert!(!json.contains("updated_at"));
        assert!(json.contains("\"source\":\"powerschool\""));
    }
}
