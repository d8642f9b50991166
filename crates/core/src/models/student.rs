use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::common::Source;

/// A student whose data is aggregated. Root of ownership for all
/// student-scoped records.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Student {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grade_level: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schoology_user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub powerschool_student_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Student {
    /// The student's provider-native identifier, if linked to that provider.
    pub fn external_id(&self, source: Source) -> Option<&str> {
        match source {
            Source::Schoology => self.schoology_user_id.as_deref(),
            Source::PowerSchool => self.powerschool_student_id.as_deref(),
        }
        .filter(|id| !id.is_empty())
    }

    /// Providers this student is linked to.
    pub fn linked_sources(&self) -> Vec<Source> {
        Source::ALL
            .into_iter()
            .filter(|s| self.external_id(*s).is_some())
            .collect()
    }
}

/// Input for creating or updating a student.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NewStudent {
    #[serde(default)]
    pub id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub grade_level: Option<i64>,
    #[serde(default)]
    pub schoology_user_id: Option<String>,
    #[serde(default)]
    pub powerschool_student_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_student() -> Student {
        Student {
            id: "S1".to_string(),
            name: "Matilda Wormwood".to_string(),
            grade_level: Some(9),
            schoology_user_id: Some("1001".to_string()),
            powerschool_student_id: None,
            created_at: Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2025, 9, 1, 8, 0, 0).unwrap(),
        }
    }

    #[test]
    fn external_id_per_source() {
        let student = sample_student();
        assert_eq!(student.external_id(Source::Schoology), Some("1001"));
        assert_eq!(student.external_id(Source::PowerSchool), None);
    }

    #[test]
    fn empty_external_id_is_unlinked() {
        let mut student = sample_student();
        student.powerschool_student_id = Some(String::new());
        assert_eq!(student.linked_sources(), vec![Source::Schoology]);
    }

    #[test]
    fn student_round_trip() {
        let student = sample_student();
        let json = serde_json::to_string(&student).unwrap();
        let back: Student = serde_json::from_str(&json).unwrap();
        assert_eq!(back, student);
        assert!(!json.contains("powerschool_student_id"));
    }

    #[test]
    fn new_student_minimal_json() {
        let input: NewStudent = serde_json::from_str(r#"{"name":"Bruce"}"#).unwrap();
        assert_eq!(input.name, "Bruce");
        assert!(input.id.is_none());
        assert!(input.grade_level.is_none());
    }
}
