use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{
    assignment::{Assignment, AssignmentFilter},
    common::Source,
    course::Course,
    event::{Event, EventFilter},
    grade::{Grade, GradeFilter},
    message::{Message, MessageFilter},
    student::{NewStudent, Student},
    sync::{SyncKey, SyncStatusRecord},
    token::OAuthToken,
};
use crate::normalizer::NormalizedRecords;

/// Rows written by one atomic persist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistSummary {
    pub upserted: usize,
    /// Records dropped because the course they reference is not stored.
    pub orphaned: usize,
}

#[async_trait]
pub trait StudentRepository: Send + Sync {
    async fn create_student(&self, student: &NewStudent) -> Result<Student>;
    async fn update_student(&self, id: &str, student: &NewStudent) -> Result<Option<Student>>;
    async fn get_student(&self, id: &str) -> Result<Option<Student>>;
    async fn list_students(&self) -> Result<Vec<Student>>;
    /// Removes the student and, by cascade, every record it owns.
    async fn delete_student(&self, id: &str) -> Result<bool>;
}

#[async_trait]
pub trait CourseRepository: Send + Sync {
    async fn upsert_courses(&self, courses: &[Course]) -> Result<PersistSummary>;
    async fn get_course(&self, id: &str) -> Result<Option<Course>>;
    async fn list_courses(&self, student_id: &str) -> Result<Vec<Course>>;
}

#[async_trait]
pub trait AssignmentRepository: Send + Sync {
    async fn upsert_assignments(&self, assignments: &[Assignment]) -> Result<PersistSummary>;
    async fn list_assignments(
        &self,
        student_id: &str,
        filter: &AssignmentFilter,
    ) -> Result<Vec<Assignment>>;
    async fn count_outstanding_assignments(&self, student_id: &str) -> Result<i64>;
}

#[async_trait]
pub trait GradeRepository: Send + Sync {
    async fn upsert_grades(&self, grades: &[Grade]) -> Result<PersistSummary>;
    async fn list_grades(&self, student_id: &str, filter: &GradeFilter) -> Result<Vec<Grade>>;
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    async fn upsert_events(&self, events: &[Event]) -> Result<PersistSummary>;
    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>>;
    async fn count_upcoming_events(&self, now: DateTime<Utc>) -> Result<i64>;
    async fn delete_event(&self, id: &str) -> Result<bool>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn upsert_messages(&self, messages: &[Message]) -> Result<PersistSummary>;
    async fn list_messages(&self, student_id: &str, filter: &MessageFilter)
        -> Result<Vec<Message>>;
    async fn count_unread_messages(&self, student_id: &str) -> Result<i64>;
}

#[async_trait]
pub trait SyncStatusRepository: Send + Sync {
    async fn get_sync_status(&self, key: &SyncKey) -> Result<Option<SyncStatusRecord>>;
    async fn list_sync_statuses(&self, student_id: Option<&str>) -> Result<Vec<SyncStatusRecord>>;
    async fn mark_sync_in_progress(&self, key: &SyncKey) -> Result<()>;
    async fn mark_sync_failed(&self, key: &SyncKey, error_message: &str) -> Result<()>;
    /// Reset rows left `in_progress` by a process that died mid-sync.
    async fn fail_interrupted_syncs(&self) -> Result<u64>;
}

#[async_trait]
pub trait BatchRepository: Send + Sync {
    /// Upsert one normalized batch and mark the slot successful, all in one
    /// transaction. Nothing is visible unless everything commits.
    async fn persist_batch(
        &self,
        key: &SyncKey,
        records: &NormalizedRecords,
        synced_at: DateTime<Utc>,
    ) -> Result<PersistSummary>;
}

#[async_trait]
pub trait TokenRepository: Send + Sync {
    async fn save_token(&self, token: &OAuthToken) -> Result<()>;
    async fn get_token(&self, student_id: &str, source: Source) -> Result<Option<OAuthToken>>;
    async fn delete_token(&self, student_id: &str, source: Source) -> Result<bool>;
}

/// Umbrella trait for the full store.
pub trait TrunchbullRepository:
    StudentRepository
    + CourseRepository
    + AssignmentRepository
    + GradeRepository
    + EventRepository
    + MessageRepository
    + SyncStatusRepository
    + BatchRepository
    + TokenRepository
{
}
