//! Read-only dashboard composition over the local store.

use std::sync::Arc;

use chrono::Utc;
use tracing::debug;

use crate::db::repository::TrunchbullRepository;
use crate::error::{Result, TrunchbullError};
use crate::models::assignment::{Assignment, AssignmentFilter};
use crate::models::dashboard::{Dashboard, DashboardSummary};
use crate::models::event::{Event, EventFilter};
use crate::models::grade::{Grade, GradeFilter};
use crate::models::message::{Message, MessageFilter};
use crate::models::student::Student;

/// Maps stored grades to a single GPA figure.
pub trait GpaPolicy: Send + Sync {
    /// Grade points for one percentage.
    fn points(&self, percentage: f64) -> f64;

    /// Equal-weight average over course-level grades, or over every graded
    /// row when the student has no course-level grades yet. `None` when
    /// nothing has a percentage.
    fn compute(&self, grades: &[Grade]) -> Option<f64> {
        let course_level: Vec<f64> = grades
            .iter()
            .filter(|g| g.is_course_level())
            .filter_map(|g| g.percentage)
            .collect();
        let pcts = if course_level.is_empty() {
            grades.iter().filter_map(|g| g.percentage).collect()
        } else {
            course_level
        };
        if pcts.is_empty() {
            return None;
        }
        let total: f64 = pcts.iter().map(|p| self.points(*p)).sum();
        Some(round2(total / pcts.len() as f64))
    }
}

/// Letter bands on a 4.0 scale: 90+ is 4.0, 80+ is 3.0, 70+ is 2.0, 60+ is 1.0.
#[derive(Debug, Clone, Copy, Default)]
pub struct FourPointScale;

impl GpaPolicy for FourPointScale {
    fn points(&self, percentage: f64) -> f64 {
        match percentage {
            p if p >= 90.0 => 4.0,
            p if p >= 80.0 => 3.0,
            p if p >= 70.0 => 2.0,
            p if p >= 60.0 => 1.0,
            _ => 0.0,
        }
    }
}

/// Straight proportional mapping, `pct / 100 * 4`, clamped to 0..=4.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearScale;

impl GpaPolicy for LinearScale {
    fn points(&self, percentage: f64) -> f64 {
        (percentage / 100.0 * 4.0).clamp(0.0, 4.0)
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Builds dashboard views from stored data only. Never calls a provider and
/// never writes.
pub struct DashboardAggregator<R> {
    repo: R,
    gpa: Arc<dyn GpaPolicy>,
}

impl<R: TrunchbullRepository> DashboardAggregator<R> {
    pub fn new(repo: R) -> Self {
        Self::with_policy(repo, Arc::new(FourPointScale))
    }

    pub fn with_policy(repo: R, gpa: Arc<dyn GpaPolicy>) -> Self {
        Self { repo, gpa }
    }

    async fn student(&self, student_id: &str) -> Result<Student> {
        self.repo
            .get_student(student_id)
            .await?
            .ok_or_else(|| TrunchbullError::NotFound(format!("student '{student_id}'")))
    }

    pub async fn dashboard(&self, student_id: &str) -> Result<Dashboard> {
        let student = self.student(student_id).await?;
        let now = Utc::now();

        let assignments = self
            .repo
            .list_assignments(student_id, &AssignmentFilter::default())
            .await?;
        let grades = self.repo.list_grades(student_id, &GradeFilter::default()).await?;
        let events = self
            .repo
            .list_events(&EventFilter {
                from: Some(now),
                ..Default::default()
            })
            .await?;
        let messages = self
            .repo
            .list_messages(student_id, &MessageFilter::default())
            .await?;
        let sync_status = self.repo.list_sync_statuses(Some(student_id)).await?;

        let summary = DashboardSummary {
            outstanding_assignments: self.repo.count_outstanding_assignments(student_id).await?,
            current_gpa: self.gpa.compute(&grades),
            unread_messages: self.repo.count_unread_messages(student_id).await?,
            upcoming_events: self.repo.count_upcoming_events(now).await?,
        };
        let last_sync = sync_status.iter().filter_map(|s| s.last_sync).max();

        debug!(
            student_id,
            assignments = assignments.len(),
            grades = grades.len(),
            events = events.len(),
            messages = messages.len(),
            "Dashboard assembled"
        );

        Ok(Dashboard {
            student,
            summary,
            assignments,
            grades,
            events,
            messages,
            sync_status,
            last_sync,
        })
    }

    pub async fn assignments(
        &self,
        student_id: &str,
        filter: &AssignmentFilter,
    ) -> Result<Vec<Assignment>> {
        self.student(student_id).await?;
        self.repo.list_assignments(student_id, filter).await
    }

    pub async fn grades(&self, student_id: &str, filter: &GradeFilter) -> Result<Vec<Grade>> {
        self.student(student_id).await?;
        self.repo.list_grades(student_id, filter).await
    }

    pub async fn events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        self.repo.list_events(filter).await
    }

    pub async fn messages(&self, student_id: &str, filter: &MessageFilter) -> Result<Vec<Message>> {
        self.student(student_id).await?;
        self.repo.list_messages(student_id, filter).await
    }

    pub async fn gpa(&self, student_id: &str) -> Result<Option<f64>> {
        self.student(student_id).await?;
        let grades = self.repo.list_grades(student_id, &GradeFilter::default()).await?;
        Ok(self.gpa.compute(&grades))
    }
}
