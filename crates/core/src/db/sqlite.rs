use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::crypto;
use crate::error::{Result, TrunchbullError};
use crate::models::{
    assignment::{Assignment, AssignmentFilter, AssignmentStatus},
    common::{DataType, Source},
    course::Course,
    event::{Event, EventFilter},
    grade::{Grade, GradeFilter},
    message::{Message, MessageFilter},
    student::{NewStudent, Student},
    sync::{SyncKey, SyncState, SyncStatusRecord},
    token::OAuthToken,
};
use crate::normalizer::NormalizedRecords;

use super::repository::{
    AssignmentRepository, BatchRepository, CourseRepository, EventRepository, GradeRepository,
    MessageRepository, PersistSummary, StudentRepository, SyncStatusRepository, TokenRepository,
    TrunchbullRepository,
};

#[derive(Clone)]
pub struct SqliteRepository {
    pool: SqlitePool,
    token_key: Option<[u8; 32]>,
}

impl SqliteRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            token_key: None,
        }
    }

    /// Encrypt OAuth tokens at rest with the given key.
    pub fn with_token_key(mut self, key: [u8; 32]) -> Self {
        self.token_key = Some(key);
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl TrunchbullRepository for SqliteRepository {}

// -- Helper functions for converting between DB strings and model types --

fn datetime_to_str(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn try_parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    match DateTime::parse_from_rfc3339(s) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            warn!(value = s, error = %e, "Unparseable timestamp in database");
            None
        }
    }
}

/// Required audit columns fall back to the current time when corrupt.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    try_parse_datetime(s).unwrap_or_else(Utc::now)
}

/// Optional columns (including `last_sync`) read a corrupt value as absent,
/// so a broken sync timestamp never counts as fresh.
fn parse_opt_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|v| try_parse_datetime(&v))
}

fn parse_source(s: &str) -> Source {
    s.parse().unwrap_or(Source::Schoology)
}

fn parse_data_type(s: &str) -> DataType {
    s.parse().unwrap_or(DataType::Courses)
}

fn parse_assignment_status(s: &str) -> AssignmentStatus {
    AssignmentStatus::parse(s).unwrap_or(AssignmentStatus::Assigned)
}

fn row_to_student(r: &SqliteRow) -> Student {
    Student {
        id: r.get("id"),
        name: r.get("name"),
        grade_level: r.get("grade_level"),
        schoology_user_id: r.get("schoology_user_id"),
        powerschool_student_id: r.get("powerschool_student_id"),
        created_at: parse_datetime(r.get("created_at")),
        updated_at: parse_datetime(r.get("updated_at")),
    }
}

fn row_to_course(r: &SqliteRow) -> Course {
    Course {
        id: r.get("id"),
        student_id: r.get("student_id"),
        name: r.get("name"),
        teacher: r.get("teacher"),
        period: r.get("period"),
        source: parse_source(r.get("source")),
        external_id: r.get("external_id"),
        updated_at: Some(parse_datetime(r.get("updated_at"))),
    }
}

fn row_to_assignment(r: &SqliteRow) -> Assignment {
    Assignment {
        id: r.get("id"),
        student_id: r.get("student_id"),
        course_id: r.get("course_id"),
        title: r.get("title"),
        description: r.get("description"),
        due_date: parse_opt_datetime(r.get("due_date")),
        status: parse_assignment_status(r.get("status")),
        source: parse_source(r.get("source")),
        external_id: r.get("external_id"),
        updated_at: Some(parse_datetime(r.get("updated_at"))),
    }
}

fn row_to_grade(r: &SqliteRow) -> Grade {
    Grade {
        id: r.get("id"),
        student_id: r.get("student_id"),
        course_id: r.get("course_id"),
        assignment_id: r.get("assignment_id"),
        score: r.get("score"),
        max_score: r.get("max_score"),
        percentage: r.get("percentage"),
        letter_grade: r.get("letter_grade"),
        grading_period: r.get("grading_period"),
        source: parse_source(r.get("source")),
        external_id: r.get("external_id"),
        recorded_at: parse_opt_datetime(r.get("recorded_at")),
        updated_at: Some(parse_datetime(r.get("updated_at"))),
    }
}

fn row_to_event(r: &SqliteRow) -> Event {
    Event {
        id: r.get("id"),
        title: r.get("title"),
        description: r.get("description"),
        event_date: parse_datetime(r.get("event_date")),
        event_type: r.get("event_type"),
        source: parse_source(r.get("source")),
        external_id: r.get("external_id"),
        updated_at: Some(parse_datetime(r.get("updated_at"))),
    }
}

fn row_to_message(r: &SqliteRow) -> Message {
    Message {
        id: r.get("id"),
        student_id: r.get("student_id"),
        from_name: r.get("from_name"),
        from_email: r.get("from_email"),
        subject: r.get("subject"),
        body: r.get("body"),
        received_at: parse_opt_datetime(r.get("received_at")),
        read: r.get::<i64, _>("read") != 0,
        source: parse_source(r.get("source")),
        external_id: r.get("external_id"),
        updated_at: Some(parse_datetime(r.get("updated_at"))),
    }
}

fn row_to_sync_status(r: &SqliteRow) -> SyncStatusRecord {
    SyncStatusRecord {
        student_id: r.get("student_id"),
        source: parse_source(r.get("source")),
        data_type: parse_data_type(r.get("data_type")),
        last_sync: parse_opt_datetime(r.get("last_sync")),
        status: SyncState::parse(r.get("status")),
        error_message: r.get("error_message"),
    }
}

const COURSE_COLUMNS: &str =
    "id, student_id, name, teacher, period, source, external_id, updated_at";
const ASSIGNMENT_COLUMNS: &str = "id, student_id, course_id, title, description, due_date, status, source, external_id, updated_at";
const GRADE_COLUMNS: &str = "id, student_id, course_id, assignment_id, score, max_score, percentage, letter_grade, grading_period, source, external_id, recorded_at, updated_at";
const EVENT_COLUMNS: &str =
    "id, title, description, event_date, event_type, source, external_id, updated_at";
const MESSAGE_COLUMNS: &str = "id, student_id, from_name, from_email, subject, body, received_at, read, source, external_id, updated_at";

// -- Upsert primitives shared by single-type writes and batch persists --

async fn course_exists(conn: &mut SqliteConnection, id: &str, student_id: &str) -> Result<bool> {
    let row = sqlx::query("SELECT 1 FROM courses WHERE id = ?1 AND student_id = ?2")
        .bind(id)
        .bind(student_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

async fn assignment_exists(conn: &mut SqliteConnection, id: &str) -> Result<bool> {
    let row = sqlx::query("SELECT 1 FROM assignments WHERE id = ?1")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

async fn write_courses(
    conn: &mut SqliteConnection,
    courses: &[Course],
    now: &str,
) -> Result<PersistSummary> {
    let mut summary = PersistSummary::default();
    for course in courses {
        sqlx::query(
            "INSERT INTO courses (id, student_id, name, teacher, period, source, external_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT (student_id, source, external_id) DO UPDATE SET
                name = excluded.name,
                teacher = excluded.teacher,
                period = excluded.period,
                updated_at = excluded.updated_at",
        )
        .bind(&course.id)
        .bind(&course.student_id)
        .bind(&course.name)
        .bind(&course.teacher)
        .bind(&course.period)
        .bind(course.source.as_str())
        .bind(&course.external_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        summary.upserted += 1;
    }
    Ok(summary)
}

async fn write_assignments(
    conn: &mut SqliteConnection,
    assignments: &[Assignment],
    now: &str,
) -> Result<PersistSummary> {
    let mut summary = PersistSummary::default();
    for a in assignments {
        if !course_exists(conn, &a.course_id, &a.student_id).await? {
            warn!(external_id = %a.external_id, course_id = %a.course_id, "Skipping assignment for unknown course");
            summary.orphaned += 1;
            continue;
        }
        sqlx::query(
            "INSERT INTO assignments (id, student_id, course_id, title, description, due_date, status, source, external_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT (student_id, source, external_id) DO UPDATE SET
                course_id = excluded.course_id,
                title = excluded.title,
                description = excluded.description,
                due_date = excluded.due_date,
                status = excluded.status,
                updated_at = excluded.updated_at",
        )
        .bind(&a.id)
        .bind(&a.student_id)
        .bind(&a.course_id)
        .bind(&a.title)
        .bind(&a.description)
        .bind(a.due_date.as_ref().map(datetime_to_str))
        .bind(a.status.as_str())
        .bind(a.source.as_str())
        .bind(&a.external_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        summary.upserted += 1;
    }
    Ok(summary)
}

async fn write_grades(
    conn: &mut SqliteConnection,
    grades: &[Grade],
    now: &str,
) -> Result<PersistSummary> {
    let mut summary = PersistSummary::default();
    for g in grades {
        if !course_exists(conn, &g.course_id, &g.student_id).await? {
            warn!(external_id = ?g.external_id, course_id = %g.course_id, "Skipping grade for unknown course");
            summary.orphaned += 1;
            continue;
        }
        if let Some(ref assignment_id) = g.assignment_id {
            if !assignment_exists(conn, assignment_id).await? {
                warn!(external_id = ?g.external_id, assignment_id = %assignment_id, "Skipping grade for unknown assignment");
                summary.orphaned += 1;
                continue;
            }
        }
        sqlx::query(
            "INSERT INTO grades (id, student_id, course_id, assignment_id, score, max_score, percentage, letter_grade, grading_period, source, external_id, recorded_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13)
             ON CONFLICT (student_id, source, external_id) DO UPDATE SET
                course_id = excluded.course_id,
                assignment_id = excluded.assignment_id,
                score = excluded.score,
                max_score = excluded.max_score,
                percentage = excluded.percentage,
                letter_grade = excluded.letter_grade,
                grading_period = excluded.grading_period,
                recorded_at = excluded.recorded_at,
                updated_at = excluded.updated_at",
        )
        .bind(&g.id)
        .bind(&g.student_id)
        .bind(&g.course_id)
        .bind(&g.assignment_id)
        .bind(g.score)
        .bind(g.max_score)
        .bind(g.percentage)
        .bind(&g.letter_grade)
        .bind(&g.grading_period)
        .bind(g.source.as_str())
        .bind(&g.external_id)
        .bind(g.recorded_at.as_ref().map(datetime_to_str))
        .bind(now)
        .execute(&mut *conn)
        .await?;
        summary.upserted += 1;
    }
    Ok(summary)
}

async fn write_events(
    conn: &mut SqliteConnection,
    events: &[Event],
    now: &str,
) -> Result<PersistSummary> {
    let mut summary = PersistSummary::default();
    for e in events {
        sqlx::query(
            "INSERT INTO events (id, title, description, event_date, event_type, source, external_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
             ON CONFLICT (source, external_id) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                event_date = excluded.event_date,
                event_type = excluded.event_type,
                updated_at = excluded.updated_at",
        )
        .bind(&e.id)
        .bind(&e.title)
        .bind(&e.description)
        .bind(datetime_to_str(&e.event_date))
        .bind(&e.event_type)
        .bind(e.source.as_str())
        .bind(&e.external_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        summary.upserted += 1;
    }
    Ok(summary)
}

async fn write_messages(
    conn: &mut SqliteConnection,
    messages: &[Message],
    now: &str,
) -> Result<PersistSummary> {
    let mut summary = PersistSummary::default();
    for m in messages {
        sqlx::query(
            "INSERT INTO messages (id, student_id, from_name, from_email, subject, body, received_at, read, source, external_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             ON CONFLICT (student_id, source, external_id) DO UPDATE SET
                from_name = excluded.from_name,
                from_email = excluded.from_email,
                subject = excluded.subject,
                body = excluded.body,
                received_at = excluded.received_at,
                read = excluded.read,
                updated_at = excluded.updated_at",
        )
        .bind(&m.id)
        .bind(&m.student_id)
        .bind(&m.from_name)
        .bind(&m.from_email)
        .bind(&m.subject)
        .bind(&m.body)
        .bind(m.received_at.as_ref().map(datetime_to_str))
        .bind(m.read as i64)
        .bind(m.source.as_str())
        .bind(&m.external_id)
        .bind(now)
        .execute(&mut *conn)
        .await?;
        summary.upserted += 1;
    }
    Ok(summary)
}

async fn write_records(
    conn: &mut SqliteConnection,
    records: &NormalizedRecords,
    now: &str,
) -> Result<PersistSummary> {
    match records {
        NormalizedRecords::Courses(v) => write_courses(conn, v, now).await,
        NormalizedRecords::Assignments(v) => write_assignments(conn, v, now).await,
        NormalizedRecords::Grades(v) => write_grades(conn, v, now).await,
        NormalizedRecords::Events(v) => write_events(conn, v, now).await,
        NormalizedRecords::Messages(v) => write_messages(conn, v, now).await,
    }
}

async fn write_sync_state(
    conn: &mut SqliteConnection,
    key: &SyncKey,
    state: SyncState,
    last_sync: Option<&str>,
    error_message: Option<&str>,
) -> Result<()> {
    // Only rows whose current status may move to `state` are touched; a
    // missing row counts as never_synced.
    let allowed: Vec<String> = SyncState::ALL
        .iter()
        .filter(|from| from.can_transition_to(state))
        .map(|from| format!("'{}'", from.as_str()))
        .collect();
    let allowed = allowed.join(", ");

    // last_sync only moves forward on success; other states keep the old value.
    let sql = if SyncState::NeverSynced.can_transition_to(state) {
        format!(
            "INSERT INTO sync_status (student_id, source, data_type, last_sync, status, error_message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (student_id, source, data_type) DO UPDATE SET
                last_sync = COALESCE(excluded.last_sync, sync_status.last_sync),
                status = excluded.status,
                error_message = excluded.error_message
             WHERE sync_status.status IN ({allowed})"
        )
    } else {
        format!(
            "UPDATE sync_status SET
                last_sync = COALESCE(?4, last_sync),
                status = ?5,
                error_message = ?6
             WHERE student_id = ?1 AND source = ?2 AND data_type = ?3
               AND status IN ({allowed})"
        )
    };

    let result = sqlx::query(&sql)
        .bind(&key.student_id)
        .bind(key.source.as_str())
        .bind(key.data_type.as_str())
        .bind(last_sync)
        .bind(state.as_str())
        .bind(error_message)
        .execute(&mut *conn)
        .await?;
    if result.rows_affected() == 0 {
        warn!(key = %key, to = state.as_str(), "Rejected illegal sync state transition");
        return Err(TrunchbullError::Conflict(format!(
            "sync {key} cannot move to {}",
            state.as_str()
        )));
    }
    Ok(())
}

impl SqliteRepository {
    async fn write_in_tx(&self, records: &NormalizedRecords) -> Result<PersistSummary> {
        let now = datetime_to_str(&Utc::now());
        let mut tx = self.pool.begin().await?;
        let summary = write_records(&mut tx, records, &now).await?;
        tx.commit().await?;
        Ok(summary)
    }

    fn seal_token_value(&self, value: &str) -> Result<String> {
        match self.token_key {
            Some(ref key) => crypto::seal(key, value),
            None => Ok(value.to_string()),
        }
    }

    fn open_token_value(&self, value: String, encrypted: bool) -> Result<String> {
        if !encrypted {
            return Ok(value);
        }
        let key = self.token_key.as_ref().ok_or_else(|| {
            TrunchbullError::Crypto("token is encrypted but no encryption key is configured".into())
        })?;
        crypto::open(key, &value)
    }
}

// -- StudentRepository --

#[async_trait]
impl StudentRepository for SqliteRepository {
    async fn create_student(&self, student: &NewStudent) -> Result<Student> {
        let id = student
            .id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let now = datetime_to_str(&Utc::now());
        sqlx::query(
            "INSERT INTO students (id, name, grade_level, schoology_user_id, powerschool_student_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        )
        .bind(&id)
        .bind(&student.name)
        .bind(student.grade_level)
        .bind(&student.schoology_user_id)
        .bind(&student.powerschool_student_id)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                TrunchbullError::Conflict(format!("student '{id}' already exists"))
            }
            other => other.into(),
        })?;

        self.get_student(&id)
            .await?
            .ok_or_else(|| TrunchbullError::NotFound(format!("student '{id}'")))
    }

    async fn update_student(&self, id: &str, student: &NewStudent) -> Result<Option<Student>> {
        let result = sqlx::query(
            "UPDATE students SET name = ?2, grade_level = ?3, schoology_user_id = ?4,
                powerschool_student_id = ?5, updated_at = ?6
             WHERE id = ?1",
        )
        .bind(id)
        .bind(&student.name)
        .bind(student.grade_level)
        .bind(&student.schoology_user_id)
        .bind(&student.powerschool_student_id)
        .bind(datetime_to_str(&Utc::now()))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_student(id).await
    }

    async fn get_student(&self, id: &str) -> Result<Option<Student>> {
        let row = sqlx::query("SELECT * FROM students WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_student))
    }

    async fn list_students(&self) -> Result<Vec<Student>> {
        let rows = sqlx::query("SELECT * FROM students ORDER BY name, id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_student).collect())
    }

    async fn delete_student(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM students WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// -- CourseRepository --

#[async_trait]
impl CourseRepository for SqliteRepository {
    async fn upsert_courses(&self, courses: &[Course]) -> Result<PersistSummary> {
        self.write_in_tx(&NormalizedRecords::Courses(courses.to_vec()))
            .await
    }

    async fn get_course(&self, id: &str) -> Result<Option<Course>> {
        let sql = format!("SELECT {COURSE_COLUMNS} FROM courses WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_course))
    }

    async fn list_courses(&self, student_id: &str) -> Result<Vec<Course>> {
        let sql = format!(
            "SELECT {COURSE_COLUMNS} FROM courses WHERE student_id = ?1 ORDER BY period, name"
        );
        let rows = sqlx::query(&sql)
            .bind(student_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_course).collect())
    }
}

// -- AssignmentRepository --

#[async_trait]
impl AssignmentRepository for SqliteRepository {
    async fn upsert_assignments(&self, assignments: &[Assignment]) -> Result<PersistSummary> {
        self.write_in_tx(&NormalizedRecords::Assignments(assignments.to_vec()))
            .await
    }

    async fn list_assignments(
        &self,
        student_id: &str,
        filter: &AssignmentFilter,
    ) -> Result<Vec<Assignment>> {
        let mut sql = format!("SELECT {ASSIGNMENT_COLUMNS} FROM assignments WHERE student_id = ?");
        let mut binds: Vec<String> = vec![student_id.to_string()];

        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            binds.push(status.as_str().to_string());
        }
        if let Some(ref course_id) = filter.course_id {
            sql.push_str(" AND course_id = ?");
            binds.push(course_id.clone());
        }
        if let Some(ref after) = filter.due_after {
            sql.push_str(" AND due_date >= ?");
            binds.push(datetime_to_str(after));
        }
        if let Some(ref before) = filter.due_before {
            sql.push_str(" AND due_date < ?");
            binds.push(datetime_to_str(before));
        }
        sql.push_str(" ORDER BY due_date IS NULL, due_date, title");

        let mut query = sqlx::query(&sql);
        for b in &binds {
            query = query.bind(b);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_assignment).collect())
    }

    async fn count_outstanding_assignments(&self, student_id: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM assignments
             WHERE student_id = ?1 AND status IN ('assigned', 'missing', 'late')",
        )
        .bind(student_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }
}

// -- GradeRepository --

#[async_trait]
impl GradeRepository for SqliteRepository {
    async fn upsert_grades(&self, grades: &[Grade]) -> Result<PersistSummary> {
        self.write_in_tx(&NormalizedRecords::Grades(grades.to_vec()))
            .await
    }

    async fn list_grades(&self, student_id: &str, filter: &GradeFilter) -> Result<Vec<Grade>> {
        let mut sql = format!("SELECT {GRADE_COLUMNS} FROM grades WHERE student_id = ?");
        let mut binds: Vec<String> = vec![student_id.to_string()];

        if let Some(ref course_id) = filter.course_id {
            sql.push_str(" AND course_id = ?");
            binds.push(course_id.clone());
        }
        if let Some(ref period) = filter.grading_period {
            sql.push_str(" AND grading_period = ?");
            binds.push(period.clone());
        }
        if let Some(source) = filter.source {
            sql.push_str(" AND source = ?");
            binds.push(source.as_str().to_string());
        }
        sql.push_str(" ORDER BY course_id, recorded_at DESC, id");

        let mut query = sqlx::query(&sql);
        for b in &binds {
            query = query.bind(b);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_grade).collect())
    }
}

// -- EventRepository --

#[async_trait]
impl EventRepository for SqliteRepository {
    async fn upsert_events(&self, events: &[Event]) -> Result<PersistSummary> {
        self.write_in_tx(&NormalizedRecords::Events(events.to_vec()))
            .await
    }

    async fn list_events(&self, filter: &EventFilter) -> Result<Vec<Event>> {
        let mut sql = format!("SELECT {EVENT_COLUMNS} FROM events WHERE 1=1");
        let mut binds: Vec<String> = Vec::new();

        if let Some(ref from) = filter.from {
            sql.push_str(" AND event_date >= ?");
            binds.push(datetime_to_str(from));
        }
        if let Some(ref to) = filter.to {
            sql.push_str(" AND event_date < ?");
            binds.push(datetime_to_str(to));
        }
        if let Some(source) = filter.source {
            sql.push_str(" AND source = ?");
            binds.push(source.as_str().to_string());
        }
        sql.push_str(" ORDER BY event_date, title");

        let mut query = sqlx::query(&sql);
        for b in &binds {
            query = query.bind(b);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_event).collect())
    }

    async fn count_upcoming_events(&self, now: DateTime<Utc>) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM events WHERE event_date >= ?1")
            .bind(datetime_to_str(&now))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn delete_event(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM events WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// -- MessageRepository --

#[async_trait]
impl MessageRepository for SqliteRepository {
    async fn upsert_messages(&self, messages: &[Message]) -> Result<PersistSummary> {
        self.write_in_tx(&NormalizedRecords::Messages(messages.to_vec()))
            .await
    }

    async fn list_messages(
        &self,
        student_id: &str,
        filter: &MessageFilter,
    ) -> Result<Vec<Message>> {
        let mut sql = format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE student_id = ?");
        let mut binds: Vec<String> = vec![student_id.to_string()];

        if filter.unread_only {
            sql.push_str(" AND read = 0");
        }
        if let Some(ref since) = filter.since {
            sql.push_str(" AND received_at >= ?");
            binds.push(datetime_to_str(since));
        }
        sql.push_str(" ORDER BY received_at DESC, id");

        let mut query = sqlx::query(&sql);
        for b in &binds {
            query = query.bind(b);
        }
        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_message).collect())
    }

    async fn count_unread_messages(&self, student_id: &str) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM messages WHERE student_id = ?1 AND read = 0")
                .bind(student_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

// -- SyncStatusRepository --

#[async_trait]
impl SyncStatusRepository for SqliteRepository {
    async fn get_sync_status(&self, key: &SyncKey) -> Result<Option<SyncStatusRecord>> {
        let row = sqlx::query(
            "SELECT student_id, source, data_type, last_sync, status, error_message FROM sync_status
             WHERE student_id = ?1 AND source = ?2 AND data_type = ?3",
        )
        .bind(&key.student_id)
        .bind(key.source.as_str())
        .bind(key.data_type.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_sync_status))
    }

    async fn list_sync_statuses(&self, student_id: Option<&str>) -> Result<Vec<SyncStatusRecord>> {
        let rows = match student_id {
            Some(id) => {
                sqlx::query(
                    "SELECT student_id, source, data_type, last_sync, status, error_message FROM sync_status
                     WHERE student_id = ?1 ORDER BY source, data_type",
                )
                .bind(id)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT student_id, source, data_type, last_sync, status, error_message FROM sync_status
                     ORDER BY student_id, source, data_type",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.iter().map(row_to_sync_status).collect())
    }

    async fn mark_sync_in_progress(&self, key: &SyncKey) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_sync_state(&mut conn, key, SyncState::InProgress, None, None).await
    }

    async fn mark_sync_failed(&self, key: &SyncKey, error_message: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_sync_state(&mut conn, key, SyncState::Failed, None, Some(error_message)).await
    }

    async fn fail_interrupted_syncs(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sync_status SET status = 'failed', error_message = 'interrupted'
             WHERE status = 'in_progress'",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

// -- BatchRepository --

#[async_trait]
impl BatchRepository for SqliteRepository {
    async fn persist_batch(
        &self,
        key: &SyncKey,
        records: &NormalizedRecords,
        synced_at: DateTime<Utc>,
    ) -> Result<PersistSummary> {
        let now = datetime_to_str(&synced_at);
        let mut tx = self.pool.begin().await?;
        let summary = write_records(&mut tx, records, &now).await?;
        write_sync_state(&mut tx, key, SyncState::Success, Some(&now), None).await?;
        tx.commit().await?;
        debug!(key = %key, upserted = summary.upserted, orphaned = summary.orphaned, "Batch persisted");
        Ok(summary)
    }
}

// -- TokenRepository --

#[async_trait]
impl TokenRepository for SqliteRepository {
    async fn save_token(&self, token: &OAuthToken) -> Result<()> {
        let access = self.seal_token_value(&token.access_token)?;
        let refresh = token
            .refresh_token
            .as_deref()
            .map(|r| self.seal_token_value(r))
            .transpose()?;
        sqlx::query(
            "INSERT INTO oauth_tokens (student_id, source, access_token, refresh_token, expires_at, encrypted, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (student_id, source) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                encrypted = excluded.encrypted,
                updated_at = excluded.updated_at",
        )
        .bind(&token.student_id)
        .bind(token.source.as_str())
        .bind(access)
        .bind(refresh)
        .bind(token.expires_at.as_ref().map(datetime_to_str))
        .bind(self.token_key.is_some() as i64)
        .bind(datetime_to_str(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_token(&self, student_id: &str, source: Source) -> Result<Option<OAuthToken>> {
        let row = sqlx::query(
            "SELECT access_token, refresh_token, expires_at, encrypted FROM oauth_tokens
             WHERE student_id = ?1 AND source = ?2",
        )
        .bind(student_id)
        .bind(source.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else {
            return Ok(None);
        };
        let encrypted = r.get::<i64, _>("encrypted") != 0;
        let access_token = self.open_token_value(r.get("access_token"), encrypted)?;
        let refresh_token = r
            .get::<Option<String>, _>("refresh_token")
            .map(|v| self.open_token_value(v, encrypted))
            .transpose()?;
        Ok(Some(OAuthToken {
            student_id: student_id.to_string(),
            source,
            access_token,
            refresh_token,
            expires_at: parse_opt_datetime(r.get("expires_at")),
        }))
    }

    async fn delete_token(&self, student_id: &str, source: Source) -> Result<bool> {
        let result = sqlx::query("DELETE FROM oauth_tokens WHERE student_id = ?1 AND source = ?2")
            .bind(student_id)
            .bind(source.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
