use crate::error::Result;
use crate::models::{
    assignment::{Assignment, AssignmentStatus},
    common::{entity_id, shared_entity_id, Source},
    course::Course,
    event::Event,
    grade::{percentage, Grade},
    message::Message,
};
use crate::normalizer::{
    decode, non_blank, parse_opt_timestamp, parse_timestamp, required, RecordMapper,
};
use crate::providers::RawRecord;

use super::models::{PsAssignment, PsEvent, PsGrade, PsNotification, PsSection};

/// Maps PowerSchool sections, assignments, grades, events and notifications
/// onto the canonical model.
pub struct PowerSchoolMapper;

impl PowerSchoolMapper {
    fn grade_external_id(g: &PsGrade) -> String {
        if let Some(ref id) = g.id {
            return id.clone();
        }
        match g.assignment_id {
            Some(ref assignment_id) => format!("{}:{assignment_id}", g.section_id),
            None => format!(
                "{}:final:{}",
                g.section_id,
                g.store_code.as_deref().unwrap_or("all")
            ),
        }
    }
}

impl RecordMapper for PowerSchoolMapper {
    const SOURCE: Source = Source::PowerSchool;

    fn course(student_id: &str, raw: &RawRecord) -> Result<Course> {
        let s: PsSection = decode(raw)?;
        Ok(Course {
            id: entity_id(student_id, Self::SOURCE, "course", &s.id),
            student_id: student_id.to_string(),
            name: required("course_name", s.course_name)?,
            teacher: non_blank(s.teacher_name),
            period: non_blank(s.expression),
            source: Self::SOURCE,
            external_id: s.id,
            updated_at: None,
        })
    }

    fn assignment(student_id: &str, raw: &RawRecord) -> Result<Assignment> {
        let a: PsAssignment = decode(raw)?;
        let status = match non_blank(a.status) {
            Some(s) => AssignmentStatus::parse(&s).unwrap_or(AssignmentStatus::Assigned),
            None => AssignmentStatus::Assigned,
        };
        Ok(Assignment {
            id: entity_id(student_id, Self::SOURCE, "assignment", &a.id),
            student_id: student_id.to_string(),
            course_id: entity_id(student_id, Self::SOURCE, "course", &a.section_id),
            title: required("name", a.name)?,
            description: non_blank(a.description),
            due_date: parse_opt_timestamp("due_date", a.due_date.as_deref())?,
            status,
            source: Self::SOURCE,
            external_id: a.id,
            updated_at: None,
        })
    }

    fn grade(student_id: &str, raw: &RawRecord) -> Result<Grade> {
        let g: PsGrade = decode(raw)?;
        let external_id = Self::grade_external_id(&g);
        let pct = match g.points_possible {
            Some(_) => percentage(g.score, g.points_possible),
            None => g.percent,
        };
        Ok(Grade {
            id: entity_id(student_id, Self::SOURCE, "grade", &external_id),
            student_id: student_id.to_string(),
            course_id: entity_id(student_id, Self::SOURCE, "course", &g.section_id),
            assignment_id: g
                .assignment_id
                .as_deref()
                .map(|a| entity_id(student_id, Self::SOURCE, "assignment", a)),
            score: g.score,
            max_score: g.points_possible,
            percentage: pct,
            letter_grade: non_blank(g.letter_grade),
            grading_period: non_blank(g.store_code),
            source: Self::SOURCE,
            external_id: Some(external_id),
            recorded_at: parse_opt_timestamp("date_stored", g.date_stored.as_deref())?,
            updated_at: None,
        })
    }

    fn event(raw: &RawRecord) -> Result<Event> {
        let e: PsEvent = decode(raw)?;
        let date = required("date", e.date)?;
        Ok(Event {
            id: shared_entity_id(Self::SOURCE, "event", &e.id),
            title: required("title", e.title)?,
            description: non_blank(e.description),
            event_date: parse_timestamp("date", &date)?,
            event_type: non_blank(e.event_type),
            source: Self::SOURCE,
            external_id: Some(e.id),
            updated_at: None,
        })
    }

    fn message(student_id: &str, raw: &RawRecord) -> Result<Message> {
        let n: PsNotification = decode(raw)?;
        Ok(Message {
            id: entity_id(student_id, Self::SOURCE, "message", &n.id),
            student_id: student_id.to_string(),
            from_name: required("from", n.from)?,
            from_email: non_blank(n.from_email),
            subject: non_blank(n.subject),
            body: non_blank(n.body),
            received_at: parse_opt_timestamp("sent_at", n.sent_at.as_deref())?,
            read: n.read,
            source: Self::SOURCE,
            external_id: n.id,
            updated_at: None,
        })
    }
}
