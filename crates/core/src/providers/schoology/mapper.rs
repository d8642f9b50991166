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
    decode, from_unix, non_blank, parse_opt_timestamp, parse_timestamp, required, RecordMapper,
};
use crate::providers::RawRecord;

use super::models::{
    SchoologyAssignment, SchoologyEvent, SchoologyGrade, SchoologyMessage, SchoologySection,
};

const SOURCE: Source = Source::Schoology;

/// Maps Schoology sections, assignments, grades, events and inbox messages
/// onto the canonical model. Sections become courses.
pub struct SchoologyMapper;

impl SchoologyMapper {
    fn assignment_status(raw: &SchoologyAssignment) -> AssignmentStatus {
        if let Some(status) = raw.status.as_deref().and_then(AssignmentStatus::parse) {
            return status;
        }
        if raw.graded {
            AssignmentStatus::Graded
        } else if raw.completed {
            AssignmentStatus::Submitted
        } else {
            AssignmentStatus::Assigned
        }
    }

    /// Schoology grade rows carry no id of their own; derive one from their
    /// position in the section/period tree.
    fn grade_external_id(raw: &SchoologyGrade) -> String {
        match raw.assignment_id {
            Some(ref assignment_id) => format!("{}:{assignment_id}", raw.section_id),
            None => {
                let period = raw
                    .period_id
                    .as_deref()
                    .or(raw.period_title.as_deref())
                    .unwrap_or("all");
                format!("{}:final:{period}", raw.section_id)
            }
        }
    }
}

impl RecordMapper for SchoologyMapper {
    const SOURCE: Source = SOURCE;

    fn course(student_id: &str, raw: &RawRecord) -> Result<Course> {
        let section: SchoologySection = decode(raw)?;
        let name = required(
            "course_title",
            section.course_title.or(section.section_title.clone()),
        )?;
        Ok(Course {
            id: entity_id(student_id, SOURCE, "course", &section.id),
            student_id: student_id.to_string(),
            name,
            teacher: non_blank(section.instructor),
            period: non_blank(section.period).or(non_blank(section.section_title)),
            source: SOURCE,
            external_id: section.id,
            updated_at: None,
        })
    }

    fn assignment(student_id: &str, raw: &RawRecord) -> Result<Assignment> {
        let a: SchoologyAssignment = decode(raw)?;
        let status = Self::assignment_status(&a);
        Ok(Assignment {
            id: entity_id(student_id, SOURCE, "assignment", &a.id),
            student_id: student_id.to_string(),
            course_id: entity_id(student_id, SOURCE, "course", &a.section_id),
            title: required("title", a.title)?,
            description: non_blank(a.description),
            due_date: parse_opt_timestamp("due", a.due.as_deref())?,
            status,
            source: SOURCE,
            external_id: a.id,
            updated_at: None,
        })
    }

    fn grade(student_id: &str, raw: &RawRecord) -> Result<Grade> {
        let g: SchoologyGrade = decode(raw)?;
        let external_id = Self::grade_external_id(&g);
        // Final grades are reported as a percentage without a max.
        let pct = match (g.assignment_id.is_some(), g.max_points) {
            (_, Some(_)) => percentage(g.grade, g.max_points),
            (false, None) => g.grade,
            (true, None) => None,
        };
        let recorded_at = match g.timestamp {
            Some(secs) => Some(from_unix("timestamp", secs)?),
            None => None,
        };
        Ok(Grade {
            id: entity_id(student_id, SOURCE, "grade", &external_id),
            student_id: student_id.to_string(),
            course_id: entity_id(student_id, SOURCE, "course", &g.section_id),
            assignment_id: g
                .assignment_id
                .as_deref()
                .map(|a| entity_id(student_id, SOURCE, "assignment", a)),
            score: g.grade,
            max_score: g.max_points,
            percentage: pct,
            letter_grade: non_blank(g.letter_grade),
            grading_period: non_blank(g.period_title),
            source: SOURCE,
            external_id: Some(external_id),
            recorded_at,
            updated_at: None,
        })
    }

    fn event(raw: &RawRecord) -> Result<Event> {
        let e: SchoologyEvent = decode(raw)?;
        let start = required("start", e.start)?;
        Ok(Event {
            id: shared_entity_id(SOURCE, "event", &e.id),
            title: required("title", e.title)?,
            description: non_blank(e.description),
            event_date: parse_timestamp("start", &start)?,
            event_type: non_blank(e.event_type),
            source: SOURCE,
            external_id: Some(e.id),
            updated_at: None,
        })
    }

    fn message(student_id: &str, raw: &RawRecord) -> Result<Message> {
        let m: SchoologyMessage = decode(raw)?;
        let from_name = required(
            "author_name",
            non_blank(m.author_name).or(m.author_id.map(|id| format!("User {id}"))),
        )?;
        let received_at = match m.last_updated {
            Some(secs) => Some(from_unix("last_updated", secs)?),
            None => None,
        };
        Ok(Message {
            id: entity_id(student_id, SOURCE, "message", &m.id),
            student_id: student_id.to_string(),
            from_name,
            from_email: non_blank(m.author_email),
            subject: non_blank(m.subject),
            body: non_blank(m.message),
            received_at,
            read: m.message_status.as_deref() == Some("read"),
            source: SOURCE,
            external_id: m.id,
            updated_at: None,
        })
    }
}
