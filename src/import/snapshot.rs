//! Read-only view of the stored entities an import is validated and planned against.
//!
//! The digest of a snapshot is the optimistic-concurrency token: a commit is
//! only allowed while the digest taken inside the commit transaction still
//! equals the one recorded by the test run.

use super::schema::{clean_email, normalize_key, PersonRow};
use super::{ImportError, ImportKind, ImportResult, ImportTarget};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize)]
pub struct UserRecord {
    pub id: String,
    pub username: Option<String>,
    pub email: String,
    pub title: String,
    pub first_name: String,
    pub last_name: String,
    pub is_active: bool,
    /// Reference counts; only loaded for user bulk updates, zero otherwise.
    pub participations: i64,
    pub contributions: i64,
    pub responsibilities: i64,
}

impl UserRecord {
    pub fn as_person(&self) -> PersonRow {
        PersonRow {
            title: self.title.clone(),
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            email: self.email.clone(),
        }
    }

    pub fn is_referenced(&self) -> bool {
        self.participations > 0 || self.contributions > 0 || self.responsibilities > 0
    }

    /// Whether `row` carries different personal data than what is stored.
    pub fn differs_from(&self, row: &PersonRow) -> bool {
        self.first_name != row.first_name
            || self.last_name != row.last_name
            || (!row.title.is_empty() && self.title != row.title)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgramRecord {
    pub id: String,
    pub name_de: String,
    pub name_en: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseKindRecord {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CourseRecord {
    pub id: String,
    pub name_de: String,
    pub name_en: String,
    pub kind_id: String,
    pub is_graded: bool,
    pub program_ids: Vec<String>,
    pub responsible_ids: Vec<String>,
    /// First evaluation of the course, the one imports enroll into.
    pub evaluation_id: Option<String>,
    pub participant_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub kind: ImportKind,
    pub target_id: Option<String>,
    pub users: Vec<UserRecord>,
    /// Users attached to the target evaluation (participants or contributors by kind).
    pub member_ids: Vec<String>,
    pub programs: Vec<ProgramRecord>,
    pub course_kinds: Vec<CourseKindRecord>,
    pub courses: Vec<CourseRecord>,
    #[serde(skip)]
    by_email: HashMap<String, usize>,
}

impl Snapshot {
    pub fn load(conn: &Connection, kind: ImportKind, target: &ImportTarget) -> ImportResult<Self> {
        match target {
            ImportTarget::Global => {}
            ImportTarget::Evaluation(id) => ensure_exists(conn, "evaluations", id, "evaluation")?,
            ImportTarget::Semester(id) => ensure_exists(conn, "semesters", id, "semester")?,
        }

        let users = load_users(conn, kind == ImportKind::UserBulkUpdate)?;
        let member_ids = match (kind, target) {
            (ImportKind::Participant | ImportKind::Contributor, ImportTarget::Evaluation(id)) => {
                member_ids(conn, kind, id)?
            }
            _ => Vec::new(),
        };
        let (programs, course_kinds, courses) = match target {
            ImportTarget::Semester(id) => (
                load_programs(conn)?,
                load_course_kinds(conn)?,
                load_courses(conn, id)?,
            ),
            _ => (Vec::new(), Vec::new(), Vec::new()),
        };

        Ok(Self::new(
            kind,
            target.id().map(str::to_string),
            users,
            member_ids,
            programs,
            course_kinds,
            courses,
        ))
    }

    pub fn new(
        kind: ImportKind,
        target_id: Option<String>,
        users: Vec<UserRecord>,
        member_ids: Vec<String>,
        programs: Vec<ProgramRecord>,
        course_kinds: Vec<CourseKindRecord>,
        courses: Vec<CourseRecord>,
    ) -> Self {
        let by_email = users
            .iter()
            .enumerate()
            .map(|(i, u)| (clean_email(&u.email), i))
            .collect();
        Self {
            kind,
            target_id,
            users,
            member_ids,
            programs,
            course_kinds,
            courses,
            by_email,
        }
    }

    pub fn digest(&self) -> ImportResult<String> {
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(self)?);
        Ok(format!("{:x}", hasher.finalize()))
    }

    pub fn user_by_email(&self, email: &str) -> Option<&UserRecord> {
        self.by_email
            .get(&clean_email(email))
            .and_then(|&i| self.users.get(i))
    }

    pub fn is_member(&self, user_id: &str) -> bool {
        self.member_ids.iter().any(|m| m == user_id)
    }

    pub fn user(&self, id: &str) -> Option<&UserRecord> {
        self.users.iter().find(|u| u.id == id)
    }

    /// Programs match on either language's name.
    pub fn program_by_name(&self, name: &str) -> Option<&ProgramRecord> {
        let key = normalize_key(name);
        self.programs
            .iter()
            .find(|p| normalize_key(&p.name_de) == key || normalize_key(&p.name_en) == key)
    }

    pub fn course_kind_by_name(&self, name: &str) -> Option<&CourseKindRecord> {
        let key = normalize_key(name);
        self.course_kinds.iter().find(|k| normalize_key(&k.name) == key)
    }

    pub fn course_by_name_en(&self, name_en: &str) -> Option<&CourseRecord> {
        let key = normalize_key(name_en);
        self.courses.iter().find(|c| normalize_key(&c.name_en) == key)
    }
}

fn ensure_exists(conn: &Connection, table: &str, id: &str, label: &str) -> ImportResult<()> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    let found: Option<i64> = conn.query_row(&sql, [id], |r| r.get(0)).optional()?;
    if found.is_none() {
        return Err(ImportError::NotFound(format!("{} not found: {}", label, id)));
    }
    Ok(())
}

fn load_users(conn: &Connection, with_references: bool) -> ImportResult<Vec<UserRecord>> {
    let sql = if with_references {
        "SELECT u.id, u.username, u.email, u.title, u.first_name, u.last_name, u.is_active,
                (SELECT COUNT(*) FROM participations p WHERE p.user_id = u.id),
                (SELECT COUNT(*) FROM contributions c WHERE c.user_id = u.id),
                (SELECT COUNT(*) FROM course_responsibles r WHERE r.user_id = u.id)
         FROM users u
         ORDER BY u.email"
    } else {
        "SELECT u.id, u.username, u.email, u.title, u.first_name, u.last_name, u.is_active, 0, 0, 0
         FROM users u
         ORDER BY u.email"
    };
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map([], |r| {
            Ok(UserRecord {
                id: r.get(0)?,
                username: r.get(1)?,
                email: r.get(2)?,
                title: r.get(3)?,
                first_name: r.get(4)?,
                last_name: r.get(5)?,
                is_active: r.get::<_, i64>(6)? != 0,
                participations: r.get(7)?,
                contributions: r.get(8)?,
                responsibilities: r.get(9)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn member_ids(conn: &Connection, kind: ImportKind, evaluation_id: &str) -> ImportResult<Vec<String>> {
    let sql = if kind == ImportKind::Contributor {
        "SELECT user_id FROM contributions WHERE evaluation_id = ? ORDER BY user_id"
    } else {
        "SELECT user_id FROM participations WHERE evaluation_id = ? ORDER BY user_id"
    };
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map([evaluation_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// People attached to an evaluation, as rows a copy can feed into the pipeline.
pub fn member_persons(
    conn: &Connection,
    kind: ImportKind,
    evaluation_id: &str,
) -> ImportResult<Vec<PersonRow>> {
    ensure_exists(conn, "evaluations", evaluation_id, "evaluation")?;
    let table = if kind == ImportKind::Contributor {
        "contributions"
    } else {
        "participations"
    };
    let sql = format!(
        "SELECT u.title, u.first_name, u.last_name, u.email
         FROM {} m JOIN users u ON u.id = m.user_id
         WHERE m.evaluation_id = ?
         ORDER BY u.last_name, u.first_name, u.email",
        table
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([evaluation_id], |r| {
            Ok(PersonRow {
                title: r.get(0)?,
                first_name: r.get(1)?,
                last_name: r.get(2)?,
                email: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_programs(conn: &Connection) -> ImportResult<Vec<ProgramRecord>> {
    let mut stmt = conn.prepare("SELECT id, name_de, name_en FROM programs ORDER BY id")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(ProgramRecord {
                id: r.get(0)?,
                name_de: r.get(1)?,
                name_en: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_course_kinds(conn: &Connection) -> ImportResult<Vec<CourseKindRecord>> {
    let mut stmt = conn.prepare("SELECT id, name FROM course_kinds ORDER BY id")?;
    let rows = stmt
        .query_map([], |r| {
            Ok(CourseKindRecord {
                id: r.get(0)?,
                name: r.get(1)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn load_courses(conn: &Connection, semester_id: &str) -> ImportResult<Vec<CourseRecord>> {
    let mut stmt = conn.prepare(
        "SELECT id, name_de, name_en, kind_id, is_graded
         FROM courses
         WHERE semester_id = ?
         ORDER BY id",
    )?;
    let mut courses = stmt
        .query_map([semester_id], |r| {
            Ok(CourseRecord {
                id: r.get(0)?,
                name_de: r.get(1)?,
                name_en: r.get(2)?,
                kind_id: r.get(3)?,
                is_graded: r.get::<_, i64>(4)? != 0,
                program_ids: Vec::new(),
                responsible_ids: Vec::new(),
                evaluation_id: None,
                participant_ids: Vec::new(),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut programs_stmt =
        conn.prepare("SELECT program_id FROM course_programs WHERE course_id = ? ORDER BY program_id")?;
    let mut responsibles_stmt =
        conn.prepare("SELECT user_id FROM course_responsibles WHERE course_id = ? ORDER BY user_id")?;
    let mut evaluation_stmt = conn.prepare(
        "SELECT id FROM evaluations WHERE course_id = ? ORDER BY created_at, id LIMIT 1",
    )?;
    let mut participants_stmt =
        conn.prepare("SELECT user_id FROM participations WHERE evaluation_id = ? ORDER BY user_id")?;

    for course in &mut courses {
        course.program_ids = programs_stmt
            .query_map([&course.id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        course.responsible_ids = responsibles_stmt
            .query_map([&course.id], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        course.evaluation_id = evaluation_stmt
            .query_row([&course.id], |r| r.get::<_, String>(0))
            .optional()?;
        if let Some(eval_id) = course.evaluation_id.as_deref() {
            course.participant_ids = participants_stmt
                .query_map([eval_id], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
        }
    }
    Ok(courses)
}
