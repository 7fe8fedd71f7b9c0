use super::planner::{CourseSpec, ImportPlan, PlanCounts, PlanOp};
use super::schema::{clean_email, normalize_key};
use super::{ImportError, ImportResult};
use crate::db;
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Map, Value};

pub struct CommitContext<'a> {
    pub request_id: &'a str,
    pub actor: &'a str,
    /// Voting window of evaluations the commit creates.
    pub vote_start: Option<&'a str>,
    pub vote_end: Option<&'a str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitSummary {
    pub request_id: String,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub breakdown: std::collections::BTreeMap<String, usize>,
}

/// Applies every operation in order. The caller owns the transaction and
/// rolls it back on error, so a failed commit leaves nothing behind.
pub fn apply(tx: &Connection, plan: &ImportPlan, ctx: &CommitContext<'_>) -> ImportResult<CommitSummary> {
    let applier = Applier { tx, plan, ctx };
    for op in &plan.ops {
        applier.apply_op(op)?;
    }
    let PlanCounts {
        created,
        updated,
        deleted,
        breakdown,
    } = plan.counts();
    Ok(CommitSummary {
        request_id: ctx.request_id.to_string(),
        created,
        updated,
        deleted,
        breakdown,
    })
}

struct Applier<'a> {
    tx: &'a Connection,
    plan: &'a ImportPlan,
    ctx: &'a CommitContext<'a>,
}

#[derive(Debug)]
struct StoredUser {
    username: Option<String>,
    email: String,
    title: String,
    first_name: String,
    last_name: String,
    is_active: bool,
}

impl StoredUser {
    fn to_json(&self) -> Value {
        json!({
            "username": self.username,
            "email": self.email,
            "title": self.title,
            "first_name": self.first_name,
            "last_name": self.last_name,
            "is_active": self.is_active,
        })
    }
}

/// `{field: [old, new]}` for the fields that differ.
fn field_changes(before: &Value, after: &Value) -> Map<String, Value> {
    let mut out = Map::new();
    if let (Some(b), Some(a)) = (before.as_object(), after.as_object()) {
        for (k, new) in a {
            let old = b.get(k).cloned().unwrap_or(Value::Null);
            if &old != new {
                out.insert(k.clone(), json!([old, new]));
            }
        }
        for (k, old) in b {
            if !a.contains_key(k) && !old.is_null() {
                out.insert(k.clone(), json!([old, Value::Null]));
            }
        }
    }
    out
}

fn created_fields(after: &Value) -> Map<String, Value> {
    field_changes(&json!({}), after)
}

impl Applier<'_> {
    fn semester_id(&self) -> ImportResult<&str> {
        self.plan
            .target_id
            .as_deref()
            .ok_or_else(|| ImportError::BadParams("semester import without semester".to_string()))
    }

    fn evaluation_id(&self) -> ImportResult<&str> {
        self.plan
            .target_id
            .as_deref()
            .ok_or_else(|| ImportError::BadParams("member import without evaluation".to_string()))
    }

    fn log(
        &self,
        entity_type: &str,
        entity_id: &str,
        action: &str,
        data: Map<String, Value>,
    ) -> ImportResult<()> {
        self.tx.execute(
            "INSERT INTO change_log(entity_type, entity_id, action, data, request_id, actor, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                entity_type,
                entity_id,
                action,
                serde_json::to_string(&Value::Object(data))?,
                self.ctx.request_id,
                self.ctx.actor,
                db::now_rfc3339(),
            ),
        )?;
        Ok(())
    }

    fn load_user(&self, user_id: &str) -> ImportResult<StoredUser> {
        self.tx
            .query_row(
                "SELECT username, email, title, first_name, last_name, is_active FROM users WHERE id = ?",
                [user_id],
                |r| {
                    Ok(StoredUser {
                        username: r.get(0)?,
                        email: r.get(1)?,
                        title: r.get(2)?,
                        first_name: r.get(3)?,
                        last_name: r.get(4)?,
                        is_active: r.get::<_, i64>(5)? != 0,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| ImportError::NotFound(format!("user not found: {}", user_id)))
    }

    fn user_id_by_email(&self, email: &str) -> ImportResult<String> {
        self.tx
            .query_row(
                "SELECT id FROM users WHERE lower(email) = ?",
                [clean_email(email)],
                |r| r.get::<_, String>(0),
            )
            .optional()?
            .ok_or_else(|| ImportError::NotFound(format!("user not found: {}", email)))
    }

    /// Finds the first `(id, names...)` row whose names match `name` the way the snapshot matches them.
    fn lookup_id<P: rusqlite::Params>(
        &self,
        sql: &str,
        params: P,
        name: &str,
        label: &str,
    ) -> ImportResult<String> {
        let key = normalize_key(name);
        let mut stmt = self.tx.prepare(sql)?;
        let columns = stmt.column_count();
        let mut rows = stmt.query(params)?;
        while let Some(row) = rows.next()? {
            let id: String = row.get(0)?;
            for i in 1..columns {
                let candidate: String = row.get(i)?;
                if normalize_key(&candidate) == key {
                    return Ok(id);
                }
            }
        }
        Err(ImportError::NotFound(format!("{} not found: {}", label, name)))
    }

    fn program_id(&self, name: &str) -> ImportResult<String> {
        self.lookup_id(
            "SELECT id, name_de, name_en FROM programs ORDER BY id",
            [],
            name,
            "program",
        )
    }

    fn course_kind_id(&self, name: &str) -> ImportResult<String> {
        self.lookup_id(
            "SELECT id, name FROM course_kinds ORDER BY id",
            [],
            name,
            "course kind",
        )
    }

    fn course_id(&self, name_en: &str) -> ImportResult<String> {
        let semester_id = self.semester_id()?;
        self.lookup_id(
            "SELECT id, name_en FROM courses WHERE semester_id = ? ORDER BY id",
            [semester_id],
            name_en,
            "course",
        )
    }

    fn course_evaluation_id(&self, course_id: &str) -> ImportResult<Option<String>> {
        Ok(self
            .tx
            .query_row(
                "SELECT id FROM evaluations WHERE course_id = ? ORDER BY created_at, id LIMIT 1",
                [course_id],
                |r| r.get::<_, String>(0),
            )
            .optional()?)
    }

    fn apply_op(&self, op: &PlanOp) -> ImportResult<()> {
        match op {
            PlanOp::CreateUser { person, username } => {
                let id = uuid::Uuid::new_v4().to_string();
                let email = clean_email(&person.email);
                self.tx.execute(
                    "INSERT INTO users(id, username, email, title, first_name, last_name, is_active, updated_at)
                     VALUES(?, ?, ?, ?, ?, ?, 1, ?)",
                    (
                        &id,
                        username,
                        &email,
                        &person.title,
                        &person.first_name,
                        &person.last_name,
                        db::now_rfc3339(),
                    ),
                )?;
                let after = StoredUser {
                    username: username.clone(),
                    email,
                    title: person.title.clone(),
                    first_name: person.first_name.clone(),
                    last_name: person.last_name.clone(),
                    is_active: true,
                };
                self.log("user", &id, "create", created_fields(&after.to_json()))
            }
            PlanOp::UpdateUser {
                user_id,
                person,
                reactivate,
            } => {
                let before = self.load_user(user_id)?;
                let after = StoredUser {
                    username: before.username.clone(),
                    email: before.email.clone(),
                    // An upload without a title keeps the stored one.
                    title: if person.title.is_empty() {
                        before.title.clone()
                    } else {
                        person.title.clone()
                    },
                    first_name: person.first_name.clone(),
                    last_name: person.last_name.clone(),
                    is_active: before.is_active || *reactivate,
                };
                self.write_user(user_id, &before, &after)
            }
            PlanOp::UpdateAccount {
                user_id,
                email,
                username,
                reactivate,
                ..
            } => {
                let before = self.load_user(user_id)?;
                let after = StoredUser {
                    username: Some(username.clone()),
                    email: clean_email(email),
                    title: before.title.clone(),
                    first_name: before.first_name.clone(),
                    last_name: before.last_name.clone(),
                    is_active: before.is_active || *reactivate,
                };
                self.write_user(user_id, &before, &after)
            }
            PlanOp::DeactivateUser { user_id, .. } => {
                let before = self.load_user(user_id)?;
                let after = StoredUser {
                    is_active: false,
                    username: before.username.clone(),
                    email: before.email.clone(),
                    title: before.title.clone(),
                    first_name: before.first_name.clone(),
                    last_name: before.last_name.clone(),
                };
                self.write_user(user_id, &before, &after)
            }
            PlanOp::DeleteUser { user_id, .. } => {
                let before = self.load_user(user_id)?;
                self.tx.execute("DELETE FROM users WHERE id = ?", [user_id])?;
                self.log("user", user_id, "delete", field_changes(&before.to_json(), &json!({})))
            }
            PlanOp::AddParticipant { email } => {
                let evaluation_id = self.evaluation_id()?.to_string();
                let user_id = self.user_id_by_email(email)?;
                self.add_participation(&evaluation_id, &user_id, email)
            }
            PlanOp::RemoveParticipant { user_id, email } => {
                let evaluation_id = self.evaluation_id()?;
                self.tx.execute(
                    "DELETE FROM participations WHERE evaluation_id = ? AND user_id = ?",
                    (evaluation_id, user_id),
                )?;
                let mut data = Map::new();
                data.insert("participants".to_string(), json!({ "remove": [email] }));
                self.log("evaluation", evaluation_id, "change", data)
            }
            PlanOp::AddContributor { email } => {
                let evaluation_id = self.evaluation_id()?;
                let user_id = self.user_id_by_email(email)?;
                self.tx.execute(
                    "INSERT INTO contributions(id, evaluation_id, user_id) VALUES(?, ?, ?)
                     ON CONFLICT(evaluation_id, user_id) DO NOTHING",
                    (uuid::Uuid::new_v4().to_string(), evaluation_id, &user_id),
                )?;
                let mut data = Map::new();
                data.insert("contributors".to_string(), json!({ "add": [email] }));
                self.log("evaluation", evaluation_id, "change", data)
            }
            PlanOp::RemoveContributor { user_id, email } => {
                let evaluation_id = self.evaluation_id()?;
                self.tx.execute(
                    "DELETE FROM contributions WHERE evaluation_id = ? AND user_id = ?",
                    (evaluation_id, user_id),
                )?;
                let mut data = Map::new();
                data.insert("contributors".to_string(), json!({ "remove": [email] }));
                self.log("evaluation", evaluation_id, "change", data)
            }
            PlanOp::CreateProgram { name } => {
                let id = uuid::Uuid::new_v4().to_string();
                let name = name.trim();
                self.tx.execute(
                    "INSERT INTO programs(id, name_de, name_en) VALUES(?, ?, ?)",
                    (&id, name, name),
                )?;
                self.log(
                    "program",
                    &id,
                    "create",
                    created_fields(&json!({ "name_de": name, "name_en": name })),
                )
            }
            PlanOp::CreateCourseKind { name } => {
                let id = uuid::Uuid::new_v4().to_string();
                let name = name.trim();
                self.tx.execute(
                    "INSERT INTO course_kinds(id, name) VALUES(?, ?)",
                    (&id, name),
                )?;
                self.log("course_kind", &id, "create", created_fields(&json!({ "name": name })))
            }
            PlanOp::CreateCourse { course } => self.create_course(course),
            PlanOp::UpdateCourse { course_id, course } => self.update_course(course_id, course),
            PlanOp::DeleteCourse { course_id, name_en } => {
                self.tx.execute("DELETE FROM courses WHERE id = ?", [course_id])?;
                self.log(
                    "course",
                    course_id,
                    "delete",
                    field_changes(&json!({ "name_en": name_en }), &json!({})),
                )
            }
            PlanOp::CreateEvaluation { course_name_en } => {
                let course_id = self.course_id(course_name_en)?;
                let is_graded: bool = self.tx.query_row(
                    "SELECT is_graded FROM courses WHERE id = ?",
                    [&course_id],
                    |r| Ok(r.get::<_, i64>(0)? != 0),
                )?;
                self.create_evaluation(&course_id, course_name_en, is_graded)
            }
            PlanOp::Enroll {
                course_name_en,
                email,
            } => {
                let course_id = self.course_id(course_name_en)?;
                let evaluation_id = self.course_evaluation_id(&course_id)?.ok_or_else(|| {
                    ImportError::NotFound(format!("course has no evaluation: {}", course_name_en))
                })?;
                let user_id = self.user_id_by_email(email)?;
                self.add_participation(&evaluation_id, &user_id, email)
            }
        }
    }

    fn write_user(&self, user_id: &str, before: &StoredUser, after: &StoredUser) -> ImportResult<()> {
        let changes = field_changes(&before.to_json(), &after.to_json());
        if changes.is_empty() {
            return Ok(());
        }
        self.tx.execute(
            "UPDATE users
             SET username = ?, email = ?, title = ?, first_name = ?, last_name = ?, is_active = ?, updated_at = ?
             WHERE id = ?",
            rusqlite::params![
                after.username,
                after.email,
                after.title,
                after.first_name,
                after.last_name,
                if after.is_active { 1 } else { 0 },
                db::now_rfc3339(),
                user_id,
            ],
        )?;
        self.log("user", user_id, "change", changes)
    }

    fn add_participation(&self, evaluation_id: &str, user_id: &str, email: &str) -> ImportResult<()> {
        let inserted = self.tx.execute(
            "INSERT OR IGNORE INTO participations(evaluation_id, user_id) VALUES(?, ?)",
            (evaluation_id, user_id),
        )?;
        if inserted == 0 {
            return Ok(());
        }
        let mut data = Map::new();
        data.insert("participants".to_string(), json!({ "add": [email] }));
        self.log("evaluation", evaluation_id, "change", data)
    }

    fn link_course(&self, course_id: &str, course: &CourseSpec) -> ImportResult<()> {
        let program_id = self.program_id(&course.program)?;
        let responsible_id = self.user_id_by_email(&course.responsible_email)?;
        self.tx.execute(
            "INSERT OR IGNORE INTO course_programs(course_id, program_id) VALUES(?, ?)",
            (course_id, &program_id),
        )?;
        self.tx.execute(
            "INSERT OR IGNORE INTO course_responsibles(course_id, user_id) VALUES(?, ?)",
            (course_id, &responsible_id),
        )?;
        Ok(())
    }

    fn create_course(&self, course: &CourseSpec) -> ImportResult<()> {
        let semester_id = self.semester_id()?;
        let kind_id = self.course_kind_id(&course.kind)?;
        let id = uuid::Uuid::new_v4().to_string();
        self.tx.execute(
            "INSERT INTO courses(id, semester_id, name_de, name_en, kind_id, is_graded)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                &id,
                semester_id,
                &course.name_de,
                &course.name_en,
                &kind_id,
                if course.is_graded { 1 } else { 0 },
            ),
        )?;
        self.link_course(&id, course)?;
        self.log(
            "course",
            &id,
            "create",
            created_fields(&json!({
                "name_de": course.name_de,
                "name_en": course.name_en,
                "kind": course.kind,
                "is_graded": course.is_graded,
                "program": course.program,
                "responsible": course.responsible_email,
            })),
        )?;
        self.create_evaluation(&id, &course.name_en, course.is_graded)
    }

    fn update_course(&self, course_id: &str, course: &CourseSpec) -> ImportResult<()> {
        let (name_de, kind_id, is_graded): (String, String, bool) = self.tx.query_row(
            "SELECT name_de, kind_id, is_graded FROM courses WHERE id = ?",
            [course_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get::<_, i64>(2)? != 0)),
        )?;
        let new_kind_id = self.course_kind_id(&course.kind)?;
        self.tx.execute(
            "UPDATE courses SET name_de = ?, kind_id = ?, is_graded = ? WHERE id = ?",
            (
                &course.name_de,
                &new_kind_id,
                if course.is_graded { 1 } else { 0 },
                course_id,
            ),
        )?;
        // Programs and responsibles accumulate; an import never unlinks them.
        self.link_course(course_id, course)?;
        let mut changes = field_changes(
            &json!({ "name_de": name_de, "kind_id": kind_id, "is_graded": is_graded }),
            &json!({ "name_de": course.name_de, "kind_id": new_kind_id, "is_graded": course.is_graded }),
        );
        changes.insert(
            "links".to_string(),
            json!({ "program": course.program, "responsible": course.responsible_email }),
        );
        self.log("course", course_id, "change", changes)
    }

    fn create_evaluation(&self, course_id: &str, name: &str, is_graded: bool) -> ImportResult<()> {
        let id = uuid::Uuid::new_v4().to_string();
        self.tx.execute(
            "INSERT INTO evaluations(id, course_id, name, vote_start, vote_end, wait_for_grade_upload, created_at)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                id,
                course_id,
                name,
                self.ctx.vote_start,
                self.ctx.vote_end,
                if is_graded { 1 } else { 0 },
                db::now_rfc3339(),
            ],
        )?;
        self.log(
            "evaluation",
            &id,
            "create",
            created_fields(&json!({
                "course_id": course_id,
                "name": name,
                "vote_start": self.ctx.vote_start,
                "vote_end": self.ctx.vote_end,
                "wait_for_grade_upload": is_graded,
            })),
        )
    }
}
