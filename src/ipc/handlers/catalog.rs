use crate::db;
use crate::import::schema::{clean_email, is_valid_email, normalize_key};
use crate::ipc::helpers::{
    db_conn, get_bool, get_optional_str, get_required_str, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use uuid::Uuid;

fn exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    conn.query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()
        .map(|v| v.is_some())
        .map_err(HandlerErr::query)
}

fn users_list(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let include_inactive = get_bool(params, "includeInactive", true)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, username, email, title, first_name, last_name, is_active
             FROM users
             WHERE is_active = 1 OR ?
             ORDER BY last_name, first_name, email",
        )
        .map_err(HandlerErr::query)?;
    let users = stmt
        .query_map([include_inactive], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "username": r.get::<_, Option<String>>(1)?,
                "email": r.get::<_, String>(2)?,
                "title": r.get::<_, String>(3)?,
                "firstName": r.get::<_, String>(4)?,
                "lastName": r.get::<_, String>(5)?,
                "isActive": r.get::<_, i64>(6)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "users": users }))
}

fn users_create(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let email = clean_email(&get_required_str(params, "email")?);
    if !is_valid_email(&email) {
        return Err(HandlerErr::new("bad_params", format!("invalid email: {}", email)));
    }
    let first_name = get_optional_str(params, "firstName").unwrap_or_default();
    let last_name = get_optional_str(params, "lastName").unwrap_or_default();
    let title = get_optional_str(params, "title").unwrap_or_default();
    let username = get_optional_str(params, "username");

    let taken: Option<String> = conn
        .query_row("SELECT id FROM users WHERE lower(email) = ?", [&email], |r| r.get(0))
        .optional()
        .map_err(HandlerErr::query)?;
    if taken.is_some() {
        return Err(HandlerErr::new("bad_params", format!("email already in use: {}", email)));
    }

    let user_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users(id, username, email, title, first_name, last_name, is_active, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &user_id,
            &username,
            &email,
            &title,
            &first_name,
            &last_name,
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::update(e).with_details(json!({ "table": "users" })))?;
    Ok(json!({ "userId": user_id, "email": email }))
}

fn semesters_create(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let name = get_required_str(params, "name")?;
    let semester_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO semesters(id, name, created_at) VALUES(?, ?, ?)",
        (&semester_id, &name, db::now_rfc3339()),
    )
    .map_err(|e| HandlerErr::update(e).with_details(json!({ "table": "semesters" })))?;
    Ok(json!({ "semesterId": semester_id, "name": name }))
}

fn semesters_list(state: &AppState) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let mut stmt = conn
        .prepare(
            "SELECT s.id, s.name, s.created_at,
                    (SELECT COUNT(*) FROM courses c WHERE c.semester_id = s.id)
             FROM semesters s
             ORDER BY s.created_at, s.name",
        )
        .map_err(HandlerErr::query)?;
    let semesters = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "name": r.get::<_, String>(1)?,
                "createdAt": r.get::<_, String>(2)?,
                "courseCount": r.get::<_, i64>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "semesters": semesters }))
}

/// Finds a catalog row by name, creating it when missing.
fn ensure_named(conn: &Connection, table: &str, name: &str) -> Result<String, HandlerErr> {
    let key = normalize_key(name);
    let sql = match table {
        "programs" => "SELECT id, name_de, name_en FROM programs ORDER BY id",
        _ => "SELECT id, name, name FROM course_kinds ORDER BY id",
    };
    let mut stmt = conn.prepare(sql).map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map([], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    if let Some((id, _, _)) = rows
        .into_iter()
        .find(|(_, a, b)| normalize_key(a) == key || normalize_key(b) == key)
    {
        return Ok(id);
    }
    let id = Uuid::new_v4().to_string();
    let result = if table == "programs" {
        conn.execute(
            "INSERT INTO programs(id, name_de, name_en) VALUES(?, ?, ?)",
            (&id, name, name),
        )
    } else {
        conn.execute("INSERT INTO course_kinds(id, name) VALUES(?, ?)", (&id, name))
    };
    result.map_err(|e| HandlerErr::update(e).with_details(json!({ "table": table })))?;
    Ok(id)
}

fn courses_create(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let semester_id = get_required_str(params, "semesterId")?;
    if !exists(conn, "semesters", &semester_id)? {
        return Err(HandlerErr::new("not_found", "semester not found"));
    }
    let name_de = get_required_str(params, "nameDe")?;
    let name_en = get_required_str(params, "nameEn")?;
    let kind = get_optional_str(params, "kind").unwrap_or_else(|| "Lecture".to_string());
    let is_graded = get_bool(params, "isGraded", true)?;
    let program = get_optional_str(params, "program");
    let responsibles = match params.get("responsibleEmails") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(clean_email).ok_or_else(|| {
                    HandlerErr::new("bad_params", "responsibleEmails must be strings")
                })
            })
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(HandlerErr::new("bad_params", "responsibleEmails must be an array"))
        }
    };

    let tx = conn.unchecked_transaction().map_err(HandlerErr::update)?;
    let kind_id = ensure_named(&tx, "course_kinds", &kind)?;
    let course_id = Uuid::new_v4().to_string();
    tx.execute(
        "INSERT INTO courses(id, semester_id, name_de, name_en, kind_id, is_graded)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &course_id,
            &semester_id,
            &name_de,
            &name_en,
            &kind_id,
            if is_graded { 1 } else { 0 },
        ),
    )
    .map_err(|e| HandlerErr::update(e).with_details(json!({ "table": "courses" })))?;
    if let Some(program) = program {
        let program_id = ensure_named(&tx, "programs", &program)?;
        tx.execute(
            "INSERT INTO course_programs(course_id, program_id) VALUES(?, ?)",
            (&course_id, &program_id),
        )
        .map_err(HandlerErr::update)?;
    }
    for email in &responsibles {
        let user_id: Option<String> = tx
            .query_row("SELECT id FROM users WHERE lower(email) = ?", [email], |r| r.get(0))
            .optional()
            .map_err(HandlerErr::query)?;
        let Some(user_id) = user_id else {
            return Err(HandlerErr::new("not_found", format!("user not found: {}", email)));
        };
        tx.execute(
            "INSERT OR IGNORE INTO course_responsibles(course_id, user_id) VALUES(?, ?)",
            (&course_id, &user_id),
        )
        .map_err(HandlerErr::update)?;
    }
    tx.commit().map_err(HandlerErr::update)?;
    Ok(json!({ "courseId": course_id }))
}

fn courses_list(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let semester_id = get_required_str(params, "semesterId")?;
    let mut stmt = conn
        .prepare(
            "SELECT c.id, c.name_de, c.name_en, k.name, c.is_graded
             FROM courses c
             JOIN course_kinds k ON k.id = c.kind_id
             WHERE c.semester_id = ?
             ORDER BY c.name_en",
        )
        .map_err(HandlerErr::query)?;
    let courses = stmt
        .query_map([&semester_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, i64>(4)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;

    let mut programs_stmt = conn
        .prepare(
            "SELECT p.name_en FROM course_programs cp JOIN programs p ON p.id = cp.program_id
             WHERE cp.course_id = ? ORDER BY p.name_en",
        )
        .map_err(HandlerErr::query)?;
    let mut responsibles_stmt = conn
        .prepare(
            "SELECT u.email FROM course_responsibles cr JOIN users u ON u.id = cr.user_id
             WHERE cr.course_id = ? ORDER BY u.email",
        )
        .map_err(HandlerErr::query)?;
    let mut evaluations_stmt = conn
        .prepare(
            "SELECT e.id, e.name, e.vote_start, e.vote_end, e.wait_for_grade_upload,
                    (SELECT COUNT(*) FROM participations p WHERE p.evaluation_id = e.id),
                    (SELECT COUNT(*) FROM contributions c WHERE c.evaluation_id = e.id)
             FROM evaluations e
             WHERE e.course_id = ?
             ORDER BY e.created_at, e.id",
        )
        .map_err(HandlerErr::query)?;

    let mut out = Vec::with_capacity(courses.len());
    for (id, name_de, name_en, kind, is_graded) in courses {
        let programs = programs_stmt
            .query_map([&id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        let responsibles = responsibles_stmt
            .query_map([&id], |r| r.get::<_, String>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        let evaluations = evaluations_stmt
            .query_map([&id], |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "name": r.get::<_, String>(1)?,
                    "voteStart": r.get::<_, Option<String>>(2)?,
                    "voteEnd": r.get::<_, Option<String>>(3)?,
                    "waitForGradeUpload": r.get::<_, i64>(4)? != 0,
                    "participantCount": r.get::<_, i64>(5)?,
                    "contributorCount": r.get::<_, i64>(6)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(HandlerErr::query)?;
        out.push(json!({
            "id": id,
            "nameDe": name_de,
            "nameEn": name_en,
            "kind": kind,
            "isGraded": is_graded,
            "programs": programs,
            "responsibles": responsibles,
            "evaluations": evaluations,
        }));
    }
    Ok(json!({ "courses": out }))
}

fn evaluations_create(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let course_id = get_required_str(params, "courseId")?;
    let course: Option<(String, bool)> = conn
        .query_row(
            "SELECT name_en, is_graded FROM courses WHERE id = ?",
            [&course_id],
            |r| Ok((r.get(0)?, r.get::<_, i64>(1)? != 0)),
        )
        .optional()
        .map_err(HandlerErr::query)?;
    let Some((course_name, is_graded)) = course else {
        return Err(HandlerErr::new("not_found", "course not found"));
    };
    let name = get_optional_str(params, "name").unwrap_or(course_name);
    let evaluation_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO evaluations(id, course_id, name, vote_start, vote_end, wait_for_grade_upload, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &evaluation_id,
            &course_id,
            &name,
            get_optional_str(params, "voteStart"),
            get_optional_str(params, "voteEnd"),
            if is_graded { 1 } else { 0 },
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::update(e).with_details(json!({ "table": "evaluations" })))?;
    Ok(json!({ "evaluationId": evaluation_id, "name": name }))
}

fn evaluations_persons(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let evaluation_id = get_required_str(params, "evaluationId")?;
    if !exists(conn, "evaluations", &evaluation_id)? {
        return Err(HandlerErr::new("not_found", "evaluation not found"));
    }
    let role = get_optional_str(params, "role").unwrap_or_else(|| "participants".to_string());
    let table = match role.as_str() {
        "participants" => "participations",
        "contributors" => "contributions",
        _ => {
            return Err(HandlerErr::new(
                "bad_params",
                "role must be participants or contributors",
            ))
        }
    };
    let sql = format!(
        "SELECT u.id, u.email, u.title, u.first_name, u.last_name, u.is_active
         FROM {} m JOIN users u ON u.id = m.user_id
         WHERE m.evaluation_id = ?
         ORDER BY u.last_name, u.first_name, u.email",
        table
    );
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let persons = stmt
        .query_map([&evaluation_id], |r| {
            Ok(json!({
                "userId": r.get::<_, String>(0)?,
                "email": r.get::<_, String>(1)?,
                "title": r.get::<_, String>(2)?,
                "firstName": r.get::<_, String>(3)?,
                "lastName": r.get::<_, String>(4)?,
                "isActive": r.get::<_, i64>(5)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "evaluationId": evaluation_id, "role": role, "persons": persons }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "users.list" => users_list(state, &req.params),
        "users.create" => users_create(state, &req.params),
        "semesters.create" => semesters_create(state, &req.params),
        "semesters.list" => semesters_list(state),
        "courses.create" => courses_create(state, &req.params),
        "courses.list" => courses_list(state, &req.params),
        "evaluations.create" => evaluations_create(state, &req.params),
        "evaluations.persons" => evaluations_persons(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
