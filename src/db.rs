use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;

pub const DB_FILE_NAME: &str = "evap.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    // Several daemons may share one workspace; writers queue on the lock instead of failing fast.
    conn.busy_timeout(std::time::Duration::from_secs(5))?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS settings(
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT,
            email TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL DEFAULT '',
            first_name TEXT NOT NULL DEFAULT '',
            last_name TEXT NOT NULL DEFAULT '',
            is_active INTEGER NOT NULL DEFAULT 1,
            updated_at TEXT
        )",
        [],
    )?;
    ensure_users_username(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS semesters(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS programs(
            id TEXT PRIMARY KEY,
            name_de TEXT NOT NULL,
            name_en TEXT NOT NULL,
            UNIQUE(name_de, name_en)
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_kinds(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            semester_id TEXT NOT NULL,
            name_de TEXT NOT NULL,
            name_en TEXT NOT NULL,
            kind_id TEXT NOT NULL,
            is_graded INTEGER NOT NULL DEFAULT 1,
            FOREIGN KEY(semester_id) REFERENCES semesters(id) ON DELETE CASCADE,
            FOREIGN KEY(kind_id) REFERENCES course_kinds(id),
            UNIQUE(semester_id, name_en),
            UNIQUE(semester_id, name_de)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_courses_semester ON courses(semester_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_programs(
            course_id TEXT NOT NULL,
            program_id TEXT NOT NULL,
            PRIMARY KEY(course_id, program_id),
            FOREIGN KEY(course_id) REFERENCES courses(id) ON DELETE CASCADE,
            FOREIGN KEY(program_id) REFERENCES programs(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS course_responsibles(
            course_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            PRIMARY KEY(course_id, user_id),
            FOREIGN KEY(course_id) REFERENCES courses(id) ON DELETE CASCADE,
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_course_responsibles_user ON course_responsibles(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluations(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            vote_start TEXT,
            vote_end TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evaluations_course ON evaluations(course_id)",
        [],
    )?;
    // Grading moved from courses to evaluations; older workspaces get the column backfilled.
    ensure_evaluations_wait_for_grade_upload(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS participations(
            evaluation_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            PRIMARY KEY(evaluation_id, user_id),
            FOREIGN KEY(evaluation_id) REFERENCES evaluations(id) ON DELETE CASCADE,
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_participations_user ON participations(user_id)",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS contributions(
            id TEXT PRIMARY KEY,
            evaluation_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            FOREIGN KEY(evaluation_id) REFERENCES evaluations(id) ON DELETE CASCADE,
            FOREIGN KEY(user_id) REFERENCES users(id) ON DELETE CASCADE,
            UNIQUE(evaluation_id, user_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_contributions_user ON contributions(user_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS import_sessions(
            token TEXT PRIMARY KEY,
            owner TEXT NOT NULL,
            kind TEXT NOT NULL,
            target_id TEXT,
            file_name TEXT,
            file_bytes BLOB,
            file_digest TEXT NOT NULL,
            snapshot_digest TEXT,
            status TEXT NOT NULL,
            error_count INTEGER NOT NULL DEFAULT 0,
            warning_count INTEGER NOT NULL DEFAULT 0,
            log_json TEXT NOT NULL DEFAULT '[]',
            outcome_json TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            expires_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_import_sessions_owner ON import_sessions(owner, kind)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS change_log(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entity_type TEXT NOT NULL,
            entity_id TEXT NOT NULL,
            action TEXT NOT NULL,
            data TEXT NOT NULL,
            request_id TEXT NOT NULL,
            actor TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_change_log_entity ON change_log(entity_type, entity_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_change_log_request ON change_log(request_id)",
        [],
    )?;

    Ok(conn)
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn settings_get_json(conn: &Connection, key: &str) -> anyhow::Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row("SELECT value FROM settings WHERE key = ?", [key], |r| {
            r.get(0)
        })
        .optional()?;
    match raw {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub fn settings_set_json(conn: &Connection, key: &str, value: &Value) -> anyhow::Result<()> {
    conn.execute(
        "INSERT INTO settings(key, value) VALUES(?, ?)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        (key, serde_json::to_string(value)?),
    )?;
    Ok(())
}

fn ensure_users_username(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "users", "username")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE users ADD COLUMN username TEXT", [])?;
    Ok(())
}

fn ensure_evaluations_wait_for_grade_upload(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "evaluations", "wait_for_grade_upload")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE evaluations ADD COLUMN wait_for_grade_upload INTEGER NOT NULL DEFAULT 1",
        [],
    )?;
    // Ungraded courses never wait for grade documents before publishing.
    conn.execute(
        "UPDATE evaluations SET wait_for_grade_upload = 0
         WHERE course_id IN (SELECT id FROM courses WHERE is_graded = 0)",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
