use super::diagnostics::{ImporterLog, Severity};
use super::validator::Validation;
use super::{ImportError, ImportKind, ImportResult};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionStatus {
    Uploaded,
    ValidatedClean,
    ValidatedWithErrors,
    Committed,
    Abandoned,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uploaded => "UPLOADED",
            Self::ValidatedClean => "VALIDATED_CLEAN",
            Self::ValidatedWithErrors => "VALIDATED_WITH_ERRORS",
            Self::Committed => "COMMITTED",
            Self::Abandoned => "ABANDONED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "UPLOADED" => Some(Self::Uploaded),
            "VALIDATED_CLEAN" => Some(Self::ValidatedClean),
            "VALIDATED_WITH_ERRORS" => Some(Self::ValidatedWithErrors),
            "COMMITTED" => Some(Self::Committed),
            "ABANDONED" => Some(Self::Abandoned),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Abandoned)
    }

    pub fn can_become(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Uploaded, ValidatedClean)
                | (Uploaded, ValidatedWithErrors)
                | (Uploaded, Abandoned)
                | (ValidatedClean, Committed)
                | (ValidatedClean, Abandoned)
                | (ValidatedWithErrors, Abandoned)
        )
    }
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub token: String,
    pub owner: String,
    pub kind: ImportKind,
    pub target_id: Option<String>,
    pub file_name: Option<String>,
    /// Dropped once the session is terminal.
    pub file_bytes: Option<Vec<u8>>,
    pub file_digest: String,
    pub snapshot_digest: Option<String>,
    pub status: SessionStatus,
    pub log: ImporterLog,
    pub outcome: Option<Value>,
    pub created_at: String,
    pub updated_at: String,
    pub expires_at: String,
}

impl UploadSession {
    pub fn error_count(&self) -> usize {
        self.log.count(Severity::Error)
    }

    pub fn warning_count(&self) -> usize {
        self.log.count(Severity::Warning)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match DateTime::parse_from_rfc3339(&self.expires_at) {
            Ok(t) => t.with_timezone(&Utc) <= now,
            // An unreadable deadline cannot be honoured; treat it as passed.
            Err(_) => true,
        }
    }

    pub fn can_commit(&self) -> bool {
        self.status == SessionStatus::ValidatedClean
    }

    pub fn to_json(&self) -> Value {
        json!({
            "token": self.token,
            "owner": self.owner,
            "kind": self.kind,
            "targetId": self.target_id,
            "fileName": self.file_name,
            "fileDigest": self.file_digest,
            "status": self.status,
            "errorCount": self.error_count(),
            "warningCount": self.warning_count(),
            "canCommit": self.can_commit(),
            "log": self.log,
            "outcome": self.outcome,
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
            "expiresAt": self.expires_at,
        })
    }
}

pub fn file_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub struct NewSession<'a> {
    pub owner: &'a str,
    pub kind: ImportKind,
    pub target_id: Option<&'a str>,
    pub file_name: Option<&'a str>,
    pub bytes: &'a [u8],
    pub ttl_minutes: i64,
}

pub fn create(conn: &Connection, new: NewSession<'_>, now: DateTime<Utc>) -> ImportResult<UploadSession> {
    let session = UploadSession {
        token: uuid::Uuid::new_v4().to_string(),
        owner: new.owner.to_string(),
        kind: new.kind,
        target_id: new.target_id.map(str::to_string),
        file_name: new.file_name.map(str::to_string),
        file_bytes: Some(new.bytes.to_vec()),
        file_digest: file_digest(new.bytes),
        snapshot_digest: None,
        status: SessionStatus::Uploaded,
        log: ImporterLog::new(),
        outcome: None,
        created_at: rfc3339(now),
        updated_at: rfc3339(now),
        expires_at: rfc3339(now + Duration::minutes(new.ttl_minutes)),
    };
    conn.execute(
        "INSERT INTO import_sessions(
            token, owner, kind, target_id, file_name, file_bytes, file_digest,
            snapshot_digest, status, error_count, warning_count, log_json, outcome_json,
            created_at, updated_at, expires_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, NULL, ?, 0, 0, '[]', NULL, ?, ?, ?)",
        rusqlite::params![
            session.token,
            session.owner,
            session.kind.as_str(),
            session.target_id,
            session.file_name,
            session.file_bytes,
            session.file_digest,
            session.status.as_str(),
            session.created_at,
            session.updated_at,
            session.expires_at,
        ],
    )?;
    Ok(session)
}

pub const TERMINAL_RETENTION_DAYS: i64 = 30;

const SELECT_COLUMNS: &str = "token, owner, kind, target_id, file_name, file_bytes, file_digest,
    snapshot_digest, status, log_json, outcome_json, created_at, updated_at, expires_at";

fn from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<(UploadSession, String, Option<String>)> {
    let kind_raw: String = r.get(2)?;
    let status_raw: String = r.get(8)?;
    let log_json: String = r.get(9)?;
    let outcome_json: Option<String> = r.get(10)?;
    let kind = ImportKind::parse(&kind_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown import kind {}", kind_raw).into(),
        )
    })?;
    let status = SessionStatus::parse(&status_raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Text,
            format!("unknown session status {}", status_raw).into(),
        )
    })?;
    Ok((
        UploadSession {
            token: r.get(0)?,
            owner: r.get(1)?,
            kind,
            target_id: r.get(3)?,
            file_name: r.get(4)?,
            file_bytes: r.get(5)?,
            file_digest: r.get(6)?,
            snapshot_digest: r.get(7)?,
            status,
            log: ImporterLog::new(),
            outcome: None,
            created_at: r.get(11)?,
            updated_at: r.get(12)?,
            expires_at: r.get(13)?,
        },
        log_json,
        outcome_json,
    ))
}

fn decode(parts: (UploadSession, String, Option<String>)) -> ImportResult<UploadSession> {
    let (mut session, log_json, outcome_json) = parts;
    session.log = serde_json::from_str(&log_json)?;
    session.outcome = outcome_json
        .as_deref()
        .map(|raw| serde_json::from_str(raw))
        .transpose()?;
    Ok(session)
}

pub fn load(conn: &Connection, token: &str) -> ImportResult<UploadSession> {
    let sql = format!("SELECT {} FROM import_sessions WHERE token = ?", SELECT_COLUMNS);
    let parts = conn
        .query_row(&sql, [token], from_row)
        .optional()?
        .ok_or_else(|| ImportError::SessionNotFound(token.to_string()))?;
    decode(parts)
}

/// Records the outcome of a test run and moves the session out of UPLOADED.
pub fn record_validation(
    conn: &Connection,
    session: &mut UploadSession,
    validation: &Validation,
    snapshot_digest: &str,
    now: DateTime<Utc>,
) -> ImportResult<()> {
    let next = if validation.validated {
        SessionStatus::ValidatedClean
    } else {
        SessionStatus::ValidatedWithErrors
    };
    ensure_transition(session, next)?;
    session.status = next;
    session.log = validation.log.clone();
    session.snapshot_digest = Some(snapshot_digest.to_string());
    session.updated_at = rfc3339(now);
    conn.execute(
        "UPDATE import_sessions
         SET status = ?, snapshot_digest = ?, error_count = ?, warning_count = ?,
             log_json = ?, updated_at = ?
         WHERE token = ?",
        rusqlite::params![
            session.status.as_str(),
            session.snapshot_digest,
            session.error_count() as i64,
            session.warning_count() as i64,
            serde_json::to_string(&session.log)?,
            session.updated_at,
            session.token,
        ],
    )?;
    Ok(())
}

fn ensure_transition(session: &UploadSession, next: SessionStatus) -> ImportResult<()> {
    if session.status.can_become(next) {
        return Ok(());
    }
    Err(ImportError::PolicyViolation(format!(
        "session {} is {} and cannot become {}",
        session.token,
        session.status.as_str(),
        next.as_str()
    )))
}

/// Moves the session into a terminal state, dropping its file bytes.
pub fn finish(
    conn: &Connection,
    session: &mut UploadSession,
    next: SessionStatus,
    outcome: Value,
    now: DateTime<Utc>,
) -> ImportResult<()> {
    ensure_transition(session, next)?;
    session.status = next;
    session.file_bytes = None;
    session.outcome = Some(outcome);
    session.updated_at = rfc3339(now);
    conn.execute(
        "UPDATE import_sessions
         SET status = ?, file_bytes = NULL, outcome_json = ?, updated_at = ?
         WHERE token = ?",
        rusqlite::params![
            session.status.as_str(),
            serde_json::to_string(&session.outcome)?,
            session.updated_at,
            session.token,
        ],
    )?;
    Ok(())
}

fn abandon_where(
    conn: &Connection,
    filter: &str,
    params: &[&dyn rusqlite::ToSql],
    reason: &str,
    now: DateTime<Utc>,
) -> ImportResult<usize> {
    let sql = format!(
        "UPDATE import_sessions
         SET status = 'ABANDONED', file_bytes = NULL, outcome_json = ?, updated_at = ?
         WHERE status IN ('UPLOADED', 'VALIDATED_CLEAN', 'VALIDATED_WITH_ERRORS') AND {}",
        filter
    );
    let outcome = serde_json::to_string(&json!({ "reason": reason }))?;
    let updated_at = rfc3339(now);
    let mut all: Vec<&dyn rusqlite::ToSql> = vec![&outcome, &updated_at];
    all.extend_from_slice(params);
    Ok(conn.execute(&sql, all.as_slice())?)
}

/// Abandons the open sessions a new test of the same owner, kind and target replaces.
pub fn supersede(
    conn: &Connection,
    owner: &str,
    kind: ImportKind,
    target_id: Option<&str>,
    now: DateTime<Utc>,
) -> ImportResult<usize> {
    abandon_where(
        conn,
        "owner = ? AND kind = ? AND target_id IS ?",
        &[&owner, &kind.as_str(), &target_id],
        "superseded",
        now,
    )
}

/// Abandons open sessions past their expiry and deletes terminal sessions
/// untouched for `TERMINAL_RETENTION_DAYS`. Returns the number abandoned.
pub fn expire_stale(conn: &Connection, now: DateTime<Utc>) -> ImportResult<usize> {
    let cutoff = rfc3339(now);
    let abandoned = abandon_where(conn, "expires_at <= ?", &[&cutoff], "expired", now)?;

    let horizon = rfc3339(now - Duration::days(TERMINAL_RETENTION_DAYS));
    let pruned = conn.execute(
        "DELETE FROM import_sessions
         WHERE status IN ('COMMITTED', 'ABANDONED') AND updated_at <= ?",
        [&horizon],
    )?;
    if pruned > 0 {
        tracing::debug!(pruned, "deleted old import sessions");
    }
    Ok(abandoned)
}

/// Open sessions of an owner, newest first.
pub fn pending(conn: &Connection, owner: &str) -> ImportResult<Vec<UploadSession>> {
    let sql = format!(
        "SELECT {} FROM import_sessions
         WHERE owner = ? AND status IN ('UPLOADED', 'VALIDATED_CLEAN', 'VALIDATED_WITH_ERRORS')
         ORDER BY created_at DESC, token",
        SELECT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let parts = stmt
        .query_map([owner], from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    parts.into_iter().map(decode).collect()
}
