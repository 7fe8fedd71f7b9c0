use super::executor::{self, CommitContext, CommitSummary};
use super::planner::{self, PlanCounts};
use super::reader::{self, FileFormat};
use super::schema::{ImportRow, RowRecord, Schema};
use super::session::{self, NewSession, SessionStatus, UploadSession};
use super::settings::ImportSettings;
use super::snapshot::{self, Snapshot};
use super::validator::{self, Validation};
use super::{
    ConfirmOperation, ImportAction, ImportError, ImportKind, ImportPolicy, ImportResult,
    ImportTarget,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use serde_json::{json, Value};

pub struct TestUpload<'a> {
    pub owner: &'a str,
    pub kind: ImportKind,
    pub target: ImportTarget,
    pub file_name: Option<&'a str>,
    pub bytes: &'a [u8],
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanPreview {
    pub merge: PlanCounts,
    pub replace: PlanCounts,
}

#[derive(Debug, Clone)]
pub struct TestReport {
    pub session: UploadSession,
    pub format: FileFormat,
    pub row_count: usize,
    /// Only present when the upload validated cleanly.
    pub preview: Option<PlanPreview>,
}

impl TestReport {
    pub fn to_json(&self) -> Value {
        let mut out = self.session.to_json();
        if let Some(obj) = out.as_object_mut() {
            obj.insert("format".to_string(), json!(self.format));
            obj.insert("rowCount".to_string(), json!(self.row_count));
            obj.insert("preview".to_string(), json!(self.preview));
        }
        out
    }
}

fn begin_immediate(conn: &Connection) -> ImportResult<Transaction<'_>> {
    Ok(Transaction::new_unchecked(conn, TransactionBehavior::Immediate)?)
}

/// Reads and validates an upload without touching stored entities, and
/// records the result as a new session replacing earlier open ones.
pub fn test_upload(
    conn: &Connection,
    settings: &ImportSettings,
    upload: TestUpload<'_>,
    now: DateTime<Utc>,
) -> ImportResult<TestReport> {
    let table = reader::read(upload.bytes, &Schema::for_kind(upload.kind))?;

    let tx = begin_immediate(conn)?;
    session::expire_stale(&tx, now)?;
    let superseded = session::supersede(&tx, upload.owner, upload.kind, upload.target.id(), now)?;
    if superseded > 0 {
        tracing::debug!(superseded, owner = upload.owner, "abandoned earlier test runs");
    }

    let snapshot = Snapshot::load(&tx, upload.kind, &upload.target)?;
    let validation = validator::validate_table(upload.kind, &table, &snapshot, settings);
    let digest = snapshot.digest()?;

    let mut session = session::create(
        &tx,
        NewSession {
            owner: upload.owner,
            kind: upload.kind,
            target_id: upload.target.id(),
            file_name: upload.file_name,
            bytes: upload.bytes,
            ttl_minutes: settings.session_ttl_minutes,
        },
        now,
    )?;
    session::record_validation(&tx, &mut session, &validation, &digest, now)?;
    tx.commit()?;

    let preview = validation.validated.then(|| PlanPreview {
        merge: planner::plan(upload.kind, &table.rows, &snapshot, ImportPolicy::Merge, settings)
            .counts(),
        replace: planner::plan(upload.kind, &table.rows, &snapshot, ImportPolicy::Replace, settings)
            .counts(),
    });

    tracing::info!(
        token = %session.token,
        kind = upload.kind.as_str(),
        rows = table.rows.len(),
        errors = session.error_count(),
        warnings = session.warning_count(),
        "import test run finished"
    );

    Ok(TestReport {
        row_count: table.rows.len(),
        format: table.format,
        session,
        preview,
    })
}

pub struct CommitRequest<'a> {
    pub token: &'a str,
    pub operation: &'a str,
    pub actor: &'a str,
    pub acknowledge_warnings: bool,
    pub vote_start: Option<&'a str>,
    pub vote_end: Option<&'a str>,
}

/// Voting window for evaluations created by a semester import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoteWindow {
    pub start: String,
    pub end: String,
}

/// Accepts RFC 3339 or `YYYY-MM-DD[T ]HH:MM[:SS]` for the start and `YYYY-MM-DD` for the end date.
pub fn parse_vote_window(start: Option<&str>, end: Option<&str>) -> ImportResult<VoteWindow> {
    let (Some(start), Some(end)) = (
        start.map(str::trim).filter(|s| !s.is_empty()),
        end.map(str::trim).filter(|s| !s.is_empty()),
    ) else {
        return Err(ImportError::BadParams(
            "semester imports need voteStartDatetime and voteEndDate".to_string(),
        ));
    };
    let start_at = DateTime::parse_from_rfc3339(start)
        .map(|t| t.naive_utc())
        .or_else(|_| NaiveDateTime::parse_from_str(start, "%Y-%m-%dT%H:%M:%S"))
        .or_else(|_| NaiveDateTime::parse_from_str(start, "%Y-%m-%dT%H:%M"))
        .or_else(|_| NaiveDateTime::parse_from_str(start, "%Y-%m-%d %H:%M"))
        .map_err(|_| ImportError::BadParams(format!("invalid voteStartDatetime: {}", start)))?;
    let end_date = NaiveDate::parse_from_str(end, "%Y-%m-%d")
        .map_err(|_| ImportError::BadParams(format!("invalid voteEndDate: {}", end)))?;
    if end_date < start_at.date() {
        return Err(ImportError::BadParams(
            "voteEndDate must not be before voteStartDatetime".to_string(),
        ));
    }
    Ok(VoteWindow {
        start: start_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
        end: end_date.format("%Y-%m-%d").to_string(),
    })
}

fn ensure_open(conn: &Connection, session: &mut UploadSession, now: DateTime<Utc>) -> ImportResult<()> {
    match session.status {
        SessionStatus::Committed => {
            return Err(ImportError::PolicyViolation(format!(
                "session {} was already committed",
                session.token
            )))
        }
        SessionStatus::Abandoned => {
            return Err(ImportError::PolicyViolation(format!(
                "session {} was abandoned; upload the file again",
                session.token
            )))
        }
        _ => {}
    }
    if session.is_expired(now) {
        session::finish(conn, session, SessionStatus::Abandoned, json!({ "reason": "expired" }), now)?;
        return Err(ImportError::PolicyViolation(format!(
            "session {} expired; upload the file again",
            session.token
        )));
    }
    Ok(())
}

fn check_acknowledgement(
    log_has_warnings: bool,
    settings: &ImportSettings,
    acknowledged: bool,
) -> ImportResult<()> {
    if log_has_warnings && settings.require_warning_acknowledgement && !acknowledged {
        return Err(ImportError::PolicyViolation(
            "the test run reported warnings; confirm with acknowledgeWarnings".to_string(),
        ));
    }
    Ok(())
}

/// Confirms a clean session. The snapshot is re-read under the write lock and
/// must match the digest recorded by the test run.
pub fn commit(
    conn: &Connection,
    settings: &ImportSettings,
    req: CommitRequest<'_>,
    now: DateTime<Utc>,
) -> ImportResult<CommitSummary> {
    let op = ConfirmOperation::parse(req.operation)?;
    if op.action == ImportAction::Copy {
        return Err(ImportError::BadParams(
            "copy operations are run with imports.copyPersons".to_string(),
        ));
    }

    let tx = begin_immediate(conn)?;
    let mut session = session::load(&tx, req.token)?;
    if let Err(e) = ensure_open(&tx, &mut session, now) {
        // Persist the expiry before reporting it.
        tx.commit()?;
        return Err(e);
    }
    if session.status != SessionStatus::ValidatedClean {
        return Err(ImportError::PolicyViolation(format!(
            "session {} has validation errors and cannot be committed",
            session.token
        )));
    }
    op.check_kind(session.kind)?;
    if session.kind == ImportKind::UserBulkUpdate && op.kind != Some(ImportKind::UserBulkUpdate) {
        return Err(ImportError::PolicyViolation(
            "user bulk updates are confirmed with bulk_update".to_string(),
        ));
    }
    check_acknowledgement(session.log.has_warnings(), settings, req.acknowledge_warnings)?;
    let window = if session.kind == ImportKind::Semester {
        Some(parse_vote_window(req.vote_start, req.vote_end)?)
    } else {
        None
    };

    let target = ImportTarget::for_kind(session.kind, session.target_id.as_deref())?;
    let snapshot = Snapshot::load(&tx, session.kind, &target)?;
    let digest = snapshot.digest()?;
    if session.snapshot_digest.as_deref() != Some(digest.as_str()) {
        tracing::warn!(token = %session.token, "stored data changed since the test run");
        session::finish(
            &tx,
            &mut session,
            SessionStatus::Abandoned,
            json!({ "reason": "conflict" }),
            now,
        )?;
        tx.commit()?;
        return Err(ImportError::CommitConflict(
            "stored data changed since the test run; upload the file again".to_string(),
        ));
    }

    let bytes = session.file_bytes.clone().ok_or_else(|| {
        ImportError::PolicyViolation(format!("session {} has no stored upload", session.token))
    })?;
    if session::file_digest(&bytes) != session.file_digest {
        return Err(ImportError::PolicyViolation(format!(
            "stored upload of session {} is damaged",
            session.token
        )));
    }
    let table = reader::read(&bytes, &Schema::for_kind(session.kind))?;
    let validation = validator::validate_table(session.kind, &table, &snapshot, settings);
    if !validation.validated {
        return Err(ImportError::PolicyViolation(
            "the upload no longer validates under the current settings; test it again".to_string(),
        ));
    }

    let plan = planner::plan(session.kind, &table.rows, &snapshot, op.policy, settings);
    let request_id = uuid::Uuid::new_v4().to_string();
    let summary = executor::apply(
        &tx,
        &plan,
        &CommitContext {
            request_id: &request_id,
            actor: req.actor,
            vote_start: window.as_ref().map(|w| w.start.as_str()),
            vote_end: window.as_ref().map(|w| w.end.as_str()),
        },
    )?;
    session::finish(
        &tx,
        &mut session,
        SessionStatus::Committed,
        json!({
            "operation": req.operation,
            "policy": op.policy,
            "summary": summary,
        }),
        now,
    )?;
    tx.commit()?;

    tracing::info!(
        token = %session.token,
        request_id = %request_id,
        policy = op.policy.as_str(),
        created = summary.created,
        updated = summary.updated,
        deleted = summary.deleted,
        "import committed"
    );
    Ok(summary)
}

pub fn abandon(conn: &Connection, token: &str, now: DateTime<Utc>) -> ImportResult<UploadSession> {
    let tx = begin_immediate(conn)?;
    let mut session = session::load(&tx, token)?;
    if session.status.is_terminal() {
        return Err(ImportError::PolicyViolation(format!(
            "session {} is already {}",
            session.token,
            session.status.as_str()
        )));
    }
    session::finish(&tx, &mut session, SessionStatus::Abandoned, json!({ "reason": "abandoned" }), now)?;
    tx.commit()?;
    tracing::info!(token = %session.token, "import session abandoned");
    Ok(session)
}

/// Current state of a session; open sessions past their deadline are abandoned on read.
pub fn session_status(conn: &Connection, token: &str, now: DateTime<Utc>) -> ImportResult<UploadSession> {
    let mut session = session::load(conn, token)?;
    if !session.status.is_terminal() && session.is_expired(now) {
        session::finish(conn, &mut session, SessionStatus::Abandoned, json!({ "reason": "expired" }), now)?;
    }
    Ok(session)
}

pub fn pending(conn: &Connection, owner: &str, now: DateTime<Utc>) -> ImportResult<Vec<UploadSession>> {
    session::expire_stale(conn, now)?;
    session::pending(conn, owner)
}

pub struct CopyRequest<'a> {
    pub operation: &'a str,
    pub source_evaluation_id: &'a str,
    pub target_evaluation_id: &'a str,
    pub actor: &'a str,
    pub acknowledge_warnings: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CopyOutcome {
    pub validation: Validation,
    pub summary: CommitSummary,
}

/// Copies the participants or contributors of one evaluation into another,
/// through the same validation, planning and commit steps as an upload.
pub fn copy_persons(
    conn: &Connection,
    settings: &ImportSettings,
    req: CopyRequest<'_>,
) -> ImportResult<CopyOutcome> {
    let op = ConfirmOperation::parse(req.operation)?;
    let (ImportAction::Copy, Some(kind)) = (op.action, op.kind) else {
        return Err(ImportError::BadParams(format!(
            "{} is not a copy operation",
            req.operation
        )));
    };
    if req.source_evaluation_id == req.target_evaluation_id {
        return Err(ImportError::BadParams(
            "source and target evaluation must differ".to_string(),
        ));
    }

    let tx = begin_immediate(conn)?;
    let rows = snapshot::member_persons(&tx, kind, req.source_evaluation_id)?
        .into_iter()
        .enumerate()
        .map(|(i, person)| ImportRow {
            line: i + 1,
            record: RowRecord::Person(person),
        })
        .collect::<Vec<_>>();
    let target = ImportTarget::Evaluation(req.target_evaluation_id.to_string());
    let snapshot = Snapshot::load(&tx, kind, &target)?;
    let validation = validator::validate_rows(kind, &rows, &snapshot, settings);
    if !validation.validated {
        return Err(ImportError::PolicyViolation(format!(
            "the {}s of evaluation {} cannot be copied: {} error(s)",
            kind.as_str(),
            req.source_evaluation_id,
            validation.log.count(super::diagnostics::Severity::Error)
        )));
    }
    check_acknowledgement(validation.log.has_warnings(), settings, req.acknowledge_warnings)?;

    let plan = planner::plan(kind, &rows, &snapshot, op.policy, settings);
    let request_id = uuid::Uuid::new_v4().to_string();
    let summary = executor::apply(
        &tx,
        &plan,
        &CommitContext {
            request_id: &request_id,
            actor: req.actor,
            vote_start: None,
            vote_end: None,
        },
    )?;
    tx.commit()?;

    tracing::info!(
        request_id = %request_id,
        source = req.source_evaluation_id,
        target = req.target_evaluation_id,
        created = summary.created,
        deleted = summary.deleted,
        "copied {}s",
        kind.as_str()
    );
    Ok(CopyOutcome { validation, summary })
}
