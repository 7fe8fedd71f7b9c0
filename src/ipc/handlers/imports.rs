use crate::import::settings::{self, ImportSettings};
use crate::import::workflow::{self, CommitRequest, CopyRequest, TestUpload};
use crate::import::{ImportKind, ImportTarget, TargetScope};
use crate::ipc::helpers::{
    db_conn, get_bool, get_optional_str, get_required_str, respond, HandlerErr,
};
use crate::ipc::types::{AppState, Request};
use base64::Engine as _;
use rusqlite::Connection;
use serde_json::{json, Value};

/// Uploads above this size are refused before they are decoded.
const MAX_UPLOAD_BYTES: usize = 32 * 1024 * 1024;

fn load_settings(conn: &Connection) -> Result<ImportSettings, HandlerErr> {
    settings::load(conn).map_err(HandlerErr::query)
}

fn actor(params: &Value, settings: &ImportSettings, key: &str) -> String {
    get_optional_str(params, key).unwrap_or_else(|| settings.default_owner.clone())
}

fn parse_kind(params: &Value) -> Result<ImportKind, HandlerErr> {
    let raw = get_required_str(params, "kind")?;
    ImportKind::parse(&raw)
        .ok_or_else(|| HandlerErr::new("bad_params", format!("unknown import kind: {}", raw)))
}

fn parse_target(params: &Value, kind: ImportKind) -> Result<ImportTarget, HandlerErr> {
    let id = match kind.scope() {
        TargetScope::Global => None,
        TargetScope::Evaluation => get_optional_str(params, "evaluationId"),
        TargetScope::Semester => get_optional_str(params, "semesterId"),
    };
    Ok(ImportTarget::for_kind(kind, id.as_deref())?)
}

/// Upload bytes come from a local file (`inPath`) or inline (`contentBase64`).
fn upload_bytes(params: &Value) -> Result<(Vec<u8>, Option<String>), HandlerErr> {
    let file_name = get_optional_str(params, "fileName");
    if let Some(in_path) = get_optional_str(params, "inPath") {
        let bytes = std::fs::read(&in_path).map_err(|e| {
            HandlerErr::new("io_failed", e.to_string()).with_details(json!({ "path": in_path }))
        })?;
        let file_name = file_name.or_else(|| {
            std::path::Path::new(&in_path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
        });
        return check_size(bytes).map(|b| (b, file_name));
    }
    if let Some(encoded) = get_optional_str(params, "contentBase64") {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| HandlerErr::new("bad_params", format!("contentBase64 is not valid base64: {}", e)))?;
        return check_size(bytes).map(|b| (b, file_name));
    }
    Err(HandlerErr::new("bad_params", "missing inPath or contentBase64"))
}

fn check_size(bytes: Vec<u8>) -> Result<Vec<u8>, HandlerErr> {
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(HandlerErr::new(
            "bad_params",
            format!("upload exceeds {} bytes", MAX_UPLOAD_BYTES),
        ));
    }
    Ok(bytes)
}

fn imports_test(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let settings = load_settings(conn)?;
    let kind = parse_kind(params)?;
    let target = parse_target(params, kind)?;
    let (bytes, file_name) = upload_bytes(params)?;
    let owner = actor(params, &settings, "owner");

    let report = workflow::test_upload(
        conn,
        &settings,
        TestUpload {
            owner: &owner,
            kind,
            target,
            file_name: file_name.as_deref(),
            bytes: &bytes,
        },
        chrono::Utc::now(),
    )?;
    Ok(report.to_json())
}

fn imports_commit(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let settings = load_settings(conn)?;
    let token = get_required_str(params, "token")?;
    let operation = get_required_str(params, "operation")?;
    let actor = actor(params, &settings, "actor");
    let vote_start = get_optional_str(params, "voteStartDatetime");
    let vote_end = get_optional_str(params, "voteEndDate");

    let summary = workflow::commit(
        conn,
        &settings,
        CommitRequest {
            token: &token,
            operation: &operation,
            actor: &actor,
            acknowledge_warnings: get_bool(params, "acknowledgeWarnings", false)?,
            vote_start: vote_start.as_deref(),
            vote_end: vote_end.as_deref(),
        },
        chrono::Utc::now(),
    )?;
    Ok(json!({ "token": token, "status": "COMMITTED", "summary": summary }))
}

fn imports_abandon(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let token = get_required_str(params, "token")?;
    let session = workflow::abandon(conn, &token, chrono::Utc::now())?;
    Ok(json!({ "token": session.token, "status": session.status }))
}

fn imports_session(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let token = get_required_str(params, "token")?;
    let session = workflow::session_status(conn, &token, chrono::Utc::now())?;
    Ok(session.to_json())
}

fn imports_pending(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let settings = load_settings(conn)?;
    let owner = actor(params, &settings, "owner");
    let sessions = workflow::pending(conn, &owner, chrono::Utc::now())?;
    // Per kind, whether an open session is ready to be confirmed.
    let mut test_passed = serde_json::Map::new();
    for s in &sessions {
        let entry = test_passed
            .entry(s.kind.as_str().to_string())
            .or_insert(Value::Bool(false));
        if s.can_commit() {
            *entry = Value::Bool(true);
        }
    }
    let sessions = sessions
        .iter()
        .map(|s| {
            let mut v = s.to_json();
            if let Some(obj) = v.as_object_mut() {
                obj.remove("log");
            }
            v
        })
        .collect::<Vec<_>>();
    Ok(json!({ "owner": owner, "sessions": sessions, "testPassed": test_passed }))
}

fn imports_copy_persons(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let settings = load_settings(conn)?;
    let operation = get_required_str(params, "operation")?;
    let source = get_required_str(params, "sourceEvaluationId")?;
    let target = get_required_str(params, "evaluationId")?;
    let actor = actor(params, &settings, "actor");

    let outcome = workflow::copy_persons(
        conn,
        &settings,
        CopyRequest {
            operation: &operation,
            source_evaluation_id: &source,
            target_evaluation_id: &target,
            actor: &actor,
            acknowledge_warnings: get_bool(params, "acknowledgeWarnings", false)?,
        },
    )?;
    Ok(json!({
        "log": outcome.validation.log,
        "summary": outcome.summary,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "imports.test" => imports_test(state, &req.params),
        "imports.commit" => imports_commit(state, &req.params),
        "imports.abandon" => imports_abandon(state, &req.params),
        "imports.session" => imports_session(state, &req.params),
        "imports.pending" => imports_pending(state, &req.params),
        "imports.copyPersons" => imports_copy_persons(state, &req.params),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
