use crate::ipc::helpers::{db_conn, get_optional_str, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value as SqlValue;
use serde_json::{json, Value};

const DEFAULT_LIMIT: i64 = 200;
const MAX_LIMIT: i64 = 1000;

fn changelog_list(state: &AppState, params: &Value) -> Result<Value, HandlerErr> {
    let conn = db_conn(state)?;
    let limit = match params.get("limit") {
        None | Some(Value::Null) => DEFAULT_LIMIT,
        Some(v) => v
            .as_i64()
            .filter(|n| *n > 0)
            .ok_or_else(|| HandlerErr::new("bad_params", "limit must be a positive integer"))?
            .min(MAX_LIMIT),
    };

    let mut sql = String::from(
        "SELECT id, entity_type, entity_id, action, data, request_id, actor, created_at
         FROM change_log WHERE 1 = 1",
    );
    let mut binds: Vec<SqlValue> = Vec::new();
    for (param, column) in [
        ("entityType", "entity_type"),
        ("entityId", "entity_id"),
        ("requestId", "request_id"),
    ] {
        if let Some(v) = get_optional_str(params, param) {
            sql.push_str(&format!(" AND {} = ?", column));
            binds.push(SqlValue::Text(v));
        }
    }
    sql.push_str(" ORDER BY id DESC LIMIT ?");
    binds.push(SqlValue::Integer(limit));

    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let entries = stmt
        .query_map(rusqlite::params_from_iter(binds.iter()), |r| {
            let raw: String = r.get(4)?;
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "entityType": r.get::<_, String>(1)?,
                "entityId": r.get::<_, String>(2)?,
                "action": r.get::<_, String>(3)?,
                "data": serde_json::from_str::<Value>(&raw).unwrap_or(Value::String(raw)),
                "requestId": r.get::<_, String>(5)?,
                "actor": r.get::<_, String>(6)?,
                "createdAt": r.get::<_, String>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(HandlerErr::query)?;
    Ok(json!({ "entries": entries }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "changelog.list" => Some(respond(&req.id, changelog_list(state, &req.params))),
        _ => None,
    }
}
