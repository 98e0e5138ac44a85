use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use super::params::{optional_str, required_object, required_str};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::guard;
use crate::ipc::types::{AppState, Request};
use crate::staging::StagedUpload;

/// Free-text profile fields: request key, column.
const TEXT_FIELDS: &[(&str, &str)] = &[
    ("name", "name"),
    ("gender", "gender"),
    ("dob", "dob"),
    ("height", "height"),
    ("bloodGroup", "blood_group"),
    ("gotra", "gotra"),
    ("bansha", "bansha"),
    ("education", "education"),
    ("technicalEducation", "technical_education"),
    ("professionalEducation", "professional_education"),
    ("occupation", "occupation"),
    ("father", "father"),
    ("mother", "mother"),
    ("address", "address"),
    ("phone", "phone"),
    ("email", "email"),
];

const REQUIRED_FIELDS: [&str; 2] = ["name", "gender"];

const CANDIDATE_SELECT: &str = "SELECT id, name, gender, dob, age, height, blood_group, gotra,
       bansha, education, technical_education, professional_education, occupation,
       father, mother, address, phone, email, photo, is_matched,
       matched_partner_name, matched_partner_gender, created_at, updated_at
     FROM candidates";

const PHOTO_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "webp"];

fn candidate_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    let mut out = serde_json::Map::new();
    out.insert("id".into(), Value::from(r.get::<_, String>(0)?));
    for (i, (key, _)) in TEXT_FIELDS.iter().take(3).enumerate() {
        out.insert((*key).into(), Value::from(r.get::<_, Option<String>>(1 + i)?));
    }
    out.insert("age".into(), Value::from(r.get::<_, Option<i64>>(4)?));
    for (i, (key, _)) in TEXT_FIELDS.iter().skip(3).enumerate() {
        out.insert((*key).into(), Value::from(r.get::<_, Option<String>>(5 + i)?));
    }
    out.insert("photo".into(), Value::from(r.get::<_, Option<String>>(18)?));
    out.insert("isMatched".into(), Value::from(r.get::<_, i64>(19)? != 0));
    out.insert(
        "matchedPartnerName".into(),
        Value::from(r.get::<_, Option<String>>(20)?),
    );
    out.insert(
        "matchedPartnerGender".into(),
        Value::from(r.get::<_, Option<String>>(21)?),
    );
    out.insert("createdAt".into(), Value::from(r.get::<_, String>(22)?));
    out.insert("updatedAt".into(), Value::from(r.get::<_, Option<String>>(23)?));
    Ok(Value::Object(out))
}

fn find_candidate(conn: &Connection, id: &str) -> Result<Option<Value>, HandlerErr> {
    conn.query_row(
        &format!("{CANDIDATE_SELECT} WHERE id = ?"),
        [id],
        candidate_from_row,
    )
    .optional()
    .map_err(HandlerErr::query)
}

/// Empty strings clear a field.
fn text_value(v: &Value) -> Result<SqlValue, HandlerErr> {
    match v {
        Value::Null => Ok(SqlValue::Null),
        Value::String(s) if s.trim().is_empty() => Ok(SqlValue::Null),
        Value::String(s) => Ok(SqlValue::Text(s.trim().to_string())),
        Value::Number(n) => Ok(SqlValue::Text(n.to_string())),
        other => Err(HandlerErr::bad_params("expected a string").with_details(json!({ "value": other }))),
    }
}

fn age_value(v: &Value) -> Result<SqlValue, HandlerErr> {
    match v {
        Value::Null => Ok(SqlValue::Null),
        Value::String(s) if s.trim().is_empty() => Ok(SqlValue::Null),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|n| *n >= 0)
            .map(SqlValue::Integer)
            .ok_or_else(|| HandlerErr::bad_params("age must be a non-negative integer")),
        Value::Number(n) => n
            .as_i64()
            .filter(|n| *n >= 0)
            .map(SqlValue::Integer)
            .ok_or_else(|| HandlerErr::bad_params("age must be a non-negative integer")),
        _ => Err(HandlerErr::bad_params("age must be a non-negative integer")),
    }
}

/// Columns and values present in `fields`, in table order.
fn collect_columns(
    fields: &serde_json::Map<String, Value>,
) -> Result<Vec<(&'static str, SqlValue)>, HandlerErr> {
    let mut out = Vec::new();
    for (key, column) in TEXT_FIELDS {
        if let Some(v) = fields.get(*key) {
            let value = text_value(v)?;
            if REQUIRED_FIELDS.contains(key) && value == SqlValue::Null {
                return Err(HandlerErr::bad_params(format!("{key} cannot be empty")));
            }
            out.push((*column, value));
        }
    }
    if let Some(v) = fields.get("age") {
        out.push(("age", age_value(v)?));
    }
    if let Some(url) = fields.get("photoUrl") {
        out.push(("photo", text_value(url)?));
    }
    Ok(out)
}

/// Copies a staged photo into `<workspace>/photos/` and returns the stored
/// path relative to the workspace.
fn store_photo(workspace: &Path, upload: &StagedUpload) -> Result<String, HandlerErr> {
    let ext = upload
        .extension()
        .filter(|e| PHOTO_EXTENSIONS.contains(&e.as_str()))
        .ok_or_else(|| {
            HandlerErr::bad_params("photo must be a jpg, png or webp file")
                .with_details(json!({ "path": upload.path().to_string_lossy() }))
        })?;
    let dir = workspace.join("photos");
    let file_name = format!("{}.{}", Uuid::new_v4(), ext);
    std::fs::create_dir_all(&dir)
        .and_then(|_| std::fs::copy(upload.path(), dir.join(&file_name)))
        .map_err(|e| {
            HandlerErr::new("io_failed", e.to_string())
                .with_details(json!({ "path": upload.path().to_string_lossy() }))
        })?;
    Ok(format!("photos/{file_name}"))
}

fn remove_stored_photo(workspace: &Path, photo: Option<&str>) {
    let Some(rel) = photo.filter(|p| p.starts_with("photos/")) else {
        return;
    };
    let path: PathBuf = workspace.join(rel);
    if let Err(e) = std::fs::remove_file(&path) {
        warn!(path = %path.display(), "failed to remove stored photo: {e}");
    }
}

fn workspace_path(state: &AppState) -> Result<&Path, HandlerErr> {
    state
        .workspace
        .as_deref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

fn list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = guard::workspace_db(state)?;
    let gender = optional_str(&req.params, "gender");
    let (filter, args): (&str, Vec<String>) = match gender {
        Some(g) => ("WHERE gender = ?", vec![g]),
        None => ("", Vec::new()),
    };
    let mut stmt = conn
        .prepare(&format!("{CANDIDATE_SELECT} {filter} ORDER BY name"))
        .map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map(params_from_iter(args.iter()), candidate_from_row)
        .map_err(HandlerErr::query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(HandlerErr::query)?;
    Ok(json!({ "candidates": rows }))
}

fn get(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = guard::workspace_db(state)?;
    let id = required_str(&req.params, "candidateId")?;
    let candidate =
        find_candidate(conn, &id)?.ok_or_else(|| HandlerErr::not_found("candidate not found"))?;
    Ok(json!({ "candidate": candidate }))
}

fn create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    guard::require_admin(state, req)?;
    let conn = guard::workspace_db(state)?;
    let upload = optional_str(&req.params, "photoPath")
        .map(|p| guard::staged_upload(state, &p))
        .transpose()?;
    let fields = req
        .params
        .as_object()
        .ok_or_else(|| HandlerErr::bad_params("params must be an object"))?;
    for key in REQUIRED_FIELDS {
        required_str(&req.params, key)?;
    }

    let mut columns = collect_columns(fields)?;
    if let Some(upload) = &upload {
        let stored = store_photo(workspace_path(state)?, upload)?;
        columns.retain(|(c, _)| *c != "photo");
        columns.push(("photo", SqlValue::Text(stored)));
    }

    let id = Uuid::new_v4().to_string();
    let mut names = vec!["id", "created_at"];
    let mut values = vec![
        SqlValue::Text(id.clone()),
        SqlValue::Text(Utc::now().to_rfc3339()),
    ];
    for (column, value) in columns {
        names.push(column);
        values.push(value);
    }
    let placeholders = vec!["?"; names.len()].join(", ");
    conn.execute(
        &format!(
            "INSERT INTO candidates({}) VALUES({})",
            names.join(", "),
            placeholders
        ),
        params_from_iter(values.iter()),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;

    info!(candidate_id = %id, "candidate created");
    let candidate =
        find_candidate(conn, &id)?.ok_or_else(|| HandlerErr::not_found("candidate not found"))?;
    Ok(json!({ "candidate": candidate }))
}

fn update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    guard::require_admin(state, req)?;
    let conn = guard::workspace_db(state)?;
    let upload = optional_str(&req.params, "photoPath")
        .map(|p| guard::staged_upload(state, &p))
        .transpose()?;
    let id = required_str(&req.params, "candidateId")?;
    let patch = required_object(&req.params, "patch")?;

    let existing =
        find_candidate(conn, &id)?.ok_or_else(|| HandlerErr::not_found("candidate not found"))?;
    let mut columns = collect_columns(patch)?;
    if let Some(upload) = &upload {
        let workspace = workspace_path(state)?;
        let stored = store_photo(workspace, upload)?;
        remove_stored_photo(workspace, existing["photo"].as_str());
        columns.retain(|(c, _)| *c != "photo");
        columns.push(("photo", SqlValue::Text(stored)));
    }
    if columns.is_empty() {
        return Err(HandlerErr::bad_params("nothing to update"));
    }

    let mut sets: Vec<String> = columns.iter().map(|(c, _)| format!("{c} = ?")).collect();
    sets.push("updated_at = ?".to_string());
    let mut values: Vec<SqlValue> = columns.into_iter().map(|(_, v)| v).collect();
    values.push(SqlValue::Text(Utc::now().to_rfc3339()));
    values.push(SqlValue::Text(id.clone()));
    conn.execute(
        &format!("UPDATE candidates SET {} WHERE id = ?", sets.join(", ")),
        params_from_iter(values.iter()),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;

    info!(candidate_id = %id, "candidate updated");
    let candidate =
        find_candidate(conn, &id)?.ok_or_else(|| HandlerErr::not_found("candidate not found"))?;
    Ok(json!({ "candidate": candidate }))
}

fn delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    guard::require_admin(state, req)?;
    let conn = guard::workspace_db(state)?;
    let id = required_str(&req.params, "candidateId")?;
    let existing =
        find_candidate(conn, &id)?.ok_or_else(|| HandlerErr::not_found("candidate not found"))?;
    conn.execute("DELETE FROM candidates WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    if let Some(workspace) = state.workspace.as_deref() {
        remove_stored_photo(workspace, existing["photo"].as_str());
    }
    info!(candidate_id = %id, "candidate deleted");
    Ok(json!({ "ok": true }))
}

fn mark_matched(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    guard::require_admin(state, req)?;
    let conn = guard::workspace_db(state)?;
    let id = required_str(&req.params, "candidateId")?;
    let partner_name = required_str(&req.params, "partnerName")?;
    let partner_gender = required_str(&req.params, "partnerGender")?;

    let n = conn
        .execute(
            "UPDATE candidates
             SET is_matched = 1, matched_partner_name = ?, matched_partner_gender = ?, updated_at = ?
             WHERE id = ?",
            (
                partner_name.trim(),
                partner_gender.trim(),
                Utc::now().to_rfc3339(),
                &id,
            ),
        )
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    if n == 0 {
        return Err(HandlerErr::not_found("candidate not found"));
    }
    info!(candidate_id = %id, "candidate marked as matched");
    let candidate =
        find_candidate(conn, &id)?.ok_or_else(|| HandlerErr::not_found("candidate not found"))?;
    Ok(json!({ "candidate": candidate }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "candidates.list" => list(state, req),
        "candidates.get" => get(state, req),
        "candidates.create" => create(state, req),
        "candidates.update" => update(state, req),
        "candidates.delete" => delete(state, req),
        "candidates.markMatched" => mark_matched(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
