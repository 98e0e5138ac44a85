use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::params::{optional_str, required_object, required_str};
use crate::import::{
    member_from_row, normalize_row, upsert_members, validate, ImportError, ImportSummary,
    MemberImporter, MemberRecord, RawRow, MEMBER_SELECT, SHEET_COLUMNS,
};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::guard;
use crate::ipc::types::{AppState, Request};
use crate::mask::mask_sensitive;
use crate::xlsx::{Cell, SheetWriter};

const LIST_ORDER: &str = "ORDER BY district, taluka, panchayat, name";

/// Row number reported on warnings for single-member edits.
const SINGLE_ROW: usize = 1;

fn query_members(
    conn: &Connection,
    filter: &str,
    args: Vec<String>,
    order: &str,
) -> Result<Vec<MemberRecord>, HandlerErr> {
    let sql = format!("{MEMBER_SELECT} {filter} {order}");
    let mut stmt = conn.prepare(&sql).map_err(HandlerErr::query)?;
    let rows = stmt
        .query_map(params_from_iter(args.iter()), member_from_row)
        .map_err(HandlerErr::query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(HandlerErr::query)?;
    Ok(rows)
}

fn find_member(conn: &Connection, membership_no: &str) -> Result<Option<MemberRecord>, HandlerErr> {
    conn.query_row(
        &format!("{MEMBER_SELECT} WHERE membership_no = ?"),
        [membership_no],
        member_from_row,
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn present(mut member: MemberRecord, admin: bool) -> Value {
    if !admin {
        member.mobile = member.mobile.as_deref().map(mask_sensitive);
        member.aadhar_no = member.aadhar_no.as_deref().map(mask_sensitive);
    }
    serde_json::to_value(member).unwrap_or(Value::Null)
}

fn present_all(members: Vec<MemberRecord>, admin: bool) -> Value {
    Value::Array(members.into_iter().map(|m| present(m, admin)).collect())
}

fn list(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = guard::workspace_db(state)?;
    let admin = guard::is_admin(state, req);
    let members = query_members(conn, "", Vec::new(), LIST_ORDER)?;
    Ok(json!({ "members": present_all(members, admin) }))
}

fn by_location(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = guard::workspace_db(state)?;
    let admin = guard::is_admin(state, req);

    let mut conditions = Vec::new();
    let mut args = Vec::new();
    for column in ["district", "taluka", "panchayat"] {
        if let Some(v) = optional_str(&req.params, column) {
            conditions.push(format!("{column} = ?"));
            args.push(v);
        }
    }
    let filter = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };
    let members = query_members(conn, &filter, args, LIST_ORDER)?;
    Ok(json!({ "members": present_all(members, admin) }))
}

fn search(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    let conn = guard::workspace_db(state)?;
    let admin = guard::is_admin(state, req);
    let keyword = optional_str(&req.params, "keyword")
        .ok_or_else(|| HandlerErr::bad_params("keyword is required"))?;

    // Masked callers may only match on name; a mobile match would leak digits.
    let mut args = vec![format!("%{}%", keyword.to_lowercase())];
    let filter = if admin {
        args.push(format!("%{keyword}%"));
        "WHERE LOWER(name) LIKE ? OR mobile LIKE ?"
    } else {
        "WHERE LOWER(name) LIKE ?"
    };
    let members = query_members(conn, filter, args, "ORDER BY name")?;
    Ok(json!({ "members": present_all(members, admin) }))
}

/// `M` followed by nine uppercase hex digits.
fn generate_membership_no() -> String {
    let hex = Uuid::new_v4().simple().to_string().to_ascii_uppercase();
    format!("M{}", &hex[..9])
}

/// Runs one edited row through the same normalize and validate rules as an
/// import and stores it.
fn save_single(
    state: &AppState,
    conn: &Connection,
    raw: &RawRow,
) -> Result<Value, HandlerErr> {
    let mut warnings = Vec::new();
    let draft = normalize_row(raw);
    let Some(record) = validate(draft, SINGLE_ROW, &state.config.import_limits, &mut warnings)
    else {
        return Err(HandlerErr::bad_params("member rejected")
            .with_details(json!({ "warnings": warnings })));
    };
    upsert_members(conn, std::slice::from_ref(&record))
        .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    Ok(json!({ "member": present(record, true), "warnings": warnings }))
}

fn create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    guard::require_admin(state, req)?;
    let conn = guard::workspace_db(state)?;
    let mut raw = req
        .params
        .as_object()
        .cloned()
        .ok_or_else(|| HandlerErr::bad_params("params must be an object"))?;

    let membership_no = match normalize_row(&raw).membership_no {
        Some(existing) => existing,
        None => {
            let generated = generate_membership_no();
            raw.remove("membershipNo");
            raw.insert("membership_no".into(), Value::from(generated.clone()));
            generated
        }
    };
    if find_member(conn, &membership_no)?.is_some() {
        return Err(HandlerErr::new("conflict", "membership number already exists")
            .with_details(json!({ "membershipNo": membership_no })));
    }

    let out = save_single(state, conn, &raw)?;
    info!(membership_no = %membership_no, "member created");
    Ok(out)
}

fn snake_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

fn update(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    guard::require_admin(state, req)?;
    let conn = guard::workspace_db(state)?;
    let membership_no = required_str(&req.params, "membershipNo")?;
    let patch = required_object(&req.params, "patch")?;

    let existing = find_member(conn, &membership_no)?
        .ok_or_else(|| HandlerErr::not_found("member not found"))?;
    let mut raw = existing.to_raw_row();
    for (key, value) in patch {
        let key = snake_case(key);
        if key == "membership_no" {
            if value.as_str().map(str::trim) != Some(existing.membership_no.as_str()) {
                return Err(HandlerErr::bad_params("membership number cannot be changed"));
            }
            continue;
        }
        raw.insert(key, value.clone());
    }

    let out = save_single(state, conn, &raw)?;
    info!(membership_no = %membership_no, "member updated");
    Ok(out)
}

fn delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    guard::require_admin(state, req)?;
    let conn = guard::workspace_db(state)?;
    let membership_no = required_str(&req.params, "membershipNo")?;
    let n = conn
        .execute("DELETE FROM members WHERE membership_no = ?", [&membership_no])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    if n == 0 {
        return Err(HandlerErr::not_found("member not found"));
    }
    info!(membership_no = %membership_no, "member deleted");
    Ok(json!({ "ok": true }))
}

fn import_failure(e: ImportError) -> HandlerErr {
    match e {
        ImportError::NoRows | ImportError::NotAnArray => HandlerErr::bad_params(e.to_string()),
        ImportError::Spreadsheet(inner) => {
            warn!("spreadsheet rejected: {inner}");
            HandlerErr::new("bad_spreadsheet", inner.to_string())
        }
        ImportError::Storage(inner) => {
            error!("member import rolled back: {inner}");
            HandlerErr::new("import_failed", "Bulk import failed")
        }
    }
}

fn summary_json(summary: ImportSummary) -> Value {
    json!({
        "imported": summary.imported,
        "warnings": summary.warnings,
    })
}

fn import_excel(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    guard::require_admin(state, req)?;
    let conn = guard::workspace_db(state)?;
    let file_path = optional_str(&req.params, "filePath")
        .ok_or_else(|| HandlerErr::bad_params("No file uploaded"))?;
    let upload = guard::staged_upload(state, &file_path)?;
    if upload.extension().as_deref() != Some("xlsx") {
        return Err(HandlerErr::bad_params("only .xlsx workbooks are accepted")
            .with_details(json!({ "path": upload.path().to_string_lossy() })));
    }

    let importer = MemberImporter::new(state.config.import_limits);
    importer
        .import_spreadsheet(conn, upload)
        .map(summary_json)
        .map_err(import_failure)
}

fn import_json(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    guard::require_admin(state, req)?;
    let conn = guard::workspace_db(state)?;
    let importer = MemberImporter::new(state.config.import_limits);
    importer
        .import_json(conn, req.params.get("rows"))
        .map(summary_json)
        .map_err(import_failure)
}

fn text_cell(v: Option<&str>) -> Cell {
    v.map_or(Cell::Empty, |s| Cell::Text(s.to_string()))
}

fn count_cell(v: Option<u32>) -> Cell {
    v.map_or(Cell::Empty, |n| Cell::Number(f64::from(n)))
}

fn member_cells(m: &MemberRecord) -> Vec<Cell> {
    let family = m
        .family_members
        .as_ref()
        .and_then(|f| serde_json::to_string(f).ok());
    vec![
        Cell::Text(m.membership_no.clone()),
        Cell::Text(m.name.clone()),
        text_cell(m.mobile.as_deref()),
        count_cell(m.male),
        count_cell(m.female),
        text_cell(m.district.as_deref()),
        text_cell(m.taluka.as_deref()),
        text_cell(m.panchayat.as_deref()),
        text_cell(m.village.as_deref()),
        text_cell(m.head_gender.as_deref()),
        text_cell(m.aadhar_no.as_deref()),
        text_cell(m.address.as_deref()),
        text_cell(family.as_deref()),
    ]
}

fn write_workbook(path: &Path, members: &[MemberRecord]) -> anyhow::Result<usize> {
    let file = File::create(path)?;
    let mut sheet = SheetWriter::create(BufWriter::new(file), "Members")?;
    let header: Vec<Cell> = SHEET_COLUMNS
        .iter()
        .map(|c| Cell::Text((*c).to_string()))
        .collect();
    sheet.write_row(&header)?;
    for m in members {
        sheet.write_row(&member_cells(m))?;
    }
    let (mut out, rows) = sheet.finish()?;
    std::io::Write::flush(&mut out)?;
    Ok(rows.saturating_sub(1))
}

fn file_sha256(path: &Path) -> std::io::Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

fn export_excel(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    guard::require_admin(state, req)?;
    let conn = guard::workspace_db(state)?;
    let path = PathBuf::from(required_str(&req.params, "path")?);
    let members = query_members(conn, "", Vec::new(), "ORDER BY membership_no")?;

    let row_count = write_workbook(&path, &members).map_err(|e| {
        HandlerErr::new("io_failed", format!("{e:#}"))
            .with_details(json!({ "path": path.to_string_lossy() }))
    })?;
    let sha256 = file_sha256(&path).map_err(|e| HandlerErr::new("io_failed", e.to_string()))?;
    info!(path = %path.display(), row_count, "members exported");
    Ok(json!({
        "path": path.to_string_lossy(),
        "rowCount": row_count,
        "sha256": sha256,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "members.list" => list(state, req),
        "members.byLocation" => by_location(state, req),
        "members.search" => search(state, req),
        "members.create" => create(state, req),
        "members.update" => update(state, req),
        "members.delete" => delete(state, req),
        "members.importExcel" => import_excel(state, req),
        "members.importJson" => import_json(state, req),
        "members.exportExcel" => export_excel(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
