use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::guard;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;
use tracing::{error, info, warn};

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };

    let conn = match db::open_db(&path) {
        Ok(conn) => conn,
        Err(e) => {
            error!(path = %path.display(), "failed to open workspace: {e:#}");
            return err(&req.id, "db_open_failed", format!("{e:#}"), None);
        }
    };
    // A fresh workspace gets the configured admin account so it can be logged into.
    let admin_created = match db::bootstrap_admin(&conn, &state.config) {
        Ok(created) => created,
        Err(e) => return err(&req.id, "db_insert_failed", format!("{e:#}"), None),
    };

    info!(path = %path.display(), "workspace selected");
    state.workspace = Some(path.clone());
    state.db = Some(conn);

    let staging = match guard::staging_root(state) {
        Ok(dir) => dir,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = std::fs::create_dir_all(&staging) {
        warn!(path = %staging.display(), "failed to create staging directory: {e}");
    }
    ok(
        &req.id,
        json!({
            "workspacePath": path.to_string_lossy(),
            "stagingPath": staging.to_string_lossy(),
            "adminCreated": admin_created,
        }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
