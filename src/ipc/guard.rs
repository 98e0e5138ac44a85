//! Access checks shared by the handlers: tokens, workspace, staged uploads.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use serde_json::json;
use tracing::warn;

use super::error::HandlerErr;
use super::types::{AppState, Request};
use crate::auth::{self, Claims, AuthError};
use crate::staging::{StagedUpload, StagingError};

/// The verified caller. Fails when the token is missing, malformed or expired.
pub fn require_user(state: &AppState, req: &Request) -> Result<Claims, HandlerErr> {
    let token = auth::bearer_token(req.authorization.as_deref())?;
    Ok(auth::verify_token(&state.config, token)?)
}

pub fn require_admin(state: &AppState, req: &Request) -> Result<Claims, HandlerErr> {
    let claims = require_user(state, req)?;
    if !claims.is_admin() {
        return Err(AuthError::Forbidden.into());
    }
    Ok(claims)
}

/// Optional authentication: an absent or unusable token means anonymous.
pub fn caller(state: &AppState, req: &Request) -> Option<Claims> {
    let token = auth::bearer_token(req.authorization.as_deref()).ok()?;
    auth::verify_token(&state.config, token).ok()
}

pub fn is_admin(state: &AppState, req: &Request) -> bool {
    caller(state, req).is_some_and(|c| c.is_admin())
}

pub fn workspace_db(state: &AppState) -> Result<&Connection, HandlerErr> {
    state
        .db
        .as_ref()
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// The configured staging directory, else `<workspace>/staging`.
pub fn staging_root(state: &AppState) -> Result<PathBuf, HandlerErr> {
    if let Some(dir) = &state.config.staging_dir {
        return Ok(dir.clone());
    }
    state
        .workspace
        .as_ref()
        .map(|w| w.join("staging"))
        .ok_or_else(|| HandlerErr::new("no_workspace", "select a workspace first"))
}

/// Claims a client-staged file. Call only after the caller is authorized.
pub fn staged_upload(state: &AppState, path: &str) -> Result<StagedUpload, HandlerErr> {
    let root = staging_root(state)?;
    StagedUpload::claim(Path::new(path), &root).map_err(|e| {
        if matches!(e, StagingError::OutsideStaging { .. }) {
            warn!(path, "refused upload outside the staging directory");
        }
        HandlerErr::bad_params(e.to_string())
            .with_details(json!({ "path": path, "stagingDir": root.to_string_lossy() }))
    })
}
