use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::params::{optional_str, required_str};
use crate::alert::{self, LoginAlert, OutboxMailer};
use crate::auth::{self, AuthError, MIN_PASSWORD_LEN, ROLE_ADMIN, ROLE_USER};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::guard;
use crate::ipc::types::{AppState, Request};

struct UserRow {
    id: String,
    username: String,
    password_hash: String,
    role: String,
    created_at: String,
    last_login: Option<String>,
}

impl UserRow {
    fn public_json(&self) -> serde_json::Value {
        json!({
            "id": self.id,
            "username": self.username,
            "role": self.role,
            "createdAt": self.created_at,
            "lastLogin": self.last_login,
        })
    }
}

enum UserKey<'a> {
    Id(&'a str),
    Username(&'a str),
}

fn find_user(conn: &Connection, key: UserKey<'_>) -> Result<Option<UserRow>, HandlerErr> {
    let (column, value) = match key {
        UserKey::Id(v) => ("id", v),
        UserKey::Username(v) => ("username", v),
    };
    conn.query_row(
        &format!(
            "SELECT id, username, password_hash, role, created_at, last_login
             FROM users WHERE {column} = ?"
        ),
        [value],
        |r| {
            Ok(UserRow {
                id: r.get(0)?,
                username: r.get(1)?,
                password_hash: r.get(2)?,
                role: r.get(3)?,
                created_at: r.get(4)?,
                last_login: r.get(5)?,
            })
        },
    )
    .optional()
    .map_err(HandlerErr::query)
}

fn check_password_len(password: &str) -> Result<(), HandlerErr> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(HandlerErr::bad_params(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}

fn login(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let conn = guard::workspace_db(state)?;
    let username = required_str(&req.params, "username")?;
    let password = required_str(&req.params, "password")?;

    // Unknown user and wrong password look the same to the caller.
    let Some(user) = find_user(conn, UserKey::Username(username.trim()))? else {
        warn!(username = %username.trim(), "login failed: unknown user");
        return Err(AuthError::InvalidCredentials.into());
    };
    if !auth::verify_password(&password, &user.password_hash) {
        warn!(username = %user.username, "login failed: wrong password");
        return Err(AuthError::InvalidCredentials.into());
    }

    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE users SET last_login = ? WHERE id = ?",
        (&now, &user.id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    let token = auth::issue_token(&state.config, &user.id, &user.username, &user.role)?;
    info!(username = %user.username, role = %user.role, "login succeeded");

    if user.role == ROLE_ADMIN {
        raise_login_alert(state, req, &user);
    }

    Ok(json!({
        "token": token,
        "user": {
            "id": user.id,
            "username": user.username,
            "role": user.role,
            "lastLogin": now,
        }
    }))
}

fn raise_login_alert(state: &AppState, req: &Request, user: &UserRow) {
    let Some(to) = state.config.alert_to.as_deref() else {
        warn!("SAMAJ_ALERT_TO is not set; skipping admin login alert");
        return;
    };
    let Some(workspace) = state.workspace.as_ref() else {
        return;
    };
    let mailer = OutboxMailer::new(
        workspace.join("outbox"),
        state.config.alert_from.as_str(),
        to,
    );
    let alert = LoginAlert {
        username: user.username.clone(),
        role: user.role.clone(),
        client_ip: optional_str(&req.params, "clientIp"),
        user_agent: optional_str(&req.params, "userAgent"),
        at: Utc::now(),
    };
    alert::send_login_alert(&mailer, &alert);
}

fn register(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let admin = guard::require_admin(state, req)?;
    let conn = guard::workspace_db(state)?;
    let username = required_str(&req.params, "username")?.trim().to_string();
    let password = required_str(&req.params, "password")?;
    let role = optional_str(&req.params, "role").unwrap_or_else(|| ROLE_USER.to_string());

    if username.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(HandlerErr::bad_params("username must not contain spaces"));
    }
    check_password_len(&password)?;
    if role != ROLE_ADMIN && role != ROLE_USER {
        return Err(HandlerErr::bad_params(format!("unknown role: {}", role))
            .with_details(json!({ "allowed": [ROLE_ADMIN, ROLE_USER] })));
    }
    if find_user(conn, UserKey::Username(&username))?.is_some() {
        return Err(HandlerErr::new("conflict", "Username already exists"));
    }

    let hash = auth::hash_password(&password)?;
    let user = UserRow {
        id: Uuid::new_v4().to_string(),
        username,
        password_hash: hash,
        role,
        created_at: Utc::now().to_rfc3339(),
        last_login: None,
    };
    conn.execute(
        "INSERT INTO users(id, username, password_hash, role, created_at)
         VALUES(?, ?, ?, ?, ?)",
        (
            &user.id,
            &user.username,
            &user.password_hash,
            &user.role,
            &user.created_at,
        ),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    info!(username = %user.username, role = %user.role, by = %admin.username, "user registered");
    Ok(json!({ "user": user.public_json() }))
}

fn verify(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let claims = guard::require_user(state, req)?;
    Ok(json!({
        "valid": true,
        "user": {
            "id": claims.sub,
            "username": claims.username,
            "role": claims.role,
        },
        "expiresAt": claims.exp,
    }))
}

fn me(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let claims = guard::require_user(state, req)?;
    let conn = guard::workspace_db(state)?;
    let user = find_user(conn, UserKey::Id(&claims.sub))?
        .ok_or_else(|| HandlerErr::not_found("User not found"))?;
    Ok(json!({ "user": user.public_json() }))
}

fn change_password(state: &AppState, req: &Request) -> Result<serde_json::Value, HandlerErr> {
    let claims = guard::require_user(state, req)?;
    let conn = guard::workspace_db(state)?;
    let current = required_str(&req.params, "currentPassword")?;
    let new_password = required_str(&req.params, "newPassword")?;
    check_password_len(&new_password)?;

    let user = find_user(conn, UserKey::Id(&claims.sub))?
        .ok_or_else(|| HandlerErr::not_found("User not found"))?;
    if !auth::verify_password(&current, &user.password_hash) {
        return Err(HandlerErr::new("unauthorized", "Current password is incorrect"));
    }

    let hash = auth::hash_password(&new_password)?;
    conn.execute(
        "UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?",
        (&hash, Utc::now().to_rfc3339(), &user.id),
    )
    .map_err(|e| HandlerErr::new("db_update_failed", e.to_string()))?;
    info!(username = %user.username, "password changed");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "auth.login" => login(state, req),
        "auth.register" => register(state, req),
        "auth.verify" => verify(state, req),
        "auth.me" => me(state, req),
        "auth.changePassword" => change_password(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
