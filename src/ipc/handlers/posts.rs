use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use super::params::required_str;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::guard;
use crate::ipc::types::{AppState, Request};

fn list(state: &AppState) -> Result<Value, HandlerErr> {
    let conn = guard::workspace_db(state)?;
    let mut stmt = conn
        .prepare(
            "SELECT id, title, content, created_at FROM posts
             ORDER BY created_at DESC, rowid DESC",
        )
        .map_err(HandlerErr::query)?;
    let posts = stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "title": r.get::<_, String>(1)?,
                "content": r.get::<_, String>(2)?,
                "createdAt": r.get::<_, String>(3)?,
            }))
        })
        .map_err(HandlerErr::query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(HandlerErr::query)?;
    Ok(json!({ "posts": posts }))
}

fn create(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    guard::require_admin(state, req)?;
    let conn = guard::workspace_db(state)?;
    let title = required_str(&req.params, "title")?.trim().to_string();
    let content = required_str(&req.params, "content")?;

    let id = Uuid::new_v4().to_string();
    let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
    conn.execute(
        "INSERT INTO posts(id, title, content, created_at) VALUES(?, ?, ?, ?)",
        (&id, &title, &content, &created_at),
    )
    .map_err(|e| HandlerErr::new("db_insert_failed", e.to_string()))?;
    info!(post_id = %id, "post created");
    Ok(json!({
        "post": {
            "id": id,
            "title": title,
            "content": content,
            "createdAt": created_at,
        }
    }))
}

fn delete(state: &AppState, req: &Request) -> Result<Value, HandlerErr> {
    guard::require_admin(state, req)?;
    let conn = guard::workspace_db(state)?;
    let id = required_str(&req.params, "postId")?;
    let n = conn
        .execute("DELETE FROM posts WHERE id = ?", [&id])
        .map_err(|e| HandlerErr::new("db_delete_failed", e.to_string()))?;
    if n == 0 {
        return Err(HandlerErr::not_found("post not found"));
    }
    info!(post_id = %id, "post deleted");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "posts.list" => list(state),
        "posts.create" => create(state, req),
        "posts.delete" => delete(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
