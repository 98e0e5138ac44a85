use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth;
use crate::config::Config;

pub const DB_FILE: &str = "samaj.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;
    create_schema(&conn)?;
    Ok(conn)
}

pub fn create_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS members(
            id TEXT PRIMARY KEY,
            membership_no TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            mobile TEXT,
            male INTEGER,
            female INTEGER,
            district TEXT,
            taluka TEXT,
            panchayat TEXT,
            village TEXT,
            created_at TEXT NOT NULL
        )",
        [],
    )?;
    // Registries created before the household columns existed get them added.
    ensure_members_household_columns(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_members_location ON members(district, taluka, panchayat)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS candidates(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            gender TEXT NOT NULL,
            dob TEXT,
            age INTEGER,
            height TEXT,
            blood_group TEXT,
            gotra TEXT,
            bansha TEXT,
            education TEXT,
            technical_education TEXT,
            professional_education TEXT,
            occupation TEXT,
            father TEXT,
            mother TEXT,
            address TEXT,
            phone TEXT,
            email TEXT,
            photo TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT
        )",
        [],
    )?;
    ensure_candidates_match_columns(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_candidates_gender ON candidates(gender)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS posts(
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS users(
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'user',
            created_at TEXT NOT NULL,
            updated_at TEXT,
            last_login TEXT
        )",
        [],
    )?;

    Ok(())
}

fn ensure_members_household_columns(conn: &Connection) -> anyhow::Result<()> {
    for column in ["head_gender", "aadhar_no", "address", "family_members"] {
        if !table_has_column(conn, "members", column)? {
            conn.execute(&format!("ALTER TABLE members ADD COLUMN {column} TEXT"), [])?;
        }
    }
    Ok(())
}

fn ensure_candidates_match_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "candidates", "is_matched")? {
        conn.execute(
            "ALTER TABLE candidates ADD COLUMN is_matched INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    if !table_has_column(conn, "candidates", "matched_partner_name")? {
        conn.execute(
            "ALTER TABLE candidates ADD COLUMN matched_partner_name TEXT",
            [],
        )?;
    }
    if !table_has_column(conn, "candidates", "matched_partner_gender")? {
        conn.execute(
            "ALTER TABLE candidates ADD COLUMN matched_partner_gender TEXT",
            [],
        )?;
    }
    Ok(())
}

/// Creates the configured admin account when the workspace has no users yet.
/// Returns true when an account was created.
pub fn bootstrap_admin(conn: &Connection, config: &Config) -> anyhow::Result<bool> {
    let any_user: Option<i64> = conn
        .query_row("SELECT 1 FROM users LIMIT 1", [], |r| r.get(0))
        .optional()?;
    if any_user.is_some() {
        return Ok(false);
    }

    let hash = auth::hash_password(&config.admin_password)?;
    conn.execute(
        "INSERT INTO users(id, username, password_hash, role, created_at)
         VALUES(?, ?, ?, 'admin', ?)",
        (
            Uuid::new_v4().to_string(),
            &config.admin_username,
            &hash,
            chrono::Utc::now().to_rfc3339(),
        ),
    )?;
    info!(username = %config.admin_username, "created bootstrap admin account");
    if config.admin_password == Config::default().admin_password {
        warn!("bootstrap admin uses the default password; change it after first login");
    }
    Ok(true)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
