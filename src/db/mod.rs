// src/db/mod.rs

//! SQLite task store
//!
//! Every workflow-visible record lives here: projects, packages, imports,
//! builds, tasks with their artifacts and logs, repositories and their
//! append-only revisions. Writes that must be atomic go through
//! [`transaction`].

pub mod models;
pub mod schema;

use crate::error::Result;
use chrono::SecondsFormat;
use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const BUSY_TIMEOUT: Duration = Duration::from_secs(60);

/// Create the database file (and parent directory) and run migrations
pub fn init(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let conn = open(path)?;
    schema::migrate(&conn)?;
    debug!("Initialized task store at {}", path.display());
    Ok(())
}

/// Open a connection with the pragmas every caller relies on
pub fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    configure(&conn)?;
    Ok(conn)
}

/// Open an in-memory database with the schema applied
pub fn open_in_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    configure(&conn)?;
    schema::migrate(&conn)?;
    Ok(conn)
}

fn configure(conn: &Connection) -> Result<()> {
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

/// Run `f` inside a transaction; commits on `Ok`, rolls back on `Err`
pub fn transaction<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction) -> Result<T>,
{
    let tx = conn.transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

/// Current time as stored in `created_at` columns
pub fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Fresh record identifier
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
