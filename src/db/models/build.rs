// src/db/models/build.rs

//! Build, NVRA lock and batch models

use super::{enum_from_sql, enum_to_sql, TaskStatus};
use crate::db::{new_id, now};
use crate::error::{Error, Result};
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

const BUILD_COLUMNS: &str = "b.id, b.project_id, b.package_id, p.name, b.package_version_id,
     b.task_id, t.status, b.created_at";

const BUILD_JOINS: &str = "FROM builds b
     INNER JOIN tasks t ON t.id = b.task_id
     INNER JOIN packages p ON p.id = b.package_id";

/// An attempt to produce binary artifacts for one package version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: String,
    pub project_id: String,
    pub package_id: String,
    pub package_name: String,
    pub package_version_id: String,
    pub task_id: String,
    pub task_status: TaskStatus,
    pub created_at: String,
}

impl Build {
    pub fn create(
        conn: &Connection,
        package_id: &str,
        package_version_id: &str,
        task_id: &str,
        project_id: &str,
    ) -> Result<String> {
        let id = new_id();
        conn.execute(
            "INSERT INTO builds (id, project_id, package_id, package_version_id, task_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![&id, project_id, package_id, package_version_id, task_id, now()],
        )?;
        Ok(id)
    }

    pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!("SELECT {BUILD_COLUMNS} {BUILD_JOINS} WHERE b.id = ?1"))?;
        let build = stmt.query_row([id], Self::from_row).optional()?;
        Ok(build)
    }

    pub fn find_by_task_and_package(
        conn: &Connection,
        task_id: &str,
        package_id: &str,
    ) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {BUILD_COLUMNS} {BUILD_JOINS} WHERE b.task_id = ?1 AND b.package_id = ?2"
        ))?;
        let build = stmt.query_row(params![task_id, package_id], Self::from_row).optional()?;
        Ok(build)
    }

    pub fn list_in_project(conn: &Connection, project_id: &str, limit: i64, offset: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {BUILD_COLUMNS} {BUILD_JOINS} WHERE b.project_id = ?1
             ORDER BY b.created_at DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let builds = stmt
            .query_map(params![project_id, limit, offset], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(builds)
    }

    /// Total number of builds ever created
    pub fn count_all(conn: &Connection) -> Result<i64> {
        let count = conn.query_row("SELECT count(*) FROM builds", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Link a task (and so its artifacts) to a build
    pub fn attach_task(conn: &Connection, build_id: &str, task_id: &str) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO build_tasks (build_id, task_id) VALUES (?1, ?2)",
            params![build_id, task_id],
        )?;
        Ok(())
    }

    /// Successful builds of an exact (name, version, release)
    pub fn find_by_nvr(
        conn: &Connection,
        name: &str,
        version: &str,
        release: &str,
        project_id: &str,
    ) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {BUILD_COLUMNS} {BUILD_JOINS}
             INNER JOIN package_versions pv ON pv.id = b.package_version_id
             WHERE p.name = ?1 AND pv.version = ?2 AND pv.release = ?3 AND b.project_id = ?4
               AND t.status = 'succeeded'
             ORDER BY b.created_at DESC"
        ))?;
        let builds = stmt
            .query_map(params![name, version, release, project_id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(builds)
    }

    fn collect_ids(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(sql)?;
        let ids = stmt
            .query_map(args, |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Successful builds of a package whose version is active in the repo, oldest first
    pub fn latest_ids_by_package_name(conn: &Connection, name: &str, project_id: &str) -> Result<Vec<String>> {
        Self::collect_ids(
            conn,
            "SELECT b.id FROM builds b
             INNER JOIN tasks t ON t.id = b.task_id
             INNER JOIN packages p ON p.id = b.package_id
             INNER JOIN project_package_versions ppv ON ppv.package_version_id = b.package_version_id
             WHERE p.name = ?1 AND t.status = 'succeeded' AND ppv.active_in_repo = 1
               AND ppv.project_id = b.project_id AND b.project_id = ?2
             ORDER BY b.created_at ASC",
            &[&name, &project_id],
        )
    }

    /// Like [`Build::latest_ids_by_package_name`] restricted to one module stream branch
    pub fn latest_ids_by_package_and_stream(
        conn: &Connection,
        name: &str,
        stream: &str,
        project_id: &str,
    ) -> Result<Vec<String>> {
        let pattern = format!("%-stream-{}", stream);
        Self::collect_ids(
            conn,
            "SELECT DISTINCT b.id FROM builds b
             INNER JOIN tasks t ON t.id = b.task_id
             INNER JOIN packages p ON p.id = b.package_id
             INNER JOIN project_package_versions ppv ON ppv.package_version_id = b.package_version_id
             INNER JOIN import_revisions ir ON ir.package_version_id = b.package_version_id
             WHERE p.name = ?1 AND ir.scm_branch_name LIKE ?2 AND t.status = 'succeeded'
               AND ppv.active_in_repo = 1 AND ppv.project_id = b.project_id AND b.project_id = ?3
             ORDER BY b.created_at ASC",
            &[&name, &pattern, &project_id],
        )
    }

    /// Active builds owning an artifact whose name matches a SQL LIKE pattern
    pub fn active_ids_by_artifact_glob(conn: &Connection, glob: &str, project_id: &str) -> Result<Vec<String>> {
        Self::collect_ids(
            conn,
            "SELECT b.id FROM builds b
             INNER JOIN tasks t ON t.id = b.task_id
             INNER JOIN project_package_versions ppv ON ppv.package_version_id = b.package_version_id
             WHERE b.task_id IN (SELECT DISTINCT parent_task_id FROM tasks
                                 WHERE id IN (SELECT task_id FROM task_artifacts WHERE name LIKE ?2))
               AND t.status = 'succeeded' AND ppv.active_in_repo = 1
               AND ppv.project_id = b.project_id AND b.project_id = ?1
             ORDER BY b.created_at ASC",
            &[&project_id, &glob],
        )
    }

    /// All successful builds of a package regardless of repo activation
    pub fn all_ids_by_package_name(conn: &Connection, name: &str, project_id: &str) -> Result<Vec<String>> {
        Self::collect_ids(
            conn,
            "SELECT b.id FROM builds b
             INNER JOIN tasks t ON t.id = b.task_id
             INNER JOIN packages p ON p.id = b.package_id
             WHERE p.name = ?1 AND t.status = 'succeeded' AND b.project_id = ?2
             ORDER BY b.created_at ASC",
            &[&name, &project_id],
        )
    }

    /// Every successful build in a project, oldest first
    pub fn successful_ids_asc(conn: &Connection, project_id: &str) -> Result<Vec<String>> {
        Self::collect_ids(
            conn,
            "SELECT b.id FROM builds b
             INNER JOIN tasks t ON t.id = b.task_id
             WHERE b.project_id = ?1 AND t.status = 'succeeded'
             ORDER BY b.created_at ASC",
            &[&project_id],
        )
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status: String = row.get(6)?;
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            package_id: row.get(2)?,
            package_name: row.get(3)?,
            package_version_id: row.get(4)?,
            task_id: row.get(5)?,
            task_status: enum_from_sql(&status).unwrap_or(TaskStatus::Pending),
            created_at: row.get(7)?,
        })
    }
}

/// Process-wide NVRA uniqueness set
pub struct NvraLock;

impl NvraLock {
    /// Insert the NVRA; a second insert fails with [`Error::NvrAlreadyLocked`]
    pub fn lock(conn: &Connection, nvra: &str) -> Result<()> {
        match conn.execute("INSERT INTO nvrs (name) VALUES (?1)", [nvra]) {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(Error::NvrAlreadyLocked(nvra.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn unlock(conn: &Connection, nvra: &str) -> Result<()> {
        conn.execute("DELETE FROM nvrs WHERE name = ?1", [nvra])?;
        Ok(())
    }

    pub fn exists(conn: &Connection, nvra: &str) -> Result<bool> {
        let count: i64 = conn.query_row("SELECT count(*) FROM nvrs WHERE name = ?1", [nvra], |row| {
            row.get(0)
        })?;
        Ok(count > 0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchKind {
    Build,
    Import,
}

/// A group of builds or imports submitted together
pub struct Batch;

impl Batch {
    pub fn create(conn: &Connection, project_id: &str, kind: BatchKind) -> Result<String> {
        let id = new_id();
        conn.execute(
            "INSERT INTO batches (id, project_id, kind, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![&id, project_id, enum_to_sql(&kind)?, now()],
        )?;
        Ok(id)
    }

    pub fn attach(conn: &Connection, batch_id: &str, item_id: &str) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO batch_items (batch_id, item_id) VALUES (?1, ?2)",
            params![batch_id, item_id],
        )?;
        Ok(())
    }

    pub fn items(conn: &Connection, batch_id: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare("SELECT item_id FROM batch_items WHERE batch_id = ?1 ORDER BY rowid")?;
        let items = stmt
            .query_map([batch_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(items)
    }
}
