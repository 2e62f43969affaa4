// src/db/models/task.rs

//! Task, TaskArtifact and TaskLog models
//!
//! Tasks form a forest keyed by `parent_task_id`. A terminal status
//! (succeeded, failed, canceled) stamps `finished_at` and is never
//! overwritten.

use super::{enum_from_sql, enum_to_sql, json_from_sql, json_to_sql};
use crate::db::{new_id, now};
use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

/// Kind of work a task tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    Import,
    ImportUpstream,
    ImportSrcGit,
    ImportSrcGitToDistGit,
    Build,
    BuildSrpm,
    BuildArch,
    BuildSrpmUpload,
    BuildArchUpload,
    WorkerProvision,
    WorkerDestroy,
    YumrepofsUpdate,
    SyncCatalog,
    RpmImport,
    LookasideUpload,
    CloneSwap,
    UpdateInfo,
    HashedRepos,
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

const TASK_COLUMNS: &str = "id, created_at, finished_at, arch, type, status, response, metadata,
     project_id, parent_task_id, submitter, error_details";

/// A persisted task record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub created_at: String,
    pub finished_at: Option<String>,
    pub arch: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub response: Option<serde_json::Value>,
    pub metadata: Option<serde_json::Value>,
    pub project_id: Option<String>,
    pub parent_task_id: Option<String>,
    pub submitter: Option<String>,
    /// Serialized error details of a failed or canceled task
    pub error: Option<serde_json::Value>,
}

impl Task {
    /// Create a new pending task
    pub fn new(
        arch: &str,
        task_type: TaskType,
        project_id: Option<&str>,
        parent_task_id: Option<&str>,
    ) -> Self {
        Self {
            id: new_id(),
            created_at: now(),
            finished_at: None,
            arch: arch.to_string(),
            task_type,
            status: TaskStatus::Pending,
            response: None,
            metadata: None,
            project_id: project_id.map(str::to_string),
            parent_task_id: parent_task_id.map(str::to_string),
            submitter: None,
            error: None,
        }
    }

    /// Set the submitter
    pub fn with_submitter(mut self, submitter: Option<String>) -> Self {
        self.submitter = submitter;
        self
    }

    /// Insert this task into the database
    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO tasks (id, created_at, finished_at, arch, type, status, response, metadata,
             project_id, parent_task_id, submitter)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                &self.id,
                &self.created_at,
                &self.finished_at,
                &self.arch,
                enum_to_sql(&self.task_type)?,
                enum_to_sql(&self.status)?,
                json_to_sql(self.response.as_ref()),
                json_to_sql(self.metadata.as_ref()),
                &self.project_id,
                &self.parent_task_id,
                &self.submitter,
            ],
        )?;
        Ok(())
    }

    /// Find a task by ID
    pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"))?;
        let task = stmt.query_row([id], Self::from_row).optional()?;
        Ok(task)
    }

    /// The task rooted at `id` followed by all of its descendants, oldest first
    pub fn tree(conn: &Connection, id: &str, project_id: Option<&str>) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "WITH RECURSIVE task_query AS (
                SELECT * FROM tasks
                WHERE id = ?1 AND (?2 IS NULL OR project_id = ?2)
                UNION ALL
                SELECT t.* FROM tasks t
                JOIN task_query tq ON tq.id = t.parent_task_id
            )
            SELECT {TASK_COLUMNS} FROM task_query ORDER BY created_at ASC"
        ))?;

        let tasks = stmt
            .query_map(params![id, project_id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Top-level tasks, most recent first
    pub fn list_top_level(
        conn: &Connection,
        project_id: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE parent_task_id IS NULL AND (?1 IS NULL OR project_id = ?1)
             ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
        ))?;

        let tasks = stmt
            .query_map(params![project_id, limit, offset], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(tasks)
    }

    /// Task of a build (the top-level build task)
    pub fn find_by_build_id(conn: &Connection, build_id: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks
             WHERE id = (SELECT task_id FROM builds WHERE id = ?1)"
        ))?;
        let task = stmt.query_row([build_id], Self::from_row).optional()?;
        Ok(task)
    }

    /// Update task status.
    ///
    /// Returns `false` when the task is missing or already terminal.
    pub fn set_status(conn: &Connection, id: &str, status: TaskStatus) -> Result<bool> {
        let status_str = enum_to_sql(&status)?;

        let rows = if status.is_terminal() {
            conn.execute(
                "UPDATE tasks SET status = ?1, finished_at = ?2
                 WHERE id = ?3 AND status NOT IN ('succeeded', 'failed', 'canceled')",
                params![status_str, now(), id],
            )?
        } else {
            conn.execute(
                "UPDATE tasks SET status = ?1
                 WHERE id = ?2 AND status NOT IN ('succeeded', 'failed', 'canceled')",
                params![status_str, id],
            )?
        };

        Ok(rows > 0)
    }

    pub fn status_of(conn: &Connection, id: &str) -> Result<Option<TaskStatus>> {
        let status: Option<String> = conn
            .query_row("SELECT status FROM tasks WHERE id = ?1", [id], |row| row.get(0))
            .optional()?;
        Ok(status.and_then(|s| enum_from_sql(&s)))
    }

    pub fn set_response(conn: &Connection, id: &str, response: &serde_json::Value) -> Result<bool> {
        let rows = conn.execute(
            "UPDATE tasks SET response = ?1 WHERE id = ?2",
            params![response.to_string(), id],
        )?;
        Ok(rows > 0)
    }

    pub fn set_metadata(conn: &Connection, id: &str, metadata: &serde_json::Value) -> Result<bool> {
        let rows = conn.execute(
            "UPDATE tasks SET metadata = ?1 WHERE id = ?2",
            params![metadata.to_string(), id],
        )?;
        Ok(rows > 0)
    }

    pub fn set_error_details(conn: &Connection, id: &str, details: &serde_json::Value) -> Result<bool> {
        let rows = conn.execute(
            "UPDATE tasks SET error_details = ?1 WHERE id = ?2",
            params![details.to_string(), id],
        )?;
        Ok(rows > 0)
    }

    /// Convert a database row to a Task
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let type_str: String = row.get(4)?;
        let status_str: String = row.get(5)?;

        Ok(Self {
            id: row.get(0)?,
            created_at: row.get(1)?,
            finished_at: row.get(2)?,
            arch: row.get(3)?,
            task_type: enum_from_sql(&type_str).unwrap_or(TaskType::Build),
            status: enum_from_sql(&status_str).unwrap_or(TaskStatus::Pending),
            response: json_from_sql(row.get(6)?),
            metadata: json_from_sql(row.get(7)?),
            project_id: row.get(8)?,
            parent_task_id: row.get(9)?,
            submitter: row.get(10)?,
            error: json_from_sql(row.get(11)?),
        })
    }
}

/// An object produced by a task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskArtifact {
    pub id: Option<i64>,
    pub task_id: String,
    /// Object store key (`<parent task>/<basename>`)
    pub name: String,
    pub hash_sha256: String,
    pub arch: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: String,
    /// GPG key ids this artifact has been signed with
    pub signatures: Vec<String>,
}

const ARTIFACT_COLUMNS: &str = "ta.id, ta.task_id, ta.name, ta.hash_sha256, ta.arch, ta.metadata,
     ta.created_at, (SELECT group_concat(gpg_key_id) FROM task_artifact_signatures tas
                     WHERE tas.task_artifact_id = ta.id)";

impl TaskArtifact {
    /// Record an artifact; re-attaching the same name to a task is a no-op
    pub fn attach(
        conn: &Connection,
        task_id: &str,
        name: &str,
        hash_sha256: &str,
        arch: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        conn.execute(
            "INSERT OR IGNORE INTO task_artifacts (task_id, name, hash_sha256, arch, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![task_id, name, hash_sha256, arch, json_to_sql(metadata), now()],
        )?;
        Ok(())
    }

    pub fn find_by_id(conn: &Connection, id: i64) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM task_artifacts ta WHERE ta.id = ?1"
        ))?;
        let artifact = stmt.query_row([id], Self::from_row).optional()?;
        Ok(artifact)
    }

    /// Artifacts of every task attached to a build, newest first
    pub fn list_for_build(conn: &Connection, build_id: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM task_artifacts ta
             INNER JOIN build_tasks bt ON bt.task_id = ta.task_id
             WHERE bt.build_id = ?1
             ORDER BY ta.created_at DESC, ta.id DESC"
        ))?;

        let artifacts = stmt
            .query_map([build_id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(artifacts)
    }

    pub fn list_for_task(conn: &Connection, task_id: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {ARTIFACT_COLUMNS} FROM task_artifacts ta
             WHERE ta.task_id = ?1 ORDER BY ta.id ASC"
        ))?;

        let artifacts = stmt
            .query_map([task_id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(artifacts)
    }

    /// Record or replace a signature hash for (artifact, key)
    pub fn add_signature(
        conn: &Connection,
        artifact_id: i64,
        gpg_key_id: &str,
        hash_sha256: &str,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO task_artifact_signatures (task_artifact_id, gpg_key_id, hash_sha256)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (task_artifact_id, gpg_key_id) DO UPDATE SET hash_sha256 = ?3",
            params![artifact_id, gpg_key_id, hash_sha256],
        )?;
        Ok(())
    }

    /// Signed hash of the artifact stored under `name`
    pub fn signature_hash(conn: &Connection, name: &str, gpg_key_id: &str) -> Result<Option<String>> {
        let hash = conn
            .query_row(
                "SELECT tas.hash_sha256 FROM task_artifact_signatures tas
                 INNER JOIN task_artifacts ta ON ta.id = tas.task_artifact_id
                 WHERE ta.name = ?1 AND tas.gpg_key_id = ?2",
                params![name, gpg_key_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let signatures: Option<String> = row.get(7)?;
        Ok(Self {
            id: row.get(0)?,
            task_id: row.get(1)?,
            name: row.get(2)?,
            hash_sha256: row.get(3)?,
            arch: row.get(4)?,
            metadata: json_from_sql(row.get(5)?),
            created_at: row.get(6)?,
            signatures: signatures
                .map(|s| s.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }
}

/// Task log stream
pub struct TaskLog;

impl TaskLog {
    /// Append lines for a task; `parent_task_id` defaults to the task itself
    pub fn append(
        conn: &Connection,
        lines: &[String],
        task_id: &str,
        parent_task_id: Option<&str>,
    ) -> Result<()> {
        let parent = parent_task_id.filter(|p| !p.is_empty()).unwrap_or(task_id);
        let created_at = now();
        let mut stmt = conn.prepare(
            "INSERT INTO task_logs (task_id, parent_task_id, line, created_at) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for line in lines {
            stmt.execute(params![task_id, parent, line, &created_at])?;
        }
        Ok(())
    }

    /// Lines after `offset` (a log row id) for a task or a whole task tree
    pub fn list(
        conn: &Connection,
        task_id: Option<&str>,
        parent_task_id: Option<&str>,
        offset: i64,
    ) -> Result<Vec<(i64, String)>> {
        let mut stmt = conn.prepare(
            "SELECT id, line FROM task_logs
             WHERE (?1 IS NULL OR task_id = ?1) AND (?2 IS NULL OR parent_task_id = ?2) AND id > ?3
             ORDER BY id ASC",
        )?;
        let lines = stmt
            .query_map(params![task_id, parent_task_id, offset], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(lines)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    #[test]
    fn test_terminal_status_is_write_once() {
        let conn = open_in_memory().unwrap();
        let task = Task::new("noarch", TaskType::Build, None, None);
        task.insert(&conn).unwrap();

        assert!(Task::set_status(&conn, &task.id, TaskStatus::Running).unwrap());
        assert!(Task::set_status(&conn, &task.id, TaskStatus::Canceled).unwrap());
        assert!(!Task::set_status(&conn, &task.id, TaskStatus::Succeeded).unwrap());

        let stored = Task::find_by_id(&conn, &task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Canceled);
        assert!(stored.finished_at.is_some());
    }

    #[test]
    fn test_tree_returns_descendants() {
        let conn = open_in_memory().unwrap();
        let root = Task::new("noarch", TaskType::Build, None, None);
        root.insert(&conn).unwrap();
        let srpm = Task::new("noarch", TaskType::BuildSrpm, None, Some(&root.id));
        srpm.insert(&conn).unwrap();
        let upload = Task::new("noarch", TaskType::BuildSrpmUpload, None, Some(&srpm.id));
        upload.insert(&conn).unwrap();
        let other = Task::new("x86_64", TaskType::Import, None, None);
        other.insert(&conn).unwrap();

        let tree = Task::tree(&conn, &root.id, None).unwrap();
        let ids: Vec<_> = tree.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec![root.id.as_str(), srpm.id.as_str(), upload.id.as_str()]);
        assert_eq!(tree[1].task_type, TaskType::BuildSrpm);
    }

    #[test]
    fn test_artifact_signatures() {
        let conn = open_in_memory().unwrap();
        let task = Task::new("x86_64", TaskType::BuildArchUpload, None, None);
        task.insert(&conn).unwrap();
        TaskArtifact::attach(&conn, &task.id, "t/bash.rpm", "abc", "x86_64", None).unwrap();
        TaskArtifact::attach(&conn, &task.id, "t/bash.rpm", "abc", "x86_64", None).unwrap();

        let artifacts = TaskArtifact::list_for_task(&conn, &task.id).unwrap();
        assert_eq!(artifacts.len(), 1);
        let id = artifacts[0].id.unwrap();

        TaskArtifact::add_signature(&conn, id, "KEY1", "111").unwrap();
        TaskArtifact::add_signature(&conn, id, "KEY1", "222").unwrap();
        assert_eq!(
            TaskArtifact::signature_hash(&conn, "t/bash.rpm", "KEY1").unwrap(),
            Some("222".to_string())
        );
        let artifact = TaskArtifact::find_by_id(&conn, id).unwrap().unwrap();
        assert_eq!(artifact.signatures, vec!["KEY1".to_string()]);
    }

    #[test]
    fn test_logs_default_parent() {
        let conn = open_in_memory().unwrap();
        TaskLog::append(&conn, &["a".into(), "b".into()], "t1", None).unwrap();
        TaskLog::append(&conn, &["c".into()], "t2", Some("t1")).unwrap();

        let tree = TaskLog::list(&conn, None, Some("t1"), 0).unwrap();
        assert_eq!(tree.len(), 3);
        let after = TaskLog::list(&conn, None, Some("t1"), tree[0].0).unwrap();
        assert_eq!(after.len(), 2);
    }
}
