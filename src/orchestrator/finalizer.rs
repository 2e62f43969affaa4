// src/orchestrator/finalizer.rs

//! Task finalization
//!
//! Every workflow that owns a task starts a [`TaskFinalizer`] and hands it
//! the workflow outcome on exit. The finalizer stores the response, maps
//! errors onto [`TaskErrorDetails`], picks the terminal status and fails
//! any subtask still left running.

use crate::db::{self, models::Task, models::TaskStatus, models::TaskLog};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{debug, info, warn};

pub const DOMAIN_TASKS: &str = "tasks.peridot.resf.org";
pub const DOMAIN_BUILDS: &str = "builds.peridot.resf.org";
pub const DOMAIN_IMPORTS: &str = "imports.peridot.resf.org";

pub const REASON_INTERNAL: &str = "internal-error";
pub const REASON_PACKAGE_NOT_FOUND: &str = "could not find specified package";
pub const REASON_ACTIVITY_FAILED: &str = "activity failed in asynctask";

/// Error details stored on a task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskErrorDetails {
    pub reason: String,
    pub domain: String,
    pub message: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl TaskErrorDetails {
    /// Describe `err`; `domain` applies to package lookups
    pub fn from_error(err: &Error, domain: &str, project_id: Option<&str>) -> Self {
        match err {
            Error::CouldNotFindPackage(msg) => {
                let mut metadata = BTreeMap::new();
                if let Some(project) = project_id {
                    metadata.insert(
                        "subject".to_string(),
                        format!("/v1/projects/{}/packages", project),
                    );
                }
                Self {
                    reason: REASON_PACKAGE_NOT_FOUND.to_string(),
                    domain: domain.to_string(),
                    message: msg.clone(),
                    metadata,
                }
            }
            Error::ActivityFailed(msg) => Self {
                reason: REASON_ACTIVITY_FAILED.to_string(),
                domain: DOMAIN_TASKS.to_string(),
                message: msg.clone(),
                metadata: BTreeMap::from([("activity_message".to_string(), msg.clone())]),
            },
            other => Self {
                reason: REASON_INTERNAL.to_string(),
                domain: DOMAIN_TASKS.to_string(),
                message: other.to_string(),
                metadata: BTreeMap::new(),
            },
        }
    }

    /// Terminal status for a task that ended with this error
    pub fn status(&self, err: &Error) -> TaskStatus {
        let message_canceled = self.message.to_lowercase().contains("canceled")
            || self
                .metadata
                .get("activity_message")
                .is_some_and(|m| m.to_lowercase().contains("canceled"));
        if err.is_canceled() || matches!(err, Error::NvrAlreadyLocked(_)) || message_canceled {
            TaskStatus::Canceled
        } else {
            TaskStatus::Failed
        }
    }
}

/// Owns the lifecycle of one task for the duration of a workflow
#[derive(Debug, Clone)]
pub struct TaskFinalizer {
    db_path: PathBuf,
    task_id: String,
    project_id: Option<String>,
    domain: &'static str,
}

impl TaskFinalizer {
    /// Mark the task running
    pub async fn start(db_path: PathBuf, task_id: &str, domain: &'static str) -> Result<Self> {
        let (path, id) = (db_path.clone(), task_id.to_string());
        let project_id = tokio::task::spawn_blocking(move || {
            let conn = db::open(&path)?;
            Task::set_status(&conn, &id, TaskStatus::Running)?;
            Ok::<_, Error>(Task::find_by_id(&conn, &id)?.and_then(|t| t.project_id))
        })
        .await??;

        debug!("Task {} running", task_id);
        Ok(Self {
            db_path,
            task_id: task_id.to_string(),
            project_id,
            domain,
        })
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Persist the response without leaving the running state
    pub async fn save_progress<R: Serialize>(&self, response: &R) -> Result<()> {
        let value = serde_json::to_value(response)?;
        let (path, id) = (self.db_path.clone(), self.task_id.clone());
        tokio::task::spawn_blocking(move || {
            let conn = db::open(&path)?;
            Task::set_response(&conn, &id, &value)?;
            Ok(())
        })
        .await?
    }

    /// Append lines to this task's log stream
    pub async fn log(&self, lines: Vec<String>) -> Result<()> {
        let (path, id) = (self.db_path.clone(), self.task_id.clone());
        tokio::task::spawn_blocking(move || {
            let conn = db::open(&path)?;
            TaskLog::append(&conn, &lines, &id, None)
        })
        .await?
    }

    /// Record the outcome and close the task tree.
    ///
    /// `Ok(status)` sets that status; `Err` stores error details and sets
    /// failed or canceled. Returns the status actually written.
    pub async fn finish<R: Serialize>(
        &self,
        response: Option<&R>,
        outcome: &Result<TaskStatus>,
    ) -> Result<TaskStatus> {
        let response = response.map(serde_json::to_value).transpose()?;
        let (status, details) = match outcome {
            Ok(status) => (*status, None),
            Err(e) => {
                let details = TaskErrorDetails::from_error(e, self.domain, self.project_id.as_deref());
                (details.status(e), Some(details))
            }
        };
        let details = details.map(|d| serde_json::to_value(&d)).transpose()?;

        let (path, id) = (self.db_path.clone(), self.task_id.clone());
        tokio::task::spawn_blocking(move || {
            let mut conn = db::open(&path)?;
            db::transaction(&mut conn, |tx| {
                if let Some(response) = &response {
                    Task::set_response(tx, &id, response)?;
                }
                if let Some(details) = &details {
                    Task::set_error_details(tx, &id, details)?;
                }
                Task::set_status(tx, &id, status)?;

                for child in Task::tree(tx, &id, None)? {
                    if child.id != id && !child.status.is_terminal() {
                        Task::set_status(tx, &child.id, TaskStatus::Failed)?;
                    }
                }
                Ok(())
            })
        })
        .await??;

        match outcome {
            Ok(_) => info!("Task {} finished: {}", self.task_id, status),
            Err(e) => warn!("Task {} finished: {} ({})", self.task_id, status, e),
        }
        Ok(status)
    }

    /// Close the task with the outcome of a workflow body and hand it back.
    ///
    /// A successful value is stored as the response.
    pub async fn close<R: Serialize>(&self, outcome: Result<R>) -> Result<R> {
        match outcome {
            Ok(value) => {
                self.finish(Some(&value), &Ok(TaskStatus::Succeeded)).await?;
                Ok(value)
            }
            Err(e) => {
                let failed = Err(e);
                self.finish(None::<&R>, &failed).await?;
                match failed {
                    Err(e) => Err(e),
                    Ok(status) => Err(Error::InternalError(format!("task closed as {status}"))),
                }
            }
        }
    }
}
