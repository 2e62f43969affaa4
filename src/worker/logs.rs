// src/worker/logs.rs

//! Sandbox log ingestion into the task log stream

use super::{Provisioner, Sandbox};
use crate::db::{self, models::TaskLog};
use crate::error::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Lines the sandbox runtime emits that say nothing about the build
pub fn is_noise(line: &str) -> bool {
    line.starts_with("unable to retrieve container logs for")
        || line.contains("Failed to poll for task")
        || line.starts_with("failed to try resolving symlinks in path")
}

/// Where ingested lines go
#[derive(Debug, Clone)]
pub struct LogSink {
    pub db_path: PathBuf,
    pub task_id: String,
    pub parent_task_id: Option<String>,
    pub batch: usize,
}

impl LogSink {
    async fn flush(&self, lines: Vec<String>) -> Result<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let sink = self.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db::open(&sink.db_path)?;
            TaskLog::append(&conn, &lines, &sink.task_id, sink.parent_task_id.as_deref())
        })
        .await?
    }

    /// Filter and store lines in batches of at most `batch`
    pub async fn push(&self, lines: Vec<String>) -> Result<usize> {
        let mut kept = 0;
        let mut pending = Vec::with_capacity(self.batch);
        for line in lines.into_iter().filter(|l| !is_noise(l)) {
            pending.push(line);
            kept += 1;
            if pending.len() >= self.batch.max(1) {
                self.flush(std::mem::take(&mut pending)).await?;
            }
        }
        self.flush(pending).await?;
        Ok(kept)
    }
}

/// Follow a sandbox log until `stop` flips, then drain what is left.
///
/// Returns the number of lines stored.
pub async fn ingest(
    provisioner: Arc<dyn Provisioner>,
    sandbox: Sandbox,
    sink: LogSink,
    mut stop: watch::Receiver<bool>,
) -> Result<usize> {
    let mut offset = 0u64;
    let mut total = 0usize;
    loop {
        let stopping = *stop.borrow();
        match provisioner.read_logs(&sandbox, offset).await {
            Ok((lines, next)) => {
                offset = next;
                total += sink.push(lines).await?;
            }
            Err(e) => warn!("Reading logs of {} failed: {}", sandbox.name, e),
        }
        if stopping {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = stop.changed() => {}
        }
    }
    debug!("Ingested {} log lines from {}", total, sandbox.name);
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Task, TaskType};
    use crate::worker::{LocalProvisioner, SandboxSpec};
    use std::io::Write;

    #[test]
    fn test_noise_filter() {
        assert!(is_noise("unable to retrieve container logs for abc"));
        assert!(is_noise("2024 worker: Failed to poll for task, retrying"));
        assert!(is_noise("failed to try resolving symlinks in path /x"));
        assert!(!is_noise("Finish: rpmbuild -bb"));
    }

    #[tokio::test]
    async fn test_ingest_stores_filtered_lines() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tasks.db");
        db::init(&db_path).unwrap();
        let task = Task::new("x86_64", TaskType::BuildArch, None, None);
        task.insert(&db::open(&db_path).unwrap()).unwrap();

        let provisioner = Arc::new(LocalProvisioner::new(dir.path().join("sandboxes")).unwrap());
        let sandbox = provisioner
            .provision(&SandboxSpec {
                task_id: task.id.clone(),
                parent_task_id: task.id.clone(),
                project_id: "p".to_string(),
                purpose: "b-x86_64".to_string(),
                arch: "x86_64".to_string(),
                high_resource: false,
                privileged: false,
            })
            .await
            .unwrap();
        let mut f = std::fs::File::create(sandbox.log_path()).unwrap();
        for i in 0..7 {
            writeln!(f, "line {i}").unwrap();
        }
        writeln!(f, "unable to retrieve container logs for x").unwrap();

        let (tx, rx) = watch::channel(false);
        let sink = LogSink {
            db_path: db_path.clone(),
            task_id: task.id.clone(),
            parent_task_id: None,
            batch: 5,
        };
        let handle = tokio::spawn(ingest(provisioner, sandbox, sink, rx));
        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap().unwrap(), 7);

        let conn = db::open(&db_path).unwrap();
        let lines = TaskLog::list(&conn, Some(&task.id), None, 0).unwrap();
        assert_eq!(lines.len(), 7);
        assert_eq!(lines[6].1, "line 6");
    }
}
