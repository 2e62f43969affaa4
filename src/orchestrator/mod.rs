// src/orchestrator/mod.rs

//! Durable workflow runtime
//!
//! Workflows are plain async functions driven through a [`WorkflowContext`].
//! Everything non-deterministic a workflow does (task creation, UUIDs, clock
//! reads, database writes) goes through [`WorkflowContext::side_effect`], and
//! every long-running piece of work goes through
//! [`WorkflowContext::execute_activity`]. Both record their results in the
//! `workflow_history` table under `(workflow_id, seq)`, so re-running a
//! workflow with the same id after a crash replays completed steps instead of
//! repeating them.
//!
//! Concurrent branches inside one workflow must each use their own
//! [`WorkflowContext::child`] scope so that sequence numbers stay stable
//! between executions.

mod activity;
mod finalizer;

pub use activity::{ActivityContext, ActivityOptions, KeepAlive, RetryPolicy};
pub use finalizer::{
    DOMAIN_BUILDS, DOMAIN_IMPORTS, DOMAIN_TASKS, REASON_ACTIVITY_FAILED, REASON_INTERNAL,
    REASON_PACKAGE_NOT_FOUND, TaskErrorDetails, TaskFinalizer,
};

use crate::db;
use crate::error::{Error, Result};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{debug, warn};

const KIND_SIDE_EFFECT: &str = "side_effect";
const KIND_ACTIVITY: &str = "activity";

/// Where recorded steps are kept
#[derive(Clone)]
pub enum History {
    /// Persisted in the task store
    Sqlite(PathBuf),
    /// Process-local, lost on exit
    Memory(Arc<Mutex<HashMap<(String, u64), String>>>),
}

impl History {
    pub fn memory() -> Self {
        History::Memory(Arc::new(Mutex::new(HashMap::new())))
    }

    async fn load(&self, workflow_id: &str, seq: u64, kind: &str) -> Result<Option<String>> {
        match self {
            History::Sqlite(path) => {
                let (path, id, kind) = (path.clone(), workflow_id.to_string(), kind.to_string());
                tokio::task::spawn_blocking(move || {
                    let conn = db::open(&path)?;
                    let payload = conn
                        .query_row(
                            "SELECT payload FROM workflow_history
                             WHERE workflow_id = ?1 AND seq = ?2 AND kind = ?3",
                            params![id, seq as i64, kind],
                            |row| row.get(0),
                        )
                        .optional()?;
                    Ok(payload)
                })
                .await?
            }
            History::Memory(map) => {
                let map = map
                    .lock()
                    .map_err(|_| Error::InternalError("history lock poisoned".to_string()))?;
                Ok(map.get(&(format!("{workflow_id}:{kind}"), seq)).cloned())
            }
        }
    }

    async fn record(&self, workflow_id: &str, seq: u64, kind: &str, payload: String) -> Result<()> {
        match self {
            History::Sqlite(path) => {
                let (path, id, kind) = (path.clone(), workflow_id.to_string(), kind.to_string());
                tokio::task::spawn_blocking(move || {
                    let conn = db::open(&path)?;
                    conn.execute(
                        "INSERT OR REPLACE INTO workflow_history (workflow_id, seq, kind, payload)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![id, seq as i64, kind, payload],
                    )?;
                    Ok(())
                })
                .await?
            }
            History::Memory(map) => {
                let mut map = map
                    .lock()
                    .map_err(|_| Error::InternalError("history lock poisoned".to_string()))?;
                map.insert((format!("{workflow_id}:{kind}"), seq), payload);
                Ok(())
            }
        }
    }
}

struct Inner {
    workflow_id: String,
    seq: AtomicU64,
    history: History,
    cancel: watch::Receiver<bool>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

/// Handle a workflow uses to reach the outside world
#[derive(Clone)]
pub struct WorkflowContext {
    inner: Arc<Inner>,
}

impl WorkflowContext {
    pub fn new(workflow_id: impl Into<String>, history: History) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                workflow_id: workflow_id.into(),
                seq: AtomicU64::new(0),
                history,
                cancel: rx,
                cancel_tx: Arc::new(tx),
            }),
        }
    }

    pub fn workflow_id(&self) -> &str {
        &self.inner.workflow_id
    }

    /// A nested scope with its own sequence, sharing history and cancellation
    pub fn child(&self, name: &str) -> Self {
        Self {
            inner: Arc::new(Inner {
                workflow_id: format!("{}/{}", self.inner.workflow_id, name),
                seq: AtomicU64::new(0),
                history: self.inner.history.clone(),
                cancel: self.inner.cancel.clone(),
                cancel_tx: self.inner.cancel_tx.clone(),
            }),
        }
    }

    /// Request cancellation of every running activity in this workflow tree
    pub fn cancel(&self) {
        let _ = self.inner.cancel_tx.send(true);
    }

    pub fn is_canceled(&self) -> bool {
        *self.inner.cancel.borrow()
    }

    fn next_seq(&self) -> u64 {
        self.inner.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Run a blocking, non-deterministic step once and record its output
    pub async fn side_effect<T, F>(&self, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let seq = self.next_seq();
        let id = self.workflow_id();
        if let Some(payload) = self.inner.history.load(id, seq, KIND_SIDE_EFFECT).await? {
            debug!("Replaying side effect {}#{}", id, seq);
            return Ok(serde_json::from_str(&payload)?);
        }

        let value = tokio::task::spawn_blocking(f).await??;
        self.inner
            .history
            .record(id, seq, KIND_SIDE_EFFECT, serde_json::to_string(&value)?)
            .await?;
        Ok(value)
    }

    /// Run an activity under its timeout, heartbeat and retry policy
    pub async fn execute_activity<T, F, Fut>(
        &self,
        name: &str,
        options: &ActivityOptions,
        f: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: Fn(ActivityContext) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let seq = self.next_seq();
        let id = self.workflow_id().to_string();
        if let Some(payload) = self.inner.history.load(&id, seq, KIND_ACTIVITY).await? {
            debug!("Replaying activity {} ({}#{})", name, id, seq);
            return Ok(serde_json::from_str(&payload)?);
        }

        let mut attempt = 1u32;
        loop {
            let ctx = ActivityContext::new(name, attempt, self.inner.cancel.clone());
            match activity::run_attempt(&ctx, options, f(ctx.clone())).await {
                Ok(value) => {
                    self.inner
                        .history
                        .record(&id, seq, KIND_ACTIVITY, serde_json::to_string(&value)?)
                        .await?;
                    return Ok(value);
                }
                Err(e) => {
                    let exhausted = options
                        .retry
                        .max_attempts
                        .is_some_and(|max| attempt >= max);
                    if exhausted || !e.is_retryable() || self.is_canceled() {
                        return Err(e.into_inner());
                    }
                    let delay = options.retry.delay_for(attempt);
                    warn!(
                        "Activity {} attempt {} failed, retrying in {:?}: {}",
                        name, attempt, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    #[tokio::test]
    async fn test_side_effect_replays_recorded_value() {
        let history = History::memory();
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let ctx = WorkflowContext::new("wf-1", history.clone());
            let calls = calls.clone();
            let value: String = ctx
                .side_effect(move || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(db::new_id())
                })
                .await
                .unwrap();
            assert!(!value.is_empty());
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_activity_retries_until_success() {
        let ctx = WorkflowContext::new("wf-2", History::memory());
        let calls = Arc::new(AtomicU32::new(0));
        let options = ActivityOptions::new(Duration::from_secs(5)).with_retry(RetryPolicy {
            initial_interval: Duration::from_millis(1),
            backoff: 1.0,
            max_interval: Duration::from_millis(1),
            max_attempts: Some(3),
        });

        let result: u32 = ctx
            .execute_activity("flaky", &options, |_| {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(Error::IoError("transient".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let ctx = WorkflowContext::new("wf-3", History::memory());
        let calls = Arc::new(AtomicU32::new(0));
        let options = ActivityOptions::new(Duration::from_secs(5));

        let err = ctx
            .execute_activity::<(), _, _>("pod", &options, |_| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Error::PodFailed("pod failed".to_string()))
                }
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PodFailed(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_child_scopes_have_independent_sequences() {
        let history = History::memory();
        let ctx = WorkflowContext::new("wf-4", history.clone());
        let a: u32 = ctx.child("x86_64").side_effect(|| Ok(1)).await.unwrap();
        let b: u32 = ctx.child("aarch64").side_effect(|| Ok(2)).await.unwrap();
        assert_eq!((a, b), (1, 2));

        let replay = WorkflowContext::new("wf-4", history);
        let b: u32 = replay.child("aarch64").side_effect(|| Ok(99)).await.unwrap();
        assert_eq!(b, 2);
    }
}
