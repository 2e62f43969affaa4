// src/lease.rs

//! Exclusive named leases backed by the task store
//!
//! The composer holds a lease keyed by project id while it rewrites
//! repository revisions, so publications for one project are serialized
//! across every process sharing the database. A lease expires unless its
//! holder heartbeats it; an expired lease can be taken over.
//!
//! # Example
//!
//! ```ignore
//! let leases = LeaseManager::new(db_path, Duration::from_secs(10), Duration::from_secs(3));
//! let lease = leases.acquire(&project_id).await?;
//! // ... compose ...
//! lease.release()?;
//! ```

use crate::db;
use crate::error::{Error, Result};
use rusqlite::{Connection, params};
use std::path::PathBuf;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Hands out leases against one database
#[derive(Debug, Clone)]
pub struct LeaseManager {
    db_path: PathBuf,
    duration: Duration,
    heartbeat: Duration,
}

impl LeaseManager {
    pub fn new(db_path: impl Into<PathBuf>, duration: Duration, heartbeat: Duration) -> Self {
        Self {
            db_path: db_path.into(),
            duration,
            heartbeat,
        }
    }

    /// Take the lease if it is free, expired, or already ours
    pub fn try_acquire(conn: &Connection, name: &str, holder: &str, duration: Duration) -> Result<bool> {
        let now = now_millis();
        let expires = now + duration.as_millis() as i64;
        let changed = conn.execute(
            "INSERT INTO leases (name, holder, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at = excluded.expires_at
             WHERE leases.expires_at < ?4 OR leases.holder = excluded.holder",
            params![name, holder, expires, now],
        )?;
        Ok(changed > 0)
    }

    /// Extend a held lease; false when it was lost to another holder
    pub fn extend(conn: &Connection, name: &str, holder: &str, duration: Duration) -> Result<bool> {
        let expires = now_millis() + duration.as_millis() as i64;
        let changed = conn.execute(
            "UPDATE leases SET expires_at = ?3 WHERE name = ?1 AND holder = ?2",
            params![name, holder, expires],
        )?;
        Ok(changed > 0)
    }

    pub fn release_raw(conn: &Connection, name: &str, holder: &str) -> Result<()> {
        conn.execute(
            "DELETE FROM leases WHERE name = ?1 AND holder = ?2",
            params![name, holder],
        )?;
        Ok(())
    }

    /// Spin until the lease is acquired, then keep it alive in the background
    pub async fn acquire(&self, name: &str) -> Result<Lease> {
        let holder = db::new_id();
        let mut attempts = 0u64;
        loop {
            let db_path = self.db_path.clone();
            let (n, h, d) = (name.to_string(), holder.clone(), self.duration);
            let acquired = tokio::task::spawn_blocking(move || {
                let conn = db::open(&db_path)?;
                Self::try_acquire(&conn, &n, &h, d)
            })
            .await??;

            if acquired {
                info!("Acquired lease {} after {} attempts", name, attempts + 1);
                break;
            }
            attempts += 1;
            if attempts % 10 == 0 {
                debug!("Still waiting for lease {}", name);
            }
            tokio::time::sleep(self.heartbeat).await;
        }

        let heartbeat = {
            let db_path = self.db_path.clone();
            let (name, holder) = (name.to_string(), holder.clone());
            let (interval, duration) = (self.heartbeat, self.duration);
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let (db_path, n, h) = (db_path.clone(), name.clone(), holder.clone());
                    let kept = tokio::task::spawn_blocking(move || {
                        let conn = db::open(&db_path)?;
                        Self::extend(&conn, &n, &h, duration)
                    })
                    .await;
                    match kept {
                        Ok(Ok(true)) => {}
                        Ok(Ok(false)) => {
                            warn!("Lease {} was lost", name);
                            return;
                        }
                        Ok(Err(e)) => warn!("Lease {} heartbeat failed: {}", name, e),
                        Err(e) => warn!("Lease {} heartbeat panicked: {}", name, e),
                    }
                }
            })
        };

        Ok(Lease {
            name: name.to_string(),
            holder,
            db_path: self.db_path.clone(),
            heartbeat: Some(heartbeat),
            released: false,
        })
    }
}

/// A held lease; released explicitly or on drop
pub struct Lease {
    name: String,
    holder: String,
    db_path: PathBuf,
    heartbeat: Option<JoinHandle<()>>,
    released: bool,
}

impl Lease {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
        self.released = true;
        let conn = db::open(&self.db_path)?;
        LeaseManager::release_raw(&conn, &self.name, &self.holder)
            .map_err(|e| Error::LeaseError(format!("release {}: {}", self.name, e)))?;
        debug!("Released lease {}", self.name);
        Ok(())
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            warn!("Failed to release lease on drop: {}", e);
        }
    }
}
