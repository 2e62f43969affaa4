// src/server/mod.rs
//! Yumrepofs HTTP server
//!
//! Serves the latest revision of every repository straight from the
//! database:
//! - `repomd.xml` and its detached signature
//! - `repodata/<revision>-<TYPE>` payloads, compressed or plain
//! - `Packages/...` RPMs from the blob store, through url mappings for
//!   hashed repositories
//!
//! Nothing here writes; revisions are only created by the composer.

mod handlers;
mod routes;

pub use routes::create_router;

use crate::config::BuilderConfig;
use crate::store::BlobStore;
use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// Shared server state
pub struct ServerState {
    pub db_path: PathBuf,
    pub store: Arc<dyn BlobStore>,
}

impl ServerState {
    pub fn new(db_path: PathBuf, store: Arc<dyn BlobStore>) -> Self {
        Self { db_path, store }
    }
}

/// Start the yumrepofs server and block until it stops
pub async fn run_server(config: &BuilderConfig, store: Arc<dyn BlobStore>) -> Result<()> {
    let bind_addr = config.bind_addr()?;

    tracing::info!("Starting yumrepofs server on {}", bind_addr);
    tracing::info!("Database: {:?}", config.database.path);

    let state = Arc::new(ServerState::new(config.database.path.clone(), store));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", bind_addr))?;
    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
