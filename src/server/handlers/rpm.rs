// src/server/handlers/rpm.rs
//! RPM downloads from the blob store

use super::{RepoPath, body, error_response, latest_revision, with_db};
use crate::error::Error;
use crate::server::ServerState;
use axum::{
    extract::{Path, State},
    response::Response,
};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct RpmPath {
    pub project_id: String,
    pub repo_name: String,
    pub arch: String,
    pub parent: String,
    pub file: String,
}

/// GET /v1/projects/:project_id/repo/:repo_name/:arch/Packages/:parent/:file
///
/// Hashed repositories publish `Packages/<letter>/<file>`; those are
/// resolved through the url mappings of the latest revision.
pub async fn get_rpm(State(state): State<Arc<ServerState>>, Path(path): Path<RpmPath>) -> Response {
    match serve_rpm(&state, path).await {
        Ok(response) => response,
        Err(e) => error_response(e),
    }
}

async fn serve_rpm(state: &ServerState, path: RpmPath) -> Result<Response, Error> {
    if !path.file.ends_with(".rpm") {
        return Err(Error::InvalidArgument(format!("not an rpm: {}", path.file)));
    }
    let mut key = format!("{}/{}", path.parent, path.file);
    if path.parent.chars().count() == 1 {
        let lookup = key.clone();
        key = with_db(state.db_path.clone(), move |conn| {
            let repo = RepoPath {
                project_id: path.project_id,
                repo_name: path.repo_name,
                arch: path.arch,
            };
            let revision = latest_revision(conn, &repo)?;
            revision
                .url_mapping()
                .remove(&lookup)
                .ok_or_else(|| Error::NotFound(format!("url mapping {lookup}")))
        })
        .await?;
    }

    let store = state.store.clone();
    let data = tokio::task::spawn_blocking(move || store.get(&key)).await??;
    Ok(body("application/x-rpm", data))
}
