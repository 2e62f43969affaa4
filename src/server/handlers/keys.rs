// src/server/handlers/keys.rs
//! Project signing key

use super::{body, error_response, with_db};
use crate::db::models::{Key, Project};
use crate::error::Error;
use crate::server::ServerState;
use axum::{
    extract::{Path, State},
    response::Response,
};
use std::sync::Arc;

/// GET /v1/projects/:project_id/public-key
pub async fn get_public_key(State(state): State<Arc<ServerState>>, Path(project_id): Path<String>) -> Response {
    let key = with_db(state.db_path.clone(), move |conn| {
        let project = Project::resolve(conn, &project_id)?;
        Key::default_for_project(conn, &project.id)?
            .ok_or_else(|| Error::NotFound(format!("default key for project {}", project.name)))
    })
    .await;

    match key {
        Ok(key) => body("application/pgp-keys", key.public_key.into_bytes()),
        Err(e) => error_response(e),
    }
}
