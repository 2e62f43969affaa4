// src/server/routes.rs
//! Axum router for the yumrepofs surface

use crate::server::ServerState;
use crate::server::handlers::{keys, repo, rpm};
use axum::{Router, routing::get};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Create the main application router
pub fn create_router(state: Arc<ServerState>) -> Router {
    let repo_routes = Router::new()
        .route("/repodata/:blob", get(repo::get_repodata))
        .route("/url-mappings", get(repo::get_url_mappings))
        .route("/Packages/:parent/:file", get(rpm::get_rpm));

    Router::new()
        .route("/health", get(health_check))
        .route("/v1/projects/:project_id/public-key", get(keys::get_public_key))
        .nest("/v1/projects/:project_id/repo/:repo_name/:arch", repo_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}
