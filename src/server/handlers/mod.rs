// src/server/handlers/mod.rs
//! HTTP handlers for the yumrepofs server

pub mod keys;
pub mod repo;
pub mod rpm;

use crate::db::{
    self,
    models::{Project, RepositoryRevision},
};
use crate::error::Error;
use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use rusqlite::Connection;
use serde::Deserialize;
use std::path::PathBuf;

/// Path parameters shared by every per-repository route
#[derive(Debug, Clone, Deserialize)]
pub struct RepoPath {
    pub project_id: String,
    pub repo_name: String,
    pub arch: String,
}

impl RepoPath {
    /// `i386` is served from the `i686` revision
    pub fn arch(&self) -> &str {
        if self.arch == "i386" { "i686" } else { &self.arch }
    }
}

/// Run a database lookup off the async runtime
pub(crate) async fn with_db<T, F>(db_path: PathBuf, f: F) -> Result<T, Error>
where
    T: Send + 'static,
    F: FnOnce(&Connection) -> Result<T, Error> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let conn = db::open(&db_path)?;
        f(&conn)
    })
    .await?
}

/// Latest revision of a repository for an arch
pub(crate) fn latest_revision(conn: &Connection, path: &RepoPath) -> Result<RepositoryRevision, Error> {
    let project = Project::resolve(conn, &path.project_id)?;
    RepositoryRevision::latest_by_project_name_arch(conn, &project.id, &path.repo_name, path.arch())?.ok_or_else(|| {
        Error::NotFound(format!("revision of {}/{}/{}", project.name, path.repo_name, path.arch))
    })
}

/// A response with a body and content type
pub(crate) fn body(content_type: &str, data: Vec<u8>) -> Response {
    ([(header::CONTENT_TYPE, content_type.to_string())], data).into_response()
}

pub(crate) fn error_response(err: Error) -> Response {
    let status = match &err {
        Error::NotFound(_) | Error::CouldNotFindPackage(_) => StatusCode::NOT_FOUND,
        Error::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        _ => {
            tracing::error!("Request failed: {}", err);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, err.to_string()).into_response()
}
