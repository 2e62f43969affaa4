// src/server/handlers/repo.rs
//! Repository metadata endpoints

use super::{RepoPath, body, error_response, latest_revision, with_db};
use crate::db::models::RepositoryRevision;
use crate::error::Error;
use crate::metadata::codec::{b64_decode, decompress_gz};
use crate::server::ServerState;
use axum::{
    Json,
    extract::{Path, State},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct RepodataPath {
    pub project_id: String,
    pub repo_name: String,
    pub arch: String,
    pub blob: String,
}

impl RepodataPath {
    fn repo(&self) -> RepoPath {
        RepoPath {
            project_id: self.project_id.clone(),
            repo_name: self.repo_name.clone(),
            arch: self.arch.clone(),
        }
    }
}

/// A requested `repodata/` file
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Repodata {
    Repomd,
    RepomdSignature,
    /// A sqlite database uploaded for a hashed repository
    Sqlite(String),
    Blob {
        revision: String,
        kind: String,
        yaml: bool,
        gz: bool,
    },
}

/// Parse a `repodata/` file name
pub(crate) fn parse_repodata(name: &str) -> Result<Repodata, Error> {
    match name {
        "repomd.xml" => return Ok(Repodata::Repomd),
        "repomd.xml.asc" => return Ok(Repodata::RepomdSignature),
        _ => {}
    }
    if name.ends_with(".sqlite.gz") {
        return Ok(Repodata::Sqlite(name.to_string()));
    }

    let invalid = || Error::InvalidArgument(format!("invalid blob {name}"));
    let (stem, gz) = match name.strip_suffix(".gz") {
        Some(stem) => (stem, true),
        None => (name, false),
    };
    let (stem, yaml) = if let Some(stem) = stem.strip_suffix(".xml") {
        (stem, false)
    } else if let Some(stem) = stem.strip_suffix(".yaml") {
        (stem, true)
    } else {
        return Err(invalid());
    };
    let (revision, kind) = stem.rsplit_once('-').ok_or_else(invalid)?;
    if revision.is_empty() || kind.is_empty() {
        return Err(invalid());
    }
    Ok(Repodata::Blob {
        revision: revision.to_string(),
        kind: kind.to_string(),
        yaml,
        gz,
    })
}

/// Stored payload of a blob type; always gzip
fn payload<'a>(revision: &'a RepositoryRevision, kind: &str) -> Option<&'a str> {
    match kind {
        "PRIMARY" => Some(&revision.primary_xml),
        "FILELISTS" => Some(&revision.filelists_xml),
        "OTHER" => Some(&revision.other_xml),
        "GROUPS" => Some(&revision.groups_xml),
        "MODULES" => Some(&revision.modules_yaml),
        "UPDATEINFO" => Some(&revision.updateinfo_xml),
        _ => None,
    }
}

/// GET /v1/projects/:project_id/repo/:repo_name/:arch/repodata/:blob
pub async fn get_repodata(State(state): State<Arc<ServerState>>, Path(path): Path<RepodataPath>) -> Response {
    match serve_repodata(&state, path).await {
        Ok(response) => response,
        Err(e) => error_response(e),
    }
}

async fn serve_repodata(state: &ServerState, path: RepodataPath) -> Result<Response, Error> {
    match parse_repodata(&path.blob)? {
        Repodata::Repomd => {
            let repo = path.repo();
            let revision = with_db(state.db_path.clone(), move |conn| latest_revision(conn, &repo)).await?;
            Ok(body("application/xml", b64_decode(&revision.repomd_xml)?))
        }
        Repodata::RepomdSignature => {
            let repo = path.repo();
            let revision = with_db(state.db_path.clone(), move |conn| latest_revision(conn, &repo)).await?;
            let key = format!("repo-signatures/{}.xml.asc", revision.id);
            let data = read_object(state, key).await?;
            Ok(body("application/pgp-signature", data))
        }
        Repodata::Sqlite(name) => {
            let data = read_object(state, format!("sqlite-files/{name}")).await?;
            Ok(body("application/gzip", data))
        }
        Repodata::Blob { revision, kind, yaml, gz } => {
            let id = revision.clone();
            let revision = with_db(state.db_path.clone(), move |conn| RepositoryRevision::find_by_id(conn, &id))
                .await?
                .ok_or_else(|| Error::NotFound(format!("revision {revision}")))?;
            let stored = payload(&revision, &kind)
                .ok_or_else(|| Error::InvalidArgument(format!("invalid blob {}", path.blob)))?;
            if stored.is_empty() {
                return Err(Error::NotFound(format!("{kind} of revision {}", revision.id)));
            }
            let data = b64_decode(stored)?;
            let (content_type, data) = match (yaml, gz) {
                (false, true) => ("application/xml+gzip", data),
                (true, true) => ("text/yaml+gzip", data),
                (false, false) => ("application/xml", decompress_gz(&data)?),
                (true, false) => ("text/yaml", decompress_gz(&data)?),
            };
            Ok(body(content_type, data))
        }
    }
}

async fn read_object(state: &ServerState, key: String) -> Result<Vec<u8>, Error> {
    let store = state.store.clone();
    tokio::task::spawn_blocking(move || {
        if !store.exists(&key)? {
            return Err(Error::NotFound(key));
        }
        store.get(&key)
    })
    .await?
}

/// GET /v1/projects/:project_id/repo/:repo_name/:arch/url-mappings
pub async fn get_url_mappings(State(state): State<Arc<ServerState>>, Path(path): Path<RepoPath>) -> Response {
    let mappings: Result<BTreeMap<String, String>, Error> =
        with_db(state.db_path.clone(), move |conn| Ok(latest_revision(conn, &path)?.url_mapping())).await;
    match mappings {
        Ok(mappings) => Json(mappings).into_response(),
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repodata() {
        assert_eq!(parse_repodata("repomd.xml").unwrap(), Repodata::Repomd);
        assert_eq!(parse_repodata("repomd.xml.asc").unwrap(), Repodata::RepomdSignature);
        assert_eq!(
            parse_repodata("a1b2-c3d4-PRIMARY.xml.gz").unwrap(),
            Repodata::Blob {
                revision: "a1b2-c3d4".to_string(),
                kind: "PRIMARY".to_string(),
                yaml: false,
                gz: true,
            }
        );
        assert_eq!(
            parse_repodata("r1-MODULES.yaml").unwrap(),
            Repodata::Blob {
                revision: "r1".to_string(),
                kind: "MODULES".to_string(),
                yaml: true,
                gz: false,
            }
        );
        assert_eq!(
            parse_repodata("abc-primary.sqlite.gz").unwrap(),
            Repodata::Sqlite("abc-primary.sqlite.gz".to_string())
        );
        assert!(parse_repodata("PRIMARY.xml.gz").is_err());
        assert!(parse_repodata("r1-PRIMARY.json").is_err());
    }
}
