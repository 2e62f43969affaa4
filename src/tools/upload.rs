// src/tools/upload.rs

//! Build artifact upload
//!
//! Every file a build produces goes through [`upload_artifact`]: it is
//! hashed, stored under `<parent-task>/<basename>`, described with
//! single-package repodata when it is an RPM, and recorded as an artifact
//! of a fresh upload subtask.

use super::RepoTool;
use crate::db::{
    self,
    models::{Task, TaskArtifact, TaskLog, TaskStatus, TaskType},
};
use crate::error::{Error, Result};
use crate::metadata::codec::sha256_hex;
use crate::metadata::primary::{PrimaryPackage, decode_primary};
use crate::rpmutils;
use crate::store::BlobStore;
use crate::worker::CommandRunner;
use rpm::IndexTag;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Repodata and arch tags of one uploaded RPM
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpmArtifactMetadata {
    /// primary.xml of a repository holding only this package
    pub primary: String,
    pub filelists: String,
    pub other: String,
    #[serde(default)]
    pub build_arch: Vec<String>,
    #[serde(default)]
    pub exclude_arch: Vec<String>,
    #[serde(default)]
    pub exclusive_arch: Vec<String>,
}

impl RpmArtifactMetadata {
    /// The package entry of the embedded primary document
    pub fn primary_package(&self) -> Result<PrimaryPackage> {
        decode_primary(self.primary.as_bytes())?
            .packages
            .into_iter()
            .next()
            .ok_or_else(|| Error::ParseError("artifact primary has no package".to_string()))
    }

    pub fn from_value(value: &serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub object_name: String,
    pub subtask: String,
    pub hash_sha256: String,
    pub arch: String,
    /// The object already existed and was not written again
    pub skip: bool,
}

/// Where uploads go and what describes them
pub struct Uploader {
    pub db_path: PathBuf,
    pub store: Arc<dyn BlobStore>,
    pub repo: Arc<dyn RepoTool>,
    pub project_id: String,
    pub parent_task_id: String,
}

/// Arch an artifact is recorded under
pub fn artifact_arch(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidArgument(format!("invalid artifact path {}", path.display())))?;
    if name.ends_with(".src.rpm") {
        return Ok("src".to_string());
    }
    if !name.ends_with(".rpm") {
        return Ok("noarch".to_string());
    }
    rpmutils::Nvr::parse(rpmutils::strip_rpm_suffix(name))
        .map(|nvr| nvr.arch)
        .ok_or_else(|| Error::ParseError(format!("invalid RPM file name {}", name)))
}

fn header_tags(path: &Path) -> Result<(Vec<String>, Vec<String>, Vec<String>)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let pkg = rpm::Package::parse(&mut reader)
        .map_err(|e| Error::ParseError(format!("failed to parse {}: {}", path.display(), e)))?;
    let tag = |t: IndexTag| {
        pkg.metadata
            .header
            .get_entry_data_as_string_array(t)
            .map(|v| v.to_vec())
            .unwrap_or_default()
    };
    Ok((
        tag(IndexTag::RPMTAG_BUILDARCHS),
        tag(IndexTag::RPMTAG_EXCLUDEARCH),
        tag(IndexTag::RPMTAG_EXCLUSIVEARCH),
    ))
}

impl Uploader {
    /// Upload one file as an artifact of a new `task_type` subtask
    pub async fn upload_artifact(
        &self,
        runner: &dyn CommandRunner,
        path: &Path,
        task_type: TaskType,
    ) -> Result<UploadResult> {
        let basename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidArgument(format!("invalid artifact path {}", path.display())))?
            .to_string();
        let arch = artifact_arch(path)?;
        let object_name = format!("{}/{}", self.parent_task_id, basename);

        let (db_path, project, parent) = (
            self.db_path.clone(),
            self.project_id.clone(),
            self.parent_task_id.clone(),
        );
        let subtask = tokio::task::spawn_blocking(move || {
            let conn = db::open(&db_path)?;
            let task = Task::new("noarch", task_type, Some(&project), Some(&parent));
            task.insert(&conn)?;
            Task::set_status(&conn, &task.id, TaskStatus::Running)?;
            Ok::<_, Error>(task.id)
        })
        .await??;

        let content = tokio::fs::read(path).await?;
        let hash = sha256_hex(&content);

        let metadata = if basename.ends_with(".rpm") {
            let xml = self.repo.package_metadata(runner, path).await?;
            let rpm_path = path.to_path_buf();
            let (build_arch, exclude_arch, exclusive_arch) =
                tokio::task::spawn_blocking(move || header_tags(&rpm_path)).await??;
            let metadata = RpmArtifactMetadata {
                primary: String::from_utf8_lossy(&xml.primary).into_owned(),
                filelists: String::from_utf8_lossy(&xml.filelists).into_owned(),
                other: String::from_utf8_lossy(&xml.other).into_owned(),
                build_arch,
                exclude_arch,
                exclusive_arch,
            };
            Some(serde_json::to_value(&metadata)?)
        } else {
            None
        };

        // A retried upload finds the object in place but still needs its description
        let store = self.store.clone();
        let key = object_name.clone();
        let skip = tokio::task::spawn_blocking(move || {
            if store.exists(&key)? {
                return Ok::<_, Error>(true);
            }
            store.put(&key, &content)?;
            Ok(false)
        })
        .await??;
        if skip {
            debug!("{} already uploaded", object_name);
        } else {
            info!("Uploaded {} ({})", object_name, arch);
        }

        self.close(&subtask, &object_name, &hash, &arch, metadata.as_ref())
            .await?;
        Ok(UploadResult {
            object_name,
            subtask,
            hash_sha256: hash,
            arch,
            skip,
        })
    }

    async fn close(
        &self,
        subtask: &str,
        object_name: &str,
        hash: &str,
        arch: &str,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        let (db_path, subtask, object_name, hash, arch) = (
            self.db_path.clone(),
            subtask.to_string(),
            object_name.to_string(),
            hash.to_string(),
            arch.to_string(),
        );
        let metadata = metadata.cloned();
        let parent = self.parent_task_id.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db::open(&db_path)?;
            db::transaction(&mut conn, |tx| {
                TaskArtifact::attach(tx, &subtask, &object_name, &hash, &arch, metadata.as_ref())?;
                if let Some(metadata) = &metadata {
                    Task::set_metadata(tx, &subtask, metadata)?;
                }
                TaskLog::append(
                    tx,
                    &[format!("Uploaded {} ({})", object_name, hash)],
                    &subtask,
                    Some(&parent),
                )?;
                Task::set_status(tx, &subtask, TaskStatus::Succeeded)?;
                Ok(())
            })
        })
        .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::workflow::testing::{FakeRepo, write_rpm};
    use crate::worker::LocalRunner;

    #[tokio::test]
    async fn test_reupload_still_describes_rpm() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("tasks.db");
        db::init(&db_path).unwrap();
        let parent = Task::new("noarch", TaskType::Build, None, None);
        parent.insert(&db::open(&db_path).unwrap()).unwrap();

        let store = Arc::new(MemoryStore::default());
        let uploader = Uploader {
            db_path: db_path.clone(),
            store: store.clone(),
            repo: Arc::new(FakeRepo),
            project_id: "p1".to_string(),
            parent_task_id: parent.id.clone(),
        };
        let rpm = dir.path().join("bash-5.1.8-6.el9.src.rpm");
        write_rpm(&rpm, "bash", "5.1.8", "6.el9", "x86_64");
        let runner = LocalRunner::new(dir.path());

        let first = uploader
            .upload_artifact(&runner, &rpm, TaskType::BuildSrpmUpload)
            .await
            .unwrap();
        let second = uploader
            .upload_artifact(&runner, &rpm, TaskType::BuildSrpmUpload)
            .await
            .unwrap();
        assert!(!first.skip);
        assert!(second.skip);
        assert_eq!(first.object_name, second.object_name);
        assert_eq!(store.len(), 1);

        let conn = db::open(&db_path).unwrap();
        for upload in [&first, &second] {
            let task = Task::find_by_id(&conn, &upload.subtask).unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Succeeded);
            let metadata = RpmArtifactMetadata::from_value(task.metadata.as_ref().unwrap()).unwrap();
            assert_eq!(metadata.primary_package().unwrap().name, "bash");

            let artifacts = TaskArtifact::list_for_task(&conn, &upload.subtask).unwrap();
            assert_eq!(artifacts.len(), 1);
            assert_eq!(artifacts[0].metadata.as_ref(), task.metadata.as_ref());
        }
    }

    #[test]
    fn test_artifact_arch() {
        assert_eq!(artifact_arch(Path::new("/r/bash-5.1-2.el9.src.rpm")).unwrap(), "src");
        assert_eq!(artifact_arch(Path::new("/r/bash-5.1-2.el9.x86_64.rpm")).unwrap(), "x86_64");
        assert_eq!(artifact_arch(Path::new("/r/bash-doc-5.1-2.el9.noarch.rpm")).unwrap(), "noarch");
        assert_eq!(artifact_arch(Path::new("/r/build.log")).unwrap(), "noarch");
    }
}
