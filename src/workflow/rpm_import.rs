// src/workflow/rpm_import.rs

//! Import of pre-built RPMs
//!
//! A stored object holding one RPM or a tar of RPMs becomes a build of the
//! package they were built from. Every RPM must come from the same source
//! package, and the source NVRA is locked unless the import overrides an
//! existing one.

use super::build::list_rpms;
use super::{Controller, PackageOperationMetadata, UpdateRepoRequest, UpdateRepoTask};
use crate::db::models::{
    Build, NvraLock, Package, PackageVersion, Project, ProjectPackageVersion, Task, TaskType,
};
use crate::error::{Error, Result};
use crate::orchestrator::{ActivityOptions, DOMAIN_BUILDS, TaskFinalizer, WorkflowContext};
use crate::rpmutils::{self, Nvr};
use crate::tools::UploadResult;
use crate::worker::SandboxSpec;
use serde::{Deserialize, Serialize};
use std::io::{BufReader, Cursor, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpmImportRequest {
    pub project_id: String,
    /// Blob store key of an RPM or a `.tar` of RPMs
    pub rpms: String,
    #[serde(default)]
    pub force_override: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpmLookasideBatchImportRequest {
    pub project_id: String,
    pub lookaside_blobs: Vec<String>,
    #[serde(default)]
    pub force_override: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpmImportTask {
    pub build_id: String,
    #[serde(default)]
    pub repo_changes: Option<UpdateRepoTask>,
}

/// Header fields that decide where an RPM belongs
#[derive(Debug, Clone, PartialEq, Eq)]
struct RpmHeader {
    name: String,
    version: String,
    release: String,
    arch: String,
    /// Empty for source packages
    source_rpm: String,
}

impl RpmHeader {
    fn parse(content: &[u8]) -> Result<Self> {
        let mut reader = BufReader::new(Cursor::new(content));
        let pkg = rpm::Package::parse(&mut reader)
            .map_err(|e| Error::ParseError(format!("failed to parse RPM: {e}")))?;
        let field = |value: std::result::Result<&str, rpm::Error>, tag: &str| {
            value
                .map(str::to_string)
                .map_err(|e| Error::ParseError(format!("RPM has no {tag}: {e}")))
        };
        let meta = &pkg.metadata;
        let source_rpm = if meta.is_source_package() {
            String::new()
        } else {
            meta.get_source_rpm().map(str::to_string).unwrap_or_default()
        };
        Ok(Self {
            name: field(meta.get_name(), "name")?,
            version: field(meta.get_version(), "version")?,
            release: field(meta.get_release(), "release")?,
            arch: field(meta.get_arch(), "arch")?,
            source_rpm,
        })
    }

    fn is_source(&self) -> bool {
        self.source_rpm.is_empty()
    }

    /// `n-v-r.a.rpm`, with `src` as the arch of source packages
    fn file_name(&self) -> String {
        let arch = if self.is_source() { "src" } else { &self.arch };
        format!("{}-{}-{}.{}.rpm", self.name, self.version, self.release, arch)
    }

    /// File name of the source package this RPM comes from
    fn source_file_name(&self) -> String {
        if self.is_source() {
            self.file_name()
        } else {
            self.source_rpm.clone()
        }
    }
}

/// RPMs of one stored object, by the file name they are written under
fn read_rpms(key: &str, content: Vec<u8>) -> Result<Vec<(String, Vec<u8>, RpmHeader)>> {
    if !key.ends_with(".tar") {
        info!("Reading RPM: {}", key);
        let header = RpmHeader::parse(&content)?;
        return Ok(vec![(header.file_name(), content, header)]);
    }

    info!("Reading tar: {}", key);
    let mut rpms = Vec::new();
    let mut archive = tar::Archive::new(Cursor::new(content));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.into_owned();
        let Some(name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            continue;
        };
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        info!("Detected RPM: {}", name);
        let header = RpmHeader::parse(&buf)?;
        rpms.push((name, buf, header));
    }
    Ok(rpms)
}

/// Source NVR shared by every RPM of an import
fn source_nvr(headers: &[&RpmHeader]) -> Result<Nvr> {
    let mut source: Option<String> = None;
    for header in headers {
        let file = header.source_file_name();
        match &source {
            None => source = Some(file),
            Some(existing) if *existing != file => {
                return Err(Error::InvalidArgument("only include RPMs from one package".to_string()));
            }
            Some(_) => {}
        }
    }
    let source = source.ok_or_else(|| Error::InvalidArgument("no RPMs to import".to_string()))?;
    Nvr::parse(rpmutils::strip_rpm_suffix(&source))
        .ok_or_else(|| Error::InvalidArgument(format!("invalid SNVR: {source}")))
}

/// Record the build for an import; `existing` reuses the batch's build
fn register_import(
    conn: &rusqlite::Connection,
    project_id: &str,
    task_id: &str,
    nvr: &Nvr,
    force_override: bool,
    existing: Option<&str>,
) -> Result<String> {
    let src_nvra = format!("{}-{}-{}.src", nvr.name, nvr.version, nvr.release);
    let locked = NvraLock::exists(conn, &src_nvra)?;
    if locked && !force_override {
        return Err(Error::NvrAlreadyLocked(src_nvra));
    }

    let package = Package::find_in_project(conn, project_id, &nvr.name)?
        .ok_or_else(|| Error::CouldNotFindPackage(format!("{} in project {}", nvr.name, project_id)))?;
    let metadata = PackageOperationMetadata {
        package_name: package.name.clone(),
        modular: false,
    };
    Task::set_metadata(conn, task_id, &serde_json::to_value(&metadata)?)?;

    let build_id = match existing {
        Some(id) => id.to_string(),
        None => {
            let version_id = PackageVersion::ensure(conn, &package.id, &nvr.version, &nvr.release)?;
            ProjectPackageVersion::attach(conn, project_id, &package.id, &version_id, false)?;
            Build::create(conn, &package.id, &version_id, task_id, project_id)?
        }
    };
    if !locked {
        NvraLock::lock(conn, &src_nvra)?;
    }
    Ok(build_id)
}

impl Controller {
    pub async fn submit_rpm_import(&self, req: RpmImportRequest, submitter: Option<String>) -> Result<RpmImportTask> {
        let batch = RpmLookasideBatchImportRequest {
            project_id: req.project_id,
            lookaside_blobs: vec![req.rpms],
            force_override: req.force_override,
        };
        self.submit_rpm_batch_import(batch, submitter).await
    }

    pub async fn submit_rpm_batch_import(
        &self,
        req: RpmLookasideBatchImportRequest,
        submitter: Option<String>,
    ) -> Result<RpmImportTask> {
        let project_ref = req.project_id.clone();
        let (project_id, task_id) = self
            .tx(move |tx| {
                let project = Project::resolve(tx, &project_ref)?;
                let task = Task::new("noarch", TaskType::RpmImport, Some(&project.id), None).with_submitter(submitter);
                task.insert(tx)?;
                Ok((project.id, task.id))
            })
            .await?;
        let req = RpmLookasideBatchImportRequest { project_id, ..req };
        let ctx = self.workflow(&task_id);
        self.rpm_import(&ctx, req, &task_id).await
    }

    /// Import every blob into one build, then compose it.
    ///
    /// A single-blob batch is a plain RPM import.
    pub async fn rpm_import(
        &self,
        ctx: &WorkflowContext,
        req: RpmLookasideBatchImportRequest,
        task_id: &str,
    ) -> Result<RpmImportTask> {
        let finalizer = TaskFinalizer::start(self.db_path.clone(), task_id, DOMAIN_BUILDS).await?;
        let outcome = self.run_rpm_import(ctx, &req, task_id).await;
        finalizer.close(outcome).await
    }

    async fn run_rpm_import(
        &self,
        ctx: &WorkflowContext,
        req: &RpmLookasideBatchImportRequest,
        task_id: &str,
    ) -> Result<RpmImportTask> {
        let purpose = if req.lookaside_blobs.len() > 1 { "batchrpmimport" } else { "rpmimport" };
        let spec = SandboxSpec {
            task_id: task_id.to_string(),
            parent_task_id: task_id.to_string(),
            project_id: req.project_id.clone(),
            purpose: purpose.to_string(),
            arch: "noarch".to_string(),
            high_resource: false,
            privileged: false,
        };

        let build_id = self
            .with_worker(ctx, spec, |runner, sandbox| async move {
                let rpm_dir = sandbox.work_dir.join("rpm-import").join("RPMS");
                let rpm_dir = &rpm_dir;
                let mut build_id: Option<String> = None;
                for (i, blob) in req.lookaside_blobs.iter().enumerate() {
                    let existing = build_id.clone();
                    let imported: String = ctx
                        .execute_activity(
                            &format!("rpm-import-{i}"),
                            &ActivityOptions::once(Duration::from_secs(60 * 60)),
                            |actx| {
                                let existing = existing.clone();
                                async move {
                                    let _alive = actx.keep_alive(HEARTBEAT_INTERVAL);
                                    self.import_blob(req, task_id, blob, rpm_dir, existing).await
                                }
                            },
                        )
                        .await?;
                    build_id.get_or_insert(imported);
                }
                let build_id =
                    build_id.ok_or_else(|| Error::InvalidArgument("no lookaside blobs to import".to_string()))?;

                let uploads: Vec<UploadResult> = ctx
                    .execute_activity("upload-arch", &ActivityOptions::upload(), |actx| {
                        let runner = runner.clone();
                        async move {
                            let _alive = actx.keep_alive(HEARTBEAT_INTERVAL);
                            let uploader = self.uploader(&req.project_id, task_id);
                            let mut results = Vec::new();
                            for rpm in list_rpms(rpm_dir)? {
                                results.push(
                                    uploader
                                        .upload_artifact(runner.as_ref(), &rpm, TaskType::BuildArchUpload)
                                        .await?,
                                );
                            }
                            Ok(results)
                        }
                    })
                    .await?;

                let (id, task_ids) = (build_id.clone(), uploads.into_iter().map(|u| u.subtask).collect::<Vec<_>>());
                self.db(move |conn| {
                    for subtask in &task_ids {
                        Build::attach_task(conn, &id, subtask)?;
                    }
                    Ok(())
                })
                .await?;
                Ok(build_id)
            })
            .await?;

        let mut update = UpdateRepoRequest::new(&req.project_id, vec![build_id.clone()]);
        update.task_id = Some(task_id.to_string());
        update.no_delete_previous = true;
        let repo_changes = self.update_repo(&ctx.child("yumrepofs"), update).await?;
        Ok(RpmImportTask {
            build_id,
            repo_changes: Some(repo_changes),
        })
    }

    /// Read one blob, register it and stage its RPMs under `rpm_dir`
    async fn import_blob(
        &self,
        req: &RpmLookasideBatchImportRequest,
        task_id: &str,
        blob: &str,
        rpm_dir: &Path,
        existing: Option<String>,
    ) -> Result<String> {
        let (store, key) = (self.store.clone(), blob.to_string());
        let rpms = tokio::task::spawn_blocking(move || {
            let content = store.get(&key)?;
            read_rpms(&key, content)
        })
        .await??;
        let nvr = source_nvr(&rpms.iter().map(|(_, _, h)| h).collect::<Vec<_>>())?;
        info!("Importing {} RPM(s) of {}-{}-{}", rpms.len(), nvr.name, nvr.version, nvr.release);

        let (project_id, task, force) = (req.project_id.clone(), task_id.to_string(), req.force_override);
        let build_id = self
            .tx(move |tx| register_import(tx, &project_id, &task, &nvr, force, existing.as_deref()))
            .await?;

        std::fs::create_dir_all(rpm_dir)?;
        for (name, content, _) in &rpms {
            let target: PathBuf = rpm_dir.join(name);
            std::fs::write(&target, content)?;
        }
        Ok(build_id)
    }
}
