// src/workflow/build.rs

//! Package builds
//!
//! A build checks out the dist-git revision of an import and turns it into
//! a source RPM on a sandbox of its own. The SRPM header decides the arches;
//! each arch is rebuilt in parallel on a high resource sandbox and every
//! resulting RPM is uploaded and attached to the build row before the
//! composer publishes the build. Once published, the NVR is locked and
//! later builds of the same NVR are canceled.
//!
//! Side NVRs are earlier builds made visible to the build root through a
//! throwaway repository that wins over the regular ones.

use super::import::{create_import, scratch_dir};
use super::{
    BuildOptions, BuildRequest, Controller, ImportRequest, PackageOperationMetadata, SubmitBuildTask,
    UpdateRepoRequest, not_found_package,
};
use crate::db::{
    self,
    models::{
        Batch, BatchKind, Build, ExternalRepository, ExtraOptions, ImportRevision, NvraLock, Package,
        PackageVersion, Project, Repository, Task, TaskArtifact, TaskType,
    },
};
use crate::error::{Error, Result};
use crate::orchestrator::{ActivityOptions, DOMAIN_BUILDS, DOMAIN_TASKS, TaskFinalizer, WorkflowContext};
use crate::rpmutils::{self, Nvr};
use crate::tools::mock::{
    DEFAULT_BUILD_PKG_GROUP, DEFAULT_SRPM_BUILD_PKG_GROUP, ExtraYumrepofsRepo, MockConfig, render_external_repo,
    render_yumrepofs_repo, resolve_repo_url, yumrepofs_repo_url, yumrepofs_repos,
};
use crate::tools::upload::{RpmArtifactMetadata, UploadResult, Uploader};
use crate::tools::{MockInvocation, MockMode, gitlabify};
use crate::worker::{CommandRunner, Sandbox, SandboxSpec};
use futures::future::join_all;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Outcome of one package of a batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub package_name: String,
    /// Unset when the task could not even be created
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildBatchTask {
    pub batch_id: String,
    pub items: Vec<BatchItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportBatchTask {
    pub batch_id: String,
    pub items: Vec<BatchItem>,
}

/// Everything a build resolves up front
struct BuildInputs {
    project: Project,
    package: Package,
    /// Task builds hang their subtasks and uploads under
    parent: String,
    revision: ImportRevision,
    version: PackageVersion,
    extra: ExtraOptions,
}

/// Arches to build a source RPM for.
///
/// `BuildArch` replaces the project arches, `ExclusiveArch` narrows and
/// `ExcludeArch` removes them. `noarch` is added when the package asks for
/// it and does not exclude it. Arches the project does not carry are
/// dropped.
pub fn select_arches(project_archs: &[String], metadata: &RpmArtifactMetadata) -> Result<Vec<String>> {
    let mut arches = if metadata.build_arch.is_empty() {
        project_archs.to_vec()
    } else {
        metadata.build_arch.clone()
    };
    if !metadata.exclusive_arch.is_empty() {
        arches.retain(|a| metadata.exclusive_arch.contains(a));
    }
    arches.retain(|a| !metadata.exclude_arch.contains(a));

    let noarch = "noarch".to_string();
    if !metadata.exclude_arch.contains(&noarch)
        && (metadata.build_arch.contains(&noarch) || metadata.exclusive_arch.contains(&noarch))
    {
        arches.push(noarch);
    }

    let mut selected: Vec<String> = Vec::new();
    for arch in arches {
        if (arch == "noarch" || project_archs.contains(&arch)) && !selected.contains(&arch) {
            selected.push(arch);
        }
    }
    if selected.is_empty() {
        return Err(Error::ActivityFailed("no arches found for project".to_string()));
    }
    Ok(selected)
}

/// First `*.spec` under `<dir>/SPECS`
pub(super) fn find_spec(dir: &Path) -> Result<PathBuf> {
    let specs = dir.join("SPECS");
    WalkDir::new(&specs)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .find(|p| p.is_file() && p.extension().is_some_and(|e| e == "spec"))
        .ok_or_else(|| Error::NotFound(format!("could not find a valid spec file in {}", specs.display())))
}

/// Every RPM under `dir`, sorted by name
pub(super) fn list_rpms(dir: &Path) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut rpms = Vec::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
        if entry.file_type().is_file() && entry.path().extension().is_some_and(|e| e == "rpm") {
            rpms.push(entry.into_path());
        }
    }
    Ok(rpms)
}

fn stage_packages(configured: &[String], default: &[&str], depends_on: &[String]) -> Vec<String> {
    let mut pkgs: Vec<String> = if configured.is_empty() {
        default.iter().map(|p| p.to_string()).collect()
    } else {
        configured.to_vec()
    };
    pkgs.extend(depends_on.iter().cloned());
    pkgs
}

/// Import revision a build starts from.
///
/// An explicit hash wins; otherwise the newest active revision on the
/// project's target branch.
fn pick_revision(
    conn: &Connection,
    project: &Project,
    package_name: &str,
    scm_hash: Option<&str>,
) -> Result<ImportRevision> {
    match scm_hash {
        Some(hash) => ImportRevision::find_by_scm_hash(conn, hash)?
            .ok_or_else(|| Error::ActivityFailed(format!("import revision not found for scm hash {hash}"))),
        None => {
            let branch = project.target_branch();
            ImportRevision::latest_for_package_in_project(conn, package_name, &project.id)?
                .into_iter()
                .find(|r| r.scm_branch_name == branch)
                .ok_or_else(|| Error::ActivityFailed("could not find upstream branch".to_string()))
        }
    }
}

/// Create a build task, and for plain packages its build row.
///
/// Returns the task id and the build id.
pub(super) fn create_build(
    conn: &Connection,
    project: &Project,
    req: &BuildRequest,
    module: bool,
    submitter: Option<String>,
) -> Result<(String, Option<String>)> {
    let package = Package::find_in_project(conn, &project.id, &req.package_name)?
        .ok_or_else(|| not_found_package(&project.id, &req.package_name))?;
    let revision = if module {
        None
    } else {
        Some(pick_revision(conn, project, &package.name, req.scm_hash.as_deref())?)
    };

    let task = Task::new("noarch", TaskType::Build, Some(&project.id), None).with_submitter(submitter);
    task.insert(conn)?;
    let metadata = PackageOperationMetadata {
        package_name: package.name.clone(),
        modular: module,
    };
    Task::set_metadata(conn, &task.id, &serde_json::to_value(&metadata)?)?;

    let build_id = match revision {
        Some(revision) => Some(Build::create(
            conn,
            &package.id,
            &revision.package_version_id,
            &task.id,
            &project.id,
        )?),
        None => None,
    };
    Ok((task.id, build_id))
}

/// Prefer a real failure over a cancellation
pub(super) fn pick_error(errors: Vec<Error>) -> Option<Error> {
    let (canceled, failed): (Vec<Error>, Vec<Error>) = errors.into_iter().partition(Error::is_canceled);
    failed.into_iter().next().or_else(|| canceled.into_iter().next())
}

impl Controller {
    pub(super) fn uploader(&self, project_id: &str, parent_task_id: &str) -> Uploader {
        Uploader {
            db_path: self.db_path.clone(),
            store: self.store.clone(),
            repo: self.tools.repo.clone(),
            project_id: project_id.to_string(),
            parent_task_id: parent_task_id.to_string(),
        }
    }

    /// Rendered repo blocks for a build root: yumrepofs first, then external
    pub(super) async fn mock_repos(&self, project: &Project, arch: &str, options: &BuildOptions) -> Result<Vec<String>> {
        let client = reqwest::Client::new();
        let base = self.yumrepofs_base();
        let mut blocks = Vec::new();
        for (i, repo) in yumrepofs_repos(&options.extra_yumrepofs_repos).iter().enumerate() {
            let template = yumrepofs_repo_url(&base, &project.id, &repo.name);
            let url = resolve_repo_url(&client, &template, arch).await;
            blocks.push(render_yumrepofs_repo(i, &url, repo, &options.exclude_packages));
        }

        let project_id = project.id.clone();
        let external = self
            .db(move |conn| ExternalRepository::list_for_project(conn, &project_id))
            .await?;
        for (i, repo) in external.iter().enumerate() {
            let url = resolve_repo_url(&client, &repo.url, arch).await;
            blocks.push(render_external_repo(i, &url, repo, &options.exclude_packages));
        }
        Ok(blocks)
    }

    /// mock config for the SRPM stage; networking is always on
    pub(super) async fn srpm_mock_config(
        &self,
        project: &Project,
        extra: &ExtraOptions,
        options: &BuildOptions,
        release: Option<&str>,
    ) -> Result<String> {
        let repos = self.mock_repos(project, "noarch", options).await?;
        let host_arch = self.env.build_arch();
        Ok(MockConfig {
            project,
            release,
            arch: "noarch",
            host_arch: &host_arch,
            pkg_group: stage_packages(&project.srpm_stage_packages, DEFAULT_SRPM_BUILD_PKG_GROUP, &extra.depends_on),
            force_dist: options.force_dist.as_deref(),
            modules: &extra.enable_module,
            disabled_modules: &extra.disable_module,
            enable_networking: true,
            extra_files: BTreeMap::new(),
            repos,
        }
        .render())
    }

    /// mock config for one arch of the binary stage
    async fn arch_mock_config(
        &self,
        project: &Project,
        extra: &ExtraOptions,
        options: &BuildOptions,
        arch: &str,
        release: &str,
    ) -> Result<String> {
        let repos = self.mock_repos(project, arch, options).await?;
        let host_arch = self.env.build_arch();
        let mut modules = options.modules.clone();
        modules.extend(extra.enable_module.iter().cloned());
        let mut disabled = options.disabled_modules.clone();
        disabled.extend(extra.disable_module.iter().cloned());
        Ok(MockConfig {
            project,
            release: Some(release),
            arch,
            host_arch: &host_arch,
            pkg_group: stage_packages(&project.build_stage_packages, DEFAULT_BUILD_PKG_GROUP, &extra.depends_on),
            force_dist: options.force_dist.as_deref(),
            modules: &modules,
            disabled_modules: &disabled,
            enable_networking: options.enable_networking,
            extra_files: options.build_arch_extra_files.clone(),
            repos,
        }
        .render())
    }

    /// Create a build task for a package and run it to completion
    pub async fn submit_build(
        &self,
        req: BuildRequest,
        options: BuildOptions,
        submitter: Option<String>,
    ) -> Result<SubmitBuildTask> {
        let request = req.clone();
        let (project_id, task_id, build_id) = self
            .tx(move |tx| {
                let project = Project::resolve(tx, &request.project_id)?;
                let (task_id, build_id) = create_build(tx, &project, &request, false, submitter)?;
                Ok((project.id, task_id, build_id))
            })
            .await?;
        let req = BuildRequest { project_id, ..req };
        let options = BuildOptions {
            reusable_build_id: build_id,
            ..options
        };
        let ctx = self.workflow(&task_id);
        self.build_package(&ctx, req, &task_id, options).await
    }

    /// Build workflow for an existing build task
    pub async fn build_package(
        &self,
        ctx: &WorkflowContext,
        req: BuildRequest,
        task_id: &str,
        options: BuildOptions,
    ) -> Result<SubmitBuildTask> {
        let finalizer = TaskFinalizer::start(self.db_path.clone(), task_id, DOMAIN_BUILDS).await?;
        let outcome = self.run_build(ctx, &finalizer, &req, task_id, options).await;
        finalizer.close(outcome).await
    }

    async fn run_build(
        &self,
        ctx: &WorkflowContext,
        finalizer: &TaskFinalizer,
        req: &BuildRequest,
        task_id: &str,
        mut options: BuildOptions,
    ) -> Result<SubmitBuildTask> {
        let (request, id) = (req.clone(), task_id.to_string());
        let inputs = self
            .db(move |conn| {
                let project = Project::resolve(conn, &request.project_id)?;
                let package = Package::find_in_project(conn, &project.id, &request.package_name)?
                    .ok_or_else(|| not_found_package(&project.id, &request.package_name))?;
                let task = Task::find_by_id(conn, &id)?.ok_or_else(|| Error::NotFound(format!("task {id}")))?;
                let revision = pick_revision(conn, &project, &package.name, request.scm_hash.as_deref())?;
                let version = PackageVersion::find_by_id(conn, &revision.package_version_id)?.ok_or_else(|| {
                    Error::InternalError(format!(
                        "could not get package version for import revision {}",
                        revision.id
                    ))
                })?;
                let extra = ExtraOptions::find(conn, &project.id, &package.name)?.unwrap_or_default();
                Ok(BuildInputs {
                    parent: task.parent_task_id.unwrap_or(task.id),
                    project,
                    package,
                    revision,
                    version,
                    extra,
                })
            })
            .await?;
        let project = &inputs.project;

        let build_id = match options.reusable_build_id.clone() {
            Some(id) => id,
            None => {
                let db_path = self.db_path.clone();
                let (package_id, pv, task, project_id) = (
                    inputs.package.id.clone(),
                    inputs.version.id.clone(),
                    task_id.to_string(),
                    project.id.clone(),
                );
                ctx.side_effect(move || {
                    let conn = db::open(&db_path)?;
                    Build::create(&conn, &package_id, &pv, &task, &project_id)
                })
                .await?
            }
        };

        if !req.side_nvrs.is_empty() {
            self.prepare_side_repo(ctx, project, &req.side_nvrs, &inputs.parent, &mut options)
                .await?;
        }

        let srpm_task = self
            .create_subtask(ctx, "noarch", TaskType::BuildSrpm, &project.id, &inputs.parent)
            .await?;
        let spec = SandboxSpec {
            task_id: srpm_task.clone(),
            parent_task_id: inputs.parent.clone(),
            project_id: project.id.clone(),
            purpose: "srpm".to_string(),
            arch: "noarch".to_string(),
            high_resource: false,
            privileged: true,
        };
        let (inputs_ref, options_ref, srpm_task_ref) = (&inputs, &options, &srpm_task);
        let srpm = self
            .with_worker(ctx, spec, |runner, sandbox| async move {
                let path = self
                    .build_srpm(ctx, &runner, &sandbox, inputs_ref, options_ref, srpm_task_ref)
                    .await?;
                ctx.execute_activity("upload-srpm", &ActivityOptions::upload(), |actx| {
                    let (runner, path) = (runner.clone(), path.clone());
                    async move {
                        let _alive = actx.keep_alive(HEARTBEAT_INTERVAL);
                        self.uploader(&inputs_ref.project.id, &inputs_ref.parent)
                            .upload_artifact(runner.as_ref(), &path, TaskType::BuildSrpmUpload)
                            .await
                    }
                })
                .await
            })
            .await?;

        let nvr = rpmutils::strip_rpm_suffix(rpmutils::basename(&srpm.object_name)).to_string();
        let locked: bool = ctx
            .side_effect({
                let (db_path, nvr) = (self.db_path.clone(), nvr.clone());
                move || NvraLock::exists(&db::open(&db_path)?, &nvr)
            })
            .await?;
        if locked {
            let err = Error::NvrAlreadyLocked(nvr);
            finalizer.log(vec![err.to_string()]).await?;
            return Err(err);
        }

        let (upload_task, archs) = (srpm.subtask.clone(), project.archs.clone());
        let arches = self
            .db(move |conn| {
                let task = Task::find_by_id(conn, &upload_task)?
                    .ok_or_else(|| Error::NotFound(format!("task {upload_task}")))?;
                let metadata = task
                    .metadata
                    .as_ref()
                    .ok_or_else(|| Error::InternalError(format!("source RPM upload {upload_task} has no metadata")))?;
                select_arches(&archs, &RpmArtifactMetadata::from_value(metadata)?)
            })
            .await?;
        info!("Building {} for {}", nvr, arches.join(", "));

        let (srpm_ref, build_id_ref) = (&srpm, &build_id);
        let builds = arches.iter().map(|arch| {
            let scope = ctx.child(&format!("arch-{arch}"));
            async move {
                self.build_arch(&scope, inputs_ref, options_ref, srpm_ref, build_id_ref, arch, req.disable_checks)
                    .await
                    .map_err(|e| Error::ActivityFailed(format!("failed to build arch {arch}: {e}")))
            }
        });
        let (mut artifacts, mut errors) = (Vec::new(), Vec::new());
        for outcome in join_all(builds).await {
            match outcome {
                Ok(uploads) => artifacts.extend(uploads.into_iter().map(|u| u.object_name)),
                Err(e) => errors.push(e),
            }
        }
        if let Some(err) = pick_error(errors) {
            return Err(err);
        }
        artifacts.sort();
        artifacts.dedup();

        let mut response = SubmitBuildTask {
            build_id: build_id.clone(),
            build_task_id: task_id.to_string(),
            package_version_id: inputs.version.id.clone(),
            package_name: inputs.package.name.clone(),
            artifacts,
            repo_changes: None,
        };
        finalizer.save_progress(&response).await?;

        if !options.disable_yumrepofs_updates && !req.set_inactive {
            let mut update = UpdateRepoRequest::new(&project.id, vec![build_id.clone()]);
            update.task_id = Some(inputs.parent.clone());
            response.repo_changes = Some(self.update_repo(&ctx.child("yumrepofs"), update).await?);
        }

        let db_path = self.db_path.clone();
        ctx.side_effect(move || {
            let conn = db::open(&db_path)?;
            NvraLock::lock(&conn, &nvr).or_else(|e| {
                warn!("Locking {} failed, retrying: {}", nvr, e);
                NvraLock::lock(&conn, &nvr)
            })
        })
        .await?;
        Ok(response)
    }

    /// Publish side NVR builds to a fresh internal repository and point the
    /// build root at it
    async fn prepare_side_repo(
        &self,
        ctx: &WorkflowContext,
        project: &Project,
        side_nvrs: &[String],
        parent: &str,
        options: &mut BuildOptions,
    ) -> Result<()> {
        let mut wanted = Vec::with_capacity(side_nvrs.len());
        for side_nvr in side_nvrs {
            let nvr = Nvr::parse_no_arch(side_nvr)
                .ok_or_else(|| Error::ActivityFailed(format!("invalid side NVR: {side_nvr}")))?;
            wanted.push((side_nvr.clone(), nvr));
        }

        let (db_path, project_id) = (self.db_path.clone(), project.id.clone());
        let (build_ids, excludes, repo_id, repo_name): (Vec<String>, Vec<String>, String, String) = ctx
            .side_effect(move || {
                let mut conn = db::open(&db_path)?;
                db::transaction(&mut conn, |tx| {
                    let (mut build_ids, mut excludes) = (Vec::new(), Vec::new());
                    for (raw, nvr) in &wanted {
                        let builds = Build::find_by_nvr(tx, &nvr.name, &nvr.version, &nvr.release, &project_id)?;
                        if builds.is_empty() {
                            return Err(Error::ActivityFailed(format!(
                                "side NVR {raw} not found in project {project_id}"
                            )));
                        }
                        for build in builds {
                            for artifact in TaskArtifact::list_for_build(tx, &build.id)? {
                                let file = rpmutils::strip_rpm_suffix(rpmutils::basename(&artifact.name));
                                if let Some(parsed) = Nvr::parse(file) {
                                    if !excludes.contains(&parsed.name) {
                                        excludes.push(parsed.name);
                                    }
                                }
                            }
                            build_ids.push(build.id);
                        }
                    }
                    let repo = Repository::create_with_packages(
                        tx,
                        &project_id,
                        &Uuid::new_v4().to_string(),
                        true,
                        Vec::new(),
                    )?;
                    Ok((build_ids, excludes, repo.id, repo.name))
                })
            })
            .await?;

        let mut update = UpdateRepoRequest::new(&project.id, build_ids);
        update.task_id = Some(parent.to_string());
        update.force_repo_id = Some(repo_id);
        update.force_non_modular = true;
        update.disable_signing = true;
        update.disable_set_active = true;
        self.update_repo(&ctx.child("side-nvrs"), update).await?;

        info!("Side repository {} excludes {}", repo_name, excludes.join(" "));
        options.extra_yumrepofs_repos.push(ExtraYumrepofsRepo {
            name: repo_name,
            module_hotfixes: true,
            ignore_exclude: true,
        });
        options.exclude_packages.extend(excludes);
        Ok(())
    }

    async fn build_srpm(
        &self,
        ctx: &WorkflowContext,
        runner: &Arc<dyn CommandRunner>,
        sandbox: &Sandbox,
        inputs: &BuildInputs,
        options: &BuildOptions,
        subtask: &str,
    ) -> Result<PathBuf> {
        let finalizer = TaskFinalizer::start(self.db_path.clone(), subtask, DOMAIN_TASKS).await?;
        let outcome = ctx
            .execute_activity("build-srpm", &ActivityOptions::srpm_build(), |actx| {
                let runner = runner.clone();
                async move {
                    let _alive = actx.keep_alive(HEARTBEAT_INTERVAL);
                    let work = scratch_dir(sandbox, &actx)?;
                    self.srpm_activity(runner.as_ref(), &work, inputs, options).await
                }
            })
            .await;
        finalizer.close(outcome).await
    }

    async fn srpm_activity(
        &self,
        runner: &dyn CommandRunner,
        work: &Path,
        inputs: &BuildInputs,
        options: &BuildOptions,
    ) -> Result<PathBuf> {
        let (project, package) = (&inputs.project, &inputs.package);
        let scm = &self.tools.scm;
        let url = format!("{}/rpms/{}.git", project.upstream_prefix(), gitlabify(&package.name));
        let clone_dir = work.join("rpmbuild");
        scm.clone_repo(runner, &url, &clone_dir, None).await?;
        scm.fetch_heads(runner, &clone_dir).await?;
        scm.checkout(runner, &clone_dir, &inputs.revision.scm_hash).await?;

        let srpms = clone_dir.join("SRPMS");
        std::fs::create_dir_all(&srpms)?;
        self.tools
            .srpmproc
            .fetch(runner, &clone_dir, project.cdn_url.as_deref())
            .await?;
        let spec = find_spec(&clone_dir)?;
        let sources = clone_dir.join("SOURCES");
        std::fs::create_dir_all(&sources)?;

        let config = work.join("mock.cfg");
        let rendered = self
            .srpm_mock_config(project, &inputs.extra, options, Some(&inputs.version.release))
            .await?;
        std::fs::write(&config, rendered)?;

        self.tools
            .mock
            .build(
                runner,
                &MockInvocation {
                    mode: MockMode::Srpm,
                    config,
                    target: "noarch".to_string(),
                    result_dir: srpms.clone(),
                    sources: Some(sources),
                    input: spec,
                    with: inputs.extra.with_flags.clone(),
                    without: inputs.extra.without_flags.clone(),
                    nocheck: false,
                },
            )
            .await?;

        list_rpms(&srpms)?
            .into_iter()
            .find(|p| p.to_string_lossy().ends_with(".src.rpm"))
            .ok_or_else(|| Error::tool("mock", "no source RPM produced"))
    }

    /// Build and upload one arch, attaching the uploads to the build
    #[allow(clippy::too_many_arguments)]
    async fn build_arch(
        &self,
        ctx: &WorkflowContext,
        inputs: &BuildInputs,
        options: &BuildOptions,
        srpm: &UploadResult,
        build_id: &str,
        arch: &str,
        disable_checks: bool,
    ) -> Result<Vec<UploadResult>> {
        let project = &inputs.project;
        let subtask = self
            .create_subtask(ctx, arch, TaskType::BuildArch, &project.id, &inputs.parent)
            .await?;
        let spec = SandboxSpec {
            task_id: subtask.clone(),
            parent_task_id: inputs.parent.clone(),
            project_id: project.id.clone(),
            purpose: format!("b-{arch}"),
            arch: arch.to_string(),
            high_resource: true,
            privileged: true,
        };

        let subtask_ref = &subtask;
        let mut uploads = self
            .with_worker(ctx, spec, |runner, sandbox| async move {
                let finalizer = TaskFinalizer::start(self.db_path.clone(), subtask_ref, DOMAIN_TASKS).await?;
                let sandbox = &sandbox;
                let built = ctx
                    .execute_activity("build-arch", &ActivityOptions::arch_build(), |actx| {
                        let runner = runner.clone();
                        async move {
                            let _alive = actx.keep_alive(HEARTBEAT_INTERVAL);
                            let work = scratch_dir(sandbox, &actx)?;
                            self.arch_activity(runner.as_ref(), &work, inputs, options, srpm, arch, disable_checks)
                                .await
                        }
                    })
                    .await;
                let rpms = finalizer.close(built).await?;

                ctx.execute_activity("upload-arch", &ActivityOptions::upload(), |actx| {
                    let (runner, rpms) = (runner.clone(), rpms.clone());
                    async move {
                        let _alive = actx.keep_alive(HEARTBEAT_INTERVAL);
                        let uploader = self.uploader(&project.id, &inputs.parent);
                        let mut results = Vec::with_capacity(rpms.len());
                        for rpm in &rpms {
                            results.push(
                                uploader
                                    .upload_artifact(runner.as_ref(), rpm, TaskType::BuildArchUpload)
                                    .await?,
                            );
                        }
                        Ok(results)
                    }
                })
                .await
            })
            .await?;

        // The published SRPM stays untouched when rebuilding an arch
        let nvr = rpmutils::strip_rpm_suffix(rpmutils::basename(&srpm.object_name)).to_string();
        if !self.db(move |conn| NvraLock::exists(conn, &nvr)).await? {
            uploads.push(srpm.clone());
        }

        let (build_id, task_ids) = (
            build_id.to_string(),
            uploads.iter().map(|u| u.subtask.clone()).collect::<Vec<_>>(),
        );
        self.db(move |conn| {
            for task_id in &task_ids {
                Build::attach_task(conn, &build_id, task_id)?;
            }
            Ok(())
        })
        .await?;
        Ok(uploads)
    }

    #[allow(clippy::too_many_arguments)]
    async fn arch_activity(
        &self,
        runner: &dyn CommandRunner,
        work: &Path,
        inputs: &BuildInputs,
        options: &BuildOptions,
        srpm: &UploadResult,
        arch: &str,
        disable_checks: bool,
    ) -> Result<Vec<PathBuf>> {
        let (srpms, result_dir) = (work.join("SRPMS"), work.join("RPMS"));
        std::fs::create_dir_all(&srpms)?;
        std::fs::create_dir_all(&result_dir)?;

        let srpm_path = srpms.join(rpmutils::basename(&srpm.object_name));
        let (store, key, dest) = (self.store.clone(), srpm.object_name.clone(), srpm_path.clone());
        tokio::task::spawn_blocking(move || store.download(&key, &dest)).await??;

        let config = work.join("mock.cfg");
        let rendered = self
            .arch_mock_config(&inputs.project, &inputs.extra, options, arch, &inputs.version.release)
            .await?;
        std::fs::write(&config, rendered)?;

        self.tools
            .mock
            .build(
                runner,
                &MockInvocation {
                    mode: MockMode::Binary,
                    config,
                    target: arch.to_string(),
                    result_dir: result_dir.clone(),
                    sources: None,
                    input: srpm_path,
                    with: inputs.extra.with_flags.clone(),
                    without: inputs.extra.without_flags.clone(),
                    nocheck: disable_checks,
                },
            )
            .await?;

        Ok(list_rpms(&result_dir)?
            .into_iter()
            .filter(|p| !p.to_string_lossy().ends_with(".src.rpm"))
            .collect())
    }

    /// Build several packages at once.
    ///
    /// A failing package never fails the batch; its error is reported in
    /// the returned items.
    pub async fn build_batch(
        &self,
        project_id: &str,
        packages: Vec<String>,
        module_packages: Vec<String>,
        submitter: Option<String>,
    ) -> Result<BuildBatchTask> {
        let id = project_id.to_string();
        let (project, batch_id) = self
            .tx(move |tx| {
                let project = Project::resolve(tx, &id)?;
                let batch_id = Batch::create(tx, &project.id, BatchKind::Build)?;
                Ok((project, batch_id))
            })
            .await?;
        info!("Build batch {} with {} package(s)", batch_id, packages.len() + module_packages.len());

        let requested = packages
            .into_iter()
            .map(|p| (p, false))
            .chain(module_packages.into_iter().map(|p| (p, true)));
        let triggers = requested.map(|(name, module)| {
            let (project, batch_id, submitter) = (&project, &batch_id, submitter.clone());
            async move { self.trigger_batch_build(project, batch_id, name, module, submitter).await }
        });
        let items = join_all(triggers).await;
        Ok(BuildBatchTask { batch_id, items })
    }

    async fn trigger_batch_build(
        &self,
        project: &Project,
        batch_id: &str,
        package_name: String,
        module: bool,
        submitter: Option<String>,
    ) -> BatchItem {
        let req = BuildRequest {
            project_id: project.id.clone(),
            package_name: package_name.clone(),
            ..Default::default()
        };
        let (request, owned_project, batch) = (req.clone(), project.clone(), batch_id.to_string());
        let created = self
            .tx(move |tx| {
                let (task_id, build_id) = create_build(tx, &owned_project, &request, module, submitter)?;
                if let Some(build_id) = &build_id {
                    Batch::attach(tx, &batch, build_id)?;
                }
                Ok((task_id, build_id))
            })
            .await;
        let (task_id, build_id) = match created {
            Ok(created) => created,
            Err(e) => {
                warn!("Could not trigger build of {} in batch {}: {}", package_name, batch_id, e);
                return BatchItem {
                    package_name,
                    task_id: None,
                    error: Some(e.to_string()),
                };
            }
        };

        let options = BuildOptions {
            reusable_build_id: build_id,
            build_batch_id: Some(batch_id.to_string()),
            ..Default::default()
        };
        let ctx = self.workflow(&task_id);
        let outcome = if module {
            self.build_module(&ctx, req, &task_id, options).await.map(|_| ())
        } else {
            self.build_package(&ctx, req, &task_id, options).await.map(|_| ())
        };
        if let Err(e) = &outcome {
            warn!("Build of {} in batch {} failed: {}", package_name, batch_id, e);
        }
        BatchItem {
            package_name,
            task_id: Some(task_id),
            error: outcome.err().map(|e| e.to_string()),
        }
    }

    /// Import several packages at once; failures are reported per package
    pub async fn import_batch(
        &self,
        project_id: &str,
        packages: Vec<String>,
        submitter: Option<String>,
    ) -> Result<ImportBatchTask> {
        let id = project_id.to_string();
        let (project, batch_id) = self
            .tx(move |tx| {
                let project = Project::resolve(tx, &id)?;
                let batch_id = Batch::create(tx, &project.id, BatchKind::Import)?;
                Ok((project, batch_id))
            })
            .await?;

        let triggers = packages.into_iter().map(|name| {
            let (project, batch_id, submitter) = (project.clone(), batch_id.clone(), submitter.clone());
            async move {
                let (name_ref, batch) = (name.clone(), batch_id.clone());
                let created = self
                    .tx(move |tx| {
                        let (task_id, import) = create_import(tx, &project, &name_ref, submitter)?;
                        Batch::attach(tx, &batch, &import.id)?;
                        Ok((project.id, task_id, import.id))
                    })
                    .await;
                let (project_id, task_id, import_id) = match created {
                    Ok(created) => created,
                    Err(e) => {
                        warn!("Could not trigger import of {} in batch {}: {}", name, batch_id, e);
                        return BatchItem {
                            package_name: name,
                            task_id: None,
                            error: Some(e.to_string()),
                        };
                    }
                };
                let req = ImportRequest {
                    project_id,
                    package_name: name.clone(),
                    ..Default::default()
                };
                let ctx = self.workflow(&task_id);
                let outcome = self.import_package(&ctx, req, &task_id, &import_id).await;
                if let Err(e) = &outcome {
                    warn!("Import of {} in batch {} failed: {}", name, batch_id, e);
                }
                BatchItem {
                    package_name: name,
                    task_id: Some(task_id),
                    error: outcome.err().map(|e| e.to_string()),
                }
            }
        });
        let items = join_all(triggers).await;
        Ok(ImportBatchTask { batch_id, items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{PackageType, RepositoryRevision, TaskStatus};
    use crate::workflow::testing::TestEnv;

    const BASH_URL: &str = "https://git.rockylinux.test/staging/rpms/bash.git";

    fn metadata(build: &[&str], exclusive: &[&str], exclude: &[&str]) -> RpmArtifactMetadata {
        let owned = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        RpmArtifactMetadata {
            build_arch: owned(build),
            exclusive_arch: owned(exclusive),
            exclude_arch: owned(exclude),
            ..Default::default()
        }
    }

    fn project_archs() -> Vec<String> {
        vec!["x86_64".to_string(), "aarch64".to_string(), "s390x".to_string()]
    }

    #[test]
    fn test_select_arches_defaults_to_project() {
        let arches = select_arches(&project_archs(), &metadata(&[], &[], &[])).unwrap();
        assert_eq!(arches, project_archs());
    }

    #[test]
    fn test_select_arches_exclusive_and_exclude() {
        let arches = select_arches(&project_archs(), &metadata(&[], &["x86_64", "aarch64", "ppc64le"], &["aarch64"]))
            .unwrap();
        assert_eq!(arches, vec!["x86_64"]);
    }

    #[test]
    fn test_select_arches_noarch() {
        let arches = select_arches(&project_archs(), &metadata(&["noarch"], &[], &[])).unwrap();
        assert_eq!(arches, vec!["noarch"]);

        let err = select_arches(&project_archs(), &metadata(&["noarch"], &[], &["noarch"])).unwrap_err();
        assert!(err.to_string().contains("no arches found for project"));
    }

    #[test]
    fn test_find_spec_and_list_rpms() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_spec(dir.path()).is_err());
        assert!(list_rpms(&dir.path().join("RPMS")).unwrap().is_empty());

        std::fs::create_dir_all(dir.path().join("SPECS")).unwrap();
        std::fs::write(dir.path().join("SPECS/bash.spec"), "Name: bash\n").unwrap();
        assert!(find_spec(dir.path()).unwrap().ends_with("SPECS/bash.spec"));

        std::fs::create_dir_all(dir.path().join("RPMS")).unwrap();
        std::fs::write(dir.path().join("RPMS/b-1-1.x86_64.rpm"), "").unwrap();
        std::fs::write(dir.path().join("RPMS/a-1-1.x86_64.rpm"), "").unwrap();
        std::fs::write(dir.path().join("RPMS/build.log"), "").unwrap();
        let rpms = list_rpms(&dir.path().join("RPMS")).unwrap();
        assert_eq!(rpms.len(), 2);
        assert!(rpms[0].ends_with("a-1-1.x86_64.rpm"));
    }

    #[test]
    fn test_pick_error_prefers_failure() {
        let err = pick_error(vec![
            Error::Canceled("arch x86_64".to_string()),
            Error::ActivityFailed("failed to build arch aarch64: boom".to_string()),
        ])
        .unwrap();
        assert!(!err.is_canceled());
        assert!(pick_error(vec![Error::Canceled("x".to_string())]).unwrap().is_canceled());
        assert!(pick_error(Vec::new()).is_none());
    }

    /// bash imported on r9 with a dist-git fixture and a BaseOS repository
    fn build_env() -> (TestEnv, Package) {
        let env = TestEnv::new();
        let package = env.package("bash", PackageType::NormalFork);
        env.import_revision(&package, "5.1.8", "6.el9", "r9", "aaaa");

        let fixture = env.path("fixtures/bash");
        std::fs::create_dir_all(fixture.join("SPECS")).unwrap();
        std::fs::write(fixture.join("SPECS/bash.spec"), "Name: bash\nVersion: 5.1.8\n").unwrap();
        env.scm.add_remote(BASH_URL, &fixture);

        let conn = env.conn();
        let mut repo = Repository::new(&env.project.id, "BaseOS");
        repo.packages = vec!["bash".to_string()];
        repo.insert(&conn).unwrap();
        (env, package)
    }

    fn request(env: &TestEnv) -> BuildRequest {
        BuildRequest {
            project_id: env.project.id.clone(),
            package_name: "bash".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_build_publishes_and_locks_nvr() {
        let (env, _) = build_env();
        env.mock.subpackages.lock().unwrap().push("bash-doc".to_string());

        let response = env
            .controller
            .submit_build(request(&env), BuildOptions::default(), Some("alice".to_string()))
            .await
            .unwrap();

        let conn = env.conn();
        let task = Task::find_by_id(&conn, &response.build_task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert_eq!(task.submitter.as_deref(), Some("alice"));

        let artifacts = TaskArtifact::list_for_build(&conn, &response.build_id).unwrap();
        let mut names: Vec<&str> = artifacts.iter().map(|a| rpmutils::basename(&a.name)).collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "bash-5.1.8-6.el9.src.rpm",
                "bash-5.1.8-6.el9.x86_64.rpm",
                "bash-doc-5.1.8-6.el9.x86_64.rpm"
            ]
        );
        assert!(artifacts.iter().all(|a| a.name.starts_with(&format!("{}/", task.id))));

        let changes = response.repo_changes.unwrap().changes;
        assert!(changes.iter().any(|c| c.name == "BaseOS-x86_64"));
        assert!(
            RepositoryRevision::latest_by_project_name_arch(&conn, &env.project.id, "BaseOS", "x86_64")
                .unwrap()
                .is_some()
        );
        assert!(NvraLock::exists(&conn, "bash-5.1.8-6.el9.src").unwrap());

        let srpm_builds: Vec<_> = env
            .mock
            .invocations()
            .into_iter()
            .filter(|i| i.mode == MockMode::Srpm)
            .collect();
        assert_eq!(srpm_builds.len(), 1);
        assert_eq!(env.scm.checkouts.lock().unwrap().as_slice(), ["aaaa"]);
    }

    #[tokio::test]
    async fn test_locked_nvr_is_canceled() {
        let (env, _) = build_env();
        NvraLock::lock(&env.conn(), "bash-5.1.8-6.el9.src").unwrap();

        let err = env
            .controller
            .submit_build(request(&env), BuildOptions::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NvrAlreadyLocked(_)));

        let conn = env.conn();
        let top = Task::list_top_level(&conn, Some(&env.project.id), 10, 0)
            .unwrap()
            .into_iter()
            .find(|t| t.task_type == TaskType::Build)
            .unwrap();
        assert_eq!(top.status, TaskStatus::Canceled);
        assert!(
            !env.mock.invocations().iter().any(|i| i.mode == MockMode::Binary),
            "no arch build after a locked NVR"
        );
    }

    #[tokio::test]
    async fn test_failed_arch_fails_build() {
        let env = TestEnv::with_archs(&["x86_64", "aarch64"]);
        let package = env.package("bash", PackageType::NormalFork);
        env.import_revision(&package, "5.1.8", "6.el9", "r9", "aaaa");
        let fixture = env.path("fixtures/bash");
        std::fs::create_dir_all(fixture.join("SPECS")).unwrap();
        std::fs::write(fixture.join("SPECS/bash.spec"), "Name: bash\n").unwrap();
        env.scm.add_remote(BASH_URL, &fixture);
        env.mock.fail_arches.lock().unwrap().push("aarch64".to_string());

        let err = env
            .controller
            .submit_build(request(&env), BuildOptions::default(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to build arch aarch64"));

        let conn = env.conn();
        assert!(!NvraLock::exists(&conn, "bash-5.1.8-6.el9.src").unwrap());
        let top = Task::list_top_level(&conn, Some(&env.project.id), 10, 0)
            .unwrap()
            .into_iter()
            .find(|t| t.task_type == TaskType::Build)
            .unwrap();
        assert_eq!(top.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_missing_branch_is_reported() {
        let env = TestEnv::new();
        let package = env.package("bash", PackageType::NormalFork);
        env.import_revision(&package, "5.1.8", "6.el9", "c9s", "aaaa");

        let err = env
            .controller
            .submit_build(request(&env), BuildOptions::default(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("could not find upstream branch"));
    }

    #[tokio::test]
    async fn test_invalid_side_nvr() {
        let (env, _) = build_env();
        let req = BuildRequest {
            side_nvrs: vec!["bash".to_string()],
            ..request(&env)
        };
        let err = env
            .controller
            .submit_build(req, BuildOptions::default(), None)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "activity failed: invalid side NVR: bash");
    }

    #[tokio::test]
    async fn test_side_nvr_repo_is_published() {
        let (env, _) = build_env();
        let first = env
            .controller
            .submit_build(request(&env), BuildOptions::default(), None)
            .await
            .unwrap();

        let zsh = env.package("zsh", PackageType::NormalFork);
        env.import_revision(&zsh, "5.8", "9.el9", "r9", "bbbb");
        let fixture = env.path("fixtures/zsh");
        std::fs::create_dir_all(fixture.join("SPECS")).unwrap();
        std::fs::write(fixture.join("SPECS/zsh.spec"), "Name: zsh\n").unwrap();
        env.scm.add_remote("https://git.rockylinux.test/staging/rpms/zsh.git", &fixture);
        env.mock.set_srpm("zsh", "5.8", "9.el9");

        let req = BuildRequest {
            project_id: env.project.id.clone(),
            package_name: "zsh".to_string(),
            side_nvrs: vec!["bash-5.1.8-6.el9".to_string()],
            ..Default::default()
        };
        let second = env
            .controller
            .submit_build(req, BuildOptions::default(), None)
            .await
            .unwrap();
        assert_ne!(first.build_id, second.build_id);

        let conn = env.conn();
        let side = Repository::list_all(&conn, &env.project.id)
            .unwrap()
            .into_iter()
            .find(|r| Uuid::parse_str(&r.name).is_ok())
            .unwrap();
        assert!(side.internal_only);
        let revision = RepositoryRevision::latest(&conn, &side.id, "x86_64").unwrap().unwrap();
        assert!(!revision.primary_xml.is_empty());

        // The side repository was composed under the zsh build task
        let tree = Task::tree(&conn, &second.build_task_id, None).unwrap();
        assert!(tree.iter().any(|t| t.task_type == TaskType::YumrepofsUpdate));
    }

    #[tokio::test]
    async fn test_build_batch_reports_failures() {
        let (env, _) = build_env();
        let batch = env
            .controller
            .build_batch(&env.project.id, vec!["bash".to_string(), "missing".to_string()], Vec::new(), None)
            .await
            .unwrap();

        assert_eq!(batch.items.len(), 2);
        let bash = batch.items.iter().find(|i| i.package_name == "bash").unwrap();
        assert!(bash.task_id.is_some() && bash.error.is_none());
        let missing = batch.items.iter().find(|i| i.package_name == "missing").unwrap();
        assert!(missing.task_id.is_none());
        assert!(missing.error.is_some());

        let items = Batch::items(&env.conn(), &batch.batch_id).unwrap();
        assert_eq!(items.len(), 1);
    }
}
