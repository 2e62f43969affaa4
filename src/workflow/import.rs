// src/workflow/import.rs

//! Imports into dist-git
//!
//! Forked packages go through the source transform, which pulls the
//! upstream package, applies the project's patches and pushes one commit
//! per branch to the target git host. Packages kept as src-git are
//! converted here instead: every directory under `SOURCES` becomes a
//! deterministic tarball in the lookaside store, and the rest of the tree
//! is committed to the matching dist-git repository next to a metadata
//! sidecar naming those tarballs. Either way every pushed branch becomes
//! an import revision of a package version.

use super::{Controller, PackageOperationMetadata, not_found_package};
use crate::db::models::{
    ExtraOptions, Import, ImportRevision, Package, PackageType, PackageVersion, Project,
    ProjectPackageVersion, Task, TaskType,
};
use crate::error::{Error, Result};
use crate::metadata::sha256_hex;
use crate::orchestrator::{
    ActivityContext, ActivityOptions, DOMAIN_IMPORTS, DOMAIN_TASKS, TaskFinalizer, WorkflowContext,
};
use crate::rpmutils::{self, Nvr};
use crate::store::BlobStore;
use crate::tools::{MockInvocation, MockMode, ProcessRequest, ProcessResponse, VersionRelease, gitlabify};
use crate::worker::{CommandRunner, Sandbox, SandboxSpec};
use flate2::{Compression, GzBuilder};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use walkdir::WalkDir;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(4);

/// Input of the import workflow
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRequest {
    pub project_id: String,
    pub package_name: String,
    /// Pin the upstream version instead of taking the latest
    #[serde(default)]
    pub version_release: Option<VersionRelease>,
    /// Record the revisions without activating them
    #[serde(default)]
    pub set_inactive: bool,
}

/// One branch pushed to dist-git
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportedRevision {
    pub scm_hash: String,
    pub scm_branch_name: String,
    pub scm_url: String,
    pub version: String,
    pub release: String,
    pub modular: bool,
    /// A `-stream-` branch of a non-modular import
    #[serde(default)]
    pub module_stream: bool,
}

/// Response of the import workflow
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportTask {
    pub import_id: String,
    pub package_name: String,
    pub revisions: Vec<ImportedRevision>,
}

/// Tarballs produced from a src-git tree, by file name
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SourceTarballs {
    task_id: String,
    tarballs: BTreeMap<String, String>,
}

/// `<host>/<prefix>/<section>/<name>.git` on the target git host
pub fn target_scm_url(project: &Project, package_name: &str, section: &str) -> String {
    format!(
        "{}/{}/{}/{}.git",
        project.target_gitlab_host,
        project.target_prefix,
        section,
        gitlabify(package_name)
    )
    .replace("//", "/")
    .replacen(":/", "://", 1)
}

/// Tar and gzip `dir` so equal trees always give equal bytes.
///
/// Entries are named `<dir name>/<relative path>`, walked in name order,
/// with zeroed owners and timestamps and mode 0644.
pub fn deterministic_tar_gz(dir: &Path) -> Result<Vec<u8>> {
    let prefix = dir
        .file_name()
        .ok_or_else(|| Error::InvalidArgument(format!("cannot archive {}", dir.display())))?;
    let encoder = GzBuilder::new().mtime(0).write(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| Error::IoError(e.to_string()))?;
        let content = std::fs::read(entry.path())?;

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        builder.append_data(&mut header, Path::new(prefix).join(rel), content.as_slice())?;
    }

    let encoder = builder.into_inner()?;
    Ok(encoder.finish()?)
}

/// Create the import task and its row.
///
/// Returns the task id and the import.
pub(super) fn create_import(
    conn: &Connection,
    project: &Project,
    package_name: &str,
    submitter: Option<String>,
) -> Result<(String, Import)> {
    let package = Package::find_in_project(conn, &project.id, package_name)?
        .ok_or_else(|| not_found_package(&project.id, package_name))?;
    let task = Task::new("noarch", TaskType::Import, Some(&project.id), None).with_submitter(submitter);
    task.insert(conn)?;
    let metadata = PackageOperationMetadata {
        package_name: package.name.clone(),
        modular: false,
    };
    Task::set_metadata(conn, &task.id, &serde_json::to_value(&metadata)?)?;

    let scm_url = target_scm_url(project, &package.name, "rpms");
    let import = Import::create(conn, &scm_url, &task.id, &package.id, &project.id)?;
    Ok((task.id, import))
}

/// Revisions named by a source transform response
fn revisions_from_response(
    project: &Project,
    package: &Package,
    response: &ProcessResponse,
    module_mode: bool,
) -> Vec<ImportedRevision> {
    let section = if module_mode { "modules" } else { "rpms" };
    let scm_url = target_scm_url(project, &package.name, section);
    response
        .branch_commits
        .iter()
        .map(|(branch, hash)| {
            let vr = response.branch_versions.get(branch).cloned().unwrap_or_default();
            ImportedRevision {
                scm_hash: hash.clone(),
                scm_branch_name: branch.clone(),
                scm_url: scm_url.clone(),
                version: vr.version,
                release: vr.release,
                modular: module_mode,
                module_stream: !module_mode && branch.contains("-stream-"),
            }
        })
        .collect()
}

/// Turn each directory under `<tree>/SOURCES` into a stored tarball
fn package_sources(store: &dyn BlobStore, tree: &Path) -> Result<BTreeMap<String, String>> {
    let sources = tree.join("SOURCES");
    if !sources.exists() {
        return Ok(BTreeMap::new());
    }
    if !sources.is_dir() {
        return Err(Error::non_retryable(Error::InvalidArgument(
            "SOURCES is not a directory".to_string(),
        )));
    }

    let mut dirs = std::fs::read_dir(&sources)?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .collect::<Vec<_>>();
    dirs.sort();

    let mut tarballs = BTreeMap::new();
    for dir in dirs {
        let content = deterministic_tar_gz(&dir)?;
        let hash = sha256_hex(&content);
        let name = format!(
            "{}.tar.gz",
            dir.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()
        );
        if store.exists(&hash)? {
            debug!("{} already in lookaside as {}", name, hash);
        } else {
            store.put(&hash, &content)?;
            info!("Stored {} as {}", name, hash);
        }
        tarballs.insert(name, hash);
    }
    Ok(tarballs)
}

/// Replace the dist-git tree with the src-git tree, minus packed sources
fn overlay_src_git(src: &Path, dist: &Path) -> Result<()> {
    let src_sources = src.join("SOURCES");
    if src_sources.is_dir() {
        for entry in std::fs::read_dir(&src_sources)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                std::fs::remove_dir_all(entry.path())?;
            }
        }
    }
    let ci = src.join(".gitlab-ci.yml");
    if ci.exists() {
        std::fs::remove_file(ci)?;
    }

    for entry in std::fs::read_dir(dist)? {
        let entry = entry?;
        if entry.file_name() == ".git" {
            continue;
        }
        if entry.file_type()?.is_dir() {
            std::fs::remove_dir_all(entry.path())?;
        } else {
            std::fs::remove_file(entry.path())?;
        }
    }

    for entry in WalkDir::new(src).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::IoError(e.to_string()))?;
        if rel.starts_with(".git") {
            continue;
        }
        let target = dist.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Metadata sidecar naming lookaside sources, one `<hash> SOURCES/<name>` per line
fn metadata_sidecar(tarballs: &BTreeMap<String, String>) -> String {
    tarballs
        .iter()
        .map(|(name, hash)| format!("{hash} SOURCES/{name}\n"))
        .collect()
}

/// Fresh scratch directory for one activity attempt
pub(super) fn scratch_dir(sandbox: &Sandbox, actx: &ActivityContext) -> Result<PathBuf> {
    let dir = sandbox.work_dir.join(format!("{}-{}", actx.name(), actx.attempt()));
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

impl Controller {
    /// Create an import task for a package and run it to completion
    pub async fn submit_import(&self, req: ImportRequest, submitter: Option<String>) -> Result<ImportTask> {
        let (project_id, name) = (req.project_id.clone(), req.package_name.clone());
        let (task_id, import) = self
            .tx(move |tx| {
                let project = Project::resolve(tx, &project_id)?;
                create_import(tx, &project, &name, submitter)
            })
            .await?;
        let ctx = self.workflow(&task_id);
        self.import_package(&ctx, req, &task_id, &import.id).await
    }

    /// Import workflow for an existing import task
    pub async fn import_package(
        &self,
        ctx: &WorkflowContext,
        req: ImportRequest,
        task_id: &str,
        import_id: &str,
    ) -> Result<ImportTask> {
        let finalizer = TaskFinalizer::start(self.db_path.clone(), task_id, DOMAIN_IMPORTS).await?;
        let outcome = self.run_import(ctx, &req, task_id, import_id).await;
        finalizer.close(outcome).await
    }

    async fn run_import(
        &self,
        ctx: &WorkflowContext,
        req: &ImportRequest,
        task_id: &str,
        import_id: &str,
    ) -> Result<ImportTask> {
        let (project_id, name, id) = (req.project_id.clone(), req.package_name.clone(), task_id.to_string());
        let (project, package, parent) = self
            .db(move |conn| {
                let project = Project::resolve(conn, &project_id)?;
                let package = Package::find_in_project(conn, &project.id, &name)?
                    .ok_or_else(|| not_found_package(&project.id, &name))?;
                let task = Task::find_by_id(conn, &id)?
                    .ok_or_else(|| Error::NotFound(format!("task {id}")))?;
                Ok((project, package, task.parent_task_id.unwrap_or(task.id)))
            })
            .await?;

        let spec = SandboxSpec {
            task_id: task_id.to_string(),
            parent_task_id: parent,
            project_id: project.id.clone(),
            purpose: "import".to_string(),
            arch: "noarch".to_string(),
            high_resource: false,
            privileged: false,
        };
        let package_type = package.effective_type();
        let (project_ref, package_ref) = (&project, &package);
        let revisions = self
            .with_worker(ctx, spec, |runner, sandbox| async move {
                match package_type {
                    PackageType::NormalSrc => self
                        .import_src_git(ctx, runner, sandbox, project_ref, package_ref, task_id)
                        .await
                        .map(|r| vec![r]),
                    _ => {
                        self.import_upstream(ctx, runner, project_ref, package_ref, req, task_id)
                            .await
                    }
                }
            })
            .await?;

        let set_inactive = req.set_inactive;
        let recorded: usize = ctx
            .execute_activity(
                "record-import-revisions",
                &ActivityOptions::once(Duration::from_secs(60)),
                |_| {
                    let revisions = revisions.clone();
                    let (project_id, package_id, import_id) =
                        (project.id.clone(), package.id.clone(), import_id.to_string());
                    self.tx(move |tx| {
                        if !set_inactive {
                            ProjectPackageVersion::deactivate_by_package(tx, &project_id, &package_id)?;
                        }
                        for rev in &revisions {
                            let pv = PackageVersion::ensure(tx, &package_id, &rev.version, &rev.release)?;
                            ProjectPackageVersion::attach(tx, &project_id, &package_id, &pv, !set_inactive)?;
                            ImportRevision::create(
                                tx,
                                &import_id,
                                &rev.scm_hash,
                                &rev.scm_branch_name,
                                &rev.scm_url,
                                &pv,
                                rev.modular,
                            )?;
                        }
                        Ok(revisions.len())
                    })
                },
            )
            .await?;
        info!("Imported {} revision(s) of {}", recorded, package.name);

        Ok(ImportTask {
            import_id: import_id.to_string(),
            package_name: package.name,
            revisions,
        })
    }

    /// Source transform request for one pass over a forked package
    fn process_request(
        &self,
        project: &Project,
        package: &Package,
        req: &ImportRequest,
        module_mode: bool,
    ) -> Result<ProcessRequest> {
        let (host, prefix, import_branch_prefix) = if package.effective_type() == PackageType::Normal {
            (
                project.target_gitlab_host.clone(),
                project.target_prefix.clone(),
                project.target_branch_prefix.clone(),
            )
        } else {
            match (&project.source_git_host, &project.source_prefix, &project.source_branch_prefix) {
                (Some(host), Some(prefix), Some(branch)) if !host.is_empty() && !branch.is_empty() => {
                    (host.clone(), prefix.clone(), branch.clone())
                }
                _ => {
                    return Err(Error::non_retryable(Error::InvalidArgument(
                        "no upstream info provided".to_string(),
                    )));
                }
            }
        };
        let (host, prefix) = (host.trim_end_matches('/'), prefix.trim_matches('/'));
        let pinned = req.version_release.as_ref().filter(|_| !module_mode);

        Ok(ProcessRequest {
            version: project.major_version,
            storage_addr: format!("file://{}", self.config.storage.root.display()),
            package: package.name.clone(),
            package_git_name: gitlabify(&package.name),
            module_prefix: format!("{host}/{prefix}/modules"),
            rpm_prefix: format!("{host}/{prefix}/rpms"),
            upstream_prefix: project.upstream_prefix(),
            git_committer_name: self.config.tools.git_author.clone(),
            git_committer_email: self.config.tools.git_email.clone(),
            import_branch_prefix,
            branch_prefix: project.target_branch_prefix.clone(),
            branch_suffix: project.branch_suffix.clone().unwrap_or_default(),
            strict_branch_mode: true,
            module_mode,
            cdn_url: project.cdn_url.clone().unwrap_or_default(),
            package_version: pinned.map(|vr| vr.version.clone()),
            package_release: pinned.map(|vr| vr.release.clone()),
        })
    }

    /// Run the source transform once, or twice for packages with a module side
    async fn import_upstream(
        &self,
        ctx: &WorkflowContext,
        runner: Arc<dyn CommandRunner>,
        project: &Project,
        package: &Package,
        req: &ImportRequest,
        parent_task_id: &str,
    ) -> Result<Vec<ImportedRevision>> {
        let subtask = self
            .create_subtask(ctx, "noarch", TaskType::ImportUpstream, &project.id, parent_task_id)
            .await?;
        let finalizer = TaskFinalizer::start(self.db_path.clone(), &subtask, DOMAIN_TASKS).await?;

        let package_type = package.effective_type();
        let mut passes = vec![package_type == PackageType::ModuleFork];
        if matches!(
            package_type,
            PackageType::NormalForkModule | PackageType::ModuleForkModuleComponent
        ) {
            passes.push(true);
        }

        let outcome = async {
            let mut revisions = Vec::new();
            for module_mode in passes {
                let request = self.process_request(project, package, req, module_mode)?;
                let response = ctx
                    .execute_activity("upstream-dist-git", &ActivityOptions::import(), |actx| {
                        let (runner, request) = (runner.clone(), request.clone());
                        async move {
                            let _alive = actx.keep_alive(HEARTBEAT_INTERVAL);
                            self.tools.srpmproc.process(runner.as_ref(), &request).await
                        }
                    })
                    .await?;
                revisions.extend(revisions_from_response(project, package, &response, module_mode));
            }
            Ok(revisions)
        }
        .await;
        finalizer.close(outcome).await
    }

    async fn import_src_git(
        &self,
        ctx: &WorkflowContext,
        runner: Arc<dyn CommandRunner>,
        sandbox: Sandbox,
        project: &Project,
        package: &Package,
        parent_task_id: &str,
    ) -> Result<ImportedRevision> {
        let sources = self
            .package_src_git(ctx, runner.clone(), &sandbox, project, package, parent_task_id)
            .await?;
        self.update_dist_git(ctx, runner, &sandbox, project, package, &sources)
            .await
    }

    /// Pack the src-git `SOURCES` directories into the lookaside store
    async fn package_src_git(
        &self,
        ctx: &WorkflowContext,
        runner: Arc<dyn CommandRunner>,
        sandbox: &Sandbox,
        project: &Project,
        package: &Package,
        parent_task_id: &str,
    ) -> Result<SourceTarballs> {
        let subtask = self
            .create_subtask(ctx, "noarch", TaskType::ImportSrcGit, &project.id, parent_task_id)
            .await?;
        let finalizer = TaskFinalizer::start(self.db_path.clone(), &subtask, DOMAIN_TASKS).await?;

        let src_url = target_scm_url(project, &package.name, "src");
        let branch = project.target_branch();
        let outcome = ctx
            .execute_activity("package-src-git", &ActivityOptions::import(), |actx| {
                let runner = runner.clone();
                let (src_url, branch) = (src_url.clone(), branch.clone());
                async move {
                    let _alive = actx.keep_alive(HEARTBEAT_INTERVAL);
                    let dir = scratch_dir(sandbox, &actx)?.join("src-git");
                    self.tools
                        .scm
                        .clone_repo(runner.as_ref(), &src_url, &dir, Some(&branch))
                        .await?;
                    let store = self.store.clone();
                    tokio::task::spawn_blocking(move || package_sources(store.as_ref(), &dir)).await?
                }
            })
            .await;
        let tarballs = finalizer.close(outcome).await?;
        Ok(SourceTarballs {
            task_id: subtask,
            tarballs,
        })
    }

    /// Commit the src-git tree to dist-git and tag it with its NVR
    async fn update_dist_git(
        &self,
        ctx: &WorkflowContext,
        runner: Arc<dyn CommandRunner>,
        sandbox: &Sandbox,
        project: &Project,
        package: &Package,
        sources: &SourceTarballs,
    ) -> Result<ImportedRevision> {
        let subtask = self
            .create_subtask(
                ctx,
                "noarch",
                TaskType::ImportSrcGitToDistGit,
                &project.id,
                &sources.task_id,
            )
            .await?;
        let finalizer = TaskFinalizer::start(self.db_path.clone(), &subtask, DOMAIN_TASKS).await?;

        let (project_id, name) = (project.id.clone(), package.name.clone());
        let extra = self
            .db(move |conn| ExtraOptions::find(conn, &project_id, &name))
            .await?
            .unwrap_or_default();

        let outcome = ctx
            .execute_activity("update-dist-git", &ActivityOptions::import(), |actx| {
                let runner = runner.clone();
                let extra = &extra;
                async move {
                    let _alive = actx.keep_alive(HEARTBEAT_INTERVAL);
                    let work = scratch_dir(sandbox, &actx)?;
                    self.sync_dist_git(runner.as_ref(), &work, project, package, &sources.tarballs, extra)
                        .await
                }
            })
            .await;
        finalizer.close(outcome).await
    }

    async fn sync_dist_git(
        &self,
        runner: &dyn CommandRunner,
        work: &Path,
        project: &Project,
        package: &Package,
        tarballs: &BTreeMap<String, String>,
        extra: &ExtraOptions,
    ) -> Result<ImportedRevision> {
        let scm = &self.tools.scm;
        let branch = project.target_branch();
        let (src_dir, dist_dir) = (work.join("src-git"), work.join("dist-git"));

        let src_url = target_scm_url(project, &package.name, "src");
        scm.clone_repo(runner, &src_url, &src_dir, Some(&branch)).await?;

        let rpms_url = target_scm_url(project, &package.name, "rpms");
        let created = match scm.clone_repo(runner, &rpms_url, &dist_dir, Some(&branch)).await {
            Ok(()) => false,
            Err(e) if e.to_string().contains("not found") => {
                info!("Creating dist-git repository {}", rpms_url);
                if dist_dir.exists() {
                    std::fs::remove_dir_all(&dist_dir)?;
                }
                scm.init(runner, &dist_dir, &rpms_url, &branch).await?;
                true
            }
            Err(e) => return Err(e),
        };

        let (src, dist) = (src_dir.clone(), dist_dir.clone());
        tokio::task::spawn_blocking(move || overlay_src_git(&src, &dist)).await??;

        // Sources for the SRPM build live outside the dist-git tree
        let build_sources = work.join("build-sources");
        std::fs::create_dir_all(&build_sources)?;
        let dist_sources = dist_dir.join("SOURCES");
        if dist_sources.is_dir() {
            for entry in std::fs::read_dir(&dist_sources)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    std::fs::copy(entry.path(), build_sources.join(entry.file_name()))?;
                }
            }
        }
        for (name, hash) in tarballs {
            let (store, hash, dest) = (self.store.clone(), hash.clone(), build_sources.join(name));
            tokio::task::spawn_blocking(move || store.download(&hash, &dest)).await??;
        }

        let spec = super::build::find_spec(&dist_dir)?;
        let config = work.join("mock-srpm.cfg");
        let rendered = self
            .srpm_mock_config(project, extra, &super::BuildOptions::default(), None)
            .await?;
        std::fs::write(&config, rendered)?;

        let result_dir = work.join("SRPMS");
        self.tools
            .mock
            .build(
                runner,
                &MockInvocation {
                    mode: MockMode::Srpm,
                    config,
                    target: "noarch".to_string(),
                    result_dir: result_dir.clone(),
                    sources: Some(build_sources),
                    input: spec,
                    with: extra.with_flags.clone(),
                    without: extra.without_flags.clone(),
                    nocheck: false,
                },
            )
            .await?;

        let srpm = super::build::list_rpms(&result_dir)?
            .into_iter()
            .find(|p| p.to_string_lossy().ends_with(".src.rpm"))
            .ok_or_else(|| Error::tool("mock", "no source RPM produced"))?;
        let file_name = srpm.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
        let nvr = Nvr::parse(rpmutils::strip_rpm_suffix(&file_name))
            .ok_or_else(|| Error::ParseError(format!("invalid source RPM name {file_name}")))?;

        let tag = format!("imports/{}/{}-{}-{}", branch, package.name, nvr.version, nvr.release);
        let revision = |hash: String| ImportedRevision {
            scm_hash: hash,
            scm_branch_name: branch.clone(),
            scm_url: rpms_url.clone(),
            version: nvr.version.clone(),
            release: nvr.release.clone(),
            modular: false,
            module_stream: false,
        };

        if !created {
            if let Some(hash) = scm.tag_commit(runner, &dist_dir, &tag).await? {
                info!("{} already imported at {}", tag, hash);
                return Ok(revision(hash));
            }
        }

        std::fs::write(
            dist_dir.join(format!(".{}.metadata", package.name)),
            metadata_sidecar(tarballs),
        )?;
        let hash = scm.commit_all(runner, &dist_dir, &format!("import {tag}")).await?;
        scm.tag(runner, &dist_dir, &tag, "sync from src-git to dist-git").await?;
        scm.push(
            runner,
            &dist_dir,
            &[format!("HEAD:refs/heads/{branch}"), format!("HEAD:refs/tags/{tag}")],
        )
        .await?;
        info!("Pushed {} to {}", tag, rpms_url);
        Ok(revision(hash))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Import, TaskStatus};
    use crate::workflow::testing::TestEnv;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    fn upstream_env() -> TestEnv {
        let mut env = TestEnv::new();
        env.project.source_git_host = Some("https://git.centos.test".to_string());
        env.project.source_prefix = Some("/src/".to_string());
        env.project.source_branch_prefix = Some("c".to_string());
        let conn = env.conn();
        conn.execute(
            "UPDATE projects SET source_git_host = ?1, source_prefix = ?2, source_branch_prefix = ?3 WHERE id = ?4",
            rusqlite::params!["https://git.centos.test", "/src/", "c", &env.project.id],
        )
        .unwrap();
        env
    }

    #[test]
    fn test_target_scm_url() {
        let env = TestEnv::new();
        assert_eq!(
            target_scm_url(&env.project, "libstdc++", "rpms"),
            "https://git.rockylinux.test/staging/rpms/libstdcplusplus.git"
        );
    }

    #[test]
    fn test_deterministic_tar_gz_ignores_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("bash-5.1");
        write(&tree.join("b.txt"), "b");
        write(&tree.join("sub/a.txt"), "a");

        let first = deterministic_tar_gz(&tree).unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        std::fs::write(tree.join("b.txt"), "b").unwrap();
        let second = deterministic_tar_gz(&tree).unwrap();
        assert_eq!(first, second);

        let decoder = flate2::read::GzDecoder::new(first.as_slice());
        let mut archive = tar::Archive::new(decoder);
        let names = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["bash-5.1/b.txt", "bash-5.1/sub/a.txt"]);
    }

    #[tokio::test]
    async fn test_upstream_import_records_revisions() {
        let env = upstream_env();
        let pkg = env.package("bash", PackageType::NormalFork);
        let old_pv = env.import_revision(&pkg, "5.1.8", "4.el9", "r9", "old");

        {
            let mut response = env.srpmproc.response.lock().unwrap();
            response.branch_commits.insert("r9".to_string(), "abc123".to_string());
            response.branch_commits.insert("r9-stream-2".to_string(), "def456".to_string());
            for branch in ["r9", "r9-stream-2"] {
                response.branch_versions.insert(
                    branch.to_string(),
                    VersionRelease {
                        version: "5.1.8".to_string(),
                        release: "6.el9".to_string(),
                    },
                );
            }
        }

        let req = ImportRequest {
            project_id: env.project.id.clone(),
            package_name: "bash".to_string(),
            version_release: Some(VersionRelease {
                version: "5.1.8".to_string(),
                release: "6.el9".to_string(),
            }),
            set_inactive: false,
        };
        let task = env.controller.submit_import(req, Some("jdoe".to_string())).await.unwrap();
        assert_eq!(task.revisions.len(), 2);
        let stream = task.revisions.iter().find(|r| r.scm_branch_name == "r9-stream-2").unwrap();
        assert!(stream.module_stream);
        assert!(!stream.modular);
        assert_eq!(stream.scm_url, "https://git.rockylinux.test/staging/rpms/bash.git");

        let requests = env.srpmproc.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].rpm_prefix, "https://git.centos.test/src/rpms");
        assert_eq!(requests[0].import_branch_prefix, "c");
        assert_eq!(requests[0].package_version.as_deref(), Some("5.1.8"));

        let conn = env.conn();
        let latest = ImportRevision::latest_for_package_in_project(&conn, "bash", &env.project.id).unwrap();
        assert_eq!(latest.len(), 2);
        assert!(latest.iter().all(|r| r.release == "6.el9"));
        let old = ProjectPackageVersion::find(&conn, &env.project.id, &old_pv).unwrap().unwrap();
        assert!(!old.active);

        let imports = Import::list_in_project(&conn, &env.project.id, 10, 0).unwrap();
        let top = Task::find_by_id(&conn, &imports[0].task_id).unwrap().unwrap();
        assert_eq!(top.status, TaskStatus::Succeeded);
        assert_eq!(top.submitter.as_deref(), Some("jdoe"));
    }

    #[tokio::test]
    async fn test_module_package_runs_module_pass() {
        let env = upstream_env();
        env.package("nodejs", PackageType::NormalForkModule);
        env.srpmproc
            .response
            .lock()
            .unwrap()
            .branch_commits
            .insert("r9".to_string(), "abc".to_string());

        let req = ImportRequest {
            project_id: env.project.id.clone(),
            package_name: "nodejs".to_string(),
            version_release: Some(VersionRelease::default()),
            ..Default::default()
        };
        let task = env.controller.submit_import(req, None).await.unwrap();
        let requests = env.srpmproc.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 2);
        assert!(!requests[0].module_mode);
        assert!(requests[1].module_mode);
        assert!(requests[1].package_version.is_none());
        assert!(task.revisions.iter().any(|r| r.modular && r.scm_url.ends_with("/modules/nodejs.git")));
    }

    #[tokio::test]
    async fn test_missing_upstream_info_fails_import() {
        let env = TestEnv::new();
        env.package("bash", PackageType::NormalFork);
        let req = ImportRequest {
            project_id: env.project.id.clone(),
            package_name: "bash".to_string(),
            ..Default::default()
        };
        let err = env.controller.submit_import(req, None).await.unwrap_err();
        assert!(err.to_string().contains("no upstream info provided"));

        let conn = env.conn();
        let imports = Import::list_in_project(&conn, &env.project.id, 10, 0).unwrap();
        let tree = Task::tree(&conn, &imports[0].task_id, None).unwrap();
        let top = tree.iter().find(|t| t.id == imports[0].task_id).unwrap();
        let upstream = tree.iter().find(|t| t.task_type == TaskType::ImportUpstream).unwrap();
        assert_eq!(top.status, TaskStatus::Failed);
        assert_eq!(upstream.status, TaskStatus::Failed);
        assert!(top.error.is_some());
    }

    #[tokio::test]
    async fn test_src_git_import_pushes_tag_once() {
        let env = TestEnv::new();
        env.package("bash", PackageType::NormalSrc);
        let fixture = env.path("fixtures/src-bash");
        write(&fixture.join("SPECS/bash.spec"), "Name: bash\n");
        write(&fixture.join("SOURCES/bash-5.1/configure"), "#!/bin/sh\n");
        write(&fixture.join("SOURCES/bash-2.patch"), "--- a\n+++ b\n");
        write(&fixture.join(".gitlab-ci.yml"), "stages: []\n");
        env.scm
            .add_remote("https://git.rockylinux.test/staging/src/bash.git", &fixture);

        let req = ImportRequest {
            project_id: env.project.id.clone(),
            package_name: "bash".to_string(),
            ..Default::default()
        };
        let task = env.controller.submit_import(req.clone(), None).await.unwrap();
        assert_eq!(task.revisions.len(), 1);
        let revision = &task.revisions[0];
        assert_eq!(revision.version, "5.1.8");
        assert_eq!(revision.release, "6.el9");
        assert_eq!(revision.scm_branch_name, "r9");

        let pushes = env.scm.pushes.lock().unwrap().clone();
        assert_eq!(
            pushes,
            vec![vec![
                "HEAD:refs/heads/r9".to_string(),
                "HEAD:refs/tags/imports/r9/bash-5.1.8-6.el9".to_string(),
            ]]
        );
        let srpm_build = &env.mock.invocations()[0];
        assert_eq!(srpm_build.mode, MockMode::Srpm);
        assert!(srpm_build.sources.as_ref().unwrap().ends_with("build-sources"));
        assert!(srpm_build.input.ends_with("SPECS/bash.spec"));

        let tarball = deterministic_tar_gz(&fixture.join("SOURCES/bash-5.1")).unwrap();
        let conn = env.conn();
        let revisions = ImportRevision::latest_for_package_in_project(&conn, "bash", &env.project.id).unwrap();
        assert_eq!(revisions[0].scm_hash, revision.scm_hash);
        assert!(env.controller.store.exists(&sha256_hex(&tarball)).unwrap());

        // Dist-git now exists and already carries the tag
        env.scm
            .add_remote("https://git.rockylinux.test/staging/rpms/bash.git", &fixture);
        let again = env.controller.submit_import(req, None).await.unwrap();
        assert_eq!(env.scm.pushes.lock().unwrap().len(), 1);
        assert_eq!(again.revisions[0].version, "5.1.8");
    }

    #[test]
    fn test_sources_file_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write(&dir.path().join("SOURCES"), "not a dir");
        let store = crate::store::MemoryStore::default();
        let err = package_sources(&store, dir.path()).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_metadata_sidecar() {
        let mut tarballs = BTreeMap::new();
        tarballs.insert("b.tar.gz".to_string(), "bb".to_string());
        tarballs.insert("a.tar.gz".to_string(), "aa".to_string());
        assert_eq!(
            metadata_sidecar(&tarballs),
            "aa SOURCES/a.tar.gz\nbb SOURCES/b.tar.gz\n"
        );
    }
}
