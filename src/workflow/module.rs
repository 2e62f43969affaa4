// src/workflow/module.rs

//! Module builds
//!
//! A module package carries one modulemd source document per stream branch
//! in its `modules/` repository. Every stream becomes a build row of its
//! own; its components are built in `buildorder` groups with a shared
//! `macros.zz-module` file, and the resulting RPMs are filtered into one
//! modulemd document per arch (plus a `-devel` variant holding whatever
//! the filters left out). The composer then publishes every stream at once.

use super::build::{create_build, pick_error};
use super::{BuildOptions, BuildRequest, Controller, ModuleBuildTask, ModuleStream, SubmitBuildTask, UpdateRepoRequest};
use super::not_found_package;
use crate::db::{
    self,
    models::{
        Batch, Build, ImportRevision, ModuleConfiguration, ModulePlatform, Package, Project, Repository,
        TaskArtifact, TaskType,
    },
};
use crate::error::{Error, Result};
use crate::metadata::modulemd::{self, Dependencies, License, ModuleData, ModuleMd};
use crate::metadata::primary::PrimaryPackage;
use crate::multilib::compatible_arches;
use crate::orchestrator::{ActivityOptions, DOMAIN_BUILDS, TaskFinalizer, WorkflowContext};
use crate::rpmutils;
use crate::tools::gitlabify;
use crate::tools::mock::ExtraYumrepofsRepo;
use crate::tools::upload::RpmArtifactMetadata;
use crate::worker::LocalRunner;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const MODULE_MACROS_PATH: &str = "/etc/rpm/macros.zz-module";

/// `<M>0<m>0<p><YYYYmmddHHMMSS>`
pub fn module_version(platform: &ModulePlatform, at: &DateTime<Utc>) -> String {
    format!("{}{}", platform.version_prefix(), at.format("%Y%m%d%H%M%S"))
}

/// First 8 hex chars of the sha1 of the source document
pub fn module_context(yaml: &[u8]) -> String {
    let digest = hex::encode(Sha1::digest(yaml));
    digest[..8].to_string()
}

/// Release dist of every component built for a stream
pub fn module_dist(platform: &ModulePlatform, increment: i64, context: &str) -> String {
    format!("module+{}+{}+{}", platform.dist(), increment, context)
}

/// A published RPM of a stream build with what the artifact filter looks at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleArtifact {
    pub package: PrimaryPackage,
    pub exclude_arch: Vec<String>,
    pub exclusive_arch: Vec<String>,
    /// Component (source package) that produced it
    pub srpm_name: String,
    pub srpm_nevra: String,
}

/// Whether a module document admits an artifact on `arch`.
///
/// The whitelist limits which components count, `filter.rpms` drops binary
/// names, and multilib RPMs only pass for components declaring the arch
/// multilib.
pub fn rpm_passes_filter(artifact: &ModuleArtifact, data: &ModuleData, arch: &str, multilib_arches: &[String]) -> bool {
    let whitelist = data.whitelist();
    if !whitelist.is_empty() && !whitelist.contains(&artifact.srpm_name) {
        return false;
    }
    if data.filtered_rpms().contains(&artifact.package.name) {
        return false;
    }

    let Some(component) = data
        .components
        .as_ref()
        .and_then(|c| c.rpms.get(&artifact.srpm_name))
    else {
        return false;
    };

    let rpm_arch = &artifact.package.arch;
    if !component.multilib.iter().any(|a| a == arch) && multilib_arches.contains(rpm_arch) {
        return false;
    }
    // Whitelisted names may not match component names; drop multilib then
    if !whitelist.is_empty() && rpm_arch != arch && rpm_arch != "noarch" {
        return false;
    }
    true
}

/// A stream branch revision and its module source document
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StreamSource {
    revision: ImportRevision,
    yaml: String,
}

/// One stream to build, fixed before any component runs
#[derive(Debug, Clone)]
struct StreamPlan {
    name: String,
    stream: String,
    version: String,
    context: String,
    dist: String,
    increment: i64,
    revision: ImportRevision,
    build_id: String,
    document: ModuleMd,
}

impl StreamPlan {
    fn data(&self) -> Result<&ModuleData> {
        self.document.data()
    }

    /// Contents of `macros.zz-module` for every component of the stream
    fn macros(&self) -> Result<String> {
        Ok(format!(
            "\n%dist .{dist}\n%modularitylabel {name}:{stream}:{version}:{context}\n%_module_build {increment}\n\
             %_module_name {name}\n%_module_stream {stream}\n%_module_version {version}\n\
             %_module_context {context}\n\n{buildopts}\n",
            dist = self.dist,
            name = self.name,
            stream = self.stream,
            version = self.version,
            context = self.context,
            increment = self.increment,
            buildopts = self.data()?.build_macros(),
        ))
    }
}

/// What a module build resolves up front
struct ModuleInputs {
    project: Project,
    package: Package,
    configuration: ModuleConfiguration,
    revisions: Vec<ImportRevision>,
}

/// Newest modular revision of each stream branch, optionally restricted
fn stream_revisions(revisions: Vec<ImportRevision>, project: &Project, branches: &[String]) -> Vec<ImportRevision> {
    let prefix = format!("{}-stream", project.target_branch());
    let mut selected: Vec<ImportRevision> = Vec::new();
    for revision in revisions {
        if !revision.modular || !revision.scm_branch_name.starts_with(&prefix) {
            continue;
        }
        if !branches.is_empty() && !branches.contains(&revision.scm_branch_name) {
            continue;
        }
        if selected.iter().any(|r| r.scm_branch_name == revision.scm_branch_name) {
            continue;
        }
        selected.push(revision);
    }
    selected
}

/// `name:stream` pairs of the module's buildrequires, platform aside
fn build_requires_modules(data: &ModuleData) -> Result<Vec<String>> {
    let mut modules = Vec::new();
    for dependency in &data.dependencies {
        for (module, streams) in &dependency.buildrequires {
            if module == "platform" {
                continue;
            }
            if streams.is_empty() {
                return Err(Error::InvalidModule(format!(
                    "buildrequires on {module} must name a stream"
                )));
            }
            modules.extend(streams.iter().map(|s| format!("{module}:{s}")));
        }
    }
    Ok(modules)
}

/// Component names grouped by ascending buildorder
fn build_orders(data: &ModuleData) -> BTreeMap<i64, Vec<String>> {
    let mut orders: BTreeMap<i64, Vec<String>> = BTreeMap::new();
    if let Some(components) = &data.components {
        for (name, component) in &components.rpms {
            orders.entry(component.buildorder).or_default().push(name.clone());
        }
    }
    orders
}

/// Index the stream build's artifacts by NEVRA and gather their licenses
fn index_artifacts(
    builds: &[SubmitBuildTask],
    artifacts: &[TaskArtifact],
) -> Result<(BTreeMap<String, ModuleArtifact>, Vec<String>)> {
    let mut described = Vec::with_capacity(artifacts.len());
    for artifact in artifacts {
        let Some(value) = artifact.metadata.as_ref() else {
            continue;
        };
        let metadata = RpmArtifactMetadata::from_value(value)?;
        let package = metadata.primary_package()?;
        described.push((artifact, metadata, package));
    }

    let mut srpm_nevras = BTreeMap::new();
    for (artifact, _, package) in &described {
        if artifact.arch != "src" {
            continue;
        }
        if builds.iter().any(|b| b.package_name == package.name) {
            srpm_nevras.insert(package.name.clone(), package.nevra());
        }
    }

    let (mut index, mut licenses) = (BTreeMap::new(), Vec::new());
    for build in builds {
        for (artifact, metadata, package) in &described {
            if !build.artifacts.contains(&artifact.name) {
                continue;
            }
            let license = &package.format.license;
            if !license.is_empty() && !licenses.contains(license) {
                licenses.push(license.clone());
            }
            index.insert(
                package.nevra(),
                ModuleArtifact {
                    package: package.clone(),
                    exclude_arch: metadata.exclude_arch.clone(),
                    exclusive_arch: metadata.exclusive_arch.clone(),
                    srpm_name: build.package_name.clone(),
                    srpm_nevra: srpm_nevras.get(&build.package_name).cloned().unwrap_or_default(),
                },
            );
        }
    }
    Ok((index, licenses))
}

/// NEVRAs listed under `artifacts.rpms` for one arch.
///
/// The plain variant lists what passes the filters; the devel variant what
/// does not. Debug packages follow their main package. A source RPM goes to
/// the plain variant when any of its RPMs did, to devel otherwise.
fn artifact_rpms(
    data: &ModuleData,
    index: &BTreeMap<String, ModuleArtifact>,
    arch: &str,
    multilib_arches: &[String],
    devel: bool,
) -> Vec<String> {
    let binary_names: Vec<&str> = index
        .values()
        .filter(|a| a.package.arch != "src")
        .map(|a| a.package.name.as_str())
        .collect();
    let source_rpms: BTreeMap<&str, &str> = index
        .iter()
        .filter(|(_, a)| a.package.arch == "src")
        .map(|(nevra, a)| (a.package.name.as_str(), nevra.as_str()))
        .collect();

    let mut rpms: Vec<String> = Vec::new();
    let mut included_names: Vec<String> = Vec::new();
    let mut included_srpms: Vec<String> = Vec::new();
    let mut plain_sources: Vec<String> = Vec::new();

    for (nevra, artifact) in index {
        let pkg = &artifact.package;
        if pkg.arch == "src" {
            continue;
        }
        if !multilib_arches.contains(&pkg.arch) && pkg.arch != arch && pkg.arch != "noarch" {
            continue;
        }
        let targets = [arch, "noarch"];
        if artifact.exclude_arch.iter().any(|a| targets.contains(&a.as_str())) {
            continue;
        }
        if !artifact.exclusive_arch.is_empty() && !artifact.exclusive_arch.iter().any(|a| targets.contains(&a.as_str()))
        {
            continue;
        }

        let include = if rpmutils::is_debug_package(&pkg.name) {
            let main = rpmutils::strip_debug_suffixes(&pkg.name);
            let main_included = included_names.contains(&main);
            let orphan = !binary_names.contains(&main.as_str()) && included_srpms.contains(&artifact.srpm_name);
            (main_included || orphan) && rpm_passes_filter(artifact, data, arch, multilib_arches)
        } else {
            rpm_passes_filter(artifact, data, arch, multilib_arches)
        };

        if include {
            plain_sources.push(artifact.srpm_nevra.clone());
            included_names.push(pkg.name.clone());
            included_srpms.push(artifact.srpm_name.clone());
        }
        if include == devel {
            continue;
        }
        if !rpms.contains(nevra) {
            rpms.push(nevra.clone());
        }
    }

    let sources: Vec<String> = if devel {
        source_rpms
            .values()
            .filter(|nevra| !plain_sources.iter().any(|p| p == *nevra))
            .map(|nevra| nevra.to_string())
            .collect()
    } else {
        plain_sources
    };
    for source in sources {
        if !source.is_empty() && !rpms.contains(&source) {
            rpms.push(source);
        }
    }
    rpms
}

/// Render one arch variant of a stream's modulemd.
///
/// Returns the key it is stored under (`<stream>` or `<stream>-devel`) and
/// the document.
#[allow(clippy::too_many_arguments)]
fn stream_document(
    plan: &StreamPlan,
    platform: &ModulePlatform,
    project_archs: &[String],
    index: &BTreeMap<String, ModuleArtifact>,
    licenses: &[String],
    arch: &str,
    multilib_arches: &[String],
    devel: bool,
) -> Result<(String, String)> {
    let source = plan.data()?;
    let mut data = source.clone();
    data.version = plan.version.clone();
    data.context = plan.context.clone();
    data.arch = arch.to_string();
    data.license.get_or_insert_with(License::default).content = licenses.to_vec();

    let platform_stream = platform.dist();
    if data.dependencies.iter().any(|d| d.buildrequires.contains_key("platform")) {
        data.set_platform(&platform_stream);
    } else {
        data.dependencies.push(Dependencies {
            buildrequires: BTreeMap::from([("platform".to_string(), vec![platform_stream])]),
            ..Default::default()
        });
    }
    if let Some(components) = data.components.as_mut() {
        for component in components.rpms.values_mut() {
            component.arches = project_archs.to_vec();
        }
    }

    let artifacts = data.artifacts.get_or_insert_with(Default::default);
    artifacts.rpms = artifact_rpms(source, index, arch, multilib_arches, devel);

    let key = if devel {
        data.name = format!("{}-devel", plan.name);
        format!("{}-devel", plan.stream)
    } else {
        plan.stream.clone()
    };
    let document = ModuleMd {
        document: plan.document.document.clone(),
        version: plan.document.version,
        data: Some(data),
    };
    Ok((key, document.to_document()?))
}

/// Keep cancellations recognizable, wrap everything else
fn stream_error(e: Error) -> Error {
    if e.is_canceled() || matches!(e, Error::NvrAlreadyLocked(_)) {
        e
    } else {
        Error::InternalError(format!("failed to build module stream: {e}"))
    }
}

impl Controller {
    /// Create a module build task for a package and run it to completion
    pub async fn submit_module_build(
        &self,
        req: BuildRequest,
        options: BuildOptions,
        submitter: Option<String>,
    ) -> Result<ModuleBuildTask> {
        let request = req.clone();
        let (project_id, task_id) = self
            .tx(move |tx| {
                let project = Project::resolve(tx, &request.project_id)?;
                let (task_id, _) = create_build(tx, &project, &request, true, submitter)?;
                Ok((project.id, task_id))
            })
            .await?;
        let req = BuildRequest { project_id, ..req };
        let ctx = self.workflow(&task_id);
        self.build_module(&ctx, req, &task_id, options).await
    }

    /// Module build workflow for an existing build task
    pub async fn build_module(
        &self,
        ctx: &WorkflowContext,
        req: BuildRequest,
        task_id: &str,
        options: BuildOptions,
    ) -> Result<ModuleBuildTask> {
        let finalizer = TaskFinalizer::start(self.db_path.clone(), task_id, DOMAIN_BUILDS).await?;
        let outcome = self.run_module(ctx, &finalizer, &req, task_id, &options).await;
        finalizer.close(outcome).await
    }

    async fn run_module(
        &self,
        ctx: &WorkflowContext,
        finalizer: &TaskFinalizer,
        req: &BuildRequest,
        task_id: &str,
        options: &BuildOptions,
    ) -> Result<ModuleBuildTask> {
        let request = req.clone();
        let inputs = self
            .db(move |conn| {
                let project = Project::resolve(conn, &request.project_id)?;
                let package = Package::find_in_project(conn, &project.id, &request.package_name)?
                    .ok_or_else(|| not_found_package(&project.id, &request.package_name))?;
                if !package.effective_type().is_module() {
                    return Err(Error::InternalError(format!("package {} is not a module", package.name)));
                }
                let configuration = ModuleConfiguration::find(conn, &project.id)?.ok_or_else(|| {
                    Error::InternalError(format!("project {} has no module configuration", project.id))
                })?;
                let revisions = ImportRevision::latest_for_package_in_project(conn, &package.name, &project.id)?;
                let revisions = stream_revisions(revisions, &project, &request.branches);
                Ok(ModuleInputs {
                    project,
                    package,
                    configuration,
                    revisions,
                })
            })
            .await?;
        let (project, package) = (&inputs.project, &inputs.package);
        if inputs.revisions.is_empty() {
            return Err(Error::ActivityFailed(format!(
                "no stream revisions found for module {}",
                package.name
            )));
        }

        let (increment, started): (i64, DateTime<Utc>) = ctx
            .side_effect({
                let db_path = self.db_path.clone();
                move || Ok((Build::count_all(&db::open(&db_path)?)?, Utc::now()))
            })
            .await?;

        let sources = self.read_module_documents(ctx, project, package, &inputs.revisions).await?;
        let platform = inputs.configuration.platform;
        let mut plans = Vec::with_capacity(sources.len());
        for source in sources {
            let branch = source.revision.scm_branch_name.clone();
            let mut document = modulemd::parse(source.yaml.as_bytes()).map_err(|e| {
                Error::ActivityFailed(format!(
                    "could not parse yaml file from modules repo in branch {branch}: {e}"
                ))
            })?;
            let data = document
                .data
                .as_mut()
                .ok_or_else(|| Error::InvalidModule(package.name.clone()))?;
            if data.components.is_none() {
                return Err(Error::InvalidModule(package.name.clone()));
            }
            if data.name.is_empty() {
                data.name = package.name.clone();
            }
            let (name, stream) = (data.name.clone(), data.stream.clone());

            let context = module_context(source.yaml.as_bytes());
            let build_id: String = ctx
                .side_effect({
                    let db_path = self.db_path.clone();
                    let (package_id, pv, task, project_id) = (
                        package.id.clone(),
                        source.revision.package_version_id.clone(),
                        task_id.to_string(),
                        project.id.clone(),
                    );
                    let batch = options.build_batch_id.clone();
                    move || {
                        let conn = db::open(&db_path)?;
                        let id = Build::create(&conn, &package_id, &pv, &task, &project_id)?;
                        if let Some(batch) = batch {
                            Batch::attach(&conn, &batch, &id)?;
                        }
                        Ok(id)
                    }
                })
                .await?;

            info!("Module {}:{} from {} builds as {}", name, stream, branch, build_id);
            plans.push(StreamPlan {
                dist: module_dist(&platform, increment, &context),
                version: module_version(&platform, &started),
                name,
                stream,
                context,
                increment,
                revision: source.revision,
                build_id,
                document,
            });
        }

        let inputs_ref = &inputs;
        let runs = plans.iter().map(|plan| {
            let scope = ctx.child(&format!("stream-{}", plan.revision.scm_branch_name));
            async move {
                self.build_stream(&scope, req, inputs_ref, plan, options, task_id)
                    .await
                    .map_err(stream_error)
            }
        });
        let (mut streams, mut errors) = (Vec::new(), Vec::new());
        for outcome in join_all(runs).await {
            match outcome {
                Ok(stream) => streams.push(stream),
                Err(e) => errors.push(e),
            }
        }
        if let Some(err) = pick_error(errors) {
            return Err(err);
        }

        let mut response = ModuleBuildTask {
            streams,
            repo_changes: None,
        };
        // The composer reads the streams back from the task response
        finalizer.save_progress(&response).await?;

        if !options.disable_yumrepofs_updates {
            let build_ids = plans.iter().map(|p| p.build_id.clone()).collect();
            let mut update = UpdateRepoRequest::new(&project.id, build_ids);
            update.task_id = Some(task_id.to_string());
            response.repo_changes = Some(self.update_repo(&ctx.child("yumrepofs"), update).await?);
        }
        Ok(response)
    }

    /// Check out every stream revision of the module repository and read its
    /// source document
    async fn read_module_documents(
        &self,
        ctx: &WorkflowContext,
        project: &Project,
        package: &Package,
        revisions: &[ImportRevision],
    ) -> Result<Vec<StreamSource>> {
        let url = format!("{}/modules/{}.git", project.upstream_prefix(), gitlabify(&package.name));
        let file = format!("{}.yaml", package.name);
        ctx.execute_activity(
            "read-module-documents",
            &ActivityOptions::once(Duration::from_secs(600)),
            |actx| {
                let (scm, url, file) = (self.tools.scm.clone(), url.clone(), file.clone());
                let revisions = revisions.to_vec();
                async move {
                    let _alive = actx.keep_alive(HEARTBEAT_INTERVAL);
                    let scratch = tempfile::tempdir()?;
                    let runner = LocalRunner::new(scratch.path());
                    let dir = scratch.path().join("module");
                    scm.clone_repo(&runner, &url, &dir, None)
                        .await
                        .map_err(|e| Error::ActivityFailed(format!("failed to clone module repo: {e}")))?;

                    let mut sources = Vec::with_capacity(revisions.len());
                    for revision in revisions {
                        scm.checkout(&runner, &dir, &revision.scm_hash).await.map_err(|e| {
                            Error::ActivityFailed(format!("failed to checkout revision {}: {e}", revision.scm_hash))
                        })?;
                        let yaml = std::fs::read_to_string(dir.join(&file)).map_err(|e| {
                            Error::ActivityFailed(format!(
                                "could not open yaml file from modules repo in branch {}: {e}",
                                revision.scm_branch_name
                            ))
                        })?;
                        sources.push(StreamSource { revision, yaml });
                    }
                    Ok(sources)
                }
            },
        )
        .await
    }

    /// Build every component of one stream in buildorder and render its
    /// per-arch documents
    async fn build_stream(
        &self,
        ctx: &WorkflowContext,
        req: &BuildRequest,
        inputs: &ModuleInputs,
        plan: &StreamPlan,
        options: &BuildOptions,
        parent: &str,
    ) -> Result<ModuleStream> {
        let project = &inputs.project;
        let data = plan.data()?;
        let macros = plan.macros()?;
        let modules = build_requires_modules(data)?;
        let orders = build_orders(data);

        // Later orders see earlier outputs through a private repository
        let internal: Option<(String, String)> = if orders.len() > 1 {
            let (db_path, project_id) = (self.db_path.clone(), project.id.clone());
            let created: (String, String) = ctx
                .side_effect(move || {
                    let conn = db::open(&db_path)?;
                    let repo = Repository::create_with_packages(
                        &conn,
                        &project_id,
                        &Uuid::new_v4().to_string(),
                        true,
                        Vec::new(),
                    )?;
                    Ok((repo.id, repo.name))
                })
                .await?;
            Some(created)
        } else {
            None
        };
        let extra_repos: Vec<ExtraYumrepofsRepo> = internal
            .iter()
            .map(|(_, name)| ExtraYumrepofsRepo {
                name: name.clone(),
                module_hotfixes: true,
                ignore_exclude: true,
            })
            .collect();

        let mut excludes: Vec<String> = Vec::new();
        let mut builds: Vec<SubmitBuildTask> = Vec::new();
        for (order, names) in &orders {
            info!(
                "Building order {} of {}:{}: {}",
                order,
                plan.name,
                plan.stream,
                names.join(", ")
            );
            let mut pending = Vec::with_capacity(names.len());
            for name in names {
                let component = data
                    .components
                    .as_ref()
                    .and_then(|c| c.rpms.get(name))
                    .ok_or_else(|| Error::InvalidModule(format!("component {name} vanished")))?;
                let task_id = self
                    .create_subtask(ctx, "noarch", TaskType::Build, &project.id, parent)
                    .await?;
                let request = BuildRequest {
                    project_id: project.id.clone(),
                    package_name: name.clone(),
                    scm_hash: (!component.git_ref.is_empty()).then(|| component.git_ref.clone()),
                    side_nvrs: req.side_nvrs.clone(),
                    disable_checks: req.disable_checks,
                    ..Default::default()
                };
                let component_options = BuildOptions {
                    reusable_build_id: Some(plan.build_id.clone()),
                    extra_yumrepofs_repos: extra_repos.clone(),
                    modules: modules.clone(),
                    exclude_packages: excludes.clone(),
                    force_dist: Some(plan.dist.clone()),
                    build_arch_extra_files: BTreeMap::from([(MODULE_MACROS_PATH.to_string(), macros.clone())]),
                    disable_yumrepofs_updates: true,
                    build_batch_id: options.build_batch_id.clone(),
                    ..Default::default()
                };
                pending.push((task_id, request, component_options));
            }

            let runs = pending.into_iter().map(|(task_id, request, component_options)| {
                let scope = ctx.child(&format!("component-{}", request.package_name));
                async move { self.build_package(&scope, request, &task_id, component_options).await }
            });
            let (mut finished, mut errors) = (Vec::new(), Vec::new());
            for outcome in join_all(runs).await {
                match outcome {
                    Ok(build) => finished.push(build),
                    Err(e) => errors.push(e),
                }
            }
            if let Some(err) = pick_error(errors) {
                return Err(err);
            }

            for build in finished {
                for artifact in &build.artifacts {
                    let file = rpmutils::strip_rpm_suffix(rpmutils::basename(artifact));
                    if let Some(nvr) = rpmutils::Nvr::parse(file) {
                        if !excludes.contains(&nvr.name) {
                            excludes.push(nvr.name);
                        }
                    }
                }
                if let Some((repo_id, _)) = &internal {
                    let mut update = UpdateRepoRequest::new(&project.id, vec![build.build_id.clone()]);
                    update.task_id = Some(build.build_task_id.clone());
                    update.force_repo_id = Some(repo_id.clone());
                    update.force_non_modular = true;
                    update.disable_signing = true;
                    update.disable_set_active = true;
                    let scope = ctx.child(&format!("internal-{}", build.package_name));
                    self.update_repo(&scope, update).await?;
                }
                builds.push(build);
            }
        }

        let build_id = plan.build_id.clone();
        let artifacts = self
            .db(move |conn| TaskArtifact::list_for_build(conn, &build_id))
            .await?;
        let (index, licenses) = index_artifacts(&builds, &artifacts)?;
        debug!("Indexed {} artifacts of {}:{}", index.len(), plan.name, plan.stream);

        let mut docs: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let families = &self.config.composer.multilib;
        for arch in &project.archs {
            let multilib_arches = compatible_arches(families, arch);
            let arch_docs = docs.entry(arch.clone()).or_default();
            for devel in [false, true] {
                let (key, document) = stream_document(
                    plan,
                    &inputs.configuration.platform,
                    &project.archs,
                    &index,
                    &licenses,
                    arch,
                    multilib_arches,
                    devel,
                )?;
                arch_docs.insert(key, document);
            }
        }

        Ok(ModuleStream {
            dist: plan.dist.clone(),
            increment: plan.increment,
            name: plan.name.clone(),
            stream: plan.stream.clone(),
            version: plan.version.clone(),
            context: plan.context.clone(),
            import_revision_id: plan.revision.id.clone(),
            build_id: plan.build_id.clone(),
            docs,
            builds,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Import, PackageType, RepositoryRevision, Task, TaskStatus};
    use crate::metadata::codec::decode_stored;
    use crate::metadata::modulemd::decode_modules;
    use crate::metadata::primary::PackageVersion as RpmVersion;
    use crate::workflow::testing::TestEnv;
    use chrono::TimeZone;

    const NODEJS_YAML: &str = r#"---
document: modulemd
version: 2
data:
  name: nodejs
  stream: "18"
  summary: Javascript runtime
  description: Node.js
  license:
    module: [MIT]
  dependencies:
    - buildrequires:
        platform: [el9]
      requires:
        platform: [el9]
  buildopts:
    rpms:
      macros: "%_with_bootstrap 1"
  components:
    rpms:
      nodejs-packaging:
        rationale: build helpers
        ref: p18
        buildorder: 0
      nodejs:
        rationale: runtime
        ref: c18
        buildorder: 1
"#;

    const RELEASE: &str = "1.module+el9.2.0+0+abcdef12";

    fn platform() -> ModulePlatform {
        ModulePlatform {
            major: 9,
            minor: 2,
            patch: 0,
        }
    }

    fn artifact(name: &str, arch: &str, srpm: &str) -> ModuleArtifact {
        ModuleArtifact {
            package: PrimaryPackage {
                name: name.to_string(),
                arch: arch.to_string(),
                version: RpmVersion {
                    epoch: "0".to_string(),
                    ver: "1".to_string(),
                    rel: "1".to_string(),
                },
                ..Default::default()
            },
            srpm_name: srpm.to_string(),
            srpm_nevra: format!("{srpm}-0:1-1.src"),
            ..Default::default()
        }
    }

    fn index(artifacts: Vec<ModuleArtifact>) -> BTreeMap<String, ModuleArtifact> {
        artifacts.into_iter().map(|a| (a.package.nevra(), a)).collect()
    }

    fn data(yaml: &str) -> ModuleData {
        modulemd::parse(yaml.as_bytes()).unwrap().data.unwrap()
    }

    #[test]
    fn test_version_context_and_dist() {
        let at = Utc.with_ymd_and_hms(2023, 10, 15, 12, 0, 0).unwrap();
        assert_eq!(module_version(&platform(), &at), "9020020231015120000");
        assert_eq!(module_context(b"abc"), "a9993e36");
        assert_eq!(module_dist(&platform(), 42, "a9993e36"), "module+el9.2.0+42+a9993e36");
    }

    #[test]
    fn test_stream_macros() {
        let plan = StreamPlan {
            name: "nodejs".to_string(),
            stream: "18".to_string(),
            version: "9020020231015120000".to_string(),
            context: "a9993e36".to_string(),
            dist: "module+el9.2.0+3+a9993e36".to_string(),
            increment: 3,
            revision: ImportRevision::default(),
            build_id: String::new(),
            document: modulemd::parse(NODEJS_YAML.as_bytes()).unwrap(),
        };
        let macros = plan.macros().unwrap();
        assert!(macros.contains("%dist .module+el9.2.0+3+a9993e36\n"));
        assert!(macros.contains("%modularitylabel nodejs:18:9020020231015120000:a9993e36\n"));
        assert!(macros.contains("%_module_build 3\n"));
        assert!(macros.trim_end().ends_with("%_with_bootstrap 1"));
    }

    #[test]
    fn test_stream_revisions_keep_newest_per_branch() {
        let mut project = Project::new("p", 9, vec!["x86_64".to_string()]);
        project.target_branch_prefix = "r".to_string();
        let rev = |branch: &str, hash: &str, modular: bool| ImportRevision {
            scm_branch_name: branch.to_string(),
            scm_hash: hash.to_string(),
            modular,
            ..Default::default()
        };
        let revisions = vec![
            rev("r9-stream-18", "new", true),
            rev("r9-stream-18", "old", true),
            rev("r9-stream-20", "twenty", true),
            rev("r9", "plain", false),
            rev("r8-stream-18", "el8", true),
        ];
        let all = stream_revisions(revisions.clone(), &project, &[]);
        let hashes: Vec<&str> = all.iter().map(|r| r.scm_hash.as_str()).collect();
        assert_eq!(hashes, vec!["new", "twenty"]);

        let only = stream_revisions(revisions, &project, &["r9-stream-20".to_string()]);
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].scm_hash, "twenty");
    }

    #[test]
    fn test_build_requires_and_orders() {
        let mut md = data(NODEJS_YAML);
        assert!(build_requires_modules(&md).unwrap().is_empty());
        let orders = build_orders(&md);
        assert_eq!(orders[&0], vec!["nodejs-packaging"]);
        assert_eq!(orders[&1], vec!["nodejs"]);

        md.dependencies[0]
            .buildrequires
            .insert("python39".to_string(), vec!["3.9".to_string()]);
        assert_eq!(build_requires_modules(&md).unwrap(), vec!["python39:3.9"]);

        md.dependencies[0].buildrequires.insert("perl".to_string(), Vec::new());
        assert!(matches!(build_requires_modules(&md), Err(Error::InvalidModule(_))));
    }

    #[test]
    fn test_rpm_passes_filter() {
        let mut md = data(NODEJS_YAML);
        let families = crate::multilib::default_families();
        let multilib = compatible_arches(&families, "x86_64");

        assert!(rpm_passes_filter(&artifact("nodejs", "x86_64", "nodejs"), &md, "x86_64", multilib));
        assert!(!rpm_passes_filter(&artifact("other", "x86_64", "other"), &md, "x86_64", multilib));
        assert!(!rpm_passes_filter(&artifact("nodejs", "i686", "nodejs"), &md, "x86_64", multilib));

        let components = md.components.as_mut().unwrap();
        components.rpms.get_mut("nodejs").unwrap().multilib = vec!["x86_64".to_string()];
        assert!(rpm_passes_filter(&artifact("nodejs", "i686", "nodejs"), &md, "x86_64", multilib));

        md.filter = Some(modulemd::RpmList {
            rpms: vec!["nodejs-docs".to_string()],
        });
        assert!(!rpm_passes_filter(&artifact("nodejs-docs", "noarch", "nodejs"), &md, "x86_64", multilib));

        let opts = md.build_opts.get_or_insert_with(Default::default);
        opts.rpms.get_or_insert_with(Default::default).whitelist = vec!["nodejs-packaging".to_string()];
        assert!(!rpm_passes_filter(&artifact("nodejs", "x86_64", "nodejs"), &md, "x86_64", multilib));
        assert!(rpm_passes_filter(
            &artifact("nodejs-packaging", "noarch", "nodejs-packaging"),
            &md,
            "x86_64",
            multilib
        ));
    }

    #[test]
    fn test_artifact_rpms_split_plain_and_devel() {
        let mut md = data(NODEJS_YAML);
        md.filter = Some(modulemd::RpmList {
            rpms: vec!["nodejs-devel".to_string()],
        });
        let mut aarch64_only = artifact("nodejs-arm", "aarch64", "nodejs");
        aarch64_only.exclusive_arch = vec!["aarch64".to_string()];
        let index = index(vec![
            artifact("nodejs", "x86_64", "nodejs"),
            artifact("nodejs-debuginfo", "x86_64", "nodejs"),
            artifact("nodejs-devel", "x86_64", "nodejs"),
            artifact("nodejs-devel-debuginfo", "x86_64", "nodejs"),
            artifact("nodejs", "src", "nodejs"),
            artifact("nodejs-packaging", "noarch", "nodejs-packaging"),
            artifact("nodejs-packaging", "src", "nodejs-packaging"),
            aarch64_only,
        ]);
        let families = crate::multilib::default_families();
        let multilib = compatible_arches(&families, "x86_64");

        let plain = artifact_rpms(&md, &index, "x86_64", multilib, false);
        assert_eq!(
            plain,
            vec![
                "nodejs-0:1-1.x86_64",
                "nodejs-debuginfo-0:1-1.x86_64",
                "nodejs-packaging-0:1-1.noarch",
                "nodejs-0:1-1.src",
                "nodejs-packaging-0:1-1.src",
            ]
        );

        let devel = artifact_rpms(&md, &index, "x86_64", multilib, true);
        assert_eq!(devel, vec!["nodejs-devel-0:1-1.x86_64"]);
    }

    #[test]
    fn test_devel_only_source_goes_to_devel() {
        let mut md = data(NODEJS_YAML);
        md.filter = Some(modulemd::RpmList {
            rpms: vec!["nodejs-packaging".to_string()],
        });
        let index = index(vec![
            artifact("nodejs-packaging", "noarch", "nodejs-packaging"),
            artifact("nodejs-packaging", "src", "nodejs-packaging"),
        ]);
        let plain = artifact_rpms(&md, &index, "x86_64", &[], false);
        assert!(plain.is_empty());
        let devel = artifact_rpms(&md, &index, "x86_64", &[], true);
        assert_eq!(devel, vec!["nodejs-packaging-0:1-1.noarch", "nodejs-packaging-0:1-1.src"]);
    }

    /// nodejs module with two components in separate build orders
    fn module_env() -> TestEnv {
        let env = TestEnv::new();
        let conn = env.conn();
        ModuleConfiguration {
            platform: platform(),
            default: Vec::new(),
        }
        .save(&conn, &env.project.id)
        .unwrap();

        let nodejs = env.package("nodejs", PackageType::ModuleFork);
        let pv = env.import_revision(&nodejs, "18.1.0", RELEASE, "r9-stream-18", "c18");
        let task = env.task(TaskType::Import);
        let import = Import::create(
            &conn,
            "https://git.rockylinux.test/staging/modules/nodejs.git",
            &task,
            &nodejs.id,
            &env.project.id,
        )
        .unwrap();
        ImportRevision::create(&conn, &import.id, "m18", "r9-stream-18", &import.scm_url, &pv, true).unwrap();

        let packaging = env.package("nodejs-packaging", PackageType::ModuleForkComponent);
        env.import_revision(&packaging, "2", RELEASE, "r9-stream-18", "p18");

        let modules = env.path("fixtures/modules/nodejs");
        std::fs::create_dir_all(&modules).unwrap();
        std::fs::write(modules.join("nodejs.yaml"), NODEJS_YAML).unwrap();
        env.scm
            .add_remote("https://git.rockylinux.test/staging/modules/nodejs.git", &modules);
        for name in ["nodejs", "nodejs-packaging"] {
            let fixture = env.path(&format!("fixtures/rpms/{name}"));
            std::fs::create_dir_all(fixture.join("SPECS")).unwrap();
            std::fs::write(fixture.join(format!("SPECS/{name}.spec")), format!("Name: {name}\n")).unwrap();
            env.scm
                .add_remote(&format!("https://git.rockylinux.test/staging/rpms/{name}.git"), &fixture);
        }
        env.mock.set_spec_srpm("nodejs", "18.1.0", RELEASE);
        env.mock.set_spec_srpm("nodejs-packaging", "2", RELEASE);

        Repository::new(&env.project.id, "AppStream").insert(&conn).unwrap();
        env
    }

    fn module_request(env: &TestEnv) -> BuildRequest {
        BuildRequest {
            project_id: env.project.id.clone(),
            package_name: "nodejs".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_module_build_publishes_stream() {
        let env = module_env();
        let response = env
            .controller
            .submit_module_build(module_request(&env), BuildOptions::default(), None)
            .await
            .unwrap();

        assert_eq!(response.streams.len(), 1);
        let stream = &response.streams[0];
        assert_eq!((stream.name.as_str(), stream.stream.as_str()), ("nodejs", "18"));
        assert_eq!(stream.context, module_context(NODEJS_YAML.as_bytes()));
        assert_eq!(stream.dist, format!("module+el9.2.0+0+{}", stream.context));
        assert!(stream.version.starts_with("90200"));
        let built: Vec<&str> = stream.builds.iter().map(|b| b.package_name.as_str()).collect();
        assert_eq!(built, vec!["nodejs-packaging", "nodejs"]);

        let plain = modulemd::parse(stream.docs["x86_64"]["18"].as_bytes()).unwrap();
        let plain = plain.data().unwrap();
        assert_eq!(plain.arch, "x86_64");
        assert_eq!(plain.dependencies[0].buildrequires["platform"], vec!["el9.2.0"]);
        let rpms = plain.artifact_rpms();
        assert!(rpms.contains(&format!("nodejs-0:18.1.0-{RELEASE}.x86_64")));
        assert!(rpms.contains(&format!("nodejs-packaging-0:2-{RELEASE}.x86_64")));
        assert!(rpms.contains(&format!("nodejs-0:18.1.0-{RELEASE}.src")));
        let devel = modulemd::parse(stream.docs["x86_64"]["18-devel"].as_bytes()).unwrap();
        assert_eq!(devel.data().unwrap().name, "nodejs-devel");

        // Both components reached their arch build
        let arch_builds: Vec<_> = env
            .mock
            .invocations()
            .into_iter()
            .filter(|i| i.mode == crate::tools::MockMode::Binary)
            .collect();
        assert_eq!(arch_builds.len(), 2);
        assert!(arch_builds.iter().all(|i| i.input.to_string_lossy().contains(RELEASE)));

        let conn = env.conn();
        let internal = Repository::list_all(&conn, &env.project.id)
            .unwrap()
            .into_iter()
            .find(|r| Uuid::parse_str(&r.name).is_ok())
            .unwrap();
        assert!(internal.internal_only);
        assert!(RepositoryRevision::latest(&conn, &internal.id, "x86_64").unwrap().is_some());

        let appstream = Repository::find_by_name(&conn, &env.project.id, "AppStream").unwrap().unwrap();
        let revision = RepositoryRevision::latest(&conn, &appstream.id, "x86_64").unwrap().unwrap();
        let raw = decode_stored(&revision.modules_yaml).unwrap().unwrap();
        let published: Vec<(String, String)> = decode_modules(&raw)
            .unwrap()
            .iter()
            .filter_map(|m| m.name_stream().map(|(n, s)| (n.to_string(), s.to_string())))
            .collect();
        assert!(published.contains(&("nodejs".to_string(), "18".to_string())));
        assert!(published.contains(&("nodejs-devel".to_string(), "18".to_string())));

        let task = Task::find_by_build_id(&conn, &stream.build_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Succeeded);
        assert!(response.repo_changes.is_some());
    }

    #[tokio::test]
    async fn test_module_without_stream_revisions_fails() {
        let env = module_env();
        let mut req = module_request(&env);
        req.branches = vec!["r9-stream-20".to_string()];
        let err = env
            .controller
            .submit_module_build(req, BuildOptions::default(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no stream revisions found for module nodejs"));
    }

    #[tokio::test]
    async fn test_module_without_components_is_invalid() {
        let env = module_env();
        std::fs::write(
            env.path("fixtures/modules/nodejs/nodejs.yaml"),
            "document: modulemd\nversion: 2\ndata:\n  stream: \"18\"\n",
        )
        .unwrap();
        let err = env
            .controller
            .submit_module_build(module_request(&env), BuildOptions::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidModule(ref name) if name == "nodejs"));
    }

    #[tokio::test]
    async fn test_plain_package_is_not_a_module() {
        let env = module_env();
        env.package("bash", PackageType::NormalFork);
        let req = BuildRequest {
            project_id: env.project.id.clone(),
            package_name: "bash".to_string(),
            ..Default::default()
        };
        let err = env
            .controller
            .submit_module_build(req, BuildOptions::default(), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("package bash is not a module"));
    }
}
