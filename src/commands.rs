// src/commands.rs
//! Command handlers for the builder CLI

use crate::cli::{BuildArgs, ProjectCommands, TaskCommands};
use anyhow::{Context, Result};
use peridot_builder::db::{
    self,
    models::{Key, Project, Repository, Task, TaskLog},
};
use peridot_builder::metadata::codec::b64_encode;
use peridot_builder::workflow::{
    BuildOptions, BuildRequest, CloneSwapRequest, HashedRepositoriesRequest, ImportRequest, LookasideUploadRequest,
    RpmLookasideBatchImportRequest, SyncCatalogRequest, UpdateInfoRequest, UpdateRepoRequest,
};
use peridot_builder::{BuilderConfig, Controller, Environment, server, store};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Print a workflow response as pretty JSON
fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open_controller(config: BuilderConfig) -> Result<Controller> {
    Ok(Controller::open(config, Environment::from_env())?)
}

fn open_db(config: &BuilderConfig) -> Result<rusqlite::Connection> {
    Ok(db::open(&config.database.path)?)
}

pub fn cmd_init(config: &BuilderConfig) -> Result<()> {
    info!("Initializing task store at: {}", config.database.path.display());
    db::init(&config.database.path)?;
    store::open(&config.storage)?;
    println!("Task store initialized at: {}", config.database.path.display());
    Ok(())
}

pub async fn cmd_serve(mut config: BuilderConfig, bind: Option<String>) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    db::init(&config.database.path)?;
    let store = store::open(&config.storage)?;
    server::run_server(&config, store).await
}

pub fn cmd_project(config: &BuilderConfig, command: ProjectCommands) -> Result<()> {
    match command {
        ProjectCommands::Create {
            name,
            major_version,
            archs,
            target_host,
            target_prefix,
            source_host,
            source_prefix,
            stream_mode,
            public_key,
            gpg_id,
        } => {
            let public_key = public_key
                .map(|path| {
                    std::fs::read_to_string(&path)
                        .with_context(|| format!("Failed to read public key: {}", path.display()))
                })
                .transpose()?;

            let mut conn = open_db(config)?;
            let project = db::transaction(&mut conn, |tx| {
                let mut project = Project::new(&name, major_version, archs);
                project.target_gitlab_host = target_host;
                project.target_prefix = target_prefix;
                project.source_git_host = source_host;
                project.source_prefix = source_prefix;
                project.stream_mode = stream_mode;
                project.insert(tx)?;

                if let (Some(public_key), Some(gpg_id)) = (public_key, gpg_id) {
                    let key = Key::new(&project.name, "", &gpg_id, &public_key);
                    key.insert(tx)?;
                    Key::attach_to_project(tx, &project.id, &key.id, true)?;
                    info!("Attached key {} to project {}", gpg_id, project.name);
                }
                Ok(project)
            })?;
            info!("Created project {} ({})", project.name, project.id);
            print_json(&project)
        }
        ProjectCommands::Show { project } => {
            let conn = open_db(config)?;
            let project = Project::resolve(&conn, &project)?;
            print_json(&project)
        }
    }
}

pub async fn cmd_import(
    config: BuilderConfig,
    project: String,
    package: String,
    inactive: bool,
    submitter: Option<String>,
) -> Result<()> {
    let controller = open_controller(config)?;
    let req = ImportRequest {
        project_id: project,
        package_name: package,
        version_release: None,
        set_inactive: inactive,
    };
    print_json(&controller.submit_import(req, submitter).await?)
}

fn build_request(args: BuildArgs, module_variant: bool) -> BuildRequest {
    BuildRequest {
        project_id: args.project,
        package_name: args.package,
        scm_hash: args.scm_hash,
        side_nvrs: args.side_nvrs,
        disable_checks: args.disable_checks,
        set_inactive: args.inactive,
        branches: args.branches,
        module_variant,
    }
}

pub async fn cmd_build(config: BuilderConfig, args: BuildArgs, submitter: Option<String>) -> Result<()> {
    let controller = open_controller(config)?;
    let req = build_request(args, false);
    print_json(&controller.submit_build(req, BuildOptions::default(), submitter).await?)
}

pub async fn cmd_build_module(config: BuilderConfig, args: BuildArgs, submitter: Option<String>) -> Result<()> {
    let controller = open_controller(config)?;
    let req = build_request(args, true);
    print_json(&controller.submit_module_build(req, BuildOptions::default(), submitter).await?)
}

pub struct UpdateRepoArgs {
    pub project: String,
    pub build_ids: Vec<String>,
    pub repo: Option<String>,
    pub delete: bool,
    pub force_non_modular: bool,
    pub no_sign: bool,
    pub no_delete_previous: bool,
}

pub async fn cmd_update_repo(config: BuilderConfig, args: UpdateRepoArgs) -> Result<()> {
    let (project_id, force_repo_id) = {
        let conn = open_db(&config)?;
        let project = Project::resolve(&conn, &args.project)?;
        let repo_id = match &args.repo {
            Some(name) => Some(
                Repository::find_by_name(&conn, &project.id, name)?
                    .with_context(|| format!("repository {} not found in {}", name, project.name))?
                    .id,
            ),
            None => None,
        };
        (project.id, repo_id)
    };

    let controller = open_controller(config)?;
    let req = UpdateRepoRequest {
        force_repo_id,
        delete: args.delete,
        force_non_modular: args.force_non_modular,
        disable_signing: args.no_sign,
        no_delete_previous: args.no_delete_previous,
        ..UpdateRepoRequest::new(&project_id, args.build_ids)
    };
    let ctx = controller.workflow(&db::new_id());
    print_json(&controller.update_repo(&ctx, req).await?)
}

pub async fn cmd_sync_catalog(
    config: BuilderConfig,
    project: String,
    scm_url: String,
    branch: String,
    submitter: Option<String>,
) -> Result<()> {
    let controller = open_controller(config)?;
    let req = SyncCatalogRequest {
        project_id: project,
        scm_url,
        branch,
    };
    print_json(&controller.submit_sync_catalog(req, submitter).await?)
}

fn read_b64(path: &Path) -> Result<String> {
    let content = std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    Ok(b64_encode(&content))
}

pub async fn cmd_rpm_import(
    config: BuilderConfig,
    project: String,
    files: Vec<PathBuf>,
    force: bool,
    submitter: Option<String>,
) -> Result<()> {
    let controller = open_controller(config)?;
    let mut lookaside_blobs = Vec::with_capacity(files.len());
    for file in &files {
        let upload = LookasideUploadRequest {
            project_id: Some(project.clone()),
            file: read_b64(file)?,
        };
        let uploaded = controller.submit_lookaside_upload(upload, submitter.clone()).await?;
        info!("Staged {} as {}", file.display(), uploaded.digest);
        lookaside_blobs.push(uploaded.digest);
    }

    let req = RpmLookasideBatchImportRequest {
        project_id: project,
        lookaside_blobs,
        force_override: force,
    };
    print_json(&controller.submit_rpm_batch_import(req, submitter).await?)
}

pub async fn cmd_lookaside_upload(
    config: BuilderConfig,
    file: PathBuf,
    project: Option<String>,
    submitter: Option<String>,
) -> Result<()> {
    let controller = open_controller(config)?;
    let req = LookasideUploadRequest {
        project_id: project,
        file: read_b64(&file)?,
    };
    print_json(&controller.submit_lookaside_upload(req, submitter).await?)
}

pub async fn cmd_clone_swap(
    config: BuilderConfig,
    target: String,
    source: String,
    submitter: Option<String>,
) -> Result<()> {
    let controller = open_controller(config)?;
    let req = CloneSwapRequest {
        target_project_id: target,
        src_project_id: source,
    };
    print_json(&controller.submit_clone_swap(req, submitter).await?)
}

pub async fn cmd_hashed_repos(
    config: BuilderConfig,
    project: String,
    repositories: Vec<String>,
    submitter: Option<String>,
) -> Result<()> {
    let controller = open_controller(config)?;
    let req = HashedRepositoriesRequest {
        project_id: project,
        repositories,
    };
    print_json(&controller.submit_hashed_repositories(req, submitter).await?)
}

pub async fn cmd_update_info(
    config: BuilderConfig,
    project: String,
    product: String,
    submitter: Option<String>,
) -> Result<()> {
    let controller = open_controller(config)?;
    let req = UpdateInfoRequest {
        project_id: project,
        product_name: product,
    };
    print_json(&controller.submit_update_info(req, submitter).await?)
}

pub fn cmd_task(config: &BuilderConfig, command: TaskCommands) -> Result<()> {
    let conn = open_db(config)?;
    match command {
        TaskCommands::Show { id } => {
            let tasks = Task::tree(&conn, &id, None)?;
            if tasks.is_empty() {
                anyhow::bail!("task {} not found", id);
            }
            print_json(&tasks)
        }
        TaskCommands::Logs { id, offset, tree } => {
            let lines = if tree {
                TaskLog::list(&conn, None, Some(&id), offset)?
            } else {
                TaskLog::list(&conn, Some(&id), None, offset)?
            };
            for (_, line) in lines {
                println!("{}", line);
            }
            Ok(())
        }
    }
}
