// src/workflow/clone_swap.rs

//! Clone-swap: copy a project's published repositories into another
//! project, then layer the target's own builds on top.

use super::{Controller, UpdateRepoRequest};
use crate::db::{
    self,
    models::{Build, Project, Repository, RepositoryRevision, Task, TaskType},
};
use crate::error::Result;
use crate::orchestrator::{ActivityOptions, DOMAIN_TASKS, TaskFinalizer, WorkflowContext};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// Builds composed per repository update
const LAYER_BATCH_SIZE: usize = 200;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneSwapRequest {
    pub target_project_id: String,
    pub src_project_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneSwapTask {
    pub target_project_id: String,
    pub src_project_id: String,
    pub build_ids_layered: Vec<String>,
}

/// Output of the copy step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CopiedRepositories {
    batches: Vec<Vec<String>>,
    log: Vec<String>,
}

/// Every arch a repository may carry revisions for
fn clone_arches(archs: &[String]) -> Vec<String> {
    let mut arches: Vec<String> = archs.to_vec();
    arches.push("src".to_string());
    let debug: Vec<String> = arches.iter().map(|a| format!("{a}-debug")).collect();
    arches.extend(debug);
    arches
}

fn copy_repositories(conn: &Connection, src: &Project, target: &Project) -> Result<CopiedRepositories> {
    let mut log = Vec::new();
    for src_repo in Repository::find_for_project(conn, &src.id, None, false)? {
        log.push(format!("Processing {}/{}", src.name, src_repo.name));
        let target_repo = match Repository::find_by_name(conn, &target.id, &src_repo.name)? {
            Some(repo) => repo,
            None => {
                let repo = Repository::create_with_packages(conn, &target.id, &src_repo.name, false, src_repo.packages.clone())?;
                log.push(format!("Created {}/{}", target.name, repo.name));
                repo
            }
        };

        for arch in clone_arches(&src.archs) {
            let Some(latest) = RepositoryRevision::latest(conn, &src_repo.id, &arch)? else {
                log.push(format!(
                    "Skipping {}/{}/{} because it has no active revisions",
                    src.name, src_repo.name, arch
                ));
                continue;
            };
            let mut copy = RepositoryRevision {
                id: db::new_id(),
                repository_id: target_repo.id.clone(),
                ..latest
            };
            copy.create(conn)?;
            log.push(format!("Created revision {} for {}/{}/{}", copy.id, target.name, src_repo.name, arch));
        }
    }

    let builds = Build::successful_ids_asc(conn, &target.id)?;
    let batches: Vec<Vec<String>> = builds.chunks(LAYER_BATCH_SIZE).map(|c| c.to_vec()).collect();
    log.push(format!("Created {} batches", batches.len()));
    log.push("Following builds will be synced:".to_string());
    log.extend(builds.iter().map(|id| format!("\t* {id}")));
    Ok(CopiedRepositories { batches, log })
}

impl Controller {
    pub async fn submit_clone_swap(&self, req: CloneSwapRequest, submitter: Option<String>) -> Result<CloneSwapTask> {
        let (target, src) = (req.target_project_id.clone(), req.src_project_id.clone());
        let (req, task_id) = self
            .tx(move |tx| {
                let target = Project::resolve(tx, &target)?;
                let src = Project::resolve(tx, &src)?;
                let task = Task::new("noarch", TaskType::CloneSwap, Some(&target.id), None).with_submitter(submitter);
                task.insert(tx)?;
                let req = CloneSwapRequest {
                    target_project_id: target.id,
                    src_project_id: src.id,
                };
                Ok((req, task.id))
            })
            .await?;
        let ctx = self.workflow(&task_id);
        self.clone_swap(&ctx, req, &task_id).await
    }

    pub async fn clone_swap(&self, ctx: &WorkflowContext, req: CloneSwapRequest, task_id: &str) -> Result<CloneSwapTask> {
        let finalizer = TaskFinalizer::start(self.db_path.clone(), task_id, DOMAIN_TASKS).await?;
        let outcome = async {
            let copied: CopiedRepositories = ctx
                .execute_activity("clone-swap", &ActivityOptions::once(Duration::from_secs(60 * 60)), |_actx| {
                    let req = req.clone();
                    async move {
                        self.tx(move |tx| {
                            let src = Project::resolve(tx, &req.src_project_id)?;
                            let target = Project::resolve(tx, &req.target_project_id)?;
                            copy_repositories(tx, &src, &target)
                        })
                        .await
                    }
                })
                .await?;
            finalizer.log(copied.log).await?;

            for (i, batch) in copied.batches.iter().enumerate() {
                info!("Layering batch {} of {}", i + 1, copied.batches.len());
                let mut update = UpdateRepoRequest::new(&req.target_project_id, batch.clone());
                update.task_id = Some(task_id.to_string());
                update.no_delete_previous = true;
                self.update_repo(&ctx.child(&format!("yumrepofs-{i}")), update).await?;
            }

            Ok(CloneSwapTask {
                target_project_id: req.target_project_id.clone(),
                src_project_id: req.src_project_id.clone(),
                build_ids_layered: copied.batches.concat(),
            })
        }
        .await;
        finalizer.close(outcome).await
    }
}
