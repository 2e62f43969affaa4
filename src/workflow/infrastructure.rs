// src/workflow/infrastructure.rs

//! Sandbox provisioning and teardown
//!
//! Every SRPM and arch build runs in a sandbox of its own. Provisioning and
//! destruction are recorded as `worker-provision` / `worker-destroy`
//! subtasks of the task the sandbox serves, and the sandbox log is followed
//! into that task's log stream for as long as the sandbox lives.

use super::Controller;
use crate::db::models::{Project, Task, TaskType};
use crate::error::{Error, Result};
use crate::orchestrator::{ActivityOptions, DOMAIN_TASKS, TaskFinalizer, WorkflowContext};
use crate::worker::logs::{self, LogSink};
use crate::worker::{self, CommandRunner, Provisioner, Sandbox, SandboxPhase, SandboxSpec};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const PHASE_POLL: Duration = Duration::from_secs(1);

/// A running sandbox and its log follower
pub struct ProvisionedWorker {
    pub sandbox: Sandbox,
    pub runner: Arc<dyn CommandRunner>,
    spec: SandboxSpec,
    stop_logs: watch::Sender<bool>,
    ingest: JoinHandle<Result<usize>>,
}

impl ProvisionedWorker {
    pub fn spec(&self) -> &SandboxSpec {
        &self.spec
    }

    /// Stop following the log and wait for the remaining lines to land
    async fn stop_ingest(self) -> (Sandbox, SandboxSpec) {
        let _ = self.stop_logs.send(true);
        match self.ingest.await {
            Ok(Ok(lines)) => info!("Sandbox {} produced {} log lines", self.sandbox.name, lines),
            Ok(Err(e)) => warn!("Log ingest for {} failed: {}", self.sandbox.name, e),
            Err(e) => warn!("Log ingest for {} panicked: {}", self.sandbox.name, e),
        }
        (self.sandbox, self.spec)
    }
}

/// Wait until a freshly created sandbox is usable
async fn wait_running(
    provisioner: &dyn Provisioner,
    sandbox: &Sandbox,
    heartbeat: impl Fn() -> Result<()>,
) -> Result<()> {
    loop {
        heartbeat()?;
        match provisioner.phase(sandbox).await? {
            SandboxPhase::Running | SandboxPhase::Succeeded => return Ok(()),
            SandboxPhase::Failed => {
                return Err(Error::PodFailed(format!("sandbox {} failed", sandbox.name)));
            }
            SandboxPhase::Pending | SandboxPhase::Unknown => tokio::time::sleep(PHASE_POLL).await,
        }
    }
}

impl Controller {
    /// Provision a sandbox for `spec`.
    ///
    /// `spec.arch` may be `noarch`; the concrete arch is drawn from the
    /// project's arches and recorded so a replay lands on the same one.
    pub async fn provision_worker(&self, ctx: &WorkflowContext, spec: SandboxSpec) -> Result<ProvisionedWorker> {
        let preferred = self.config.worker.noarch_arches.clone();
        let (project_id, requested) = (spec.project_id.clone(), spec.arch.clone());
        let arch: String = ctx
            .side_effect({
                let db_path = self.db_path.clone();
                move || {
                    let conn = crate::db::open(&db_path)?;
                    let project = Project::resolve(&conn, &project_id)?;
                    worker::placement_arch(&requested, &project.archs, &preferred)
                }
            })
            .await?;
        let spec = SandboxSpec { arch, ..spec };

        let task_id: String = ctx
            .side_effect({
                let db_path = self.db_path.clone();
                let (project_id, parent) = (spec.project_id.clone(), spec.task_id.clone());
                move || {
                    let conn = crate::db::open(&db_path)?;
                    let task = Task::new("noarch", TaskType::WorkerProvision, Some(&project_id), Some(&parent));
                    task.insert(&conn)?;
                    Ok(task.id)
                }
            })
            .await?;
        let finalizer = TaskFinalizer::start(self.db_path.clone(), &task_id, DOMAIN_TASKS).await?;

        let outcome = ctx
            .execute_activity("provision-worker", &ActivityOptions::worker(), |actx| {
                let provisioner = self.provisioner.clone();
                let spec = spec.clone();
                async move {
                    let sandbox = provisioner.provision(&spec).await?;
                    if let Err(e) = wait_running(provisioner.as_ref(), &sandbox, || actx.heartbeat()).await {
                        let _ = provisioner.destroy(&sandbox).await;
                        return Err(e);
                    }
                    Ok(sandbox)
                }
            })
            .await;
        let sandbox = finalizer.close(outcome).await?;

        let queue = worker::queue_for(&spec.arch, &self.config.worker.ext_arches);
        info!(
            "Sandbox {} ready on {} ({}) for task {}",
            sandbox.name, spec.arch, queue, spec.task_id
        );

        let (stop_logs, stop_rx) = watch::channel(false);
        let sink = LogSink {
            db_path: self.db_path.clone(),
            task_id: spec.task_id.clone(),
            parent_task_id: Some(spec.parent_task_id.clone()),
            batch: self.config.worker.log_batch,
        };
        let ingest = tokio::spawn(logs::ingest(self.provisioner.clone(), sandbox.clone(), sink, stop_rx));

        Ok(ProvisionedWorker {
            runner: self.provisioner.runner(&sandbox),
            sandbox,
            spec,
            stop_logs,
            ingest,
        })
    }

    /// Tear a sandbox down.
    ///
    /// Runs in its own workflow scope so a canceled parent still cleans up.
    /// Destroy failures are logged and the destroy task still succeeds.
    pub async fn destroy_worker(&self, ctx: &WorkflowContext, worker: ProvisionedWorker) -> Result<()> {
        let (sandbox, spec) = worker.stop_ingest().await;
        let scope = self.workflow(&format!("{}/destroy-{}", ctx.workflow_id(), sandbox.name));

        let task_id: String = scope
            .side_effect({
                let db_path = self.db_path.clone();
                let (project_id, parent) = (spec.project_id.clone(), spec.task_id.clone());
                move || {
                    let conn = crate::db::open(&db_path)?;
                    let task = Task::new("noarch", TaskType::WorkerDestroy, Some(&project_id), Some(&parent));
                    task.insert(&conn)?;
                    Ok(task.id)
                }
            })
            .await?;
        let finalizer = TaskFinalizer::start(self.db_path.clone(), &task_id, DOMAIN_TASKS).await?;

        let destroyed = scope
            .execute_activity("destroy-worker", &ActivityOptions::worker(), |_| {
                let provisioner = self.provisioner.clone();
                let sandbox = sandbox.clone();
                async move { provisioner.destroy(&sandbox).await }
            })
            .await;
        if let Err(e) = destroyed {
            warn!("Could not destroy sandbox {}: {}", sandbox.name, e);
        }
        finalizer.close(Ok(())).await
    }

    /// Run `body` on a fresh sandbox and always destroy it afterwards
    pub async fn with_worker<T, F, Fut>(&self, ctx: &WorkflowContext, spec: SandboxSpec, body: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn CommandRunner>, Sandbox) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let worker = self.provision_worker(ctx, spec).await?;
        let outcome = body(worker.runner.clone(), worker.sandbox.clone()).await;
        self.destroy_worker(ctx, worker).await?;
        outcome
    }
}
