// src/workflow/lookaside.rs

//! Lookaside uploads: content-addressed source blobs

use super::Controller;
use crate::db::models::{Project, Task, TaskType};
use crate::error::Result;
use crate::metadata::codec::{b64_decode, sha256_hex};
use crate::orchestrator::{ActivityOptions, DOMAIN_TASKS, TaskFinalizer, WorkflowContext};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookasideUploadRequest {
    /// Project the upload task is recorded under
    #[serde(default)]
    pub project_id: Option<String>,
    /// Base64 file content
    pub file: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookasideUploadTask {
    /// sha256 hex of the content, which is also its store key
    pub digest: String,
}

impl Controller {
    pub async fn submit_lookaside_upload(
        &self,
        req: LookasideUploadRequest,
        submitter: Option<String>,
    ) -> Result<LookasideUploadTask> {
        let project_ref = req.project_id.clone();
        let (project_id, task_id) = self
            .tx(move |tx| {
                let project_id = match project_ref {
                    Some(reference) => Some(Project::resolve(tx, &reference)?.id),
                    None => None,
                };
                let task = Task::new("noarch", TaskType::LookasideUpload, project_id.as_deref(), None)
                    .with_submitter(submitter);
                task.insert(tx)?;
                Ok((project_id, task.id))
            })
            .await?;
        let req = LookasideUploadRequest { project_id, ..req };
        let ctx = self.workflow(&task_id);
        self.lookaside_upload(&ctx, req, &task_id).await
    }

    pub async fn lookaside_upload(
        &self,
        ctx: &WorkflowContext,
        req: LookasideUploadRequest,
        task_id: &str,
    ) -> Result<LookasideUploadTask> {
        let finalizer = TaskFinalizer::start(self.db_path.clone(), task_id, DOMAIN_TASKS).await?;
        let outcome = ctx
            .execute_activity(
                "lookaside-upload",
                &ActivityOptions::once(Duration::from_secs(60 * 60)),
                |actx| {
                    let file = req.file.clone();
                    async move {
                        let _alive = actx.keep_alive(Duration::from_secs(4));
                        let store = self.store.clone();
                        tokio::task::spawn_blocking(move || {
                            let content = b64_decode(&file)?;
                            let digest = sha256_hex(&content);
                            if store.exists(&digest)? {
                                debug!("Lookaside {} already present", digest);
                            } else {
                                store.put(&digest, &content)?;
                                info!("Uploaded lookaside {} ({} bytes)", digest, content.len());
                            }
                            Ok(LookasideUploadTask { digest })
                        })
                        .await?
                    }
                },
            )
            .await;
        finalizer.close(outcome).await
    }
}
