// src/workflow/updateinfo.rs

//! Errata ingestion
//!
//! Fetches `updateinfo.xml` for every published repository and arch of a
//! project and appends a revision that differs from the latest one only in
//! its `updateinfo` payload and repomd entry.

use super::Controller;
use super::composer::derive_revision;
use crate::db::{
    self,
    models::{ALL_REPOSITORY, Project, Repository, RepositoryRevision, Task, TaskType},
};
use crate::error::{Error, Result};
use crate::metadata::codec::{PayloadDigest, b64_encode, compress_gz};
use crate::metadata::repomd::{RepomdData, blob_href};
use crate::metadata::updateinfo::decode_updateinfo;
use crate::orchestrator::{ActivityContext, ActivityOptions, DOMAIN_TASKS, TaskFinalizer, WorkflowContext};
use crate::tools::updateinfo_url;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfoRequest {
    pub project_id: String,
    /// Product name on the errata source; `$arch` is substituted per arch
    pub product_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfoTask {
    /// `<repo>-<arch>` pairs that received a new revision
    pub updated: Vec<String>,
    pub advisories: usize,
}

/// A fetched document waiting to be attached
struct FetchedUpdateInfo {
    repository_id: String,
    repository_name: String,
    arch: String,
    xml: Vec<u8>,
}

fn attach_updateinfo(conn: &Connection, fetched: &FetchedUpdateInfo) -> Result<Option<String>> {
    let Some(latest) = RepositoryRevision::latest(conn, &fetched.repository_id, &fetched.arch)? else {
        warn!(
            "No revision for {}-{}, skipping updateinfo",
            fetched.repository_name, fetched.arch
        );
        return Ok(None);
    };

    let gz = compress_gz(&fetched.xml)?;
    let digest = PayloadDigest::of(&fetched.xml, &gz);
    let id = db::new_id();
    let entry = RepomdData::compressed(
        "updateinfo",
        blob_href(&id, "UPDATEINFO"),
        &digest,
        chrono::Utc::now().timestamp(),
    );
    let previous = RepositoryRevision {
        updateinfo_xml: b64_encode(&gz),
        ..latest
    };
    let revision = derive_revision(conn, &previous, &id, vec![entry])?;
    Ok(Some(revision.id))
}

impl Controller {
    pub async fn submit_update_info(&self, req: UpdateInfoRequest, submitter: Option<String>) -> Result<UpdateInfoTask> {
        let project_ref = req.project_id.clone();
        let (project_id, task_id) = self
            .tx(move |tx| {
                let project = Project::resolve(tx, &project_ref)?;
                let task = Task::new("noarch", TaskType::UpdateInfo, Some(&project.id), None).with_submitter(submitter);
                task.insert(tx)?;
                Ok((project.id, task.id))
            })
            .await?;
        let req = UpdateInfoRequest { project_id, ..req };
        let ctx = self.workflow(&task_id);
        self.update_info(&ctx, req, &task_id).await
    }

    pub async fn update_info(&self, ctx: &WorkflowContext, req: UpdateInfoRequest, task_id: &str) -> Result<UpdateInfoTask> {
        let finalizer = TaskFinalizer::start(self.db_path.clone(), task_id, DOMAIN_TASKS).await?;
        let outcome = ctx
            .execute_activity("set-update-info", &ActivityOptions::composer(), |actx| {
                let req = req.clone();
                async move { self.set_update_info(&actx, &req).await }
            })
            .await;
        finalizer.close(outcome).await
    }

    async fn set_update_info(&self, actx: &ActivityContext, req: &UpdateInfoRequest) -> Result<UpdateInfoTask> {
        let _alive = actx.keep_alive(Duration::from_secs(10));
        let lease = self.leases.acquire(&req.project_id).await?;

        let project_id = req.project_id.clone();
        let (project, repositories) = self
            .db(move |conn| {
                let project = Project::find_by_id(conn, &project_id)?
                    .ok_or_else(|| Error::NotFound(format!("project {project_id}")))?;
                let repositories = Repository::find_for_project(conn, &project.id, None, false)?;
                Ok((project, repositories))
            })
            .await?;

        let mut ret = UpdateInfoTask::default();
        let mut fetched = Vec::new();
        for repo in repositories.iter().filter(|r| r.name != ALL_REPOSITORY) {
            for arch in &project.archs {
                let url = updateinfo_url(&self.config.updateinfo.base_url, &req.product_name, arch, &repo.name)?;
                let Some(xml) = self.tools.updateinfo.fetch(&url).await? else {
                    continue;
                };
                let advisories = decode_updateinfo(&xml)?.updates.len();
                info!("Got {} advisories for {}/{}", advisories, repo.name, arch);
                ret.advisories += advisories;
                fetched.push(FetchedUpdateInfo {
                    repository_id: repo.id.clone(),
                    repository_name: repo.name.clone(),
                    arch: arch.clone(),
                    xml,
                });
            }
        }

        let updated = self
            .tx(move |tx| {
                let mut updated = Vec::new();
                for item in &fetched {
                    if attach_updateinfo(tx, item)?.is_some() {
                        updated.push(format!("{}-{}", item.repository_name, item.arch));
                    }
                }
                Ok(updated)
            })
            .await;
        tokio::task::spawn_blocking(move || lease.release()).await??;
        ret.updated = updated?;
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::codec::{b64_decode, decode_stored};
    use crate::metadata::repomd::{RepomdRoot, decode_repomd, encode_repomd};
    use crate::workflow::testing::TestEnv;

    const ADVISORY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<updates>
  <update from="releng@rockylinux.org" status="final" type="security" version="2">
    <id>RLSA-2023:1234</id>
    <title>Important: bash security update</title>
  </update>
</updates>"#;

    fn seed_revision(env: &TestEnv, repo_name: &str) -> (Repository, RepositoryRevision) {
        let conn = env.conn();
        let repo = Repository::create_with_packages(&conn, &env.project.id, repo_name, false, vec!["bash".into()]).unwrap();
        let id = db::new_id();
        let mut revision = RepositoryRevision::new(&id, &repo.id, "x86_64");
        revision.repomd_xml = b64_encode(&encode_repomd(&RepomdRoot::new(id.clone())).unwrap());
        revision.primary_xml = "cHJpbWFyeQ==".to_string();
        revision.create(&conn).unwrap();
        (repo, revision)
    }

    fn product_url(env: &TestEnv, repo: &str) -> String {
        updateinfo_url(&env.controller.config.updateinfo.base_url, "Rocky Linux 9 $arch", "x86_64", repo).unwrap()
    }

    #[test]
    fn test_product_url_substitutes_arch() {
        let env = TestEnv::new();
        let url = product_url(&env, "BaseOS");
        assert!(url.ends_with("/Rocky%20Linux%209%20x86_64/BaseOS/updateinfo.xml"));
    }

    #[tokio::test]
    async fn test_update_info_replaces_only_updateinfo() {
        let env = TestEnv::new();
        let (baseos, seeded) = seed_revision(&env, "BaseOS");
        seed_revision(&env, "AppStream");
        env.updateinfo
            .documents
            .lock()
            .unwrap()
            .insert(product_url(&env, "BaseOS"), ADVISORY.as_bytes().to_vec());

        let req = UpdateInfoRequest {
            project_id: env.project.name.clone(),
            product_name: "Rocky Linux 9 $arch".to_string(),
        };
        let task = env.controller.submit_update_info(req.clone(), None).await.unwrap();
        assert_eq!(task.updated, vec!["BaseOS-x86_64"]);
        assert_eq!(task.advisories, 1);

        let conn = env.conn();
        let latest = RepositoryRevision::latest(&conn, &baseos.id, "x86_64").unwrap().unwrap();
        assert_ne!(latest.id, seeded.id);
        assert_eq!(latest.primary_xml, seeded.primary_xml);
        assert_eq!(decode_stored(&latest.updateinfo_xml).unwrap().unwrap(), ADVISORY.as_bytes());

        let repomd = decode_repomd(&b64_decode(&latest.repomd_xml).unwrap()).unwrap();
        let entry = repomd.find("updateinfo").unwrap();
        assert_eq!(entry.location.href, format!("repodata/{}-UPDATEINFO.xml.gz", latest.id));

        // A second run replaces the entry instead of appending one
        env.controller.submit_update_info(req, None).await.unwrap();
        let again = RepositoryRevision::latest(&conn, &baseos.id, "x86_64").unwrap().unwrap();
        let repomd = decode_repomd(&b64_decode(&again.repomd_xml).unwrap()).unwrap();
        assert_eq!(repomd.data.iter().filter(|d| d.kind == "updateinfo").count(), 1);
    }

    #[tokio::test]
    async fn test_missing_revision_is_skipped() {
        let env = TestEnv::new();
        let conn = env.conn();
        Repository::create_with_packages(&conn, &env.project.id, "CRB", false, Vec::new()).unwrap();
        env.updateinfo
            .documents
            .lock()
            .unwrap()
            .insert(product_url(&env, "CRB"), ADVISORY.as_bytes().to_vec());

        let task = env
            .controller
            .submit_update_info(
                UpdateInfoRequest {
                    project_id: env.project.id.clone(),
                    product_name: "Rocky Linux 9 $arch".to_string(),
                },
                None,
            )
            .await
            .unwrap();
        assert!(task.updated.is_empty());
        assert_eq!(task.advisories, 1);
    }
}
