// src/workflow/hashed.rs

//! Hashed repositories
//!
//! Republishes a repository with `Packages/<first letter>/<file>` hrefs as
//! the internal `hashed-<repo>` repository. The url mapping of each new
//! revision resolves hashed hrefs back to the stored objects, and sqlite
//! databases for the new repodata are uploaded under `sqlite-files/`.

use super::Controller;
use super::import::scratch_dir;
use crate::db::{
    self,
    models::{Key, Project, Repository, RepositoryRevision, Task, TaskType},
};
use crate::error::{Error, Result};
use crate::metadata::codec::{PayloadDigest, b64_decode, b64_encode, compress_gz, decode_stored};
use crate::metadata::primary::{decode_primary, encode_primary};
use crate::metadata::repomd::{decode_repomd, encode_repomd};
use crate::orchestrator::{ActivityContext, ActivityOptions, DOMAIN_TASKS, TaskFinalizer, WorkflowContext};
use crate::worker::{CommandRunner, Sandbox, SandboxSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashedRepositoriesRequest {
    pub project_id: String,
    pub repositories: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashedRepositoriesTask {
    pub repo_revisions: Vec<String>,
}

/// Name of the internal repository holding the hashed copy of `repo`
pub fn hashed_repository_name(repo: &str) -> String {
    format!("hashed-{repo}")
}

/// `<first letter, lowercased>/<file>` for an RPM href
fn hashed_href(href: &str) -> Option<String> {
    let file = href.rsplit('/').next().unwrap_or(href);
    let first = file.chars().next()?;
    Some(format!("{}/{}", first.to_lowercase(), file))
}

/// A revision rewritten with hashed hrefs, before sqlite generation
#[derive(Debug, Clone)]
struct HashedRevision {
    id: String,
    source: RepositoryRevision,
    primary_xml: Vec<u8>,
    primary_gz: Vec<u8>,
    repomd_xml: Vec<u8>,
    url_mappings: BTreeMap<String, String>,
    /// Repodata files besides `repomd.xml`, by file name
    files: Vec<(String, Vec<u8>)>,
}

fn hash_revision(source: RepositoryRevision, id: &str) -> Result<HashedRevision> {
    let primary = decode_stored(&source.primary_xml)?.unwrap_or_default();
    let mut root = decode_primary(&primary)?;
    let mut url_mappings = BTreeMap::new();
    for package in &mut root.packages {
        let Some(href) = hashed_href(&package.location.href) else {
            continue;
        };
        url_mappings.insert(
            href.clone(),
            package.location.href.trim_start_matches("Packages/").to_string(),
        );
        package.location.href = format!("Packages/{href}");
    }
    let primary_xml = encode_primary(&root)?;
    let primary_gz = compress_gz(&primary_xml)?;
    let digest = PayloadDigest::of(&primary_xml, &primary_gz);
    let primary_name = format!("{id}-PRIMARY.xml.gz");

    let mut repomd = decode_repomd(&b64_decode(&source.repomd_xml)?)?;
    repomd.revision = id.to_string();
    let mut files = vec![(primary_name.clone(), primary_gz.clone())];
    for data in &mut repomd.data {
        let name = data
            .location
            .href
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        match data.kind.as_str() {
            "primary" => {
                if let Some(checksum) = data.checksum.as_mut() {
                    checksum.value = digest.checksum.clone();
                }
                if let Some(checksum) = data.open_checksum.as_mut() {
                    checksum.value = digest.open_checksum.clone();
                }
                data.size = primary_gz.len() as u64;
                data.open_size = primary_xml.len() as u64;
                data.location.href = format!("repodata/{primary_name}");
            }
            "filelists" => files.push((name, b64_decode(&source.filelists_xml)?)),
            "other" => files.push((name, b64_decode(&source.other_xml)?)),
            "group" => {
                let groups_gz = b64_decode(&source.groups_xml)?;
                files.push((name.clone(), decode_stored(&source.groups_xml)?.unwrap_or_default()));
                files.push((format!("{name}.gz"), groups_gz));
            }
            _ => {}
        }
    }

    Ok(HashedRevision {
        id: id.to_string(),
        source,
        primary_xml,
        primary_gz,
        repomd_xml: encode_repomd(&repomd)?,
        url_mappings,
        files,
    })
}

/// Everything the activity needs from the database up front
struct HashedPlan {
    project: Project,
    key: Option<Key>,
    revisions: Vec<(String, RepositoryRevision)>,
}

fn plan(conn: &rusqlite::Connection, req: &HashedRepositoriesRequest) -> Result<HashedPlan> {
    let project = Project::resolve(conn, &req.project_id)?;
    let key = Key::default_for_project(conn, &project.id)?;
    let mut arches = project.archs.clone();
    arches.push("src".to_string());
    arches.extend(project.archs.iter().map(|a| format!("{a}-debug")));

    let mut revisions = Vec::new();
    for name in &req.repositories {
        if Repository::find_by_name(conn, &project.id, name)?.is_none() {
            return Err(Error::NotFound(format!("repository {name} in project {}", project.name)));
        }
        for arch in &arches {
            if let Some(revision) = RepositoryRevision::latest_by_project_name_arch(conn, &project.id, name, arch)? {
                revisions.push((name.clone(), revision));
            }
        }
    }
    Ok(HashedPlan { project, key, revisions })
}

impl Controller {
    pub async fn submit_hashed_repositories(
        &self,
        req: HashedRepositoriesRequest,
        submitter: Option<String>,
    ) -> Result<HashedRepositoriesTask> {
        let project_ref = req.project_id.clone();
        let (project_id, task_id) = self
            .tx(move |tx| {
                let project = Project::resolve(tx, &project_ref)?;
                let task = Task::new("noarch", TaskType::HashedRepos, Some(&project.id), None).with_submitter(submitter);
                task.insert(tx)?;
                Ok((project.id, task.id))
            })
            .await?;
        let req = HashedRepositoriesRequest { project_id, ..req };
        let ctx = self.workflow(&task_id);
        self.hashed_repositories(&ctx, req, &task_id).await
    }

    pub async fn hashed_repositories(
        &self,
        ctx: &WorkflowContext,
        req: HashedRepositoriesRequest,
        task_id: &str,
    ) -> Result<HashedRepositoriesTask> {
        let finalizer = TaskFinalizer::start(self.db_path.clone(), task_id, DOMAIN_TASKS).await?;
        let spec = SandboxSpec {
            task_id: task_id.to_string(),
            parent_task_id: task_id.to_string(),
            project_id: req.project_id.clone(),
            purpose: "sync".to_string(),
            arch: "noarch".to_string(),
            high_resource: false,
            privileged: false,
        };
        let req = &req;
        let outcome = self
            .with_worker(ctx, spec, |runner, sandbox| async move {
                ctx.execute_activity(
                    "create-hashed-repositories",
                    &ActivityOptions::once(Duration::from_secs(15 * 60)),
                    |actx| {
                        let (runner, sandbox) = (runner.clone(), sandbox.clone());
                        async move { self.create_hashed_repositories(&actx, runner.as_ref(), &sandbox, req).await }
                    },
                )
                .await
            })
            .await;
        finalizer.close(outcome).await
    }

    async fn create_hashed_repositories(
        &self,
        actx: &ActivityContext,
        runner: &dyn CommandRunner,
        sandbox: &Sandbox,
        req: &HashedRepositoriesRequest,
    ) -> Result<HashedRepositoriesTask> {
        let _alive = actx.keep_alive(Duration::from_secs(10));
        let request = req.clone();
        let HashedPlan { project, key, revisions } = self.db(move |conn| plan(conn, &request)).await?;
        let scratch = scratch_dir(sandbox, actx)?;

        let mut hashed = Vec::new();
        for (repo_name, source) in revisions {
            info!("Hashing {}/{} ({})", repo_name, source.arch, source.id);
            let revision = hash_revision(source, &db::new_id())?;
            let dir = scratch.join(&revision.id);
            let repomd_xml = self.generate_sqlite(runner, &dir, &revision).await?;

            if let Some(key) = &key {
                let signature = self.tools.signer.sign_detached(runner, &repomd_xml, key).await?;
                self.store
                    .put(&format!("repo-signatures/{}.xml.asc", revision.id), signature.as_bytes())?;
            }
            hashed.push((repo_name, revision, repomd_xml));
        }

        let project_id = project.id.clone();
        let repo_revisions = self
            .tx(move |tx| {
                let mut ids = Vec::new();
                for (repo_name, revision, repomd_xml) in hashed {
                    let name = hashed_repository_name(&repo_name);
                    let repo = match Repository::find_by_name(tx, &project_id, &name)? {
                        Some(repo) => repo,
                        None => Repository::create_with_packages(tx, &project_id, &name, true, Vec::new())?,
                    };
                    let mut created = RepositoryRevision {
                        id: revision.id.clone(),
                        repository_id: repo.id,
                        repomd_xml: b64_encode(&repomd_xml),
                        primary_xml: b64_encode(&revision.primary_gz),
                        url_mappings: serde_json::to_string(&revision.url_mappings)?,
                        ..revision.source
                    };
                    created.create(tx)?;
                    ids.push(created.id);
                }
                Ok(ids)
            })
            .await?;
        Ok(HashedRepositoriesTask { repo_revisions })
    }

    /// Write the repodata, run sqliterepo_c and upload its databases.
    ///
    /// Returns the final `repomd.xml`.
    async fn generate_sqlite(&self, runner: &dyn CommandRunner, dir: &Path, revision: &HashedRevision) -> Result<Vec<u8>> {
        let repodata = dir.join("repodata");
        std::fs::create_dir_all(&repodata)?;
        std::fs::write(repodata.join("repomd.xml"), &revision.repomd_xml)?;
        for (name, content) in &revision.files {
            std::fs::write(repodata.join(name), content)?;
        }

        for path in self.tools.repo.sqlite_metadata(runner, dir).await? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            self.store.put_file(&format!("sqlite-files/{name}"), &path)?;
        }
        Ok(std::fs::read(repodata.join("repomd.xml"))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::codec::encode_stored;
    use crate::metadata::primary::{PrimaryPackage, PrimaryRoot};
    use crate::metadata::repomd::{RepomdData, RepomdRoot};
    use crate::workflow::testing::TestEnv;

    fn seed(env: &TestEnv) -> RepositoryRevision {
        let conn = env.conn();
        let repo = Repository::create_with_packages(&conn, &env.project.id, "BaseOS", false, vec!["bash".into()]).unwrap();
        let id = db::new_id();

        let mut primary = PrimaryRoot::default();
        for href in ["Packages/abc123/bash-5.1.8-6.el9.x86_64.rpm", "Packages/def456/Zsh-5.8-9.el9.x86_64.rpm"] {
            let mut package = PrimaryPackage::default();
            package.location.href = href.to_string();
            primary.packages.push(package);
        }
        primary.package_count = 2;
        let primary_xml = encode_primary(&primary).unwrap();
        let primary_gz = compress_gz(&primary_xml).unwrap();
        let filelists_gz = compress_gz(b"<filelists/>").unwrap();

        let mut repomd = RepomdRoot::new(id.clone());
        let ts = 1_700_000_000;
        repomd.upsert(RepomdData::compressed(
            "primary",
            format!("repodata/{id}-PRIMARY.xml.gz"),
            &PayloadDigest::of(&primary_xml, &primary_gz),
            ts,
        ));
        repomd.upsert(RepomdData::compressed(
            "filelists",
            format!("repodata/{id}-FILELISTS.xml.gz"),
            &PayloadDigest::of(b"<filelists/>", &filelists_gz),
            ts,
        ));

        let mut revision = RepositoryRevision::new(&id, &repo.id, "x86_64");
        revision.repomd_xml = b64_encode(&encode_repomd(&repomd).unwrap());
        revision.primary_xml = b64_encode(&primary_gz);
        revision.filelists_xml = b64_encode(&filelists_gz);
        revision.updateinfo_xml = encode_stored(b"<updates/>").unwrap();
        revision.create(&conn).unwrap();
        revision
    }

    #[test]
    fn test_hashed_href_uses_lowercase_first_letter() {
        assert_eq!(hashed_href("Packages/abc/Zsh-5.8.rpm").unwrap(), "z/Zsh-5.8.rpm");
        assert_eq!(hashed_href("bash.rpm").unwrap(), "b/bash.rpm");
        assert!(hashed_href("Packages/").is_none());
    }

    #[test]
    fn test_hash_revision_rewrites_primary_and_repomd() {
        let env = TestEnv::new();
        let source = seed(&env);
        let hashed = hash_revision(source.clone(), "rev-2").unwrap();

        assert_eq!(hashed.url_mappings["b/bash-5.1.8-6.el9.x86_64.rpm"], "abc123/bash-5.1.8-6.el9.x86_64.rpm");
        assert_eq!(hashed.url_mappings["z/Zsh-5.8-9.el9.x86_64.rpm"], "def456/Zsh-5.8-9.el9.x86_64.rpm");
        let primary = decode_primary(&hashed.primary_xml).unwrap();
        assert_eq!(primary.packages[0].location.href, "Packages/b/bash-5.1.8-6.el9.x86_64.rpm");

        let repomd = decode_repomd(&hashed.repomd_xml).unwrap();
        assert_eq!(repomd.revision, "rev-2");
        let entry = repomd.find("primary").unwrap();
        assert_eq!(entry.location.href, "repodata/rev-2-PRIMARY.xml.gz");
        assert_eq!(entry.open_size, hashed.primary_xml.len() as u64);
        assert_eq!(repomd.find("filelists").unwrap().location.href, format!("repodata/{}-FILELISTS.xml.gz", source.id));

        let names: Vec<&str> = hashed.files.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["rev-2-PRIMARY.xml.gz".to_string(), format!("{}-FILELISTS.xml.gz", source.id)]);
    }

    #[tokio::test]
    async fn test_hashed_repository_is_internal_and_signed() {
        let env = TestEnv::new();
        let source = seed(&env);
        {
            let conn = env.conn();
            let key = Key::new("Rocky Enterprise Software Foundation", "releng@rockylinux.test", "6d745a60", "PUBKEY");
            key.insert(&conn).unwrap();
            Key::attach_to_project(&conn, &env.project.id, &key.id, true).unwrap();
        }

        let task = env
            .controller
            .submit_hashed_repositories(
                HashedRepositoriesRequest {
                    project_id: env.project.id.clone(),
                    repositories: vec!["BaseOS".to_string()],
                },
                None,
            )
            .await
            .unwrap();
        assert_eq!(task.repo_revisions.len(), 1);

        let conn = env.conn();
        let hashed = Repository::find_by_name(&conn, &env.project.id, "hashed-BaseOS").unwrap().unwrap();
        assert!(hashed.internal_only);
        let revision = RepositoryRevision::latest(&conn, &hashed.id, "x86_64").unwrap().unwrap();
        assert_eq!(revision.id, task.repo_revisions[0]);
        assert_eq!(revision.filelists_xml, source.filelists_xml);
        assert_eq!(revision.updateinfo_xml, source.updateinfo_xml);
        assert_eq!(revision.url_mapping().len(), 2);
        assert!(
            env.controller
                .store
                .exists(&format!("repo-signatures/{}.xml.asc", revision.id))
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_unknown_repository_fails() {
        let env = TestEnv::new();
        let err = env
            .controller
            .submit_hashed_repositories(
                HashedRepositoriesRequest {
                    project_id: env.project.id.clone(),
                    repositories: vec!["Plus".to_string()],
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Plus"));
    }
}
