// src/workflow/mod.rs

//! Builder workflows
//!
//! A [`Controller`] owns the shared handles every workflow needs: the task
//! store path, the blob store, the external tools, the sandbox provisioner
//! and the project lease manager. Each workflow is an async method on the
//! controller driven by a [`WorkflowContext`]; the request and response
//! types they exchange live here so child workflows can share them.
//!
//! # Module Structure
//!
//! - `infrastructure` - sandbox provision/destroy tasks and log ingest
//! - `import` - upstream and src-git imports into dist-git
//! - `build` - SRPM and per-arch builds, side NVRs, batches
//! - `composer` - yumrepofs repository composition
//! - `module` - module stream builds and modulemd generation
//! - `sync` - catalog sync
//! - `updateinfo` - errata ingestion
//! - `clone_swap`, `hashed`, `rpm_import`, `lookaside` - repository maintenance

mod build;
mod clone_swap;
mod composer;
mod hashed;
mod import;
mod infrastructure;
mod lookaside;
mod module;
mod rpm_import;
mod sync;
mod updateinfo;

#[cfg(test)]
pub(crate) mod testing;

pub use build::{BatchItem, BuildBatchTask, ImportBatchTask, select_arches};
pub use clone_swap::{CloneSwapRequest, CloneSwapTask};
pub use composer::{ArchMapArtifact, generate_arch_map};
pub use hashed::{HashedRepositoriesRequest, HashedRepositoriesTask};
pub use import::{ImportRequest, ImportTask, deterministic_tar_gz};
pub use infrastructure::ProvisionedWorker;
pub use lookaside::{LookasideUploadRequest, LookasideUploadTask};
pub use module::{ModuleArtifact, module_context, module_dist, module_version, rpm_passes_filter};
pub use rpm_import::{RpmImportRequest, RpmImportTask, RpmLookasideBatchImportRequest};
pub use sync::{SyncCatalogRequest, SyncCatalogTask};
pub use updateinfo::{UpdateInfoRequest, UpdateInfoTask};

use crate::config::{BuilderConfig, Environment};
use crate::db::{
    self,
    models::{Task, TaskType},
};
use crate::error::{Error, Result};
use crate::lease::LeaseManager;
use crate::orchestrator::{History, WorkflowContext};
use crate::store::{self, BlobStore};
use crate::tools::Toolbox;
use crate::tools::mock::ExtraYumrepofsRepo;
use crate::worker::{self, Provisioner};
use rusqlite::{Connection, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Task queue composer runs are dispatched on
pub const YUMREPOFS_QUEUE: &str = "yumrepofs";

/// Shared state behind every workflow
#[derive(Clone)]
pub struct Controller {
    pub config: Arc<BuilderConfig>,
    pub env: Environment,
    pub db_path: PathBuf,
    pub store: Arc<dyn BlobStore>,
    pub tools: Toolbox,
    pub provisioner: Arc<dyn Provisioner>,
    pub leases: Arc<LeaseManager>,
    history: History,
}

impl Controller {
    /// Assemble a controller from already opened collaborators
    pub fn new(
        config: BuilderConfig,
        env: Environment,
        store: Arc<dyn BlobStore>,
        tools: Toolbox,
        provisioner: Arc<dyn Provisioner>,
    ) -> Result<Self> {
        let db_path = config.database.path.clone();
        let duration = config.lease_duration().map_err(config_error)?;
        let heartbeat = config.lease_heartbeat().map_err(config_error)?;
        let leases = LeaseManager::new(&db_path, duration, heartbeat);
        Ok(Self {
            history: History::Sqlite(db_path.clone()),
            config: Arc::new(config),
            env,
            db_path,
            store,
            tools,
            provisioner,
            leases: Arc::new(leases),
        })
    }

    /// Open everything from configuration
    pub fn open(config: BuilderConfig, env: Environment) -> Result<Self> {
        config.validate().map_err(config_error)?;
        db::init(&config.database.path)?;
        let store = store::open(&config.storage)?;
        let tools = Toolbox::from_config(&config.tools);
        let provisioner = worker::open(&config, &env)?;
        Self::new(config, env, store, tools, provisioner)
    }

    /// Keep workflow history in memory instead of the task store
    pub fn with_history(mut self, history: History) -> Self {
        self.history = history;
        self
    }

    /// Workflow scope for a run identified by `id` (usually its task id)
    pub fn workflow(&self, id: &str) -> WorkflowContext {
        WorkflowContext::new(id, self.history.clone())
    }

    /// Run blocking store access off the async runtime
    pub async fn db<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = db::open(&path)?;
            f(&conn)
        })
        .await?
    }

    /// Like [`Controller::db`] inside one transaction
    pub async fn tx<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Transaction) -> Result<T> + Send + 'static,
    {
        let path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = db::open(&path)?;
            db::transaction(&mut conn, f)
        })
        .await?
    }

    /// yumrepofs base URL build roots fetch repositories from
    pub fn yumrepofs_base(&self) -> String {
        self.env.yumrepofs_base(&self.config)
    }

    /// Insert a pending child task once per workflow run
    pub(crate) async fn create_subtask(
        &self,
        ctx: &WorkflowContext,
        arch: &str,
        task_type: TaskType,
        project_id: &str,
        parent_task_id: &str,
    ) -> Result<String> {
        let db_path = self.db_path.clone();
        let (arch, project_id, parent) = (arch.to_string(), project_id.to_string(), parent_task_id.to_string());
        ctx.side_effect(move || {
            let conn = db::open(&db_path)?;
            let task = Task::new(&arch, task_type, Some(&project_id), Some(&parent));
            task.insert(&conn)?;
            Ok(task.id)
        })
        .await
    }
}

/// Stored on every build task so the composer knows what it publishes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageOperationMetadata {
    pub package_name: String,
    #[serde(default)]
    pub modular: bool,
}

/// Options threaded from module builds and side NVRs into plain builds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOptions {
    /// Attach this build's tasks to an existing build row
    #[serde(default)]
    pub reusable_build_id: Option<String>,
    #[serde(default)]
    pub extra_yumrepofs_repos: Vec<ExtraYumrepofsRepo>,
    /// `name:stream` pairs to enable in the build root
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default)]
    pub disabled_modules: Vec<String>,
    #[serde(default)]
    pub exclude_packages: Vec<String>,
    #[serde(default)]
    pub force_dist: Option<String>,
    /// Chroot path to content for arch builds
    #[serde(default)]
    pub build_arch_extra_files: BTreeMap<String, String>,
    #[serde(default)]
    pub disable_yumrepofs_updates: bool,
    #[serde(default)]
    pub enable_networking: bool,
    /// Batch component builds are attached to
    #[serde(default)]
    pub build_batch_id: Option<String>,
}

/// Input of the build workflow
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildRequest {
    pub project_id: String,
    pub package_name: String,
    #[serde(default)]
    pub scm_hash: Option<String>,
    #[serde(default)]
    pub side_nvrs: Vec<String>,
    #[serde(default)]
    pub disable_checks: bool,
    #[serde(default)]
    pub set_inactive: bool,
    /// Restrict a module build to these stream branches
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub module_variant: bool,
}

/// Response of a finished build
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitBuildTask {
    pub build_id: String,
    pub build_task_id: String,
    pub package_version_id: String,
    #[serde(default)]
    pub package_name: String,
    /// Object names of every uploaded artifact
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub repo_changes: Option<UpdateRepoTask>,
}

/// Input of the composer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRepoRequest {
    pub project_id: String,
    pub build_ids: Vec<String>,
    /// Parent of the composer task, when run as a child workflow
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub force_repo_id: Option<String>,
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub force_non_modular: bool,
    #[serde(default)]
    pub disable_signing: bool,
    #[serde(default)]
    pub disable_set_active: bool,
    #[serde(default)]
    pub no_delete_previous: bool,
}

impl UpdateRepoRequest {
    pub fn new(project_id: &str, build_ids: Vec<String>) -> Self {
        Self {
            project_id: project_id.to_string(),
            build_ids,
            ..Default::default()
        }
    }
}

/// What one composer run changed in one repository arch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryChange {
    /// `<repo>-<arch>`
    pub name: String,
    #[serde(default)]
    pub added_packages: Vec<String>,
    #[serde(default)]
    pub modified_packages: Vec<String>,
    #[serde(default)]
    pub removed_packages: Vec<String>,
    #[serde(default)]
    pub added_modules: Vec<String>,
    #[serde(default)]
    pub modified_modules: Vec<String>,
    #[serde(default)]
    pub removed_modules: Vec<String>,
}

impl RepositoryChange {
    pub fn is_empty(&self) -> bool {
        self.added_packages.is_empty()
            && self.modified_packages.is_empty()
            && self.removed_packages.is_empty()
            && self.added_modules.is_empty()
            && self.modified_modules.is_empty()
            && self.removed_modules.is_empty()
    }
}

/// Response of the composer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRepoTask {
    pub changes: Vec<RepositoryChange>,
}

/// Merge changes with the same name, keeping first-seen order
pub fn reduce_changes(changes: Vec<RepositoryChange>) -> Vec<RepositoryChange> {
    let mut merged: Vec<RepositoryChange> = Vec::new();
    for change in changes {
        match merged.iter_mut().find(|c| c.name == change.name) {
            Some(existing) => {
                extend_unique(&mut existing.added_packages, change.added_packages);
                extend_unique(&mut existing.modified_packages, change.modified_packages);
                extend_unique(&mut existing.removed_packages, change.removed_packages);
                extend_unique(&mut existing.added_modules, change.added_modules);
                extend_unique(&mut existing.modified_modules, change.modified_modules);
                extend_unique(&mut existing.removed_modules, change.removed_modules);
            }
            None => merged.push(change),
        }
    }
    merged
}

fn extend_unique(target: &mut Vec<String>, items: Vec<String>) {
    for item in items {
        if !target.contains(&item) {
            target.push(item);
        }
    }
}

/// One built stream of a module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStream {
    pub dist: String,
    pub increment: i64,
    pub name: String,
    pub stream: String,
    pub version: String,
    pub context: String,
    pub import_revision_id: String,
    pub build_id: String,
    /// Per arch, per stream name: the rendered modulemd document
    #[serde(default)]
    pub docs: BTreeMap<String, BTreeMap<String, String>>,
    #[serde(default)]
    pub builds: Vec<SubmitBuildTask>,
}

/// Response of a module build
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleBuildTask {
    pub streams: Vec<ModuleStream>,
    #[serde(default)]
    pub repo_changes: Option<UpdateRepoTask>,
}

fn config_error(e: anyhow::Error) -> Error {
    Error::ConfigError(format!("{e:#}"))
}

pub(crate) fn not_found_package(project_id: &str, name: &str) -> Error {
    Error::CouldNotFindPackage(format!("{} in project {}", name, project_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reduce_changes_merges_by_name() {
        let changes = vec![
            RepositoryChange {
                name: "BaseOS-x86_64".to_string(),
                added_packages: vec!["bash".to_string()],
                ..Default::default()
            },
            RepositoryChange {
                name: "AppStream-x86_64".to_string(),
                removed_packages: vec!["vim".to_string()],
                ..Default::default()
            },
            RepositoryChange {
                name: "BaseOS-x86_64".to_string(),
                added_packages: vec!["bash".to_string(), "zsh".to_string()],
                modified_modules: vec!["nodejs:18".to_string()],
                ..Default::default()
            },
        ];
        let reduced = reduce_changes(changes);
        assert_eq!(reduced.len(), 2);
        assert_eq!(reduced[0].added_packages, vec!["bash", "zsh"]);
        assert_eq!(reduced[0].modified_modules, vec!["nodejs:18"]);
        assert!(!reduced[1].is_empty());
    }
}
