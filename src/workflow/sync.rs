// src/workflow/sync.rs

//! Catalog sync
//!
//! Clones a catalog repository, applies every catalog kind to the project
//! in one transaction and re-publishes the builds whose placement may have
//! changed: the latest builds of new or modified packages, plus active
//! builds owning artifacts that match a changed filter glob.

use super::import::scratch_dir;
use super::{Controller, UpdateRepoRequest, UpdateRepoTask};
use crate::catalog::{CatalogExtraOptions, CatalogGroupInstallOption, CatalogGroupInstallOptions, CatalogSync, Catalogs};
use crate::db::{
    self,
    models::{
        Build, ExtraOptions, ModuleConfiguration, Package, PackageType, Project, Repository, RepositoryRevision, Task,
        TaskType,
    },
};
use crate::error::{Error, Result};
use crate::metadata::codec::{PayloadDigest, b64_encode, compress_gz};
use crate::metadata::repomd::{RepomdData, RepomdRoot, blob_href, encode_repomd};
use crate::orchestrator::{ActivityOptions, DOMAIN_TASKS, TaskFinalizer, WorkflowContext};
use crate::worker::SandboxSpec;
use glob::Pattern;
use regex::Regex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{info, warn};

static ARCH_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\[[^\]]+\]").expect("valid regex"));

/// Input of the catalog sync workflow
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCatalogRequest {
    pub project_id: String,
    pub scm_url: String,
    pub branch: String,
}

/// What `CatalogSync` changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCatalogSync {
    pub new_packages: Vec<String>,
    pub modified_packages: Vec<String>,
    pub new_repositories: Vec<String>,
    pub modified_repositories: Vec<String>,
    /// SQL LIKE patterns over artifact object names
    pub additional_nvr_globs: Vec<String>,
    #[serde(default)]
    pub module_configuration: Option<ModuleConfiguration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCatalogExtraOptions {
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindCatalogGroupInstallOptions {
    pub srpm_packages: Vec<String>,
    pub build_packages: Vec<String>,
    /// Packages that received scoped build root overrides
    pub scoped_packages: Vec<String>,
}

/// Response of a catalog sync
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCatalogTask {
    pub catalog_sync: KindCatalogSync,
    pub extra_options: KindCatalogExtraOptions,
    pub group_install_options: KindCatalogGroupInstallOptions,
    /// Repository-arch pairs that received new comps
    #[serde(default)]
    pub comps: Vec<String>,
    pub reprocess_build_ids: Vec<String>,
    #[serde(default)]
    pub repo_changes: Option<UpdateRepoTask>,
}

/// Everything the catalogs say about one repository
#[derive(Debug, Clone, Default)]
struct RepoSyncIndex {
    packages: Vec<(String, PackageType)>,
    /// Include filter entries by the package they came from
    include_filter: BTreeMap<String, Vec<String>>,
    exclude_filter: Vec<String>,
    multilib: Vec<String>,
    additional_multilib: Vec<String>,
    exclude_multilib_filter: Vec<String>,
    glob_include_filter: Vec<String>,
}

fn push_unique(target: &mut Vec<String>, item: &str) {
    if !target.iter().any(|t| t == item) {
        target.push(item.to_string());
    }
}

/// Filter entries added or removed, without their arch prefix
fn changed_globs(incoming: &[String], current: &[String]) -> Vec<String> {
    let mut globs = Vec::new();
    for filter in incoming.iter().filter(|f| !current.contains(f)) {
        push_unique(&mut globs, &ARCH_PREFIX_RE.replace(filter, ""));
    }
    for filter in current.iter().filter(|f| !incoming.contains(f)) {
        push_unique(&mut globs, &ARCH_PREFIX_RE.replace(filter, ""));
    }
    globs
}

fn repo_matches(repo_match: &str, repo_name: &str) -> Result<bool> {
    if repo_match == "*" {
        return Ok(true);
    }
    let re = Regex::new(repo_match)
        .map_err(|e| Error::ParseError(format!("failed to compile repo match regex: {e}")))?;
    Ok(re.is_match(repo_name))
}

fn index_catalogs(catalogs: &[CatalogSync]) -> Result<(BTreeMap<String, RepoSyncIndex>, Option<ModuleConfiguration>)> {
    let mut index: BTreeMap<String, RepoSyncIndex> = BTreeMap::new();
    let mut module_configuration = None;

    for catalog in catalogs {
        if let Some(config) = &catalog.module_configuration {
            if module_configuration.is_some() {
                return Err(Error::InvalidArgument("multiple module configurations found".to_string()));
            }
            module_configuration = Some(ModuleConfiguration::from(config.clone()));
        }

        for package in &catalog.package {
            let package_type = package.package_type()?;
            for repo in &package.repository {
                let entry = index.entry(repo.name.clone()).or_default();
                let mut names = vec![package.name.clone()];
                names.extend(repo.module_stream.iter().map(|s| format!("module:{}:{}", package.name, s)));
                for name in names {
                    if !entry.packages.iter().any(|(n, _)| *n == name) {
                        entry.packages.push((name, package_type));
                    }
                }
                let includes = entry.include_filter.entry(package.name.clone()).or_default();
                for filter in &repo.include_filter {
                    push_unique(includes, filter);
                }
                for arch in &repo.multilib {
                    push_unique(&mut entry.multilib, arch);
                }
            }
        }

        for (name, repo) in index.iter_mut() {
            for filter in &catalog.exclude_filter {
                if repo_matches(&filter.repo_match, name)? {
                    for entry in filter.filter_strings() {
                        push_unique(&mut repo.exclude_filter, &entry);
                    }
                }
            }
            for filter in &catalog.include_filter {
                if repo_matches(&filter.repo_match, name)? {
                    for entry in filter.filter_strings() {
                        push_unique(&mut repo.glob_include_filter, &entry);
                    }
                }
            }
            if !catalog.additional_multilib.is_empty() {
                repo.additional_multilib = catalog.additional_multilib.clone();
            }
            if !catalog.exclude_multilib_filter.is_empty() {
                repo.exclude_multilib_filter = catalog.exclude_multilib_filter.clone();
            }
        }
    }
    Ok((index, module_configuration))
}

/// Apply every `CatalogSync` to the project's packages and repositories
fn apply_catalog_sync(conn: &Connection, project_id: &str, catalogs: &[CatalogSync]) -> Result<KindCatalogSync> {
    let (index, module_configuration) = index_catalogs(catalogs)?;
    let mut ret = KindCatalogSync {
        module_configuration: module_configuration.clone(),
        ..Default::default()
    };
    info!("Syncing {} repositories", index.len());

    for repo in index.values() {
        for (name, package_type) in &repo.packages {
            if name.starts_with("module:") {
                continue;
            }
            let in_project = Package::find_in_project(conn, project_id, name)?.is_some();
            let package = match Package::find_by_name(conn, name)? {
                Some(package) => package,
                None => {
                    let package = Package::new(name, *package_type);
                    package.insert(conn)?;
                    package
                }
            };
            // The type is refreshed on every sync
            Package::add_to_project(conn, project_id, &package.id, Some(*package_type))?;
            if !in_project && !ret.new_packages.contains(name) {
                info!("Package {} not found in project {}, creating", name, project_id);
                ret.new_packages.push(name.clone());
            }
        }
    }

    for (name, repo) in &index {
        let include_filter: Vec<String> = repo.include_filter.values().flatten().cloned().collect();
        let existing = Repository::find_by_name(conn, project_id, name)?;
        let mut packages = existing.as_ref().map(|r| r.packages.clone()).unwrap_or_default();
        for (package, _) in &repo.packages {
            push_unique(&mut packages, package);
        }

        let mut target = match existing {
            None => {
                info!("Creating repository {}", name);
                ret.new_repositories.push(name.clone());
                // Everything in a new repository needs publishing
                for package in &packages {
                    push_unique(&mut ret.modified_packages, package);
                }
                Repository::create_with_packages(conn, project_id, name, false, packages.clone())?
            }
            Some(current) => {
                info!("Updating repository {}", name);
                ret.modified_repositories.push(name.clone());
                for (package, filters) in &repo.include_filter {
                    if filters.iter().any(|f| !current.include_filter.contains(f)) {
                        push_unique(&mut ret.modified_packages, package);
                    }
                }
                let mut globs = changed_globs(&repo.exclude_filter, &current.exclude_filter);
                globs.extend(changed_globs(&repo.exclude_multilib_filter, &current.exclude_multilib_filter));
                globs.extend(changed_globs(&repo.additional_multilib, &current.additional_multilib));
                globs.extend(changed_globs(&repo.glob_include_filter, &current.glob_include_filter));
                for glob in globs {
                    push_unique(&mut ret.additional_nvr_globs, &format!("%/{}%", glob.replace('*', "%")));
                }
                current
            }
        };

        target.packages = packages;
        target.exclude_filter = repo.exclude_filter.clone();
        target.include_filter = include_filter;
        target.additional_multilib = repo.additional_multilib.clone();
        target.exclude_multilib_filter = repo.exclude_multilib_filter.clone();
        target.multilib = repo.multilib.clone();
        target.glob_include_filter = repo.glob_include_filter.clone();
        target.set_options(conn)?;
    }

    if let Some(config) = &module_configuration {
        config.save(conn, project_id)?;
    }

    info!("New packages: {:?}", ret.new_packages);
    info!("Modified packages: {:?}", ret.modified_packages);
    info!("New repositories: {:?}", ret.new_repositories);
    info!("Modified repositories: {:?}", ret.modified_repositories);
    info!("Additional NVR globs: {:?}", ret.additional_nvr_globs);
    Ok(ret)
}

fn apply_extra_options(
    conn: &Connection,
    project_id: &str,
    catalogs: &[CatalogExtraOptions],
) -> Result<KindCatalogExtraOptions> {
    let mut ret = KindCatalogExtraOptions::default();
    for catalog in catalogs {
        for options in &catalog.package_options {
            if Package::find_in_project(conn, project_id, &options.name)?.is_none() {
                return Err(Error::CouldNotFindPackage(format!(
                    "{} in project {} (cannot set extra options)",
                    options.name, project_id
                )));
            }
            ExtraOptions::set_flags(conn, project_id, &options.name, &options.with, &options.without)?;
            push_unique(&mut ret.packages, &options.name);
        }
    }
    Ok(ret)
}

/// Packages a scoped option applies to; `*` at either end makes it a glob
fn scoped_targets(conn: &Connection, project_id: &str, name: &str) -> Result<Vec<String>> {
    if name.starts_with('*') || name.ends_with('*') {
        let needle = name.trim_start_matches('*').trim_end_matches('*');
        let pattern = Pattern::new(name).map_err(|e| Error::ParseError(format!("failed to compile glob {name}: {e}")))?;
        let matched: Vec<String> = Package::list_in_project(conn, project_id, None, Some(needle), -1, 0)?
            .into_iter()
            .map(|p| p.name)
            .filter(|n| pattern.matches(n))
            .collect();
        if matched.is_empty() {
            return Err(Error::CouldNotFindPackage(format!(
                "{name} in project {project_id} (cannot set extra options, glob)"
            )));
        }
        return Ok(matched);
    }
    match Package::find_in_project(conn, project_id, name)? {
        Some(package) => Ok(vec![package.name]),
        None => Err(Error::CouldNotFindPackage(format!("{name} in project {project_id} (scoped package)"))),
    }
}

fn apply_scoped_packages(
    conn: &Connection,
    project_id: &str,
    option: &CatalogGroupInstallOption,
    applied: &mut Vec<String>,
) -> Result<()> {
    for scoped in &option.scoped_package {
        for name in scoped_targets(conn, project_id, &scoped.name)? {
            ExtraOptions::set_group_install_options(
                conn,
                project_id,
                &name,
                &scoped.depends_on,
                &scoped.enable_module,
                &scoped.disable_module,
            )?;
            push_unique(applied, &name);
        }
    }
    Ok(())
}

fn apply_group_install_options(
    conn: &Connection,
    project_id: &str,
    catalogs: &[CatalogGroupInstallOptions],
) -> Result<KindCatalogGroupInstallOptions> {
    let mut ret = KindCatalogGroupInstallOptions::default();
    for catalog in catalogs {
        apply_scoped_packages(conn, project_id, &catalog.srpm, &mut ret.scoped_packages)?;
        apply_scoped_packages(conn, project_id, &catalog.build, &mut ret.scoped_packages)?;

        if catalog.srpm.name.is_empty() || catalog.build.name.is_empty() {
            return Err(Error::ParseError(
                "failed to parse packages from GroupInstall options".to_string(),
            ));
        }
        Project::set_build_root_packages(conn, project_id, &catalog.srpm.name, &catalog.build.name)?;
        ret.srpm_packages.extend(catalog.srpm.name.iter().cloned());
        ret.build_packages.extend(catalog.build.name.iter().cloned());
    }
    Ok(ret)
}

/// `comps/<repo>-<arch>.xml` files of a checkout
fn read_comps(root: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let dir = root.join("comps");
    if !dir.is_dir() {
        info!("No comps detected");
        return Ok(Vec::new());
    }
    let mut entries: Vec<_> = std::fs::read_dir(&dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());
    let mut comps = Vec::new();
    for entry in entries {
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.ends_with(".xml") {
            info!("Skipping non-xml file {}", name);
            continue;
        }
        comps.push((name, std::fs::read(entry.path())?));
    }
    Ok(comps)
}

/// Attach comps as the `group`/`group_gz` entries of a new revision
fn apply_comps(conn: &Connection, project_id: &str, comps: &[(String, Vec<u8>)]) -> Result<Vec<String>> {
    let mut applied = Vec::new();
    for (file, groups) in comps {
        let Some((repo_name, arch)) = file.trim_end_matches(".xml").rsplit_once('-') else {
            warn!("Comps file {} is not named <repo>-<arch>.xml, skipping", file);
            continue;
        };
        let Some(repo) = Repository::find_by_name(conn, project_id, repo_name)? else {
            info!("Repository {} does not exist, skipping comps", repo_name);
            continue;
        };
        info!("Applying comps {}", file);

        let gz = compress_gz(groups)?;
        let previous = match RepositoryRevision::latest(conn, &repo.id, arch)? {
            Some(previous) => previous,
            None => {
                let id = db::new_id();
                let mut skeleton = RepositoryRevision::new(&id, &repo.id, arch);
                skeleton.repomd_xml = b64_encode(&encode_repomd(&RepomdRoot::new(id.clone()))?);
                skeleton.groups_xml = b64_encode(&gz);
                skeleton.create(conn)?;
                skeleton
            }
        };

        let id = db::new_id();
        let digest = PayloadDigest::of(groups, &gz);
        let timestamp = chrono::Utc::now().timestamp();
        let href = blob_href(&id, "GROUPS");
        let entries = vec![
            RepomdData::plain("group", href.trim_end_matches(".gz").to_string(), &digest, timestamp),
            RepomdData::compressed("group_gz", href, &digest, timestamp),
        ];
        let revision = RepositoryRevision {
            groups_xml: b64_encode(&gz),
            ..previous
        };
        super::composer::derive_revision(conn, &revision, &id, entries)?;
        applied.push(format!("{}-{}", repo.name, arch));
    }
    Ok(applied)
}

/// Builds to re-publish after a sync, without duplicates
fn reprocess_build_ids(conn: &Connection, project_id: &str, sync: &KindCatalogSync) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    let mut seen_packages: Vec<&str> = Vec::new();
    for package in sync.new_packages.iter().chain(&sync.modified_packages) {
        if package.starts_with("module:") || seen_packages.contains(&package.as_str()) {
            continue;
        }
        for id in Build::latest_ids_by_package_name(conn, package, project_id)? {
            push_unique(&mut ids, &id);
        }
        seen_packages.push(package);
    }
    for glob in &sync.additional_nvr_globs {
        for id in Build::active_ids_by_artifact_glob(conn, glob, project_id)? {
            push_unique(&mut ids, &id);
        }
    }
    Ok(ids)
}

/// Apply decoded catalogs and comps to a project in one transaction
pub(crate) fn apply_catalogs(
    conn: &mut Connection,
    project_id: &str,
    catalogs: &Catalogs,
    comps: &[(String, Vec<u8>)],
) -> Result<SyncCatalogTask> {
    db::transaction(conn, |tx| {
        let catalog_sync = apply_catalog_sync(tx, project_id, &catalogs.sync)?;
        let comps = apply_comps(tx, project_id, comps)?;
        let extra_options = apply_extra_options(tx, project_id, &catalogs.extra_options)?;
        let group_install_options = apply_group_install_options(tx, project_id, &catalogs.group_install_options)?;
        let reprocess_build_ids = reprocess_build_ids(tx, project_id, &catalog_sync)?;
        Ok(SyncCatalogTask {
            catalog_sync,
            extra_options,
            group_install_options,
            comps,
            reprocess_build_ids,
            repo_changes: None,
        })
    })
}

impl Controller {
    /// Create a sync task for a project and run it to completion
    pub async fn submit_sync_catalog(&self, req: SyncCatalogRequest, submitter: Option<String>) -> Result<SyncCatalogTask> {
        let project_ref = req.project_id.clone();
        let (project_id, task_id) = self
            .tx(move |tx| {
                let project = Project::resolve(tx, &project_ref)?;
                let task = Task::new("noarch", TaskType::SyncCatalog, Some(&project.id), None).with_submitter(submitter);
                task.insert(tx)?;
                Ok((project.id, task.id))
            })
            .await?;
        let req = SyncCatalogRequest { project_id, ..req };
        let ctx = self.workflow(&task_id);
        self.sync_catalog(&ctx, req, &task_id).await
    }

    /// Catalog sync workflow for an existing task
    pub async fn sync_catalog(&self, ctx: &WorkflowContext, req: SyncCatalogRequest, task_id: &str) -> Result<SyncCatalogTask> {
        let finalizer = TaskFinalizer::start(self.db_path.clone(), task_id, DOMAIN_TASKS).await?;
        let outcome = self.run_sync_catalog(ctx, &req, task_id).await;
        finalizer.close(outcome).await
    }

    async fn run_sync_catalog(&self, ctx: &WorkflowContext, req: &SyncCatalogRequest, task_id: &str) -> Result<SyncCatalogTask> {
        let spec = SandboxSpec {
            task_id: task_id.to_string(),
            parent_task_id: task_id.to_string(),
            project_id: req.project_id.clone(),
            purpose: "sync".to_string(),
            arch: "noarch".to_string(),
            high_resource: false,
            privileged: false,
        };
        let mut synced = self
            .with_worker(ctx, spec, |runner, sandbox| async move {
                ctx.execute_activity(
                    "sync-catalog",
                    &ActivityOptions::once(Duration::from_secs(15 * 60)),
                    |actx| {
                        let (runner, sandbox) = (runner.clone(), sandbox.clone());
                        async move {
                            let _alive = actx.keep_alive(Duration::from_secs(10));
                            let dir = scratch_dir(&sandbox, &actx)?.join("catalog");
                            info!("Cloning repository {}", req.scm_url);
                            self.tools
                                .scm
                                .clone_repo(runner.as_ref(), &req.scm_url, &dir, Some(&req.branch))
                                .await?;

                            info!("Scanning repository");
                            let scan_dir = dir.clone();
                            let (catalogs, comps) = tokio::task::spawn_blocking(move || {
                                Ok::<_, Error>((Catalogs::load(&scan_dir)?, read_comps(&scan_dir)?))
                            })
                            .await??;

                            let (db_path, project_id) = (self.db_path.clone(), req.project_id.clone());
                            tokio::task::spawn_blocking(move || {
                                let mut conn = db::open(&db_path)?;
                                apply_catalogs(&mut conn, &project_id, &catalogs, &comps)
                            })
                            .await?
                        }
                    },
                )
                .await
            })
            .await?;

        if !synced.reprocess_build_ids.is_empty() {
            info!("Re-processing {} build(s)", synced.reprocess_build_ids.len());
            let mut update = UpdateRepoRequest::new(&req.project_id, synced.reprocess_build_ids.clone());
            update.task_id = Some(task_id.to_string());
            synced.repo_changes = Some(self.update_repo(&ctx.child("yumrepofs"), update).await?);
        }
        Ok(synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::CatalogFile;
    use crate::metadata::codec::{b64_decode, decode_stored};
    use crate::metadata::repomd::decode_repomd;
    use crate::workflow::testing::TestEnv;
    use crate::workflow::{BuildOptions, BuildRequest};

    const CATALOG_URL: &str = "https://git.rockylinux.test/staging/peridot-config.git";
    const BASH_URL: &str = "https://git.rockylinux.test/staging/rpms/bash.git";

    const SYNC: &str = r#"# kind: resf.peridot.v1.CatalogSync
package {
  name: "bash"
  type: PACKAGE_TYPE_NORMAL_FORK
  repository { name: "BaseOS" }
}
package {
  name: "zsh"
  type: PACKAGE_TYPE_NORMAL_FORK
  repository { name: "BaseOS" }
}
package {
  name: "nodejs"
  type: PACKAGE_TYPE_MODULE_FORK
  repository { name: "AppStream" module_stream: "18" }
}
module_configuration {
  platform { major: 9 minor: 2 patch: 0 }
}
"#;

    const GROUPS: &str = "# kind: resf.peridot.v1.CatalogGroupInstallOptions\n\
        srpm { name: [\"bash\", \"rpm-build\"] scoped_package { name: \"z*\" depends_on: \"zlib-devel\" } }\n\
        build { name: [\"bash\", \"gcc\"] }\n";

    const EXTRA: &str = "# kind: resf.peridot.v1.CatalogExtraOptions\n\
        package_options { name: \"zsh\" with: \"static\" }\n";

    const COMPS: &str = "<?xml version=\"1.0\"?><comps><group><id>core</id></group></comps>";

    fn catalog_fixture(env: &TestEnv, files: &[(&str, &str)]) {
        let dir = env.path("fixtures/catalog");
        if dir.exists() {
            std::fs::remove_dir_all(&dir).unwrap();
        }
        for (name, content) in files {
            let path = dir.join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }
        env.scm.add_remote(CATALOG_URL, &dir);
    }

    fn request(env: &TestEnv) -> SyncCatalogRequest {
        SyncCatalogRequest {
            project_id: env.project.name.clone(),
            scm_url: CATALOG_URL.to_string(),
            branch: "main".to_string(),
        }
    }

    #[test]
    fn test_changed_globs_strip_arch_prefix() {
        let incoming = vec!["[x86_64]kernel-rt*".to_string(), "foo".to_string()];
        let current = vec!["foo".to_string(), "[aarch64]bar*".to_string()];
        assert_eq!(changed_globs(&incoming, &current), vec!["kernel-rt*", "bar*"]);
        assert!(changed_globs(&current, &current).is_empty());
    }

    #[test]
    fn test_index_merges_catalogs() {
        let CatalogFile::Sync(first) = crate::catalog::parse_catalog("a.cfg", SYNC).unwrap() else {
            panic!("wrong kind");
        };
        let second = CatalogSync {
            exclude_filter: vec![crate::catalog::CatalogFilter {
                repo_match: "^Base".to_string(),
                arch: vec![crate::catalog::CatalogArchGlobs {
                    key: "x86_64".to_string(),
                    glob_match: vec!["zsh-doc*".to_string()],
                }],
            }],
            ..Default::default()
        };
        let (index, config) = index_catalogs(&[first.clone(), second]).unwrap();
        assert_eq!(config.unwrap().platform.minor, 2);
        let appstream: Vec<&str> = index["AppStream"].packages.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(appstream, vec!["nodejs", "module:nodejs:18"]);
        assert_eq!(index["BaseOS"].exclude_filter, vec!["[x86_64]zsh-doc*"]);
        assert!(index["AppStream"].exclude_filter.is_empty());

        let err = index_catalogs(&[first.clone(), first]).unwrap_err();
        assert!(err.to_string().contains("multiple module configurations found"));
    }

    #[tokio::test]
    async fn test_sync_creates_packages_repositories_and_comps() {
        let env = TestEnv::new();
        catalog_fixture(
            &env,
            &[
                ("catalog/sync.cfg", SYNC),
                ("catalog/groups.cfg", GROUPS),
                ("catalog/extra.cfg", EXTRA),
                ("comps/BaseOS-x86_64.xml", COMPS),
                ("comps/Missing-x86_64.xml", COMPS),
            ],
        );

        let task = env.controller.submit_sync_catalog(request(&env), None).await.unwrap();
        let sync = &task.catalog_sync;
        assert_eq!(sync.new_packages, vec!["nodejs", "bash", "zsh"]);
        assert_eq!(sync.new_repositories, vec!["AppStream", "BaseOS"]);
        assert!(sync.modified_packages.contains(&"module:nodejs:18".to_string()));
        assert_eq!(task.comps, vec!["BaseOS-x86_64"]);
        assert_eq!(task.extra_options.packages, vec!["zsh"]);
        assert_eq!(task.group_install_options.scoped_packages, vec!["zsh"]);
        assert!(task.reprocess_build_ids.is_empty());
        assert!(task.repo_changes.is_none());

        let conn = env.conn();
        let nodejs = Package::find_in_project(&conn, &env.project.id, "nodejs").unwrap().unwrap();
        assert!(nodejs.effective_type().is_module());
        let appstream = Repository::find_by_name(&conn, &env.project.id, "AppStream").unwrap().unwrap();
        assert_eq!(appstream.packages, vec!["nodejs", "module:nodejs:18"]);
        let config = ModuleConfiguration::find(&conn, &env.project.id).unwrap().unwrap();
        assert_eq!(config.platform.dist(), "el9.2.0");

        let project = Project::find_by_id(&conn, &env.project.id).unwrap().unwrap();
        assert_eq!(project.srpm_stage_packages, vec!["bash", "rpm-build"]);
        assert_eq!(project.build_stage_packages, vec!["bash", "gcc"]);
        let zsh = ExtraOptions::find(&conn, &env.project.id, "zsh").unwrap().unwrap();
        assert_eq!(zsh.with_flags, vec!["static"]);
        assert_eq!(zsh.depends_on, vec!["zlib-devel"]);

        let baseos = Repository::find_by_name(&conn, &env.project.id, "BaseOS").unwrap().unwrap();
        let revision = RepositoryRevision::latest(&conn, &baseos.id, "x86_64").unwrap().unwrap();
        assert_eq!(decode_stored(&revision.groups_xml).unwrap().unwrap(), COMPS.as_bytes());
        let repomd = decode_repomd(&b64_decode(&revision.repomd_xml).unwrap()).unwrap();
        let group = repomd.find("group_gz").unwrap();
        assert!(group.location.href.starts_with(&format!("repodata/{}-GROUPS", revision.id)));
        assert!(repomd.find("group").is_some());
    }

    #[tokio::test]
    async fn test_new_repository_republishes_existing_builds() {
        let env = TestEnv::new();
        let bash = env.package("bash", PackageType::NormalFork);
        env.import_revision(&bash, "5.1.8", "6.el9", "r9", "aaaa");
        let fixture = env.path("fixtures/bash");
        std::fs::create_dir_all(fixture.join("SPECS")).unwrap();
        std::fs::write(fixture.join("SPECS/bash.spec"), "Name: bash\nVersion: 5.1.8\n").unwrap();
        env.scm.add_remote(BASH_URL, &fixture);

        let build = env
            .controller
            .submit_build(
                BuildRequest {
                    project_id: env.project.id.clone(),
                    package_name: "bash".to_string(),
                    ..Default::default()
                },
                BuildOptions::default(),
                None,
            )
            .await
            .unwrap();

        catalog_fixture(
            &env,
            &[(
                "sync.cfg",
                "# kind: resf.peridot.v1.CatalogSync\npackage { name: \"bash\" repository { name: \"BaseOS\" } }\n",
            )],
        );
        let task = env.controller.submit_sync_catalog(request(&env), None).await.unwrap();
        assert!(task.catalog_sync.new_packages.is_empty());
        assert_eq!(task.catalog_sync.modified_packages, vec!["bash"]);
        assert_eq!(task.reprocess_build_ids, vec![build.build_id.clone()]);
        let changes = task.repo_changes.unwrap().changes;
        assert!(changes.iter().any(|c| c.name == "BaseOS-x86_64"));

        // A filter change on an existing repository yields LIKE globs
        catalog_fixture(
            &env,
            &[(
                "sync.cfg",
                "# kind: resf.peridot.v1.CatalogSync\npackage { name: \"bash\" repository { name: \"BaseOS\" } }\n\
                 exclude_filter { repo_match: \"*\" arch { key: \"x86_64\" glob_match: \"bash-doc*\" } }\n",
            )],
        );
        let task = env.controller.submit_sync_catalog(request(&env), None).await.unwrap();
        assert_eq!(task.catalog_sync.modified_repositories, vec!["BaseOS"]);
        assert_eq!(task.catalog_sync.additional_nvr_globs, vec!["%/bash-doc%%"]);
        let conn = env.conn();
        let baseos = Repository::find_by_name(&conn, &env.project.id, "BaseOS").unwrap().unwrap();
        assert_eq!(baseos.exclude_filter, vec!["[x86_64]bash-doc*"]);
    }

    #[tokio::test]
    async fn test_extra_options_for_unknown_package_fail() {
        let env = TestEnv::new();
        catalog_fixture(&env, &[("extra.cfg", EXTRA)]);
        let err = env.controller.submit_sync_catalog(request(&env), None).await.unwrap_err();
        assert!(err.to_string().contains("zsh in project"));

        let conn = env.conn();
        assert!(Repository::list_all(&conn, &env.project.id).unwrap().is_empty());
    }
}
