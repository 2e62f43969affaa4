// src/workflow/composer.rs

//! yumrepofs composer
//!
//! Publishing builds never edits a revision in place. For every repository
//! a build lands in, the latest revision of each affected arch is decoded,
//! the build's packages are merged in (replacing older entries of the same
//! package and dropping superseded artifacts), and a new revision is
//! appended. All of it happens in one transaction under the project lease,
//! so concurrent composers for the same project serialize.
//!
//! Placement of artifacts into arches is decided by [`generate_arch_map`]:
//! noarch packages go to every arch, debug packages to `<arch>-debug`,
//! sources to `src`, and multilib-eligible packages additionally to the
//! 64-bit arch they are compatible with.

use super::{
    Controller, ModuleBuildTask, ModuleStream, PackageOperationMetadata, RepositoryChange,
    UpdateRepoRequest, UpdateRepoTask, reduce_changes,
};
use crate::db::{
    self,
    models::{
        Build, Key, ModuleConfiguration, Project, ProjectPackageVersion, Repository,
        RepositoryRevision, Task, TaskArtifact, TaskType,
    },
};
use crate::error::{Error, Result};
use crate::metadata::codec::{PayloadDigest, b64_decode, b64_encode, compress_gz, decode_stored, sha256_hex};
use crate::metadata::modulemd::{self, Defaults, ModuleMd, decode_modules, encode_modules};
use crate::metadata::repomd::{RepomdData, RepomdRoot, blob_href, decode_repomd, encode_repomd};
use crate::metadata::{
    FilelistsRoot, OtherRoot, PrimaryRoot, decode_filelists, decode_other, decode_primary,
    encode_filelists, encode_other, encode_primary,
};
use crate::multilib::{ArchFamilies, compatible_arches, devel_multilib, runtime_multilib};
use crate::orchestrator::{ActivityContext, ActivityOptions, DOMAIN_TASKS, TaskFinalizer, WorkflowContext};
use crate::rpmutils::{self, Nvr};
use crate::tools::RpmArtifactMetadata;
use crate::worker::LocalRunner;
use futures::future::try_join_all;
use glob::Pattern;
use regex::Regex;
use rusqlite::Connection;
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, info};

static GLOB_ARCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[(.+)\](.+)$").expect("valid regex"));

/// A glob filter, optionally restricted to one arch with a `[arch]` prefix
#[derive(Debug, Clone)]
struct CompiledGlob {
    arch: String,
    pattern: Pattern,
}

impl CompiledGlob {
    fn compile(filter: &str) -> Result<Self> {
        let (arch, value) = match GLOB_ARCH_RE.captures(filter) {
            Some(caps) => (caps[1].to_string(), caps[2].to_string()),
            None => (String::new(), filter.to_string()),
        };
        let pattern = Pattern::new(&value)
            .map_err(|e| Error::InvalidArgument(format!("invalid glob filter {filter}: {e}")))?;
        Ok(Self { arch, pattern })
    }

    fn applies_to(&self, arch: &str) -> bool {
        self.arch.is_empty() || self.arch == arch
    }
}

/// An artifact placed into one repository arch
#[derive(Debug, Clone)]
pub struct ArchMapArtifact {
    pub artifact: TaskArtifact,
    /// Package name parsed from the file name
    pub name: String,
    pub multilib: bool,
    /// Matched a glob include filter
    pub forced: bool,
}

fn rpm_base(name: &str) -> &str {
    rpmutils::strip_rpm_suffix(rpmutils::basename(name))
}

/// Place build artifacts into the arches of a repository.
///
/// Every project arch and its `-debug` sibling is present in the result,
/// even when empty. Artifacts without RPM metadata (logs) are skipped.
pub fn generate_arch_map(
    artifacts: &[TaskArtifact],
    project: &Project,
    repo: &Repository,
    families: &ArchFamilies,
) -> Result<BTreeMap<String, Vec<ArchMapArtifact>>> {
    let include_globs = repo
        .glob_include_filter
        .iter()
        .map(|f| CompiledGlob::compile(f))
        .collect::<Result<Vec<_>>>()?;

    let mut map: BTreeMap<String, Vec<ArchMapArtifact>> = BTreeMap::new();
    for arch in &project.archs {
        map.entry(arch.clone()).or_default();
        map.entry(format!("{arch}-debug")).or_default();
    }

    for artifact in artifacts {
        let Some(metadata) = artifact.metadata.as_ref() else {
            continue;
        };
        let (name, nvr_arch) = Nvr::parse(rpm_base(&artifact.name))
            .map(|nvr| (nvr.name, nvr.arch))
            .unwrap_or_default();
        let metadata = RpmArtifactMetadata::from_value(metadata)?;
        let primary = metadata.primary_package()?;
        let files = decode_filelists(metadata.filelists.as_bytes())?
            .packages
            .into_iter()
            .next()
            .map(|p| p.files)
            .unwrap_or_default();

        // Module components are filtered through their modulemd instead
        if !rpmutils::is_module_artifact(&artifact.name) {
            for multilib_arch in &repo.multilib {
                if !compatible_arches(families, multilib_arch)
                    .iter()
                    .any(|a| *a == artifact.arch)
                {
                    continue;
                }
                let devel = devel_multilib(
                    &primary,
                    &files,
                    &repo.exclude_multilib_filter,
                    &repo.additional_multilib,
                )?;
                let runtime = runtime_multilib(
                    &primary,
                    &files,
                    &repo.exclude_multilib_filter,
                    &repo.additional_multilib,
                )?;
                if !devel && !runtime && !repo.include_filter.contains(&format!("{name}.{nvr_arch}")) {
                    continue;
                }
                map.entry(multilib_arch.clone()).or_default().push(ArchMapArtifact {
                    artifact: artifact.clone(),
                    name: name.clone(),
                    multilib: true,
                    forced: false,
                });
            }
        }

        let forced = include_globs
            .iter()
            .any(|g| g.applies_to(&artifact.arch) && g.pattern.matches(&name));
        let placed = ArchMapArtifact {
            artifact: artifact.clone(),
            name: name.clone(),
            multilib: false,
            forced,
        };

        if artifact.arch == "noarch" {
            for arch in project.archs.iter().filter(|a| *a != "noarch") {
                map.entry(arch.clone()).or_default().push(placed.clone());
            }
        } else if rpmutils::is_debug_package(&name) {
            map.entry(format!("{}-debug", artifact.arch)).or_default().push(placed);
        } else {
            map.entry(artifact.arch.clone()).or_default().push(placed);
        }
    }

    Ok(map)
}

/// Module defaults configured for a project, keyed by module name
fn indexed_module_defaults(conn: &Connection, project_id: &str) -> Result<BTreeMap<String, Defaults>> {
    let Some(config) = ModuleConfiguration::find(conn, project_id)? else {
        return Ok(BTreeMap::new());
    };

    let mut index = BTreeMap::new();
    for default in &config.default {
        if index.contains_key(&default.name) {
            return Err(Error::InvalidArgument(format!(
                "duplicate default module {}",
                default.name
            )));
        }
        let mut profiles: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for common in &default.common_profile {
            profiles.insert(common.clone(), vec!["common".to_string()]);
        }
        for profile in &default.profile {
            profiles
                .entry(profile.stream.clone())
                .or_default()
                .extend(profile.name.iter().cloned());
        }
        index.insert(
            default.name.clone(),
            Defaults::new(&default.name, &default.stream, profiles),
        );
    }
    Ok(index)
}

/// Module streams in publish order: plain documents first, then `-devel`
/// counterparts renamed to `<name>-devel`
fn split_devel_streams(streams: &[ModuleStream]) -> Vec<ModuleStream> {
    let mut plain_streams = Vec::with_capacity(streams.len() * 2);
    let mut devel_streams = Vec::with_capacity(streams.len());
    for stream in streams {
        let mut plain = ModuleStream {
            docs: BTreeMap::new(),
            ..stream.clone()
        };
        let mut devel = ModuleStream {
            name: format!("{}-devel", stream.name),
            docs: BTreeMap::new(),
            ..stream.clone()
        };
        for (arch, docs) in &stream.docs {
            let plain_docs = plain.docs.entry(arch.clone()).or_default();
            let devel_docs = devel.docs.entry(arch.clone()).or_default();
            for (doc_stream, doc) in docs {
                match doc_stream.strip_suffix("-devel") {
                    Some(base) => {
                        devel_docs.insert(base.to_string(), doc.clone());
                    }
                    None => {
                        plain_docs.insert(doc_stream.clone(), doc.clone());
                    }
                }
            }
        }
        plain_streams.push(plain);
        devel_streams.push(devel);
    }
    plain_streams.extend(devel_streams);
    plain_streams
}

/// Working copy of one repository arch during a composer run
struct CachedRepo {
    repo: Repository,
    arch: String,
    primary: PrimaryRoot,
    filelists: FilelistsRoot,
    other: OtherRoot,
    modules: Vec<ModuleMd>,
    defaults: Vec<Defaults>,
    defaults_yaml: Vec<u8>,
    groups_xml: String,
}

#[derive(Default)]
struct RepoCache {
    globs: HashMap<String, CompiledGlob>,
    /// Keyed by `<repo>-<arch>`
    repos: BTreeMap<String, CachedRepo>,
}

/// Per-build state shared by every arch of every repository
struct BuildScope<'s> {
    artifacts: &'s [TaskArtifact],
    current_active: &'s [TaskArtifact],
    skip_delete: &'s [String],
    stream: Option<&'s ModuleStream>,
}

struct Composer<'a> {
    conn: &'a Connection,
    req: &'a UpdateRepoRequest,
    project: Project,
    gpg_id: Option<&'a str>,
    families: &'a ArchFamilies,
    defaults_index: BTreeMap<String, Defaults>,
    cache: RepoCache,
}

/// Compose every build of `req` into new repository revisions.
///
/// Runs in one transaction; the caller holds the project lease.
pub(crate) fn compose(
    conn: &mut Connection,
    req: &UpdateRepoRequest,
    gpg_id: Option<&str>,
    families: &ArchFamilies,
) -> Result<UpdateRepoTask> {
    db::transaction(conn, |tx| {
        let project = Project::find_by_id(tx, &req.project_id)?
            .ok_or_else(|| Error::NotFound(format!("project {}", req.project_id)))?;
        let composer = Composer {
            conn: tx,
            req,
            defaults_index: indexed_module_defaults(tx, &project.id)?,
            project,
            gpg_id,
            families,
            cache: RepoCache::default(),
        };
        composer.run()
    })
}

/// Append a copy of `previous` under a new id with some repomd entries
/// replaced.
///
/// Payloads and the remaining entries (checksums and hrefs included) are
/// carried over untouched.
pub(crate) fn derive_revision(
    conn: &Connection,
    previous: &RepositoryRevision,
    id: &str,
    entries: Vec<RepomdData>,
) -> Result<RepositoryRevision> {
    let mut repomd = decode_repomd(&b64_decode(&previous.repomd_xml)?)?;
    repomd.revision = id.to_string();
    for entry in entries {
        repomd.upsert(entry);
    }
    let mut revision = RepositoryRevision {
        id: id.to_string(),
        repomd_xml: b64_encode(&encode_repomd(&repomd)?),
        ..previous.clone()
    };
    revision.create(conn)?;
    Ok(revision)
}

impl<'a> Composer<'a> {
    fn run(mut self) -> Result<UpdateRepoTask> {
        let mut changes = Vec::new();
        for build_id in &self.req.build_ids {
            let task = Task::find_by_build_id(self.conn, build_id)?
                .ok_or_else(|| Error::NotFound(format!("task of build {build_id}")))?;
            let metadata: PackageOperationMetadata = task
                .metadata
                .clone()
                .map(serde_json::from_value)
                .transpose()?
                .unwrap_or_default();

            if metadata.modular && !self.req.force_non_modular {
                let response: ModuleBuildTask = task
                    .response
                    .clone()
                    .map(serde_json::from_value)
                    .transpose()?
                    .ok_or_else(|| Error::InternalError(format!("module build {build_id} has no response")))?;
                for stream in split_devel_streams(&response.streams) {
                    let package_name = format!("module:{}:{}", stream.name, stream.stream);
                    changes.extend(self.make_repo_changes(&package_name, build_id, Some(&stream))?);
                }
            } else {
                changes.extend(self.make_repo_changes(&metadata.package_name, build_id, None)?);
            }
        }

        let changes = reduce_changes(changes);
        for cached in self.cache.repos.values() {
            info!("Writing revision for {}-{}", cached.repo.name, cached.arch);
            self.emit(cached)?;
        }
        Ok(UpdateRepoTask { changes })
    }

    fn make_repo_changes(
        &mut self,
        package_name: &str,
        build_id: &str,
        stream: Option<&ModuleStream>,
    ) -> Result<Vec<RepositoryChange>> {
        let conn = self.conn;
        let project_id = self.project.id.clone();
        let build = Build::find_by_id(conn, build_id)?
            .ok_or_else(|| Error::NotFound(format!("build {build_id}")))?;
        let artifacts = TaskArtifact::list_for_build(conn, build_id)?;

        let active_ids = match stream {
            None => Build::latest_ids_by_package_name(conn, &build.package_name, &project_id)?,
            Some(s) => Build::latest_ids_by_package_and_stream(conn, &build.package_name, &s.stream, &project_id)?,
        };
        let mut current_active = Vec::new();
        for id in active_ids {
            current_active.extend(TaskArtifact::list_for_build(conn, &id)?);
        }
        let skip_delete: Vec<String> = artifacts.iter().map(|a| rpm_base(&a.name).to_string()).collect();

        let repos = match &self.req.force_repo_id {
            Some(id) => vec![Repository::find(conn, id, Some(&project_id))?],
            None => Repository::find_for_package(conn, &project_id, package_name, false)?,
        };

        let scope = BuildScope {
            artifacts: &artifacts,
            current_active: &current_active,
            skip_delete: &skip_delete,
            stream,
        };
        let mut changes = Vec::new();
        for repo in &repos {
            debug!("Composing build {} into {}", build_id, repo.name);
            let arch_map = generate_arch_map(&artifacts, &self.project, repo, self.families)?;
            let exclude_globs = self.exclude_globs(repo)?;
            for (arch, arch_artifacts) in arch_map {
                changes.push(self.compose_arch(&scope, repo, &exclude_globs, &arch, arch_artifacts)?);
            }
        }

        if !self.req.disable_set_active {
            ProjectPackageVersion::make_active_in_repo(
                conn,
                &build.package_version_id,
                &build.package_id,
                &build.project_id,
            )?;
        }
        debug!("Processed {} artifacts of build {}", artifacts.len(), build_id);
        Ok(changes)
    }

    fn exclude_globs(&mut self, repo: &Repository) -> Result<Vec<CompiledGlob>> {
        let mut globs = Vec::with_capacity(repo.exclude_filter.len());
        for filter in &repo.exclude_filter {
            if let Some(glob) = self.cache.globs.get(filter) {
                globs.push(glob.clone());
                continue;
            }
            let glob = CompiledGlob::compile(filter)?;
            self.cache.globs.insert(filter.clone(), glob.clone());
            globs.push(glob);
        }
        Ok(globs)
    }

    /// Latest published state of one repository arch
    fn load_latest(
        &self,
        repo: &Repository,
        arch: &str,
        no_debug_arch: &str,
        modular: bool,
        cached_modules: Option<Vec<ModuleMd>>,
    ) -> Result<CachedRepo> {
        let mut loaded = CachedRepo {
            repo: repo.clone(),
            arch: arch.to_string(),
            primary: PrimaryRoot::default(),
            filelists: FilelistsRoot::default(),
            other: OtherRoot::default(),
            modules: Vec::new(),
            defaults: Vec::new(),
            defaults_yaml: Vec::new(),
            groups_xml: String::new(),
        };

        let current = RepositoryRevision::latest(self.conn, &repo.id, arch)?;
        if let Some(current) = &current {
            if let Some(raw) = decode_stored(&current.primary_xml)? {
                loaded.primary = decode_primary(&raw)?;
            }
            if let Some(raw) = decode_stored(&current.filelists_xml)? {
                loaded.filelists = decode_filelists(&raw)?;
            }
            if let Some(raw) = decode_stored(&current.other_xml)? {
                loaded.other = decode_other(&raw)?;
            }
            loaded.groups_xml = current.groups_xml.clone();
        }

        match cached_modules {
            Some(modules) => loaded.modules = modules,
            None => {
                let modules_revision = if arch.ends_with("-debug") && modular {
                    RepositoryRevision::latest(self.conn, &repo.id, no_debug_arch)?
                } else {
                    current
                };
                if let Some(revision) = modules_revision {
                    if let Some(raw) = decode_stored(&revision.modules_yaml)? {
                        loaded.modules = decode_modules(&raw)?;
                    }
                }
            }
        }
        Ok(loaded)
    }

    fn compose_arch(
        &mut self,
        scope: &BuildScope<'_>,
        repo: &Repository,
        exclude_globs: &[CompiledGlob],
        arch: &str,
        mut arch_artifacts: Vec<ArchMapArtifact>,
    ) -> Result<RepositoryChange> {
        let conn = self.conn;
        let no_debug_arch = arch.strip_suffix("-debug").unwrap_or(arch);
        let is_debug = arch.ends_with("-debug");

        let mut stream_document: Option<ModuleMd> = None;
        if let Some(stream) = scope.stream {
            if let Some(doc) = stream.docs.get(no_debug_arch).and_then(|d| d.get(&stream.stream)) {
                let document = modulemd::parse(doc.as_bytes())?;
                let selected: Vec<TaskArtifact> = if arch != "src" {
                    let wanted: Vec<String> = document
                        .data()?
                        .artifact_rpms()
                        .iter()
                        .map(|a| rpmutils::strip_epoch(a))
                        .collect();
                    arch_artifacts
                        .iter()
                        .filter(|a| wanted.iter().any(|w| w == rpm_base(&a.artifact.name)))
                        .map(|a| a.artifact.clone())
                        .collect()
                } else {
                    let mut seen = Vec::new();
                    arch_artifacts
                        .iter()
                        .filter(|a| {
                            if seen.contains(&a.artifact.name) {
                                return false;
                            }
                            seen.push(a.artifact.name.clone());
                            true
                        })
                        .map(|a| a.artifact.clone())
                        .collect()
                };
                arch_artifacts = generate_arch_map(&selected, &self.project, repo, self.families)?
                    .remove(arch)
                    .unwrap_or_default();
                stream_document = Some(document);
            }
            if is_debug || arch == "src" {
                stream_document = None;
            }
        }

        let mut change = RepositoryChange {
            name: format!("{}-{}", repo.name, arch),
            ..Default::default()
        };

        let id_arch = format!("{}-{}", repo.name, arch);
        let id_arch_no_debug = format!("{}-{}", repo.name, no_debug_arch);
        let cached_modules = self
            .cache
            .repos
            .get(&id_arch_no_debug)
            .map(|r| r.modules.clone());
        let mut state = match self.cache.repos.remove(&id_arch) {
            Some(mut cached) => {
                debug!("Using cached state for {}", id_arch);
                cached.modules = cached_modules.unwrap_or_default();
                cached
            }
            None => self.load_latest(repo, arch, no_debug_arch, scope.stream.is_some(), cached_modules)?,
        };

        for placed in &arch_artifacts {
            let Some(metadata) = placed.artifact.metadata.as_ref() else {
                continue;
            };
            let file_name = rpmutils::basename(&placed.artifact.name);
            let base = rpm_base(&placed.artifact.name).to_string();
            let name = placed.name.as_str();
            let no_debug_name = rpmutils::no_debug_name(name);
            let arch_name = if is_debug {
                format!("{}.{}", no_debug_name, placed.artifact.arch)
            } else {
                format!("{}.{}", name, placed.artifact.arch)
            };

            let mut should_add = true;
            if arch != "src" && scope.stream.is_none() {
                if !repo.include_filter.is_empty()
                    && !placed.forced
                    && !repo.include_filter.contains(&arch_name)
                    && !repo.additional_multilib.contains(&no_debug_name)
                {
                    should_add = false;
                }
                for glob in exclude_globs {
                    if !glob.applies_to(no_debug_arch) {
                        continue;
                    }
                    if glob.pattern.matches(&no_debug_name) || glob.pattern.matches(&arch_name) {
                        should_add = false;
                    }
                }
            }
            if !should_add {
                debug!("Filtered {} out of {}", base, change.name);
                change.removed_packages.push(base);
                continue;
            }

            let metadata = RpmArtifactMetadata::from_value(metadata)?;
            let mut pkg_primary = metadata.primary_package()?;
            let mut pkg_filelists = decode_filelists(metadata.filelists.as_bytes())?
                .packages
                .into_iter()
                .next()
                .ok_or_else(|| Error::ParseError(format!("{} has no filelists entry", base)))?;
            let mut pkg_other = decode_other(metadata.other.as_bytes())?
                .packages
                .into_iter()
                .next()
                .ok_or_else(|| Error::ParseError(format!("{} has no other entry", base)))?;

            match self.gpg_id {
                Some(gpg_id) => {
                    let dir = placed
                        .artifact
                        .name
                        .rsplit_once('/')
                        .map(|(dir, _)| dir)
                        .unwrap_or(".");
                    let signed_key = format!("{dir}/{gpg_id}/{file_name}");
                    let hash = TaskArtifact::signature_hash(conn, &placed.artifact.name, gpg_id)?
                        .ok_or_else(|| Error::NotFound(format!("could not find signed artifact: {signed_key}")))?;
                    pkg_primary.location.href = format!("Packages/{signed_key}");
                    pkg_primary.checksum.value = hash.clone();
                    pkg_filelists.pkgid = hash.clone();
                    pkg_other.pkgid = hash;
                }
                None => {
                    pkg_primary.location.href = format!("Packages/{}", placed.artifact.name);
                }
            }

            let artifact_arch = placed.artifact.arch.as_str();
            let existing = state.primary.packages.iter().position(|p| {
                if p.name != name || p.arch != artifact_arch {
                    return false;
                }
                match scope.stream {
                    None => !rpmutils::is_module_artifact(&p.version.rel),
                    Some(_) => {
                        rpmutils::is_module_artifact(&p.version.rel)
                            && scope.artifacts.iter().any(|sa| {
                                Nvr::parse(rpm_base(&sa.name)).is_some_and(|nvr| {
                                    nvr.name == name
                                        && p.version.ver == nvr.version
                                        && p.version.rel == nvr.release
                                })
                            })
                    }
                }
            });

            let pkg_id = existing.map(|i| state.primary.packages[i].checksum.value.clone());
            match existing {
                Some(i) => {
                    if !change.modified_packages.contains(&base) && !change.added_packages.contains(&base) {
                        change.modified_packages.push(base.clone());
                    }
                    state.primary.packages[i] = pkg_primary;
                }
                None => {
                    if !change.added_packages.contains(&base) && !change.modified_packages.contains(&base) {
                        change.added_packages.push(base.clone());
                    }
                    state.primary.packages.push(pkg_primary);
                }
            }

            let filelists_index = pkg_id
                .as_ref()
                .and_then(|id| state.filelists.packages.iter().position(|p| &p.pkgid == id));
            match filelists_index {
                Some(i) => state.filelists.packages[i] = pkg_filelists,
                None => state.filelists.packages.push(pkg_filelists),
            }
            let other_index = pkg_id
                .as_ref()
                .and_then(|id| state.other.packages.iter().position(|p| &p.pkgid == id));
            match other_index {
                Some(i) => state.other.packages[i] = pkg_other,
                None => state.other.packages.push(pkg_other),
            }
        }

        // Drop artifacts of previously active builds this build supersedes
        if !self.req.no_delete_previous || scope.stream.is_some() {
            let delete_ids: Vec<String> = state
                .primary
                .packages
                .iter()
                .filter(|pkg| {
                    let href_base = rpmutils::basename(&pkg.location.href);
                    scope.current_active.iter().any(|artifact| {
                        let no_rpm = rpm_base(&artifact.name).to_string();
                        rpmutils::basename(&artifact.name) == href_base
                            && !change.modified_packages.contains(&no_rpm)
                            && !change.added_packages.contains(&no_rpm)
                            && !scope.skip_delete.contains(&no_rpm)
                    })
                })
                .map(|pkg| {
                    debug!("Removing {} from {}", pkg.location.href, change.name);
                    pkg.checksum.value.clone()
                })
                .collect();
            state.primary.packages.retain(|p| !delete_ids.contains(&p.checksum.value));
            state.filelists.packages.retain(|p| !delete_ids.contains(&p.pkgid));
            state.other.packages.retain(|p| !delete_ids.contains(&p.pkgid));
        }

        state.primary.package_count = state.primary.packages.len();
        state.filelists.package_count = state.filelists.packages.len();
        state.other.package_count = state.other.packages.len();

        if let (Some(stream), Some(document)) = (scope.stream, stream_document) {
            let name_stream = format!("{}:{}", stream.name, stream.stream);
            let existing = state
                .modules
                .iter()
                .position(|md| md.name_stream() == Some((stream.name.as_str(), stream.stream.as_str())));
            match existing {
                Some(i) => {
                    debug!("Replacing module entry {}", name_stream);
                    change.modified_modules.push(name_stream);
                    state.modules[i] = document;
                }
                None => {
                    debug!("Adding module entry {}", name_stream);
                    change.added_modules.push(name_stream);
                    state.modules.push(document);
                }
            }
        }

        state.defaults = self
            .defaults_index
            .iter()
            .filter(|(module, _)| {
                state
                    .modules
                    .iter()
                    .any(|md| md.name_stream().is_some_and(|(name, _)| name == module.as_str()))
            })
            .map(|(_, defaults)| defaults.clone())
            .collect();
        state.defaults_yaml = if state.defaults.is_empty() {
            Vec::new()
        } else {
            let docs = state
                .defaults
                .iter()
                .map(serde_yaml::to_string)
                .collect::<std::result::Result<Vec<_>, _>>()?;
            format!("---\n{}", docs.join("---\n")).into_bytes()
        };

        if is_debug || arch == "src" {
            state.modules.clear();
        }
        self.cache.repos.insert(id_arch, state);
        Ok(change)
    }

    /// Append a revision for one cached repository arch
    fn emit(&self, cached: &CachedRepo) -> Result<()> {
        let primary = encode_primary(&cached.primary)?;
        let filelists = encode_filelists(&cached.filelists)?;
        let other = encode_other(&cached.other)?;
        let groups = decode_stored(&cached.groups_xml)?.unwrap_or_default();
        let modules = if cached.modules.is_empty() {
            Vec::new()
        } else {
            encode_modules(&cached.defaults, &cached.modules)?
        };

        let revision_id = db::new_id();
        let timestamp = chrono::Utc::now().timestamp();
        let mut repomd = RepomdRoot::new(revision_id.clone());

        let primary_gz = compress_gz(&primary)?;
        let filelists_gz = compress_gz(&filelists)?;
        let other_gz = compress_gz(&other)?;
        repomd.upsert(RepomdData::compressed(
            "primary",
            blob_href(&revision_id, "PRIMARY"),
            &PayloadDigest::of(&primary, &primary_gz),
            timestamp,
        ));
        repomd.upsert(RepomdData::compressed(
            "filelists",
            blob_href(&revision_id, "FILELISTS"),
            &PayloadDigest::of(&filelists, &filelists_gz),
            timestamp,
        ));
        repomd.upsert(RepomdData::compressed(
            "other",
            blob_href(&revision_id, "OTHER"),
            &PayloadDigest::of(&other, &other_gz),
            timestamp,
        ));

        let modules_gz = if modules.is_empty() {
            None
        } else {
            let gz = compress_gz(&modules)?;
            repomd.upsert(RepomdData::compressed(
                "modules",
                blob_href(&revision_id, "MODULES"),
                &PayloadDigest::of(&modules, &gz),
                timestamp,
            ));
            Some(gz)
        };

        let groups_gz = if groups.is_empty() {
            None
        } else {
            let gz = compress_gz(&groups)?;
            let digest = PayloadDigest::of(&groups, &gz);
            let href = blob_href(&revision_id, "GROUPS");
            repomd.upsert(RepomdData::plain(
                "group",
                href.trim_end_matches(".gz").to_string(),
                &digest,
                timestamp,
            ));
            repomd.upsert(RepomdData::compressed("group_gz", href, &digest, timestamp));
            Some(gz)
        };

        let mut revision = RepositoryRevision::new(&revision_id, &cached.repo.id, &cached.arch);
        revision.repomd_xml = b64_encode(&encode_repomd(&repomd)?);
        revision.primary_xml = b64_encode(&primary_gz);
        revision.filelists_xml = b64_encode(&filelists_gz);
        revision.other_xml = b64_encode(&other_gz);
        revision.modules_yaml = modules_gz.map(|gz| b64_encode(&gz)).unwrap_or_default();
        revision.module_defaults_yaml = b64_encode(&cached.defaults_yaml);
        revision.groups_xml = groups_gz.map(|gz| b64_encode(&gz)).unwrap_or_default();
        revision.create(self.conn)?;
        Ok(())
    }
}

impl Controller {
    /// Publish builds into every repository they belong to
    pub async fn update_repo(&self, ctx: &WorkflowContext, req: UpdateRepoRequest) -> Result<UpdateRepoTask> {
        let project_id = req.project_id.clone();
        let key = self
            .db(move |conn| {
                Project::find_by_id(conn, &project_id)?
                    .ok_or_else(|| Error::NotFound(format!("project {project_id}")))?;
                Key::default_for_project(conn, &project_id)
            })
            .await?;

        let mut gpg_id = None;
        if let Some(key) = key.filter(|_| !req.disable_signing) {
            let options = ActivityOptions::signing();
            let signings = req.build_ids.iter().map(|build_id| {
                let scope = ctx.child(&format!("sign-{build_id}"));
                let key = key.clone();
                async move {
                    scope
                        .execute_activity("sign-artifacts", &options, |actx| {
                            let key = key.clone();
                            async move { self.sign_build_artifacts(&actx, build_id, &key).await }
                        })
                        .await
                }
            });
            try_join_all(signings).await?;
            gpg_id = Some(key.gpg_id);
        }

        let (db_path, project_id, parent) = (self.db_path.clone(), req.project_id.clone(), req.task_id.clone());
        let task_id: String = ctx
            .side_effect(move || {
                let conn = db::open(&db_path)?;
                let task = Task::new("noarch", TaskType::YumrepofsUpdate, Some(&project_id), parent.as_deref());
                task.insert(&conn)?;
                Ok(task.id)
            })
            .await?;

        let retry_interval = self
            .config
            .composer_retry_interval()
            .map_err(|e| Error::ConfigError(format!("{e:#}")))?;
        let options = ActivityOptions::composer().with_initial_interval(retry_interval);

        // Failed attempts are retried, so only the final outcome closes the task
        let finalizer = TaskFinalizer::start(self.db_path.clone(), &task_id, DOMAIN_TASKS).await?;
        let outcome = ctx
            .execute_activity("update-repo", &options, |actx| {
                let (req, gpg_id) = (req.clone(), gpg_id.clone());
                async move { self.update_repo_activity(&actx, req, gpg_id).await }
            })
            .await;
        finalizer.close(outcome).await
    }

    async fn update_repo_activity(
        &self,
        actx: &ActivityContext,
        req: UpdateRepoRequest,
        gpg_id: Option<String>,
    ) -> Result<UpdateRepoTask> {
        let _alive = actx.keep_alive(Duration::from_secs(4));
        let lease = self.leases.acquire(&req.project_id).await?;
        let (db_path, families) = (self.db_path.clone(), self.config.composer.multilib.clone());
        let composed = tokio::task::spawn_blocking(move || {
            let mut conn = db::open(&db_path)?;
            compose(&mut conn, &req, gpg_id.as_deref(), &families)
        })
        .await
        .map_err(Error::from)
        .and_then(|r| r);
        tokio::task::spawn_blocking(move || lease.release()).await??;
        composed
    }

    /// Sign every RPM of a build not yet signed with `key`.
    ///
    /// Signed copies are stored next to the original under
    /// `<dir>/<gpg_id>/<file>`.
    pub async fn sign_build_artifacts(&self, actx: &ActivityContext, build_id: &str, key: &Key) -> Result<usize> {
        let _alive = actx.keep_alive(Duration::from_secs(4));
        let id = build_id.to_string();
        let artifacts = self.db(move |conn| TaskArtifact::list_for_build(conn, &id)).await?;

        let mut signed = 0;
        for artifact in artifacts {
            if !artifact.name.ends_with(".rpm") || artifact.signatures.contains(&key.gpg_id) {
                continue;
            }
            let Some(artifact_id) = artifact.id else {
                continue;
            };
            let file_name = rpmutils::basename(&artifact.name).to_string();
            let dir = artifact
                .name
                .rsplit_once('/')
                .map(|(dir, _)| dir.to_string())
                .unwrap_or_else(|| ".".to_string());
            let signed_key = format!("{}/{}/{}", dir, key.gpg_id, file_name);

            let scratch = tempfile::tempdir()?;
            let path = scratch.path().join(&file_name);
            let (store, name) = (self.store.clone(), artifact.name.clone());
            let content = tokio::task::spawn_blocking(move || store.get(&name)).await??;
            tokio::fs::write(&path, &content).await?;

            let runner = LocalRunner::new(scratch.path());
            self.tools.signer.sign_rpm(&runner, &path, key).await?;
            let signed_content = tokio::fs::read(&path).await?;
            let hash = sha256_hex(&signed_content);

            let (store, target) = (self.store.clone(), signed_key.clone());
            tokio::task::spawn_blocking(move || store.put(&target, &signed_content)).await??;
            let (gpg_id, hash_ref) = (key.gpg_id.clone(), hash.clone());
            self.db(move |conn| TaskArtifact::add_signature(conn, artifact_id, &gpg_id, &hash_ref))
                .await?;
            info!("Signed {} as {}", artifact.name, signed_key);
            signed += 1;
            actx.heartbeat()?;
        }
        Ok(signed)
    }
}
