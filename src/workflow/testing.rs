// src/workflow/testing.rs

//! Shared fixtures for workflow tests: a controller on a scratch directory
//! with scripted stand-ins for mock, git, srpmproc and friends.

use super::Controller;
use crate::config::{BuilderConfig, Environment};
use crate::db::{
    self,
    models::{
        Import, ImportRevision, Key, Package, PackageType, PackageVersion, Project,
        ProjectPackageVersion, Task, TaskType,
    },
};
use crate::error::{Error, Result};
use crate::metadata::filelists::FilelistsPackage;
use crate::metadata::other::OtherPackage;
use crate::metadata::primary::{
    PackageChecksum, PackageFile, PackageLocation, PackageVersion as RpmVersion,
};
use crate::metadata::{
    FilelistsRoot, OtherRoot, PrimaryPackage, PrimaryRoot, encode_filelists, encode_other,
    encode_primary, sha256_hex,
};
use crate::orchestrator::History;
use crate::rpmutils::{self, Nvr};
use crate::store::FsStore;
use crate::tools::{
    MockInvocation, MockMode, PackageMetadataXml, ProcessRequest, ProcessResponse, RepoTool,
    RpmBuilder, Scm, Signer, SourceTransform, Toolbox, UpdateInfoSource,
};
use crate::worker::{CommandRunner, LocalProvisioner};
use async_trait::async_trait;
use rusqlite::Connection;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Write a minimal but real RPM file
pub fn write_rpm(path: &Path, name: &str, version: &str, release: &str, arch: &str) {
    let pkg = rpm::PackageBuilder::new(name, version, "MIT", arch, "test package")
        .release(release)
        .build()
        .unwrap();
    let mut file = std::fs::File::create(path).unwrap();
    pkg.write(&mut file).unwrap();
}

/// Single-package repodata for an RPM named like `n-v-r.a.rpm`
pub fn metadata_xml(file_name: &str, checksum: &str) -> PackageMetadataXml {
    let nvr = Nvr::parse(rpmutils::strip_rpm_suffix(file_name)).unwrap();
    let version = RpmVersion {
        epoch: "0".to_string(),
        ver: nvr.version.clone(),
        rel: nvr.release.clone(),
    };
    let primary = PrimaryRoot {
        package_count: 1,
        packages: vec![PrimaryPackage {
            kind: "rpm".to_string(),
            name: nvr.name.clone(),
            arch: nvr.arch.clone(),
            version: version.clone(),
            checksum: PackageChecksum {
                kind: "sha256".to_string(),
                pkgid: "YES".to_string(),
                value: checksum.to_string(),
            },
            location: PackageLocation {
                href: file_name.to_string(),
            },
            ..Default::default()
        }],
        ..Default::default()
    };
    let filelists = FilelistsRoot {
        package_count: 1,
        packages: vec![FilelistsPackage {
            pkgid: checksum.to_string(),
            name: nvr.name.clone(),
            arch: nvr.arch.clone(),
            version: version.clone(),
            files: vec![PackageFile {
                kind: None,
                path: format!("/usr/share/doc/{}/README", nvr.name),
            }],
        }],
        ..Default::default()
    };
    let other = OtherRoot {
        package_count: 1,
        packages: vec![OtherPackage {
            pkgid: checksum.to_string(),
            name: nvr.name,
            arch: nvr.arch,
            version,
            changelogs: Vec::new(),
        }],
        ..Default::default()
    };
    PackageMetadataXml {
        primary: encode_primary(&primary).unwrap(),
        filelists: encode_filelists(&filelists).unwrap(),
        other: encode_other(&other).unwrap(),
    }
}

/// mock stand-in producing RPMs named after a scripted NVR
#[derive(Default)]
pub struct FakeMock {
    /// `(name, version, release)` of the SRPM
    pub srpm: Mutex<(String, String, String)>,
    /// Binary package names besides the main one
    pub subpackages: Mutex<Vec<String>>,
    /// SRPM NVRs keyed by spec file stem, overriding `srpm`
    pub spec_srpms: Mutex<HashMap<String, (String, String, String)>>,
    /// Arches whose binary build fails
    pub fail_arches: Mutex<Vec<String>>,
    pub invocations: Mutex<Vec<MockInvocation>>,
}

impl FakeMock {
    pub fn set_srpm(&self, name: &str, version: &str, release: &str) {
        *self.srpm.lock().unwrap() = (name.to_string(), version.to_string(), release.to_string());
    }

    pub fn set_spec_srpm(&self, spec: &str, version: &str, release: &str) {
        self.spec_srpms
            .lock()
            .unwrap()
            .insert(spec.to_string(), (spec.to_string(), version.to_string(), release.to_string()));
    }

    /// NVR an invocation produces: per spec for SRPMs, from the input for arches
    fn nvr_for(&self, invocation: &MockInvocation) -> (String, String, String) {
        let stem = invocation
            .input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        if let Some(nvr) = self.spec_srpms.lock().unwrap().get(&stem) {
            return nvr.clone();
        }
        if invocation.mode == MockMode::Binary {
            let file = invocation.input.file_name().and_then(|s| s.to_str()).unwrap_or_default();
            if let Some(nvr) = Nvr::parse(rpmutils::strip_rpm_suffix(file)) {
                return (nvr.name, nvr.version, nvr.release);
            }
        }
        self.srpm.lock().unwrap().clone()
    }

    pub fn invocations(&self) -> Vec<MockInvocation> {
        self.invocations.lock().unwrap().clone()
    }
}

#[async_trait]
impl RpmBuilder for FakeMock {
    async fn build(&self, _runner: &dyn CommandRunner, invocation: &MockInvocation) -> Result<()> {
        self.invocations.lock().unwrap().push(invocation.clone());
        let (name, version, release) = self.nvr_for(invocation);
        std::fs::create_dir_all(&invocation.result_dir)?;
        match invocation.mode {
            MockMode::Srpm => {
                let path = invocation.result_dir.join(format!("{name}-{version}-{release}.src.rpm"));
                write_rpm(&path, &name, &version, &release, "src");
            }
            MockMode::Binary => {
                if self.fail_arches.lock().unwrap().contains(&invocation.target) {
                    return Err(Error::tool("mock", format!("build failed for {}", invocation.target)));
                }
                let arch = invocation.target.as_str();
                let mut names = vec![name.clone()];
                names.extend(self.subpackages.lock().unwrap().iter().cloned());
                for pkg in names {
                    let path = invocation.result_dir.join(format!("{pkg}-{version}-{release}.{arch}.rpm"));
                    write_rpm(&path, &pkg, &version, &release, arch);
                }
            }
        }
        Ok(())
    }
}

/// createrepo_c stand-in deriving repodata from the file name
#[derive(Default)]
pub struct FakeRepo;

#[async_trait]
impl RepoTool for FakeRepo {
    async fn package_metadata(&self, _runner: &dyn CommandRunner, rpm: &Path) -> Result<PackageMetadataXml> {
        let content = std::fs::read(rpm)?;
        let name = rpm.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        Ok(metadata_xml(name, &sha256_hex(&content)))
    }

    async fn sqlite_metadata(&self, _runner: &dyn CommandRunner, _dir: &Path) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

/// git stand-in: clones copy fixture trees, everything else is recorded
#[derive(Default)]
pub struct FakeScm {
    /// Remote URL to fixture directory
    pub remotes: Mutex<HashMap<String, PathBuf>>,
    pub tags: Mutex<HashMap<String, String>>,
    pub pushes: Mutex<Vec<Vec<String>>>,
    pub checkouts: Mutex<Vec<String>>,
    pub commits: Mutex<Vec<String>>,
}

impl FakeScm {
    pub fn add_remote(&self, url: &str, fixture: &Path) {
        self.remotes.lock().unwrap().insert(url.to_string(), fixture.to_path_buf());
    }
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    for entry in walkdir::WalkDir::new(from) {
        let entry = entry.map_err(|e| Error::IoError(e.to_string()))?;
        let rel = entry.path().strip_prefix(from).map_err(|e| Error::IoError(e.to_string()))?;
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl Scm for FakeScm {
    async fn clone_repo(
        &self,
        _runner: &dyn CommandRunner,
        url: &str,
        dir: &Path,
        _branch: Option<&str>,
    ) -> Result<()> {
        let fixture = self.remotes.lock().unwrap().get(url).cloned();
        match fixture {
            Some(fixture) => copy_tree(&fixture, dir),
            None => Err(Error::tool("git", format!("repository {url} not found"))),
        }
    }

    async fn fetch_heads(&self, _runner: &dyn CommandRunner, _dir: &Path) -> Result<()> {
        Ok(())
    }

    async fn checkout(&self, _runner: &dyn CommandRunner, _dir: &Path, rev: &str) -> Result<()> {
        self.checkouts.lock().unwrap().push(rev.to_string());
        Ok(())
    }

    async fn init(&self, _runner: &dyn CommandRunner, dir: &Path, _remote: &str, _branch: &str) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        Ok(())
    }

    async fn tag_commit(&self, _runner: &dyn CommandRunner, _dir: &Path, tag: &str) -> Result<Option<String>> {
        Ok(self.tags.lock().unwrap().get(tag).cloned())
    }

    async fn commit_all(&self, _runner: &dyn CommandRunner, _dir: &Path, message: &str) -> Result<String> {
        let mut commits = self.commits.lock().unwrap();
        commits.push(message.to_string());
        Ok(sha256_hex(format!("{}:{}", commits.len(), message).as_bytes())[..40].to_string())
    }

    async fn tag(&self, _runner: &dyn CommandRunner, _dir: &Path, name: &str, _message: &str) -> Result<()> {
        let head = self.commits.lock().unwrap().len().to_string();
        self.tags.lock().unwrap().insert(name.to_string(), head);
        Ok(())
    }

    async fn push(&self, _runner: &dyn CommandRunner, _dir: &Path, refspecs: &[String]) -> Result<()> {
        self.pushes.lock().unwrap().push(refspecs.to_vec());
        Ok(())
    }
}

/// srpmproc stand-in answering with a scripted response
#[derive(Default)]
pub struct FakeSrpmproc {
    pub response: Mutex<ProcessResponse>,
    pub requests: Mutex<Vec<ProcessRequest>>,
    pub fetches: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl SourceTransform for FakeSrpmproc {
    async fn process(&self, _runner: &dyn CommandRunner, request: &ProcessRequest) -> Result<ProcessResponse> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self.response.lock().unwrap().clone())
    }

    async fn fetch(&self, _runner: &dyn CommandRunner, dir: &Path, _cdn_url: Option<&str>) -> Result<()> {
        self.fetches.lock().unwrap().push(dir.to_path_buf());
        Ok(())
    }
}

/// Signer that leaves RPMs alone and returns a fixed armor block
#[derive(Default)]
pub struct FakeSigner;

#[async_trait]
impl Signer for FakeSigner {
    async fn sign_rpm(&self, _runner: &dyn CommandRunner, _rpm: &Path, _key: &Key) -> Result<()> {
        Ok(())
    }

    async fn sign_detached(&self, _runner: &dyn CommandRunner, content: &[u8], key: &Key) -> Result<String> {
        Ok(format!(
            "-----BEGIN PGP SIGNATURE-----\n{}:{}\n-----END PGP SIGNATURE-----\n",
            key.gpg_id,
            sha256_hex(content)
        ))
    }
}

/// Errata source backed by a URL map
#[derive(Default)]
pub struct FakeUpdateInfo {
    pub documents: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl UpdateInfoSource for FakeUpdateInfo {
    async fn fetch(&self, url: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.documents.lock().unwrap().get(url).cloned())
    }
}

/// A controller on a scratch directory with one project
pub struct TestEnv {
    pub dir: TempDir,
    pub controller: Controller,
    pub project: Project,
    pub mock: Arc<FakeMock>,
    pub scm: Arc<FakeScm>,
    pub srpmproc: Arc<FakeSrpmproc>,
    pub updateinfo: Arc<FakeUpdateInfo>,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with_archs(&["x86_64"])
    }

    pub fn with_archs(archs: &[&str]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BuilderConfig::default();
        config.database.path = dir.path().join("tasks.db");
        config.storage.root = dir.path().join("blobs");
        config.worker.work_dir = dir.path().join("sandboxes");
        config.server.public_url = "http://yumrepofs.test".to_string();
        config.composer.retry_interval = "1s".to_string();
        db::init(&config.database.path).unwrap();

        let mut project = Project::new("Rocky Linux 9", 9, archs.iter().map(|a| a.to_string()).collect());
        project.target_gitlab_host = "https://git.rockylinux.test".to_string();
        project.target_prefix = "staging".to_string();
        project.additional_vendor = "rocky".to_string();
        project.insert(&db::open(&config.database.path).unwrap()).unwrap();

        let mock = Arc::new(FakeMock::default());
        mock.set_srpm("bash", "5.1.8", "6.el9");
        let scm = Arc::new(FakeScm::default());
        let srpmproc = Arc::new(FakeSrpmproc::default());
        let updateinfo = Arc::new(FakeUpdateInfo::default());
        let tools = Toolbox {
            mock: mock.clone(),
            repo: Arc::new(FakeRepo),
            scm: scm.clone(),
            srpmproc: srpmproc.clone(),
            signer: Arc::new(FakeSigner),
            updateinfo: updateinfo.clone(),
        };

        let store = Arc::new(FsStore::new(&config.storage.root).unwrap());
        let provisioner = Arc::new(LocalProvisioner::new(&config.worker.work_dir).unwrap());
        let controller = Controller::new(config, Environment::default(), store, tools, provisioner)
            .unwrap()
            .with_history(History::memory());

        Self {
            dir,
            controller,
            project,
            mock,
            scm,
            srpmproc,
            updateinfo,
        }
    }

    pub fn conn(&self) -> Connection {
        db::open(&self.controller.db_path).unwrap()
    }

    /// A pending top-level task in the project
    pub fn task(&self, task_type: TaskType) -> String {
        let task = Task::new("noarch", task_type, Some(&self.project.id), None);
        task.insert(&self.conn()).unwrap();
        task.id
    }

    pub fn package(&self, name: &str, package_type: PackageType) -> Package {
        let conn = self.conn();
        let package = Package::new(name, package_type);
        package.insert(&conn).unwrap();
        Package::add_to_project(&conn, &self.project.id, &package.id, None).unwrap();
        package
    }

    /// An active import of `package` at `version-release` on `branch`.
    ///
    /// Returns the package version id.
    pub fn import_revision(&self, package: &Package, version: &str, release: &str, branch: &str, hash: &str) -> String {
        let conn = self.conn();
        let task = self.task(TaskType::Import);
        let import = Import::create(&conn, "https://git.rockylinux.test/x.git", &task, &package.id, &self.project.id).unwrap();
        let pv = PackageVersion::ensure(&conn, &package.id, version, release).unwrap();
        ProjectPackageVersion::attach(&conn, &self.project.id, &package.id, &pv, true).unwrap();
        ImportRevision::create(&conn, &import.id, hash, branch, &import.scm_url, &pv, false).unwrap();
        pv
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }
}
