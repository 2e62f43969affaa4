// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use peridot_builder::db::{
    self,
    models::{Package, PackageType, Project, Repository, RepositoryRevision},
};
use peridot_builder::metadata::codec::b64_encode;
use peridot_builder::metadata::filelists::FilelistsPackage;
use peridot_builder::metadata::other::OtherPackage;
use peridot_builder::metadata::primary::{PackageChecksum, PackageLocation, PackageVersion};
use peridot_builder::metadata::repomd::blob_href;
use peridot_builder::metadata::{
    FilelistsRoot, OtherRoot, PayloadDigest, PrimaryPackage, PrimaryRoot, RepomdData, RepomdRoot, compress_gz,
    encode_filelists, encode_other, encode_primary, encode_repomd, sha256_hex,
};
use peridot_builder::orchestrator::History;
use peridot_builder::rpmutils::{self, Nvr};
use peridot_builder::store::FsStore;
use peridot_builder::tools::{PackageMetadataXml, RepoTool, Toolbox};
use peridot_builder::worker::{CommandRunner, LocalProvisioner};
use peridot_builder::{BuilderConfig, Controller, Environment, Result};
use rusqlite::Connection;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Write a minimal RPM and return its bytes
pub fn rpm_bytes(dir: &Path, name: &str, version: &str, release: &str, arch: &str) -> Vec<u8> {
    let pkg = rpm::PackageBuilder::new(name, version, "MIT", arch, "test package")
        .release(release)
        .build()
        .unwrap();
    let path = dir.join(format!("{name}-{version}-{release}.{arch}.rpm"));
    let mut file = std::fs::File::create(&path).unwrap();
    pkg.write(&mut file).unwrap();
    std::fs::read(path).unwrap()
}

fn version_of(nvr: &Nvr) -> PackageVersion {
    PackageVersion {
        epoch: "0".to_string(),
        ver: nvr.version.clone(),
        rel: nvr.release.clone(),
    }
}

/// Primary entry for an RPM file name published at `href`
pub fn primary_package(file_name: &str, href: &str) -> PrimaryPackage {
    let nvr = Nvr::parse(rpmutils::strip_rpm_suffix(file_name)).unwrap();
    PrimaryPackage {
        kind: "rpm".to_string(),
        name: nvr.name.clone(),
        arch: nvr.arch.clone(),
        version: version_of(&nvr),
        checksum: PackageChecksum {
            kind: "sha256".to_string(),
            pkgid: "YES".to_string(),
            value: sha256_hex(file_name.as_bytes()),
        },
        location: PackageLocation { href: href.to_string() },
        ..Default::default()
    }
}

/// createrepo_c stand-in deriving repodata from the file name
pub struct FakeRepo;

#[async_trait]
impl RepoTool for FakeRepo {
    async fn package_metadata(&self, _runner: &dyn CommandRunner, rpm: &Path) -> Result<PackageMetadataXml> {
        let file_name = rpm.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let nvr = Nvr::parse(rpmutils::strip_rpm_suffix(file_name)).unwrap();
        let checksum = sha256_hex(&std::fs::read(rpm)?);
        let mut package = primary_package(file_name, file_name);
        package.checksum.value = checksum.clone();

        let primary = PrimaryRoot {
            package_count: 1,
            packages: vec![package],
            ..Default::default()
        };
        let filelists = FilelistsRoot {
            package_count: 1,
            packages: vec![FilelistsPackage {
                pkgid: checksum.clone(),
                name: nvr.name.clone(),
                arch: nvr.arch.clone(),
                version: version_of(&nvr),
                files: Vec::new(),
            }],
            ..Default::default()
        };
        let other = OtherRoot {
            package_count: 1,
            packages: vec![OtherPackage {
                pkgid: checksum,
                name: nvr.name.clone(),
                arch: nvr.arch.clone(),
                version: version_of(&nvr),
                changelogs: Vec::new(),
            }],
            ..Default::default()
        };
        Ok(PackageMetadataXml {
            primary: encode_primary(&primary)?,
            filelists: encode_filelists(&filelists)?,
            other: encode_other(&other)?,
        })
    }

    async fn sqlite_metadata(&self, _runner: &dyn CommandRunner, _dir: &Path) -> Result<Vec<PathBuf>> {
        Ok(Vec::new())
    }
}

/// A controller on a scratch directory with one project
pub struct TestEnv {
    pub dir: TempDir,
    pub controller: Controller,
    pub project: Project,
}

impl TestEnv {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BuilderConfig::default();
        config.database.path = dir.path().join("tasks.db");
        config.storage.root = dir.path().join("blobs");
        config.worker.work_dir = dir.path().join("sandboxes");
        db::init(&config.database.path).unwrap();

        let project = Project::new("Rocky Linux 9", 9, vec!["x86_64".to_string()]);
        project.insert(&db::open(&config.database.path).unwrap()).unwrap();

        let mut tools = Toolbox::from_config(&config.tools);
        tools.repo = Arc::new(FakeRepo);

        let store = Arc::new(FsStore::new(&config.storage.root).unwrap());
        let provisioner = Arc::new(LocalProvisioner::new(&config.worker.work_dir).unwrap());
        let controller = Controller::new(config, Environment::default(), store, tools, provisioner)
            .unwrap()
            .with_history(History::memory());

        Self { dir, controller, project }
    }

    pub fn conn(&self) -> Connection {
        db::open(&self.controller.db_path).unwrap()
    }

    pub fn package(&self, name: &str) -> Package {
        let conn = self.conn();
        let package = Package::new(name, PackageType::NormalFork);
        package.insert(&conn).unwrap();
        Package::add_to_project(&conn, &self.project.id, &package.id, None).unwrap();
        package
    }

    pub fn repository(&self, name: &str, packages: &[&str]) -> Repository {
        Repository::create_with_packages(
            &self.conn(),
            &self.project.id,
            name,
            false,
            packages.iter().map(|p| p.to_string()).collect(),
        )
        .unwrap()
    }

    /// Publish a revision whose primary lists `hrefs`
    pub fn publish(
        &self,
        repository: &Repository,
        arch: &str,
        hrefs: &[&str],
        url_mappings: &BTreeMap<String, String>,
    ) -> RepositoryRevision {
        let id = db::new_id();
        let packages: Vec<PrimaryPackage> = hrefs
            .iter()
            .map(|href| primary_package(rpmutils::basename(href), href))
            .collect();
        let primary = PrimaryRoot {
            package_count: packages.len(),
            packages,
            ..Default::default()
        };
        let raw = encode_primary(&primary).unwrap();
        let gz = compress_gz(&raw).unwrap();

        let mut repomd = RepomdRoot::new(id.clone());
        repomd.upsert(RepomdData::compressed(
            "primary",
            blob_href(&id, "PRIMARY"),
            &PayloadDigest::of(&raw, &gz),
            0,
        ));

        let mut revision = RepositoryRevision::new(&id, &repository.id, arch);
        revision.primary_xml = b64_encode(&gz);
        revision.repomd_xml = b64_encode(&encode_repomd(&repomd).unwrap());
        revision.url_mappings = serde_json::to_string(url_mappings).unwrap();
        revision.create(&self.conn()).unwrap();
        revision
    }
}
