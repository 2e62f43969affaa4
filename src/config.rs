// src/config.rs

//! Configuration file parsing for the builder
//!
//! Supports TOML configuration files with the following sections:
//! - [database] - Task store location
//! - [storage] - Blob store backend and root
//! - [worker] - Sandbox provisioner, log batching, arch placement
//! - [tools] - External tool binaries (mock, createrepo_c, git, ...)
//! - [composer] - Lease timings, multilib arch families, re-publish batch size
//! - [updateinfo] - Errata source endpoint
//! - [server] - yumrepofs HTTP surface
//!
//! Process environment is read separately into [`Environment`].

use crate::multilib::{ArchFamilies, default_families};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// TOML configuration file structure
#[derive(Debug, Default, Deserialize)]
pub struct BuilderConfig {
    #[serde(default)]
    pub database: DatabaseSection,

    #[serde(default)]
    pub storage: StorageSection,

    #[serde(default)]
    pub worker: WorkerSection,

    #[serde(default)]
    pub tools: ToolsSection,

    #[serde(default)]
    pub composer: ComposerSection,

    #[serde(default)]
    pub updateinfo: UpdateInfoSection,

    #[serde(default)]
    pub server: ServerSection,
}

/// Task store section
#[derive(Debug, Deserialize)]
pub struct DatabaseSection {
    /// Path to the sqlite database
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("/var/lib/peridot/builder.db")
}

/// Blob store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Fs,
    Memory,
}

/// Blob store section
#[derive(Debug, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,

    /// Root directory for the filesystem backend
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            root: default_storage_root(),
        }
    }
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Fs
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/peridot/objects")
}

/// Sandbox provisioner kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionerKind {
    /// Run activities in a scratch directory on this host
    Local,
    /// Run activities inside containers started with the container CLI
    Podman,
}

/// Worker section
#[derive(Debug, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_provisioner")]
    pub provisioner: ProvisionerKind,

    /// Container image for build sandboxes
    #[serde(default = "default_image")]
    pub image: String,

    /// Container CLI binary
    #[serde(default = "default_container_cli")]
    pub container_cli: String,

    /// Scratch root for sandbox work directories
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Maximum log lines per appended batch
    #[serde(default = "default_log_batch")]
    pub log_batch: usize,

    /// Arches preferred for noarch placement
    #[serde(default = "default_noarch_arches")]
    pub noarch_arches: Vec<String>,

    /// Arches served by the external-arch queue
    #[serde(default = "default_ext_arches")]
    pub ext_arches: Vec<String>,
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            provisioner: default_provisioner(),
            image: default_image(),
            container_cli: default_container_cli(),
            work_dir: default_work_dir(),
            log_batch: default_log_batch(),
            noarch_arches: default_noarch_arches(),
            ext_arches: default_ext_arches(),
        }
    }
}

fn default_provisioner() -> ProvisionerKind {
    ProvisionerKind::Local
}

fn default_image() -> String {
    "quay.io/peridot/builder:latest".to_string()
}

fn default_container_cli() -> String {
    "podman".to_string()
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/peridot/work")
}

fn default_log_batch() -> usize {
    5
}

fn default_noarch_arches() -> Vec<String> {
    vec!["x86_64".to_string(), "aarch64".to_string()]
}

fn default_ext_arches() -> Vec<String> {
    vec!["s390x".to_string(), "ppc64le".to_string()]
}

/// External tool binaries
#[derive(Debug, Deserialize)]
pub struct ToolsSection {
    #[serde(default = "default_mock")]
    pub mock: String,

    #[serde(default = "default_createrepo")]
    pub createrepo_c: String,

    #[serde(default = "default_sqliterepo")]
    pub sqliterepo_c: String,

    #[serde(default = "default_git")]
    pub git: String,

    #[serde(default = "default_srpmproc")]
    pub srpmproc: String,

    #[serde(default = "default_gpg")]
    pub gpg: String,

    #[serde(default = "default_rpmsign")]
    pub rpmsign: String,

    /// Keyring home for the signer; signing is disabled when unset
    #[serde(default)]
    pub gpg_home: Option<PathBuf>,

    /// Git author used for dist-git commits
    #[serde(default = "default_git_author")]
    pub git_author: String,

    #[serde(default = "default_git_email")]
    pub git_email: String,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            mock: default_mock(),
            createrepo_c: default_createrepo(),
            sqliterepo_c: default_sqliterepo(),
            git: default_git(),
            srpmproc: default_srpmproc(),
            gpg: default_gpg(),
            rpmsign: default_rpmsign(),
            gpg_home: None,
            git_author: default_git_author(),
            git_email: default_git_email(),
        }
    }
}

fn default_mock() -> String {
    "mock".to_string()
}

fn default_createrepo() -> String {
    "createrepo_c".to_string()
}

fn default_sqliterepo() -> String {
    "sqliterepo_c".to_string()
}

fn default_git() -> String {
    "git".to_string()
}

fn default_srpmproc() -> String {
    "srpmproc".to_string()
}

fn default_gpg() -> String {
    "gpg".to_string()
}

fn default_rpmsign() -> String {
    "rpmsign".to_string()
}

fn default_git_author() -> String {
    "Peridot Bot".to_string()
}

fn default_git_email() -> String {
    "releng@rockylinux.org".to_string()
}

/// Composer section
#[derive(Debug, Deserialize)]
pub struct ComposerSection {
    /// Project lease lifetime (e.g. "10s")
    #[serde(default = "default_lease_duration")]
    pub lease_duration: String,

    /// Lease renewal interval (e.g. "3s")
    #[serde(default = "default_lease_heartbeat")]
    pub lease_heartbeat: String,

    /// Multilib arch families keyed by host arch
    #[serde(default = "default_families")]
    pub multilib: ArchFamilies,

    /// Builds per composer invocation when re-publishing
    #[serde(default = "default_republish_batch")]
    pub republish_batch: usize,

    /// First delay between failed composer attempts (e.g. "5s")
    #[serde(default = "default_retry_interval")]
    pub retry_interval: String,
}

impl Default for ComposerSection {
    fn default() -> Self {
        Self {
            lease_duration: default_lease_duration(),
            lease_heartbeat: default_lease_heartbeat(),
            multilib: default_families(),
            republish_batch: default_republish_batch(),
            retry_interval: default_retry_interval(),
        }
    }
}

fn default_lease_duration() -> String {
    "10s".to_string()
}

fn default_lease_heartbeat() -> String {
    "3s".to_string()
}

fn default_republish_batch() -> usize {
    200
}

fn default_retry_interval() -> String {
    "5s".to_string()
}

/// Errata ingestion section
#[derive(Debug, Deserialize)]
pub struct UpdateInfoSection {
    #[serde(default = "default_updateinfo_url")]
    pub base_url: String,
}

impl Default for UpdateInfoSection {
    fn default() -> Self {
        Self {
            base_url: default_updateinfo_url(),
        }
    }
}

fn default_updateinfo_url() -> String {
    "https://apollo.build.resf.org/api/v3/updateinfo".to_string()
}

/// yumrepofs HTTP section
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Base URL build sandboxes use to reach the repositories
    #[serde(default = "default_public_url")]
    pub public_url: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            public_url: default_public_url(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_public_url() -> String {
    "http://localhost:8080".to_string()
}

impl BuilderConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: BuilderConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Load from `path` when it exists, defaults otherwise
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) if p.exists() => Self::load(p),
            Some(p) => anyhow::bail!("config file not found: {}", p.display()),
            None => Ok(Self::default()),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.server
            .bind
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid server.bind address: {}", self.server.bind))?;

        url::Url::parse(&self.server.public_url)
            .with_context(|| format!("Invalid server.public_url: {}", self.server.public_url))?;

        let lease = self.lease_duration()?;
        let heartbeat = self.lease_heartbeat()?;
        if heartbeat >= lease {
            anyhow::bail!(
                "composer.lease_heartbeat ({:?}) must be shorter than composer.lease_duration ({:?})",
                heartbeat,
                lease
            );
        }

        if self.worker.log_batch == 0 {
            anyhow::bail!("worker.log_batch must be at least 1");
        }

        if self.composer.republish_batch == 0 {
            anyhow::bail!("composer.republish_batch must be at least 1");
        }

        self.composer_retry_interval()?;

        Ok(())
    }

    pub fn lease_duration(&self) -> Result<Duration> {
        parse_duration(&self.composer.lease_duration)
    }

    pub fn lease_heartbeat(&self) -> Result<Duration> {
        parse_duration(&self.composer.lease_heartbeat)
    }

    pub fn composer_retry_interval(&self) -> Result<Duration> {
        parse_duration(&self.composer.retry_interval)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("Invalid bind address: {}", self.server.bind))
    }
}

/// Parse a duration string (e.g., "3s", "10m", "1h", "2d")
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    let (num_str, multiplier) = if let Some(n) = s.strip_suffix('d') {
        (n, 24 * 3600)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3600)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1)
    } else {
        (s.as_str(), 1)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration number: {}", num_str))?;

    Ok(Duration::from_secs(num * multiplier))
}

/// Process environment recognized by the builder
#[derive(Debug, Clone, Default)]
pub struct Environment {
    /// `RESF_ENV`, `dev` unless set
    pub resf_env: String,
    pub callback_forwarder: Option<String>,
    /// Overrides host arch detection inside sandboxes
    pub real_build_arch: Option<String>,
    pub localstack_endpoint: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub keykeeper_endpoint_override: Option<String>,
    pub yumrepofs_endpoint_override: Option<String>,
    pub site: Option<String>,
    pub image_pull_secret: Option<String>,
    pub service_account: Option<String>,
    pub namespace: Option<String>,
    pub force_namespace: Option<String>,
}

impl Environment {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        Self {
            resf_env: get("RESF_ENV").unwrap_or_else(|| "dev".to_string()),
            callback_forwarder: get("OBSIDIAN_CALLBACK_FORWARDER"),
            real_build_arch: get("REAL_BUILD_ARCH"),
            localstack_endpoint: get("LOCALSTACK_ENDPOINT"),
            aws_access_key_id: get("AWS_ACCESS_KEY_ID"),
            aws_secret_access_key: get("AWS_SECRET_ACCESS_KEY"),
            keykeeper_endpoint_override: get("KEYKEEPER_GRPC_ENDPOINT_OVERRIDE"),
            yumrepofs_endpoint_override: get("YUMREPOFS_HTTP_ENDPOINT_OVERRIDE"),
            site: get("PERIDOT_SITE"),
            image_pull_secret: get("IMAGE_PULL_SECRET"),
            service_account: get("RESF_SERVICE_ACCOUNT"),
            namespace: get("RESF_NS"),
            force_namespace: get("RESF_FORCE_NS"),
        }
    }

    pub fn is_dev(&self) -> bool {
        self.resf_env == "dev"
    }

    /// External-arch sites pin DNS inside sandboxes
    pub fn pin_dns(&self) -> bool {
        self.site.as_deref() == Some("extarches")
    }

    /// Namespace sandboxes are scheduled in
    pub fn namespace(&self) -> String {
        self.force_namespace
            .clone()
            .or_else(|| self.namespace.clone())
            .unwrap_or_else(|| "peridot".to_string())
    }

    /// Base URL of the yumrepofs HTTP surface
    pub fn yumrepofs_base(&self, config: &BuilderConfig) -> String {
        self.yumrepofs_endpoint_override
            .clone()
            .unwrap_or_else(|| config.server.public_url.clone())
            .trim_end_matches('/')
            .to_string()
    }

    /// Host arch for this process
    pub fn build_arch(&self) -> String {
        self.real_build_arch
            .clone()
            .unwrap_or_else(|| std::env::consts::ARCH.to_string())
    }
}
