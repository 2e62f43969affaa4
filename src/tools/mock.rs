// src/tools/mock.rs

//! mock configuration rendering and invocation
//!
//! Every SRPM and arch build runs mock with a config generated per build:
//! chroot packages, dist and vendor macros, module setup commands, the
//! package manager `[main]` section and one repo block per yumrepofs or
//! external repository the project uses.

use crate::db::models::{ExternalRepository, Project};
use crate::error::Result;
use crate::rpmutils::import_dist;
use crate::worker::{CommandRunner, CommandSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

pub const RPMBUILD_PATH: &str = "/usr/bin/rpmbuild";

/// Default chroot for arch builds
pub const DEFAULT_BUILD_PKG_GROUP: &[&str] = &[
    "bash",
    "bzip2",
    "coreutils",
    "cpio",
    "diffutils",
    "findutils",
    "gawk",
    "glibc-minimal-langpack",
    "grep",
    "gzip",
    "info",
    "make",
    "patch",
    "rpm-build",
    "sed",
    "shadow-utils",
    "tar",
    "unzip",
    "util-linux",
    "which",
    "xz",
];

/// Default chroot for SRPM builds
pub const DEFAULT_SRPM_BUILD_PKG_GROUP: &[&str] = &[
    "bash",
    "glibc-minimal-langpack",
    "gnupg2",
    "rpm-build",
    "shadow-utils",
];

/// A yumrepofs repository of the project to add to the build root
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraYumrepofsRepo {
    pub name: String,
    #[serde(default)]
    pub module_hotfixes: bool,
    #[serde(default)]
    pub ignore_exclude: bool,
}

/// `$arch`/`$basearch` substitution; noarch keeps the template
pub fn substitute_arch(template: &str, arch: &str) -> String {
    if arch == "noarch" {
        return template.to_string();
    }
    template.replace("$basearch", arch).replace("$arch", arch)
}

/// Resolve a repo URL for an arch.
///
/// Some repositories publish i686 content under `i386`; when the i686 URL
/// has no `repomd.xml` the `i386` form is used instead.
pub async fn resolve_repo_url(client: &reqwest::Client, template: &str, arch: &str) -> String {
    let url = substitute_arch(template, arch);
    if arch != "i686" {
        return url;
    }
    let probe = format!("{}/repodata/repomd.xml", url.trim_end_matches('/'));
    match client.get(&probe).send().await {
        Ok(res) if res.status().is_success() => url,
        _ => {
            debug!("{} unreachable, falling back to i386", probe);
            substitute_arch(template, "i386")
        }
    }
}

/// yumrepofs base URL template for a project repository
pub fn yumrepofs_repo_url(base: &str, project_id: &str, repo: &str) -> String {
    format!("{}/v1/projects/{}/repo/{}/$arch", base.trim_end_matches('/'), project_id, repo)
}

/// Repo blocks for the project's yumrepofs repositories.
///
/// `all` always comes first unless the caller already listed it. URLs are
/// resolved by the caller and passed in the same order as the returned
/// repos list.
pub fn yumrepofs_repos(extra: &[ExtraYumrepofsRepo]) -> Vec<ExtraYumrepofsRepo> {
    if extra.iter().any(|r| r.name == "all") {
        return extra.to_vec();
    }
    let mut repos = vec![ExtraYumrepofsRepo {
        name: "all".to_string(),
        ..Default::default()
    }];
    repos.extend(extra.iter().cloned());
    repos
}

pub fn render_yumrepofs_repo(index: usize, url: &str, repo: &ExtraYumrepofsRepo, exclude: &[String]) -> String {
    let mut block = format!(
        "[yumrepofs_{i}]\nname=Peridot Internal - Yumrepofs {i}\nbaseurl={url}\ngpgcheck=0\nenabled=1\npriority={i}\nmodule_hotfixes={mhf}\nskip_if_unavailable=1",
        i = index,
        url = url,
        mhf = u8::from(repo.module_hotfixes),
    );
    if !exclude.is_empty() && !repo.ignore_exclude {
        block.push_str(&format!("\nexclude={}", exclude.join(" ")));
    }
    block
}

pub fn render_external_repo(index: usize, url: &str, repo: &ExternalRepository, exclude: &[String]) -> String {
    let mut block = format!(
        "[peridotexternal_{i}]\nname=Peridot External {i}\nbaseurl={url}\ngpgcheck=0\nenabled=1\npriority={priority}\nmodule_hotfixes={mhf}",
        i = index,
        url = url,
        priority = repo.priority.unwrap_or_default(),
        mhf = u8::from(repo.module_hotfixes),
    );
    if !exclude.is_empty() {
        block.push_str(&format!("\nexclude={}", exclude.join(" ")));
    }
    block
}

/// Distribution macros for a project, honoring an imported dist tag
pub fn build_macros(project: &Project, release: Option<&str>) -> BTreeMap<String, String> {
    let mut dist_tag = project.dist_tag();
    if project.follow_import_dist {
        if let Some(release) = release.filter(|r| !r.contains(".module+")) {
            if let Some(dist) = import_dist(release) {
                dist_tag = dist;
            }
        }
    }

    let mut chars = project.additional_vendor.chars();
    let capitalized = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };
    let vendor = project.vendor_macro.clone().filter(|v| !v.is_empty()).unwrap_or(capitalized.clone());
    let packager = project.packager_macro.clone().filter(|v| !v.is_empty()).unwrap_or(capitalized);

    let mut macros = BTreeMap::from([
        ("%__bootstrap".to_string(), "~bootstrap".to_string()),
        ("%vendor".to_string(), vendor),
        ("%packager".to_string(), packager),
        ("%distribution".to_string(), project.name.clone()),
        (
            "%dist".to_string(),
            format!(
                "%{{!?distprefix0:%{{?distprefix}}}}%{{expand:%{{lua:for i=0,9999 do print(\"%{{?distprefix\" .. i ..\"}}\") end}}}}.{}%{{?with_bootstrap:~bootstrap}}",
                dist_tag
            ),
        ),
    ]);
    match project.target_vendor.as_str() {
        "redhat" => {
            macros.insert("%rhel".to_string(), project.major_version.to_string());
        }
        "suse" => {
            macros.insert("%sles_version".to_string(), "0".to_string());
            macros.insert("%suse_version".to_string(), format!("{}00", project.major_version));
        }
        _ => {}
    }
    macros
}

/// `%name value` lines for a macros file
pub fn render_macros(macros: &BTreeMap<String, String>) -> String {
    macros.iter().map(|(k, v)| format!("{k} {v}\n")).collect()
}

/// Package manager `[main]` section
pub fn yum_config(project: &Project) -> String {
    let mut config = String::from(
        "[main]
debuglevel=1
retries=20
obsoletes=1
gpgcheck=0
assumeyes=1
keepcache=1
best=1
syslog_ident=peridotbuilder
syslog_device=
metadata_expire=0
install_weak_deps=0
protected_packages=
reposdir=/dev/null
logfile=/var/log/yum.log
mdpolicy=group:primary
metadata_expire=0
user_agent=peridotbuilder",
    );
    if project.target_vendor == "redhat" {
        config.push_str(&format!("\nmodule_platform_id=platform:el{}", project.major_version));
    }
    config
}

pub fn chroot_packages(project: &Project, pkg_group: &[String]) -> Vec<String> {
    let mut pkgs = pkg_group.to_vec();
    if project.target_vendor == "redhat" {
        pkgs.push("redhat-rpm-config".to_string());
    }
    pkgs
}

/// Everything a mock config is rendered from
#[derive(Debug, Clone)]
pub struct MockConfig<'a> {
    pub project: &'a Project,
    /// Release of the package being built, for import dist detection
    pub release: Option<&'a str>,
    pub arch: &'a str,
    pub host_arch: &'a str,
    pub pkg_group: Vec<String>,
    pub force_dist: Option<&'a str>,
    pub modules: &'a [String],
    pub disabled_modules: &'a [String],
    pub enable_networking: bool,
    /// Absolute path inside the chroot to file content
    pub extra_files: BTreeMap<String, String>,
    /// Rendered repo blocks
    pub repos: Vec<String>,
}

impl MockConfig<'_> {
    pub fn render(&self) -> String {
        let project = self.project;
        let host_arch = if self.arch == "i686" { "i686" } else { self.host_arch };

        let mut macros = build_macros(project, self.release);
        if let Some(dist) = self.force_dist.filter(|d| !d.is_empty()) {
            macros.insert("%dist".to_string(), format!(".{dist}"));
        }

        let mut host_arches: Vec<&str> = if host_arch == "i686" {
            vec!["i386", "i486", "i586", "i686", "x86_64"]
        } else {
            vec![host_arch]
        };
        host_arches.push("noarch");
        let host_arches = host_arches
            .iter()
            .map(|a| format!("'{a}'"))
            .collect::<Vec<_>>()
            .join(",");

        let module_setup = self
            .modules
            .iter()
            .map(|m| format!("('enable', '{m}')"))
            .chain(self.disabled_modules.iter().map(|m| format!("('disable', '{m}')")))
            .collect::<Vec<_>>()
            .join(",");

        let networking = if self.enable_networking { "True" } else { "False" };
        let vendor = &project.target_vendor;

        let mut out = String::new();
        out.push_str(&format!(
            "config_opts['root'] = '{}-{}-{}'\n",
            project.additional_vendor, project.major_version, host_arch
        ));
        out.push_str(&format!("config_opts['target_arch'] = '{}'\n", self.arch));
        out.push_str(&format!("config_opts['legal_host_arches'] = [{host_arches}]\n"));
        out.push_str(&format!(
            "config_opts['chroot_setup_cmd'] = 'install {}'\n",
            chroot_packages(project, &self.pkg_group).join(" ")
        ));
        out.push_str(&format!("config_opts['dist'] = '{}'\n", macros["%dist"]));
        out.push_str(&format!("config_opts['releasever'] = '{}'\n", project.major_version));
        out.push_str("config_opts['package_manager'] = 'dnf'\n");
        out.push_str("config_opts['extra_chroot_dirs'] = [ '/run/lock' ]\n");
        out.push_str(&format!("config_opts['rpmbuild_command'] = '{RPMBUILD_PATH}'\n"));
        out.push_str("config_opts['use_bootstrap_image'] = False\n");
        out.push_str("config_opts['plugin_conf']['rpmautospec_enable'] = True\n");
        out.push_str(
            "config_opts['plugin_conf']['rpmautospec_opts'] = {\n  'requires': ['rpmautospec'],\n  'cmd_base': ['/usr/bin/rpmautospec', 'process-distgit'],\n}\n",
        );
        if vendor == "suse" {
            out.push_str("config_opts['useradd'] = '/usr/sbin/useradd -o -m -u {{chrootuid}} -g {{chrootgid}} -d {{chroothome}} {{chrootuser}}'\n");
            out.push_str("config_opts['ssl_ca_bundle_path'] = '/var/lib/ca-certificates/ca-bundle.pem'\n");
            out.push_str("config_opts['package_manager_max_attempts'] = 4\n");
            out.push_str("config_opts['package_manager_attempt_delay'] = 20\n");
        }
        out.push_str("config_opts['plugin_conf']['ccache_enable'] = False\n");
        out.push_str("config_opts['plugin_conf']['root_cache_enable'] = False\n");
        out.push_str("config_opts['plugin_conf']['yum_cache_enable'] = False\n");
        out.push_str(&format!("config_opts['rpmbuild_networking'] = {networking}\n"));
        out.push_str(&format!("config_opts['use_host_resolv'] = {networking}\n"));
        out.push_str("config_opts['print_main_output'] = True\n");
        out.push_str("config_opts['macros']['%_rpmfilename'] = '%%{NAME}-%%{VERSION}-%%{RELEASE}.%%{ARCH}.rpm'\n");
        out.push_str(&format!("config_opts['macros']['%_host'] = '{host_arch}-{vendor}-linux-gnu'\n"));
        out.push_str(&format!("config_opts['macros']['%_host_cpu'] = '{host_arch}'\n"));
        out.push_str(&format!("config_opts['macros']['%_vendor'] = \"{vendor}\"\n"));
        out.push_str(&format!("config_opts['macros']['%_vendor_host'] = \"{vendor}\"\n"));
        out.push_str(&format!("config_opts['module_setup_commands'] = [{module_setup}]\n"));
        for (key, value) in &macros {
            out.push_str(&format!("config_opts['macros']['{key}'] = '{value}'\n"));
        }

        let mut files = self.extra_files.clone();
        files.insert("/usr/lib/rpm/macros.d/macros.dist".to_string(), render_macros(&macros));
        for (path, content) in &files {
            out.push_str(&format!(
                "config_opts['files']['{}'] = \"\"\"\n{}\n\"\"\"\n",
                path.trim_start_matches('/'),
                content
            ));
        }

        out.push_str("\nconfig_opts['dnf.conf'] = \"\"\"\n");
        out.push_str(&yum_config(project));
        out.push('\n');
        for repo in &self.repos {
            out.push_str(repo);
            out.push('\n');
        }
        out.push_str("\"\"\"\n");
        out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockMode {
    /// `--buildsrpm` from a spec and sources
    Srpm,
    /// Rebuild an SRPM for the target arch
    Binary,
}

/// One mock run
#[derive(Debug, Clone)]
pub struct MockInvocation {
    pub mode: MockMode,
    pub config: PathBuf,
    pub target: String,
    pub result_dir: PathBuf,
    /// SOURCES directory, SRPM mode only
    pub sources: Option<PathBuf>,
    /// Spec file (SRPM mode) or source RPM (binary mode)
    pub input: PathBuf,
    pub with: Vec<String>,
    pub without: Vec<String>,
    pub nocheck: bool,
}

impl MockInvocation {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--isolation=simple".to_string(),
            "-r".to_string(),
            self.config.display().to_string(),
            "--target".to_string(),
            self.target.clone(),
            "--resultdir".to_string(),
            self.result_dir.display().to_string(),
        ];
        if let Some(sources) = &self.sources {
            args.push("--sources".to_string());
            args.push(sources.display().to_string());
        }
        if self.nocheck {
            args.push("--nocheck".to_string());
        }
        args.extend(self.with.iter().map(|w| format!("--with={w}")));
        args.extend(self.without.iter().map(|w| format!("--without={w}")));
        match self.mode {
            MockMode::Srpm => {
                args.push("--buildsrpm".to_string());
                args.push("--spec".to_string());
                args.push(self.input.display().to_string());
            }
            MockMode::Binary => args.push(self.input.display().to_string()),
        }
        args
    }
}

/// Builds packages in a chroot
#[async_trait]
pub trait RpmBuilder: Send + Sync {
    /// Run a build; results land in `invocation.result_dir`
    async fn build(&self, runner: &dyn CommandRunner, invocation: &MockInvocation) -> Result<()>;
}

pub struct MockCli {
    program: String,
}

impl MockCli {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }
}

#[async_trait]
impl RpmBuilder for MockCli {
    async fn build(&self, runner: &dyn CommandRunner, invocation: &MockInvocation) -> Result<()> {
        let cmd = CommandSpec::new(&self.program).args(invocation.args());
        runner.run_checked("mock", &cmd).await?;
        Ok(())
    }
}
