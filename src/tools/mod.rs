// src/tools/mod.rs

//! External collaborators
//!
//! Everything the builder shells out to sits behind a trait so workflows
//! can be driven with fakes: mock, createrepo_c/sqliterepo_c, git,
//! srpmproc, the signer and the errata source. Tools that run inside a
//! sandbox take the sandbox's [`CommandRunner`]; host-side tools use a
//! [`crate::worker::LocalProvisioner`]-style runner on a scratch directory.

mod git;
pub mod mock;
mod repo;
mod signer;
mod srpmproc;
mod updateinfo;
pub mod upload;

pub use git::{GitCli, Scm};
pub use mock::{MockCli, MockInvocation, MockMode, RpmBuilder};
pub use repo::{CreaterepoCli, PackageMetadataXml, RepoTool};
pub use signer::{GpgSigner, Signer};
pub use srpmproc::{ProcessRequest, ProcessResponse, SourceTransform, SrpmprocCli, VersionRelease};
pub use updateinfo::{HttpUpdateInfo, UpdateInfoSource, updateinfo_url};
pub use upload::{RpmArtifactMetadata, UploadResult, Uploader, artifact_arch};

use crate::config::ToolsSection;
use std::sync::Arc;

/// The set of tools a controller works with
#[derive(Clone)]
pub struct Toolbox {
    pub mock: Arc<dyn RpmBuilder>,
    pub repo: Arc<dyn RepoTool>,
    pub scm: Arc<dyn Scm>,
    pub srpmproc: Arc<dyn SourceTransform>,
    pub signer: Arc<dyn Signer>,
    pub updateinfo: Arc<dyn UpdateInfoSource>,
}

impl Toolbox {
    /// Command line implementations configured from `[tools]`
    pub fn from_config(tools: &ToolsSection) -> Self {
        Self {
            mock: Arc::new(MockCli::new(&tools.mock)),
            repo: Arc::new(CreaterepoCli::new(&tools.createrepo_c, &tools.sqliterepo_c)),
            scm: Arc::new(GitCli::new(&tools.git, &tools.git_author, &tools.git_email)),
            srpmproc: Arc::new(SrpmprocCli::new(&tools.srpmproc)),
            signer: Arc::new(GpgSigner::new(&tools.rpmsign, &tools.gpg, tools.gpg_home.clone())),
            updateinfo: Arc::new(HttpUpdateInfo::new()),
        }
    }
}

/// Repository path segment for a package name on the git host
pub fn gitlabify(name: &str) -> String {
    if name == "tree" {
        return "treepkg".to_string();
    }
    name.replace('+', "plus")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gitlabify() {
        assert_eq!(gitlabify("tree"), "treepkg");
        assert_eq!(gitlabify("libstdc++"), "libstdcplusplus");
        assert_eq!(gitlabify("bash"), "bash");
    }
}
