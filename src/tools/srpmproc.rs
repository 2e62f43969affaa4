// src/tools/srpmproc.rs

//! The upstream source transform
//!
//! `srpmproc` pulls an upstream package, applies the project's patches and
//! pushes the result to the target git host. It reports the commit and
//! version it pushed per branch as a JSON document on its last output line.

use crate::error::{Error, Result};
use crate::worker::{CommandRunner, CommandSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Inputs of one transform run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRequest {
    pub version: i64,
    pub storage_addr: String,
    pub package: String,
    pub package_git_name: String,
    pub module_prefix: String,
    pub rpm_prefix: String,
    pub upstream_prefix: String,
    pub git_committer_name: String,
    pub git_committer_email: String,
    pub import_branch_prefix: String,
    pub branch_prefix: String,
    pub branch_suffix: String,
    pub strict_branch_mode: bool,
    pub module_mode: bool,
    pub cdn_url: String,
    pub package_version: Option<String>,
    pub package_release: Option<String>,
}

impl ProcessRequest {
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            "--version".to_string(),
            self.version.to_string(),
            "--storage-addr".to_string(),
            self.storage_addr.clone(),
            "--source-rpm".to_string(),
            self.package.clone(),
            "--package-git-name".to_string(),
            self.package_git_name.clone(),
            "--module-prefix".to_string(),
            self.module_prefix.clone(),
            "--rpm-prefix".to_string(),
            self.rpm_prefix.clone(),
            "--upstream-prefix".to_string(),
            self.upstream_prefix.clone(),
            "--git-committer-name".to_string(),
            self.git_committer_name.clone(),
            "--git-committer-email".to_string(),
            self.git_committer_email.clone(),
            "--import-branch-prefix".to_string(),
            self.import_branch_prefix.clone(),
            "--branch-prefix".to_string(),
            self.branch_prefix.clone(),
        ];
        if !self.branch_suffix.is_empty() {
            args.extend(["--branch-suffix".to_string(), self.branch_suffix.clone()]);
        }
        if self.strict_branch_mode {
            args.push("--strict-branch-mode".to_string());
        }
        if self.module_mode {
            args.push("--module-mode".to_string());
        }
        if !self.cdn_url.is_empty() {
            args.extend(["--cdn-url".to_string(), self.cdn_url.clone()]);
        }
        if let Some(v) = &self.package_version {
            args.extend(["--package-version".to_string(), v.clone()]);
        }
        if let Some(r) = &self.package_release {
            args.extend(["--package-release".to_string(), r.clone()]);
        }
        args
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRelease {
    pub version: String,
    pub release: String,
}

/// What the transform pushed, keyed by branch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResponse {
    #[serde(default)]
    pub branch_commits: BTreeMap<String, String>,
    #[serde(default)]
    pub branch_versions: BTreeMap<String, VersionRelease>,
}

impl ProcessResponse {
    /// Parse the JSON document on the last non-empty line of tool output
    pub fn from_output(stdout: &str) -> Result<Self> {
        let line = stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| l.starts_with('{'))
            .ok_or_else(|| Error::tool("srpmproc", "no response document in output"))?;
        Ok(serde_json::from_str(line)?)
    }
}

#[async_trait]
pub trait SourceTransform: Send + Sync {
    async fn process(&self, runner: &dyn CommandRunner, request: &ProcessRequest) -> Result<ProcessResponse>;

    /// Download lookaside sources listed in the metadata sidecar of `dir`
    async fn fetch(&self, runner: &dyn CommandRunner, dir: &Path, cdn_url: Option<&str>) -> Result<()>;
}

pub struct SrpmprocCli {
    program: String,
}

impl SrpmprocCli {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }
}

#[async_trait]
impl SourceTransform for SrpmprocCli {
    async fn process(&self, runner: &dyn CommandRunner, request: &ProcessRequest) -> Result<ProcessResponse> {
        let cmd = CommandSpec::new(&self.program).args(request.args());
        let out = runner.run_checked("srpmproc", &cmd).await?;
        ProcessResponse::from_output(&out.stdout)
    }

    async fn fetch(&self, runner: &dyn CommandRunner, dir: &Path, cdn_url: Option<&str>) -> Result<()> {
        let mut cmd = CommandSpec::new(&self.program).arg("fetch").cwd(dir);
        if let Some(cdn) = cdn_url.filter(|c| !c.is_empty()) {
            cmd = cmd.args(["--cdn-url", cdn]);
        }
        runner.run_checked("srpmproc", &cmd).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_from_output() {
        let stdout = "Cloning upstream\nPushed r9\n{\"branchCommits\":{\"r9\":\"abc\"},\"branchVersions\":{\"r9\":{\"version\":\"5.1\",\"release\":\"2.el9\"}}}\n";
        let res = ProcessResponse::from_output(stdout).unwrap();
        assert_eq!(res.branch_commits["r9"], "abc");
        assert_eq!(res.branch_versions["r9"].release, "2.el9");

        assert!(ProcessResponse::from_output("nothing here").is_err());
    }

    #[test]
    fn test_request_args() {
        let req = ProcessRequest {
            version: 9,
            package: "bash".to_string(),
            module_mode: true,
            package_version: Some("5.1".to_string()),
            ..Default::default()
        };
        let args = req.args().join(" ");
        assert!(args.contains("--version 9"));
        assert!(args.contains("--module-mode"));
        assert!(args.contains("--package-version 5.1"));
        assert!(!args.contains("--branch-suffix"));
    }
}
