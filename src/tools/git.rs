// src/tools/git.rs

//! Source control operations, run through a sandbox runner

use crate::error::Result;
use crate::worker::{CommandRunner, CommandSpec};
use async_trait::async_trait;
use std::path::Path;

/// Git as used by imports and SRPM builds
#[async_trait]
pub trait Scm: Send + Sync {
    /// Clone with all tags; `branch` selects a single branch
    async fn clone_repo(
        &self,
        runner: &dyn CommandRunner,
        url: &str,
        dir: &Path,
        branch: Option<&str>,
    ) -> Result<()>;

    /// Fetch every remote head into `refs/remotes`
    async fn fetch_heads(&self, runner: &dyn CommandRunner, dir: &Path) -> Result<()>;

    async fn checkout(&self, runner: &dyn CommandRunner, dir: &Path, rev: &str) -> Result<()>;

    /// Empty repository with `origin` and HEAD on `branch`
    async fn init(&self, runner: &dyn CommandRunner, dir: &Path, remote: &str, branch: &str) -> Result<()>;

    /// Commit a tag points at, if the tag exists
    async fn tag_commit(&self, runner: &dyn CommandRunner, dir: &Path, tag: &str) -> Result<Option<String>>;

    /// Stage everything and commit; returns the new commit hash
    async fn commit_all(&self, runner: &dyn CommandRunner, dir: &Path, message: &str) -> Result<String>;

    /// Annotated tag on HEAD
    async fn tag(&self, runner: &dyn CommandRunner, dir: &Path, name: &str, message: &str) -> Result<()>;

    /// Force-push refspecs to `origin`
    async fn push(&self, runner: &dyn CommandRunner, dir: &Path, refspecs: &[String]) -> Result<()>;
}

pub struct GitCli {
    program: String,
    author: String,
    email: String,
}

impl GitCli {
    pub fn new(program: &str, author: &str, email: &str) -> Self {
        Self {
            program: program.to_string(),
            author: author.to_string(),
            email: email.to_string(),
        }
    }

    fn cmd(&self, dir: &Path) -> CommandSpec {
        CommandSpec::new(&self.program)
            .arg("-C")
            .arg(dir.display().to_string())
            .env("GIT_AUTHOR_NAME", &self.author)
            .env("GIT_AUTHOR_EMAIL", &self.email)
            .env("GIT_COMMITTER_NAME", &self.author)
            .env("GIT_COMMITTER_EMAIL", &self.email)
    }
}

#[async_trait]
impl Scm for GitCli {
    async fn clone_repo(
        &self,
        runner: &dyn CommandRunner,
        url: &str,
        dir: &Path,
        branch: Option<&str>,
    ) -> Result<()> {
        let mut cmd = CommandSpec::new(&self.program).args(["clone", "--tags"]);
        if let Some(branch) = branch {
            cmd = cmd.args(["--branch", branch, "--single-branch"]);
        }
        cmd = cmd.arg(url).arg(dir.display().to_string());
        runner.run_checked("git", &cmd).await?;
        Ok(())
    }

    async fn fetch_heads(&self, runner: &dyn CommandRunner, dir: &Path) -> Result<()> {
        let cmd = self
            .cmd(dir)
            .args(["fetch", "--tags", "origin", "+refs/heads/*:refs/remotes/*"]);
        runner.run_checked("git", &cmd).await?;
        Ok(())
    }

    async fn checkout(&self, runner: &dyn CommandRunner, dir: &Path, rev: &str) -> Result<()> {
        runner
            .run_checked("git", &self.cmd(dir).args(["checkout", "--force", rev]))
            .await?;
        Ok(())
    }

    async fn init(&self, runner: &dyn CommandRunner, dir: &Path, remote: &str, branch: &str) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        runner.run_checked("git", &self.cmd(dir).arg("init")).await?;
        runner
            .run_checked("git", &self.cmd(dir).args(["remote", "add", "origin", remote]))
            .await?;
        runner
            .run_checked(
                "git",
                &self
                    .cmd(dir)
                    .args(["symbolic-ref", "HEAD", &format!("refs/heads/{branch}")]),
            )
            .await?;
        Ok(())
    }

    async fn tag_commit(&self, runner: &dyn CommandRunner, dir: &Path, tag: &str) -> Result<Option<String>> {
        let out = runner
            .run(
                &self
                    .cmd(dir)
                    .args(["rev-list", "-n", "1", &format!("refs/tags/{tag}")]),
            )
            .await?;
        if !out.success() {
            return Ok(None);
        }
        let commit = out.stdout.trim();
        Ok((!commit.is_empty()).then(|| commit.to_string()))
    }

    async fn commit_all(&self, runner: &dyn CommandRunner, dir: &Path, message: &str) -> Result<String> {
        runner.run_checked("git", &self.cmd(dir).args(["add", "--all"])).await?;
        runner
            .run_checked(
                "git",
                &self.cmd(dir).args(["commit", "--allow-empty", "-m", message]),
            )
            .await?;
        let out = runner
            .run_checked("git", &self.cmd(dir).args(["rev-parse", "HEAD"]))
            .await?;
        Ok(out.stdout.trim().to_string())
    }

    async fn tag(&self, runner: &dyn CommandRunner, dir: &Path, name: &str, message: &str) -> Result<()> {
        runner
            .run_checked("git", &self.cmd(dir).args(["tag", "--force", "-a", name, "-m", message]))
            .await?;
        Ok(())
    }

    async fn push(&self, runner: &dyn CommandRunner, dir: &Path, refspecs: &[String]) -> Result<()> {
        let cmd = self
            .cmd(dir)
            .args(["push", "--force", "origin"])
            .args(refspecs.iter().cloned());
        runner.run_checked("git", &cmd).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::LocalProvisioner;
    use crate::worker::{Provisioner, SandboxSpec};

    #[tokio::test]
    async fn test_tag_lookup_and_commit() {
        if which::which("git").is_err() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let provisioner = LocalProvisioner::new(dir.path()).unwrap();
        let sandbox = provisioner
            .provision(&SandboxSpec {
                task_id: "t".to_string(),
                parent_task_id: "t".to_string(),
                project_id: "p".to_string(),
                purpose: "import".to_string(),
                arch: "x86_64".to_string(),
                high_resource: false,
                privileged: false,
            })
            .await
            .unwrap();
        let runner = provisioner.runner(&sandbox);
        let git = GitCli::new("git", "Peridot Bot", "bot@example.com");
        let repo = sandbox.work_dir.join("dist");

        git.init(runner.as_ref(), &repo, "https://git.example.com/rpms/bash.git", "r9")
            .await
            .unwrap();
        std::fs::write(repo.join("bash.spec"), "Name: bash\n").unwrap();
        let commit = git.commit_all(runner.as_ref(), &repo, "import bash").await.unwrap();
        assert_eq!(commit.len(), 40);

        assert!(git.tag_commit(runner.as_ref(), &repo, "imports/r9/bash-5-1").await.unwrap().is_none());
        git.tag(runner.as_ref(), &repo, "imports/r9/bash-5-1", "sync").await.unwrap();
        assert_eq!(
            git.tag_commit(runner.as_ref(), &repo, "imports/r9/bash-5-1").await.unwrap(),
            Some(commit)
        );
    }
}
