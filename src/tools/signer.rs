// src/tools/signer.rs

//! Package and metadata signing

use crate::db::models::Key;
use crate::error::{Error, Result};
use crate::worker::{CommandRunner, CommandSpec};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

#[async_trait]
pub trait Signer: Send + Sync {
    /// Sign an RPM in place with `key`
    async fn sign_rpm(&self, runner: &dyn CommandRunner, rpm: &Path, key: &Key) -> Result<()>;

    /// ASCII-armored detached signature over `content`
    async fn sign_detached(&self, runner: &dyn CommandRunner, content: &[u8], key: &Key) -> Result<String>;
}

/// rpmsign and gpg against a local keyring
pub struct GpgSigner {
    rpmsign: String,
    gpg: String,
    home: Option<PathBuf>,
}

impl GpgSigner {
    pub fn new(rpmsign: &str, gpg: &str, home: Option<PathBuf>) -> Self {
        Self {
            rpmsign: rpmsign.to_string(),
            gpg: gpg.to_string(),
            home,
        }
    }

    fn with_home(&self, mut cmd: CommandSpec) -> CommandSpec {
        if let Some(home) = &self.home {
            cmd = cmd.env("GNUPGHOME", home.display().to_string());
        }
        cmd
    }
}

#[async_trait]
impl Signer for GpgSigner {
    async fn sign_rpm(&self, runner: &dyn CommandRunner, rpm: &Path, key: &Key) -> Result<()> {
        let cmd = self.with_home(
            CommandSpec::new(&self.rpmsign)
                .arg("--addsign")
                .arg("--key-id")
                .arg(&key.gpg_id)
                .arg(rpm.display().to_string()),
        );
        runner.run_checked("rpmsign", &cmd).await?;
        Ok(())
    }

    async fn sign_detached(&self, runner: &dyn CommandRunner, content: &[u8], key: &Key) -> Result<String> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("content");
        let output = dir.path().join("content.asc");
        tokio::fs::write(&input, content).await?;

        let cmd = self.with_home(
            CommandSpec::new(&self.gpg)
                .args(["--batch", "--yes", "--armor", "--detach-sign", "--local-user"])
                .arg(&key.gpg_id)
                .arg("--output")
                .arg(output.display().to_string())
                .arg(input.display().to_string()),
        );
        runner.run_checked("gpg", &cmd).await?;
        let signature = tokio::fs::read_to_string(&output).await?;
        if signature.trim().is_empty() {
            return Err(Error::tool("gpg", "empty signature"));
        }
        Ok(signature)
    }
}
