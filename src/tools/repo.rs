// src/tools/repo.rs

//! Repository metadata generation with createrepo_c and sqliterepo_c

use crate::error::{Error, Result};
use crate::metadata::codec::decompress_gz;
use crate::worker::{CommandRunner, CommandSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Decompressed repodata of a single-package repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadataXml {
    pub primary: Vec<u8>,
    pub filelists: Vec<u8>,
    pub other: Vec<u8>,
}

#[async_trait]
pub trait RepoTool: Send + Sync {
    /// Primary, filelists and other XML describing one RPM
    async fn package_metadata(&self, runner: &dyn CommandRunner, rpm: &Path) -> Result<PackageMetadataXml>;

    /// Generate sqlite databases next to the XML repodata in `dir`.
    ///
    /// Returns the produced `*.sqlite.*` files.
    async fn sqlite_metadata(&self, runner: &dyn CommandRunner, dir: &Path) -> Result<Vec<PathBuf>>;
}

pub struct CreaterepoCli {
    createrepo: String,
    sqliterepo: String,
}

impl CreaterepoCli {
    pub fn new(createrepo: &str, sqliterepo: &str) -> Self {
        Self {
            createrepo: createrepo.to_string(),
            sqliterepo: sqliterepo.to_string(),
        }
    }
}

fn read_gz(repodata: &Path, name: &str) -> Result<Vec<u8>> {
    let path = repodata.join(name);
    let gz = std::fs::read(&path)
        .map_err(|e| Error::tool("createrepo_c", format!("missing {}: {}", path.display(), e)))?;
    decompress_gz(&gz)
}

#[async_trait]
impl RepoTool for CreaterepoCli {
    async fn package_metadata(&self, runner: &dyn CommandRunner, rpm: &Path) -> Result<PackageMetadataXml> {
        let file_name = rpm
            .file_name()
            .ok_or_else(|| Error::InvalidArgument(format!("not a file: {}", rpm.display())))?;
        let parent = rpm.parent().unwrap_or_else(|| Path::new("."));
        let scratch = parent.join(format!(".createrepo-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&scratch).await?;

        let result = async {
            tokio::fs::copy(rpm, scratch.join(file_name)).await?;
            let cmd = CommandSpec::new(&self.createrepo)
                .args(["--no-database", "--simple-md-filenames", "--quiet"])
                .arg(scratch.display().to_string());
            runner.run_checked("createrepo_c", &cmd).await?;

            let repodata = scratch.join("repodata");
            Ok(PackageMetadataXml {
                primary: read_gz(&repodata, "primary.xml.gz")?,
                filelists: read_gz(&repodata, "filelists.xml.gz")?,
                other: read_gz(&repodata, "other.xml.gz")?,
            })
        }
        .await;

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            debug!("Leaving {}: {}", scratch.display(), e);
        }
        result
    }

    async fn sqlite_metadata(&self, runner: &dyn CommandRunner, dir: &Path) -> Result<Vec<PathBuf>> {
        let cmd = CommandSpec::new(&self.sqliterepo)
            .args(["--compress-type", "gz", "--force"])
            .arg(dir.display().to_string());
        runner.run_checked("sqliterepo_c", &cmd).await?;

        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir.join("repodata"))? {
            let path = entry?.path();
            let is_sqlite = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(".sqlite"));
            if is_sqlite {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }
}
