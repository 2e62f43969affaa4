// src/tools/updateinfo.rs

//! Errata source for `updateinfo.xml`

use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{info, warn};

#[async_trait]
pub trait UpdateInfoSource: Send + Sync {
    /// Raw updateinfo XML at `url`, or `None` when the source has none
    async fn fetch(&self, url: &str) -> Result<Option<Vec<u8>>>;
}

/// URL of the updateinfo document for a product and repository.
///
/// `$arch` in the product name is replaced with `arch`.
pub fn updateinfo_url(base: &str, product: &str, arch: &str, repo: &str) -> Result<String> {
    let product = product.replace("$arch", arch);
    let mut url = url::Url::parse(base.trim_end_matches('/'))
        .map_err(|e| Error::ConfigError(format!("invalid updateinfo base URL {}: {}", base, e)))?;
    url.path_segments_mut()
        .map_err(|_| Error::ConfigError(format!("updateinfo base URL {} cannot have paths", base)))?
        .extend([product.as_str(), repo, "updateinfo.xml"]);
    Ok(url.to_string())
}

pub struct HttpUpdateInfo {
    client: reqwest::Client,
}

impl HttpUpdateInfo {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpUpdateInfo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpdateInfoSource for HttpUpdateInfo {
    async fn fetch(&self, url: &str) -> Result<Option<Vec<u8>>> {
        info!("Getting updateinfo {}", url);
        let res = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| Error::DownloadError(format!("failed to get updateinfo: {e}")))?;
        match res.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                warn!("No updateinfo at {}", url);
                return Ok(None);
            }
            status => {
                return Err(Error::DownloadError(format!(
                    "unexpected status code {} from {}",
                    status, url
                )));
            }
        }
        let body = res
            .bytes()
            .await
            .map_err(|e| Error::DownloadError(format!("failed to read updateinfo: {e}")))?;
        Ok(Some(body.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_updateinfo_url() {
        let url = updateinfo_url(
            "https://apollo.build.resf.org/api/v3/updateinfo/",
            "Rocky Linux 9 $arch",
            "x86_64",
            "BaseOS",
        )
        .unwrap();
        assert_eq!(
            url,
            "https://apollo.build.resf.org/api/v3/updateinfo/Rocky%20Linux%209%20x86_64/BaseOS/updateinfo.xml"
        );
    }
}
