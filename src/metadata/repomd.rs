// src/metadata/repomd.rs

//! `repomd.xml` index model

use super::codec::PayloadDigest;
use super::{marshal_xml, NS_REPO, NS_RPM};
use crate::error::Result;
use serde::{Deserialize, Serialize};

fn is_zero(v: &u64) -> bool {
    *v == 0
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepomdChecksum {
    #[serde(rename = "@type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(rename = "$text", default)]
    pub value: String,
}

impl RepomdChecksum {
    pub fn sha256(value: impl Into<String>) -> Self {
        Self {
            kind: "sha256".to_string(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepomdLocation {
    #[serde(rename = "@href", default, skip_serializing_if = "String::is_empty")]
    pub href: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepomdDistro {
    #[serde(rename = "@cpeid", default, skip_serializing_if = "String::is_empty")]
    pub cpeid: String,
    #[serde(rename = "$text", default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepomdTags {
    #[serde(rename = "distro", default, skip_serializing_if = "Vec::is_empty")]
    pub distro: Vec<RepomdDistro>,
}

/// One `<data type=...>` entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepomdData {
    #[serde(rename = "@type", default)]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<RepomdChecksum>,
    #[serde(rename = "open-checksum", default, skip_serializing_if = "Option::is_none")]
    pub open_checksum: Option<RepomdChecksum>,
    #[serde(default)]
    pub location: RepomdLocation,
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub size: u64,
    #[serde(rename = "open-size", default, skip_serializing_if = "is_zero")]
    pub open_size: u64,
}

impl RepomdData {
    /// Entry for a gzipped payload with open and closed digests
    pub fn compressed(kind: &str, href: String, digest: &PayloadDigest, timestamp: i64) -> Self {
        Self {
            kind: kind.to_string(),
            checksum: Some(RepomdChecksum::sha256(&digest.checksum)),
            open_checksum: Some(RepomdChecksum::sha256(&digest.open_checksum)),
            location: RepomdLocation { href },
            timestamp,
            size: digest.size,
            open_size: digest.open_size,
        }
    }

    /// Entry for an uncompressed payload (the plain `group` sibling)
    pub fn plain(kind: &str, href: String, digest: &PayloadDigest, timestamp: i64) -> Self {
        Self {
            kind: kind.to_string(),
            checksum: Some(RepomdChecksum::sha256(&digest.open_checksum)),
            open_checksum: None,
            location: RepomdLocation { href },
            timestamp,
            size: digest.open_size,
            open_size: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepomdRoot {
    #[serde(rename = "@xmlns", default, skip_serializing_if = "String::is_empty")]
    pub xmlns: String,
    #[serde(rename = "@xmlns:rpm", default, skip_serializing_if = "String::is_empty")]
    pub xmlns_rpm: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<RepomdTags>,
    #[serde(rename = "data", default)]
    pub data: Vec<RepomdData>,
}

impl Default for RepomdRoot {
    fn default() -> Self {
        Self {
            xmlns: NS_REPO.to_string(),
            xmlns_rpm: NS_RPM.to_string(),
            revision: String::new(),
            tags: None,
            data: Vec::new(),
        }
    }
}

impl RepomdRoot {
    pub fn new(revision: impl Into<String>) -> Self {
        Self {
            revision: revision.into(),
            ..Default::default()
        }
    }

    pub fn find(&self, kind: &str) -> Option<&RepomdData> {
        self.data.iter().find(|d| d.kind == kind)
    }

    /// Replace the entry of the same type in place, or append it
    pub fn upsert(&mut self, entry: RepomdData) {
        match self.data.iter_mut().find(|d| d.kind == entry.kind) {
            Some(existing) => *existing = entry,
            None => self.data.push(entry),
        }
    }
}

pub fn decode_repomd(bytes: &[u8]) -> Result<RepomdRoot> {
    Ok(quick_xml::de::from_str(&String::from_utf8_lossy(bytes))?)
}

pub fn encode_repomd(root: &RepomdRoot) -> Result<Vec<u8>> {
    marshal_xml("repomd", root)
}

/// `repodata/<revision>-<TYPE>.<ext>.gz`
pub fn blob_href(revision: &str, blob: &str) -> String {
    let ext = if blob == "MODULES" { "yaml" } else { "xml" };
    format!("repodata/{revision}-{blob}.{ext}.gz")
}
