// src/metadata/filelists.rs

//! `filelists.xml` document model

use super::primary::{PackageFile, PackageVersion};
use super::{marshal_xml, NS_FILELISTS};
use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilelistsPackage {
    #[serde(rename = "@pkgid", default, skip_serializing_if = "String::is_empty")]
    pub pkgid: String,
    #[serde(rename = "@name", default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "@arch", default, skip_serializing_if = "String::is_empty")]
    pub arch: String,
    #[serde(default)]
    pub version: PackageVersion,
    #[serde(rename = "file", default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<PackageFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilelistsRoot {
    #[serde(rename = "@xmlns", default, skip_serializing_if = "String::is_empty")]
    pub xmlns: String,
    #[serde(rename = "@packages", default)]
    pub package_count: usize,
    #[serde(rename = "package", default)]
    pub packages: Vec<FilelistsPackage>,
}

impl Default for FilelistsRoot {
    fn default() -> Self {
        Self {
            xmlns: NS_FILELISTS.to_string(),
            package_count: 0,
            packages: Vec::new(),
        }
    }
}

pub fn decode_filelists(bytes: &[u8]) -> Result<FilelistsRoot> {
    let mut root: FilelistsRoot = quick_xml::de::from_str(&String::from_utf8_lossy(bytes))?;
    if root.xmlns.is_empty() {
        root.xmlns = NS_FILELISTS.to_string();
    }
    Ok(root)
}

pub fn encode_filelists(root: &FilelistsRoot) -> Result<Vec<u8>> {
    marshal_xml("filelists", root)
}
