// src/metadata/other.rs

//! `other.xml` document model (changelogs)

use super::primary::PackageVersion;
use super::{marshal_xml, NS_OTHER};
use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changelog {
    #[serde(rename = "@author", default, skip_serializing_if = "String::is_empty")]
    pub author: String,
    #[serde(rename = "@date", default, skip_serializing_if = "String::is_empty")]
    pub date: String,
    #[serde(rename = "$text", default)]
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtherPackage {
    #[serde(rename = "@pkgid", default, skip_serializing_if = "String::is_empty")]
    pub pkgid: String,
    #[serde(rename = "@name", default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "@arch", default, skip_serializing_if = "String::is_empty")]
    pub arch: String,
    #[serde(default)]
    pub version: PackageVersion,
    #[serde(rename = "changelog", default, skip_serializing_if = "Vec::is_empty")]
    pub changelogs: Vec<Changelog>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtherRoot {
    #[serde(rename = "@xmlns", default, skip_serializing_if = "String::is_empty")]
    pub xmlns: String,
    #[serde(rename = "@packages", default)]
    pub package_count: usize,
    #[serde(rename = "package", default)]
    pub packages: Vec<OtherPackage>,
}

impl Default for OtherRoot {
    fn default() -> Self {
        Self {
            xmlns: NS_OTHER.to_string(),
            package_count: 0,
            packages: Vec::new(),
        }
    }
}

pub fn decode_other(bytes: &[u8]) -> Result<OtherRoot> {
    let mut root: OtherRoot = quick_xml::de::from_str(&String::from_utf8_lossy(bytes))?;
    if root.xmlns.is_empty() {
        root.xmlns = NS_OTHER.to_string();
    }
    Ok(root)
}

pub fn encode_other(root: &OtherRoot) -> Result<Vec<u8>> {
    marshal_xml("otherdata", root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_changelog_text_survives() {
        let xml = r#"<otherdata xmlns="http://linux.duke.edu/metadata/other" packages="1">
<package pkgid="abc" name="bash" arch="x86_64">
  <version epoch="0" ver="5.1.8" rel="6.el9"/>
  <changelog author="Jane Doe &lt;jane@example.com&gt; - 5.1.8-6" date="1650000000">- Fix &amp; rebuild</changelog>
</package>
</otherdata>"#;
        let root = decode_other(xml.as_bytes()).unwrap();
        let log = &root.packages[0].changelogs[0];
        assert_eq!(log.author, "Jane Doe <jane@example.com> - 5.1.8-6");
        assert_eq!(log.text, "- Fix & rebuild");
        let again = decode_other(&encode_other(&root).unwrap()).unwrap();
        assert_eq!(again, root);
    }
}
