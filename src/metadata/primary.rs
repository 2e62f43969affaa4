// src/metadata/primary.rs

//! `primary.xml` document model
//!
//! The `rpm:` namespace prefix is not understood by the serde layer, so
//! element tags are rewritten to an internal token on decode and restored
//! on encode. Only tag names are touched; text content is left alone.

use super::{marshal_xml, NS_COMMON, NS_RPM};
use crate::error::Result;
use serde::{Deserialize, Serialize};

const RPM_PREFIX: &str = "rpm:";
const RPM_TOKEN: &str = "rpm_ns_";

fn to_internal(xml: &str) -> String {
    xml.replace(&format!("<{RPM_PREFIX}"), &format!("<{RPM_TOKEN}"))
        .replace(&format!("</{RPM_PREFIX}"), &format!("</{RPM_TOKEN}"))
}

fn from_internal(xml: &str) -> String {
    xml.replace(&format!("<{RPM_TOKEN}"), &format!("<{RPM_PREFIX}"))
        .replace(&format!("</{RPM_TOKEN}"), &format!("</{RPM_PREFIX}"))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageVersion {
    #[serde(rename = "@epoch", default, skip_serializing_if = "String::is_empty")]
    pub epoch: String,
    #[serde(rename = "@ver", default, skip_serializing_if = "String::is_empty")]
    pub ver: String,
    #[serde(rename = "@rel", default, skip_serializing_if = "String::is_empty")]
    pub rel: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageChecksum {
    #[serde(rename = "@type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(rename = "@pkgid", default, skip_serializing_if = "String::is_empty")]
    pub pkgid: String,
    #[serde(rename = "$text", default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageTime {
    #[serde(rename = "@file", default, skip_serializing_if = "String::is_empty")]
    pub file: String,
    #[serde(rename = "@build", default, skip_serializing_if = "String::is_empty")]
    pub build: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSize {
    #[serde(rename = "@package", default, skip_serializing_if = "String::is_empty")]
    pub package: String,
    #[serde(rename = "@installed", default, skip_serializing_if = "String::is_empty")]
    pub installed: String,
    #[serde(rename = "@archive", default, skip_serializing_if = "String::is_empty")]
    pub archive: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageLocation {
    #[serde(rename = "@href", default, skip_serializing_if = "String::is_empty")]
    pub href: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRange {
    #[serde(rename = "@start", default, skip_serializing_if = "String::is_empty")]
    pub start: String,
    #[serde(rename = "@end", default, skip_serializing_if = "String::is_empty")]
    pub end: String,
}

/// A dependency entry (`rpm:entry`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpmEntry {
    #[serde(rename = "@name", default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "@flags", default, skip_serializing_if = "String::is_empty")]
    pub flags: String,
    #[serde(rename = "@epoch", default, skip_serializing_if = "String::is_empty")]
    pub epoch: String,
    #[serde(rename = "@ver", default, skip_serializing_if = "String::is_empty")]
    pub ver: String,
    #[serde(rename = "@rel", default, skip_serializing_if = "String::is_empty")]
    pub rel: String,
    #[serde(rename = "@pre", default, skip_serializing_if = "String::is_empty")]
    pub pre: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpmEntries {
    #[serde(rename = "rpm_ns_entry", default)]
    pub entries: Vec<RpmEntry>,
}

/// A `<file>` element; `kind` is `dir` or `ghost` when present
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFile {
    #[serde(rename = "@type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(rename = "$text", default)]
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFormat {
    #[serde(rename = "rpm_ns_license", default, skip_serializing_if = "String::is_empty")]
    pub license: String,
    #[serde(rename = "rpm_ns_vendor", default)]
    pub vendor: String,
    #[serde(rename = "rpm_ns_group", default, skip_serializing_if = "String::is_empty")]
    pub group: String,
    #[serde(rename = "rpm_ns_buildhost", default, skip_serializing_if = "String::is_empty")]
    pub buildhost: String,
    #[serde(rename = "rpm_ns_sourcerpm", default, skip_serializing_if = "String::is_empty")]
    pub sourcerpm: String,
    #[serde(rename = "rpm_ns_header-range", default, skip_serializing_if = "Option::is_none")]
    pub header_range: Option<HeaderRange>,
    #[serde(rename = "rpm_ns_provides", default, skip_serializing_if = "Option::is_none")]
    pub provides: Option<RpmEntries>,
    #[serde(rename = "rpm_ns_requires", default, skip_serializing_if = "Option::is_none")]
    pub requires: Option<RpmEntries>,
    #[serde(rename = "rpm_ns_obsoletes", default, skip_serializing_if = "Option::is_none")]
    pub obsoletes: Option<RpmEntries>,
    #[serde(rename = "rpm_ns_conflicts", default, skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<RpmEntries>,
    #[serde(rename = "rpm_ns_recommends", default, skip_serializing_if = "Option::is_none")]
    pub recommends: Option<RpmEntries>,
    #[serde(rename = "rpm_ns_suggests", default, skip_serializing_if = "Option::is_none")]
    pub suggests: Option<RpmEntries>,
    #[serde(rename = "rpm_ns_supplements", default, skip_serializing_if = "Option::is_none")]
    pub supplements: Option<RpmEntries>,
    #[serde(rename = "rpm_ns_enhances", default, skip_serializing_if = "Option::is_none")]
    pub enhances: Option<RpmEntries>,
    #[serde(rename = "file", default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<PackageFile>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryPackage {
    #[serde(rename = "@type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub version: PackageVersion,
    #[serde(default)]
    pub checksum: PackageChecksum,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub packager: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<PackageTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<PackageSize>,
    #[serde(default)]
    pub location: PackageLocation,
    #[serde(default)]
    pub format: PackageFormat,
}

impl PrimaryPackage {
    /// `name-epoch:version-release.arch`
    pub fn nevra(&self) -> String {
        format!(
            "{}-{}:{}-{}.{}",
            self.name, self.version.epoch, self.version.ver, self.version.rel, self.arch
        )
    }

    /// Names this package provides
    pub fn provide_names(&self) -> impl Iterator<Item = &str> {
        self.format
            .provides
            .iter()
            .flat_map(|p| p.entries.iter())
            .map(|e| e.name.as_str())
    }
}

/// Root of `primary.xml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrimaryRoot {
    #[serde(rename = "@xmlns", default, skip_serializing_if = "String::is_empty")]
    pub xmlns: String,
    #[serde(rename = "@xmlns:rpm", default, skip_serializing_if = "String::is_empty")]
    pub xmlns_rpm: String,
    #[serde(rename = "@packages", default)]
    pub package_count: usize,
    #[serde(rename = "package", default)]
    pub packages: Vec<PrimaryPackage>,
}

impl Default for PrimaryRoot {
    fn default() -> Self {
        Self {
            xmlns: NS_COMMON.to_string(),
            xmlns_rpm: NS_RPM.to_string(),
            package_count: 0,
            packages: Vec::new(),
        }
    }
}

pub fn decode_primary(bytes: &[u8]) -> Result<PrimaryRoot> {
    let text = String::from_utf8_lossy(bytes);
    let mut root: PrimaryRoot = quick_xml::de::from_str(&to_internal(&text))?;
    if root.xmlns.is_empty() {
        root.xmlns = NS_COMMON.to_string();
    }
    if root.xmlns_rpm.is_empty() {
        root.xmlns_rpm = NS_RPM.to_string();
    }
    Ok(root)
}

pub fn encode_primary(root: &PrimaryRoot) -> Result<Vec<u8>> {
    let xml = marshal_xml("metadata", root)?;
    Ok(from_internal(&String::from_utf8_lossy(&xml)).into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<metadata xmlns="http://linux.duke.edu/metadata/common" xmlns:rpm="http://linux.duke.edu/metadata/rpm" packages="1">
<package type="rpm">
  <name>glibc</name>
  <arch>i686</arch>
  <version epoch="0" ver="2.34" rel="60.el9"/>
  <checksum type="sha256" pkgid="YES">abc123</checksum>
  <summary>The GNU libc libraries</summary>
  <description>Core libraries</description>
  <packager>Rocky Linux Build System</packager>
  <url>http://www.gnu.org/software/glibc/</url>
  <time file="1700000000" build="1690000000"/>
  <size package="2000" installed="8000" archive="8100"/>
  <location href="glibc-2.34-60.el9.i686.rpm"/>
  <format>
    <rpm:license>LGPLv2+</rpm:license>
    <rpm:vendor>Rocky</rpm:vendor>
    <rpm:group>Unspecified</rpm:group>
    <rpm:buildhost>builder</rpm:buildhost>
    <rpm:sourcerpm>glibc-2.34-60.el9.src.rpm</rpm:sourcerpm>
    <rpm:header-range start="4504" end="120000"/>
    <rpm:provides>
      <rpm:entry name="glibc" flags="EQ" epoch="0" ver="2.34" rel="60.el9"/>
      <rpm:entry name="libc.so.6"/>
    </rpm:provides>
    <rpm:requires>
      <rpm:entry name="basesystem" pre="1"/>
    </rpm:requires>
    <file>/lib/libc.so.6</file>
    <file type="dir">/etc/ld.so.conf.d</file>
  </format>
</package>
</metadata>"#;

    #[test]
    fn test_decode_primary_sample() {
        let root = decode_primary(SAMPLE.as_bytes()).unwrap();
        assert_eq!(root.package_count, 1);
        let pkg = &root.packages[0];
        assert_eq!(pkg.name, "glibc");
        assert_eq!(pkg.checksum.value, "abc123");
        assert_eq!(pkg.format.license, "LGPLv2+");
        assert_eq!(pkg.format.sourcerpm, "glibc-2.34-60.el9.src.rpm");
        assert_eq!(pkg.provide_names().collect::<Vec<_>>(), vec!["glibc", "libc.so.6"]);
        assert_eq!(pkg.format.files.len(), 2);
        assert_eq!(pkg.format.files[1].kind.as_deref(), Some("dir"));
        assert_eq!(pkg.nevra(), "glibc-0:2.34-60.el9.i686");
    }

    #[test]
    fn test_encode_restores_rpm_prefix() {
        let root = decode_primary(SAMPLE.as_bytes()).unwrap();
        let encoded = String::from_utf8(encode_primary(&root).unwrap()).unwrap();
        assert!(encoded.contains("<rpm:license>LGPLv2+</rpm:license>"));
        assert!(encoded.contains("<rpm:entry"));
        assert!(encoded.contains("xmlns:rpm=\"http://linux.duke.edu/metadata/rpm\""));
        assert!(!encoded.contains(RPM_TOKEN));

        let again = decode_primary(encoded.as_bytes()).unwrap();
        assert_eq!(again, root);
    }

    #[test]
    fn test_text_containing_prefix_is_untouched() {
        let mut root = PrimaryRoot::default();
        root.packages.push(PrimaryPackage {
            name: "rpm_ns_tool".to_string(),
            description: "uses rpm: macros".to_string(),
            ..Default::default()
        });
        root.package_count = 1;
        let encoded = encode_primary(&root).unwrap();
        let again = decode_primary(&encoded).unwrap();
        assert_eq!(again.packages[0].name, "rpm_ns_tool");
        assert_eq!(again.packages[0].description, "uses rpm: macros");
    }
}
