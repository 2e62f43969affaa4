// src/metadata/updateinfo.rs

//! `updateinfo.xml` advisory document model

use super::marshal_xml;
use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDate {
    #[serde(rename = "@date", default, skip_serializing_if = "String::is_empty")]
    pub date: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReference {
    #[serde(rename = "@href", default, skip_serializing_if = "String::is_empty")]
    pub href: String,
    #[serde(rename = "@id", default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "@type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(rename = "@title", default, skip_serializing_if = "String::is_empty")]
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateReferences {
    #[serde(rename = "reference", default)]
    pub references: Vec<UpdateReference>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePackageSum {
    #[serde(rename = "@type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(rename = "$text", default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePackage {
    #[serde(rename = "@name", default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "@version", default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(rename = "@release", default, skip_serializing_if = "String::is_empty")]
    pub release: String,
    #[serde(rename = "@epoch", default, skip_serializing_if = "String::is_empty")]
    pub epoch: String,
    #[serde(rename = "@arch", default, skip_serializing_if = "String::is_empty")]
    pub arch: String,
    #[serde(rename = "@src", default, skip_serializing_if = "String::is_empty")]
    pub src: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filename: String,
    #[serde(rename = "sum", default, skip_serializing_if = "Vec::is_empty")]
    pub sums: Vec<UpdatePackageSum>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCollection {
    #[serde(rename = "@short", default, skip_serializing_if = "String::is_empty")]
    pub short: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(rename = "package", default)]
    pub packages: Vec<UpdatePackage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateCollections {
    #[serde(rename = "collection", default)]
    pub collections: Vec<UpdateCollection>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Update {
    #[serde(rename = "@from", default, skip_serializing_if = "String::is_empty")]
    pub from: String,
    #[serde(rename = "@status", default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(rename = "@type", default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(rename = "@version", default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued: Option<UpdateDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<UpdateDate>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rights: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub release: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pushcount: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub severity: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<UpdateReferences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkglist: Option<UpdateCollections>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatesRoot {
    #[serde(rename = "update", default)]
    pub updates: Vec<Update>,
}

impl UpdatesRoot {
    /// Every package filename referenced by the advisories
    pub fn filenames(&self) -> Vec<&str> {
        self.updates
            .iter()
            .filter_map(|u| u.pkglist.as_ref())
            .flat_map(|l| l.collections.iter())
            .flat_map(|c| c.packages.iter())
            .map(|p| p.filename.as_str())
            .collect()
    }
}

pub fn decode_updateinfo(bytes: &[u8]) -> Result<UpdatesRoot> {
    Ok(quick_xml::de::from_str(&String::from_utf8_lossy(bytes))?)
}

pub fn encode_updateinfo(root: &UpdatesRoot) -> Result<Vec<u8>> {
    marshal_xml("updates", root)
}
