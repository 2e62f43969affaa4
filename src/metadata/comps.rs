// src/metadata/comps.rs

//! Minimal comps (`groups.xml`) reader used to validate catalog input

use crate::error::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompsGroup {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompsEnvironment {
    #[serde(default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompsRoot {
    #[serde(rename = "group", default)]
    pub groups: Vec<CompsGroup>,
    #[serde(rename = "environment", default)]
    pub environments: Vec<CompsEnvironment>,
}

/// Parse a comps document; the caller keeps the original bytes verbatim
pub fn decode_comps(bytes: &[u8]) -> Result<CompsRoot> {
    Ok(quick_xml::de::from_str(&String::from_utf8_lossy(bytes))?)
}
