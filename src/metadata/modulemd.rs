// src/metadata/modulemd.rs

//! modulemd (v2, with v3 input conversion) and modulemd-defaults documents
//!
//! Repository `modules.yaml` payloads are a YAML stream of defaults and
//! module documents, each opened with `---` and closed with `...`.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

pub const MODULEMD_DOCUMENT: &str = "modulemd";
pub const DEFAULTS_DOCUMENT: &str = "modulemd-defaults";

/// Module versions are long integers in the wild; accept either form
fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_yaml::Value::deserialize(deserializer)?;
    Ok(match value {
        serde_yaml::Value::Null => String::new(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::String(s) => s,
        serde_yaml::Value::Bool(b) => b.to_string(),
        other => {
            return Err(serde::de::Error::custom(format!(
                "expected scalar version, got {other:?}"
            )))
        }
    })
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceLevel {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub eol: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct License {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub module: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dependencies {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub buildrequires: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requires: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct References {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub community: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub documentation: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tracker: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rpms: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpmList {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rpms: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildOptsRpms {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub macros: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub whitelist: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BuildOpts {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpms: Option<BuildOptsRpms>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arches: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentRpm {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rationale: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cache: String,
    #[serde(rename = "ref", default, skip_serializing_if = "String::is_empty")]
    pub git_ref: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub buildonly: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub buildroot: bool,
    #[serde(rename = "srpm-buildroot", default, skip_serializing_if = "is_false")]
    pub srpm_buildroot: bool,
    #[serde(default)]
    pub buildorder: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arches: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub multilib: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentModule {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rationale: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    #[serde(rename = "ref", default, skip_serializing_if = "String::is_empty")]
    pub git_ref: String,
    #[serde(default)]
    pub buildorder: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Components {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rpms: BTreeMap<String, ComponentRpm>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub modules: BTreeMap<String, ComponentModule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rpms: Vec<String>,
    #[serde(rename = "rpm-map", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rpm_map: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleData {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stream: String,
    #[serde(
        default,
        deserialize_with = "string_or_number",
        skip_serializing_if = "String::is_empty"
    )]
    pub version: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub static_context: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arch: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub summary: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub servicelevels: BTreeMap<String, ServiceLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<License>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub xmd: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependencies>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<References>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub profiles: BTreeMap<String, Profile>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub profile: BTreeMap<String, Profile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api: Option<RpmList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<RpmList>,
    #[serde(rename = "buildopts", default, skip_serializing_if = "Option::is_none")]
    pub build_opts: Option<BuildOpts>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub components: Option<Components>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifacts: Option<Artifacts>,
}

impl ModuleData {
    pub fn whitelist(&self) -> &[String] {
        self.build_opts
            .as_ref()
            .and_then(|b| b.rpms.as_ref())
            .map(|r| r.whitelist.as_slice())
            .unwrap_or_default()
    }

    pub fn build_macros(&self) -> &str {
        self.build_opts
            .as_ref()
            .and_then(|b| b.rpms.as_ref())
            .map(|r| r.macros.as_str())
            .unwrap_or_default()
    }

    pub fn filtered_rpms(&self) -> &[String] {
        self.filter.as_ref().map(|f| f.rpms.as_slice()).unwrap_or_default()
    }

    pub fn artifact_rpms(&self) -> &[String] {
        self.artifacts
            .as_ref()
            .map(|a| a.rpms.as_slice())
            .unwrap_or_default()
    }

    /// Replace every `platform` buildrequire with a single stream
    pub fn set_platform(&mut self, platform: &str) {
        for dep in &mut self.dependencies {
            if dep.buildrequires.contains_key("platform") {
                dep.buildrequires
                    .insert("platform".to_string(), vec![platform.to_string()]);
            }
        }
    }
}

/// A modulemd v2 document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModuleMd {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub document: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ModuleData>,
}

impl ModuleMd {
    /// The data block, or an invalid-module error
    pub fn data(&self) -> Result<&ModuleData> {
        self.data
            .as_ref()
            .ok_or_else(|| Error::InvalidModule("missing data".to_string()))
    }

    pub fn name_stream(&self) -> Option<(&str, &str)> {
        self.data
            .as_ref()
            .map(|d| (d.name.as_str(), d.stream.as_str()))
    }

    /// Serialize as a standalone document with a leading separator
    pub fn to_document(&self) -> Result<String> {
        let body = serde_yaml::to_string(self)?;
        Ok(format!("---\n{}", body.trim_start_matches("---\n")))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
struct DetectVersion {
    #[serde(default)]
    document: String,
    #[serde(default)]
    version: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
struct V3Configuration {
    #[serde(default)]
    platform: String,
    #[serde(default)]
    buildrequires: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    requires: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    buildopts: Option<BuildOpts>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
struct V3Data {
    #[serde(default)]
    name: String,
    #[serde(default)]
    stream: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    license: Vec<String>,
    #[serde(default)]
    xmd: BTreeMap<String, BTreeMap<String, serde_yaml::Value>>,
    #[serde(default)]
    references: Option<References>,
    #[serde(default)]
    profiles: BTreeMap<String, Profile>,
    #[serde(default)]
    profile: BTreeMap<String, Profile>,
    #[serde(default)]
    api: Option<RpmList>,
    #[serde(default)]
    filter: Option<RpmList>,
    #[serde(default)]
    configurations: Vec<V3Configuration>,
    #[serde(default)]
    components: Option<Components>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
struct V3 {
    #[serde(default)]
    document: String,
    #[serde(default)]
    version: i64,
    #[serde(default)]
    data: Option<V3Data>,
}

impl From<V3> for ModuleMd {
    fn from(v3: V3) -> Self {
        let data = v3.data.map(|d| {
            let config = d.configurations.into_iter().next().unwrap_or_default();
            let mut buildrequires = config.buildrequires;
            let mut requires = config.requires;
            if !config.platform.is_empty() {
                buildrequires.insert("platform".to_string(), vec![config.platform.clone()]);
                requires.insert("platform".to_string(), vec![config.platform]);
            }
            let dependencies = if buildrequires.is_empty() && requires.is_empty() {
                Vec::new()
            } else {
                vec![Dependencies {
                    buildrequires,
                    requires,
                }]
            };
            ModuleData {
                name: d.name,
                stream: d.stream,
                summary: d.summary,
                description: d.description,
                license: Some(License {
                    module: d.license,
                    content: Vec::new(),
                }),
                xmd: d.xmd,
                dependencies,
                references: d.references,
                profiles: d.profiles,
                profile: d.profile,
                api: d.api,
                filter: d.filter,
                build_opts: Some(config.buildopts.unwrap_or_default()),
                components: d.components,
                ..Default::default()
            }
        });
        ModuleMd {
            document: v3.document,
            version: 2,
            data,
        }
    }
}

/// Parse a module source document, converting v3 packager files to v2
pub fn parse(input: &[u8]) -> Result<ModuleMd> {
    let detect: DetectVersion = serde_yaml::from_slice(input)
        .map_err(|e| Error::ParseError(format!("error detecting document version: {e}")))?;
    match detect.version {
        2 => serde_yaml::from_slice(input)
            .map_err(|e| Error::ParseError(format!("error parsing modulemd: {e}"))),
        3 => {
            let v3: V3 = serde_yaml::from_slice(input)
                .map_err(|e| Error::ParseError(format!("error parsing modulemd: {e}")))?;
            Ok(v3.into())
        }
        other => Err(Error::ParseError(format!(
            "unsupported {} version {other}",
            if detect.document.is_empty() { MODULEMD_DOCUMENT } else { detect.document.as_str() }
        ))),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DefaultsData {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub module: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stream: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub profiles: BTreeMap<String, Vec<String>>,
}

/// A modulemd-defaults v1 document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub document: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<DefaultsData>,
}

impl Defaults {
    pub fn new(module: &str, stream: &str, profiles: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            document: DEFAULTS_DOCUMENT.to_string(),
            version: 1,
            data: Some(DefaultsData {
                module: module.to_string(),
                stream: stream.to_string(),
                profiles,
            }),
        }
    }
}

/// Decode the module documents of a repository stream, skipping defaults
pub fn decode_modules(bytes: &[u8]) -> Result<Vec<ModuleMd>> {
    let mut modules = Vec::new();
    for doc in serde_yaml::Deserializer::from_slice(bytes) {
        let value = serde_yaml::Value::deserialize(doc)?;
        if value.is_null() {
            continue;
        }
        let kind = value
            .get("document")
            .and_then(|d| d.as_str())
            .unwrap_or_default();
        if kind == DEFAULTS_DOCUMENT {
            continue;
        }
        modules.push(serde_yaml::from_value(value)?);
    }
    Ok(modules)
}

/// Encode defaults then modules as one `---`/`...` delimited stream
pub fn encode_modules(defaults: &[Defaults], modules: &[ModuleMd]) -> Result<Vec<u8>> {
    let mut out = String::from("---\n");
    for doc in defaults {
        out.push_str(serde_yaml::to_string(doc)?.trim_start_matches("---\n"));
        out.push_str("...\n");
    }
    for doc in modules {
        out.push_str(serde_yaml::to_string(doc)?.trim_start_matches("---\n"));
        out.push_str("...\n");
    }
    Ok(out.into_bytes())
}
