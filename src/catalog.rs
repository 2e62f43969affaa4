// src/catalog.rs

//! Catalog files
//!
//! A catalog repository describes a project declaratively: which packages
//! exist, which repositories publish them, their filters, module
//! configuration, build root package sets and per-package rpmbuild flags.
//! Every `*.cfg` file is a protobuf text-format message whose first line
//! names its kind:
//!
//! ```text
//! # kind: resf.peridot.v1.CatalogSync
//! package {
//!   name: "bash"
//!   type: PACKAGE_TYPE_NORMAL_FORK
//!   repository { name: "BaseOS" multilib: "x86_64" }
//! }
//! ```
//!
//! The text is first read into a [`serde_json::Value`] tree (repeated
//! fields become arrays) and then deserialized into the typed messages
//! below.

use crate::db::models::{ModuleConfiguration, ModuleDefault, ModulePlatform, ModuleStreamProfile, PackageType};
use crate::error::{Error, Result};
use serde::de::{DeserializeOwned, Deserializer};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

const KIND_PREFIX: &str = "resf.peridot.v1.";

fn one_or_many<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany<T> {
        Many(Vec<T>),
        One(T),
    }
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::Many(items) => items,
        OneOrMany::One(item) => vec![item],
    })
}

/// Publication of a package in one repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CatalogSyncRepository {
    pub name: String,
    #[serde(deserialize_with = "one_or_many")]
    pub module_stream: Vec<String>,
    /// NVR-less `<name>.<arch>` entries pulled in from other packages
    #[serde(deserialize_with = "one_or_many")]
    pub include_filter: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub multilib: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CatalogSyncPackage {
    pub name: String,
    #[serde(rename = "type")]
    pub package_type: String,
    #[serde(deserialize_with = "one_or_many")]
    pub repository: Vec<CatalogSyncRepository>,
}

impl CatalogSyncPackage {
    /// Package type named by the `PACKAGE_TYPE_*` enum value
    pub fn package_type(&self) -> Result<PackageType> {
        package_type_from_enum(&self.package_type)
    }
}

/// Globs for one arch; `*` applies to every arch
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CatalogArchGlobs {
    pub key: String,
    #[serde(deserialize_with = "one_or_many")]
    pub glob_match: Vec<String>,
}

/// Filter applied to every repository whose name matches `repo_match`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CatalogFilter {
    pub repo_match: String,
    #[serde(deserialize_with = "one_or_many")]
    pub arch: Vec<CatalogArchGlobs>,
}

impl CatalogFilter {
    /// `[arch]glob` strings, arch prefix omitted for `*`
    pub fn filter_strings(&self) -> Vec<String> {
        let mut out = Vec::new();
        for arch in &self.arch {
            for glob in &arch.glob_match {
                let entry = if arch.key == "*" {
                    glob.clone()
                } else {
                    format!("[{}]{}", arch.key, glob)
                };
                if !out.contains(&entry) {
                    out.push(entry);
                }
            }
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CatalogStreamProfile {
    pub stream: String,
    #[serde(deserialize_with = "one_or_many")]
    pub name: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CatalogModuleDefault {
    pub name: String,
    pub stream: String,
    #[serde(deserialize_with = "one_or_many")]
    pub profile: Vec<CatalogStreamProfile>,
    #[serde(deserialize_with = "one_or_many")]
    pub common_profile: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CatalogModuleConfiguration {
    pub platform: ModulePlatform,
    #[serde(deserialize_with = "one_or_many")]
    pub default: Vec<CatalogModuleDefault>,
}

impl From<CatalogModuleConfiguration> for ModuleConfiguration {
    fn from(config: CatalogModuleConfiguration) -> Self {
        ModuleConfiguration {
            platform: config.platform,
            default: config
                .default
                .into_iter()
                .map(|d| ModuleDefault {
                    name: d.name,
                    stream: d.stream,
                    profile: d
                        .profile
                        .into_iter()
                        .map(|p| ModuleStreamProfile {
                            stream: p.stream,
                            name: p.name,
                        })
                        .collect(),
                    common_profile: d.common_profile,
                })
                .collect(),
        }
    }
}

/// `resf.peridot.v1.CatalogSync`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CatalogSync {
    #[serde(deserialize_with = "one_or_many")]
    pub package: Vec<CatalogSyncPackage>,
    #[serde(deserialize_with = "one_or_many")]
    pub exclude_filter: Vec<CatalogFilter>,
    #[serde(deserialize_with = "one_or_many")]
    pub include_filter: Vec<CatalogFilter>,
    #[serde(deserialize_with = "one_or_many")]
    pub additional_multilib: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub exclude_multilib_filter: Vec<String>,
    pub module_configuration: Option<CatalogModuleConfiguration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CatalogPackageOptions {
    pub name: String,
    #[serde(deserialize_with = "one_or_many")]
    pub with: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub without: Vec<String>,
}

/// `resf.peridot.v1.CatalogExtraOptions`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CatalogExtraOptions {
    #[serde(deserialize_with = "one_or_many")]
    pub package_options: Vec<CatalogPackageOptions>,
}

/// Build root overrides for packages matched by name or `*` glob
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CatalogScopedPackage {
    pub name: String,
    #[serde(deserialize_with = "one_or_many")]
    pub depends_on: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub enable_module: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub disable_module: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CatalogGroupInstallOption {
    #[serde(deserialize_with = "one_or_many")]
    pub name: Vec<String>,
    #[serde(deserialize_with = "one_or_many")]
    pub scoped_package: Vec<CatalogScopedPackage>,
}

/// `resf.peridot.v1.CatalogGroupInstallOptions`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CatalogGroupInstallOptions {
    pub srpm: CatalogGroupInstallOption,
    pub build: CatalogGroupInstallOption,
}

/// One decoded catalog file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogFile {
    Sync(CatalogSync),
    ExtraOptions(CatalogExtraOptions),
    GroupInstallOptions(CatalogGroupInstallOptions),
}

/// Every kind of catalog found in a checkout
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalogs {
    pub sync: Vec<CatalogSync>,
    pub extra_options: Vec<CatalogExtraOptions>,
    pub group_install_options: Vec<CatalogGroupInstallOptions>,
}

impl Catalogs {
    /// Decode every `*.cfg` file below `root`, in path order
    pub fn load(root: &Path) -> Result<Self> {
        let mut catalogs = Catalogs::default();
        for path in scan(root)? {
            let content = std::fs::read_to_string(&path)?;
            let name = path.strip_prefix(root).unwrap_or(&path).display().to_string();
            match parse_catalog(&name, &content)? {
                CatalogFile::Sync(c) => catalogs.sync.push(c),
                CatalogFile::ExtraOptions(c) => catalogs.extra_options.push(c),
                CatalogFile::GroupInstallOptions(c) => catalogs.group_install_options.push(c),
            }
        }
        Ok(catalogs)
    }
}

/// `*.cfg` files below `root`, skipping the git directory
pub fn scan(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");
    for entry in walker {
        let entry = entry.map_err(|e| Error::IoError(format!("failed to scan catalog: {e}")))?;
        if entry.file_type().is_file() && entry.path().extension().is_some_and(|ext| ext == "cfg") {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

/// Decode one catalog file by its `# kind:` header
pub fn parse_catalog(name: &str, content: &str) -> Result<CatalogFile> {
    let header = content.lines().next().unwrap_or_default();
    if header.trim().is_empty() {
        return Err(Error::ParseError(format!("invalid format for {name}")));
    }
    let kind = header.trim().trim_start_matches('#').trim();
    let kind = kind.strip_prefix("kind:").unwrap_or(kind).trim();

    let decode_err = |e: Error| Error::ParseError(format!("failed to parse kind {kind}: {e}"));
    let value = parse_text(content).map_err(decode_err)?;
    let short = kind.strip_prefix(KIND_PREFIX).unwrap_or_default();
    match short {
        "CatalogSync" => Ok(CatalogFile::Sync(from_value(value).map_err(decode_err)?)),
        "CatalogExtraOptions" => Ok(CatalogFile::ExtraOptions(from_value(value).map_err(decode_err)?)),
        "CatalogGroupInstallOptions" => Ok(CatalogFile::GroupInstallOptions(
            from_value(value).map_err(decode_err)?,
        )),
        _ => Err(Error::ParseError(format!("unknown format {kind}"))),
    }
}

fn from_value<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}

/// Map a `PACKAGE_TYPE_*` enum value
pub fn package_type_from_enum(value: &str) -> Result<PackageType> {
    let short = value.strip_prefix("PACKAGE_TYPE_").unwrap_or(value);
    Ok(match short {
        "" | "DEFAULT" | "NORMAL_FORK" => PackageType::NormalFork,
        "NORMAL" => PackageType::Normal,
        "MODULE_FORK" => PackageType::ModuleFork,
        "MODULE_FORK_COMPONENT" => PackageType::ModuleForkComponent,
        "NORMAL_FORK_MODULE" => PackageType::NormalForkModule,
        "NORMAL_FORK_MODULE_COMPONENT" => PackageType::NormalForkModuleComponent,
        "MODULE_FORK_MODULE_COMPONENT" => PackageType::ModuleForkModuleComponent,
        "NORMAL_SRC" => PackageType::NormalSrc,
        other => return Err(Error::ParseError(format!("unknown package type {other}"))),
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Number(String),
    Colon,
    Open(char),
    Close(char),
    ListOpen,
    ListClose,
    Separator,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            '#' => {
                while chars.next_if(|&c| c != '\n').is_some() {}
            }
            c if c.is_whitespace() => {
                chars.next();
            }
            ':' => {
                chars.next();
                tokens.push(Token::Colon);
            }
            ',' | ';' => {
                chars.next();
                tokens.push(Token::Separator);
            }
            '{' | '<' => {
                chars.next();
                tokens.push(Token::Open(c));
            }
            '}' | '>' => {
                chars.next();
                tokens.push(Token::Close(c));
            }
            '[' => {
                chars.next();
                tokens.push(Token::ListOpen);
            }
            ']' => {
                chars.next();
                tokens.push(Token::ListClose);
            }
            '"' | '\'' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        None => return Err(Error::ParseError("unterminated string".to_string())),
                        Some(q) if q == c => break,
                        Some('\\') => match chars.next() {
                            Some('n') => text.push('\n'),
                            Some('t') => text.push('\t'),
                            Some('r') => text.push('\r'),
                            Some(other) => text.push(other),
                            None => return Err(Error::ParseError("unterminated string".to_string())),
                        },
                        Some(other) => text.push(other),
                    }
                }
                // Adjacent literals concatenate
                match tokens.last_mut() {
                    Some(Token::Str(prev)) => prev.push_str(&text),
                    _ => tokens.push(Token::Str(text)),
                }
            }
            c if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => {
                let mut number = String::new();
                while let Some(d) = chars.next_if(|d| d.is_ascii_alphanumeric() || matches!(*d, '-' | '+' | '.')) {
                    number.push(d);
                }
                tokens.push(Token::Number(number));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(d) = chars.next_if(|d| d.is_ascii_alphanumeric() || matches!(*d, '_' | '.' | '/')) {
                    ident.push(d);
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(Error::ParseError(format!("unexpected character {other:?}"))),
        }
    }
    Ok(tokens)
}

struct TextParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl TextParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn skip_separators(&mut self) {
        while self.peek() == Some(&Token::Separator) {
            self.pos += 1;
        }
    }

    /// Fields until `close` (or the end of input when `None`)
    fn message(&mut self, close: Option<char>) -> Result<Map<String, Value>> {
        let mut fields = Map::new();
        loop {
            self.skip_separators();
            match self.next() {
                None if close.is_none() => return Ok(fields),
                None => return Err(Error::ParseError("unexpected end of message".to_string())),
                Some(Token::Close(c)) if Some(c) == close => return Ok(fields),
                Some(Token::Ident(name)) => {
                    let values = self.field_value()?;
                    for value in values {
                        push_field(&mut fields, &name, value);
                    }
                }
                Some(other) => return Err(Error::ParseError(format!("expected field name, found {other:?}"))),
            }
        }
    }

    /// Value after a field name; list syntax yields several
    fn field_value(&mut self) -> Result<Vec<Value>> {
        let has_colon = self.peek() == Some(&Token::Colon);
        if has_colon {
            self.pos += 1;
        }
        match self.next() {
            Some(Token::Open(c)) => Ok(vec![Value::Object(self.message(Some(closing(c)))?)]),
            Some(Token::ListOpen) if has_colon => {
                let mut values = Vec::new();
                loop {
                    match self.next() {
                        Some(Token::ListClose) => return Ok(values),
                        Some(Token::Separator) => continue,
                        Some(Token::Open(c)) => values.push(Value::Object(self.message(Some(closing(c)))?)),
                        Some(token) => values.push(scalar(token)?),
                        None => return Err(Error::ParseError("unterminated list".to_string())),
                    }
                }
            }
            Some(token) if has_colon => Ok(vec![scalar(token)?]),
            other => Err(Error::ParseError(format!("expected value, found {other:?}"))),
        }
    }
}

fn closing(open: char) -> char {
    if open == '<' { '>' } else { '}' }
}

fn scalar(token: Token) -> Result<Value> {
    match token {
        Token::Str(s) => Ok(Value::String(s)),
        Token::Ident(s) if s == "true" || s == "True" => Ok(Value::Bool(true)),
        Token::Ident(s) if s == "false" || s == "False" => Ok(Value::Bool(false)),
        Token::Ident(s) => Ok(Value::String(s)),
        Token::Number(n) => {
            if let Ok(i) = n.parse::<i64>() {
                Ok(Value::from(i))
            } else if let Ok(f) = n.parse::<f64>() {
                Ok(Value::from(f))
            } else {
                Err(Error::ParseError(format!("invalid number {n}")))
            }
        }
        other => Err(Error::ParseError(format!("expected scalar, found {other:?}"))),
    }
}

/// Repeated fields collect into an array
fn push_field(fields: &mut Map<String, Value>, name: &str, value: Value) {
    match fields.get_mut(name) {
        None => {
            fields.insert(name.to_string(), value);
        }
        Some(Value::Array(items)) if !value.is_array() => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
    }
}

/// Parse a protobuf text-format message into a JSON tree
pub fn parse_text(input: &str) -> Result<Value> {
    let mut parser = TextParser {
        tokens: tokenize(input)?,
        pos: 0,
    };
    Ok(Value::Object(parser.message(None)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SYNC: &str = r#"# kind: resf.peridot.v1.CatalogSync
package {
  name: "bash"
  type: PACKAGE_TYPE_NORMAL_FORK
  repository {
    name: "BaseOS"
    multilib: "x86_64"
    include_filter: ["bash-devel.x86_64"]
  }
}
package {
  name: "nodejs"
  type: PACKAGE_TYPE_MODULE_FORK
  repository: { name: "AppStream" module_stream: ["18", "20"] }
}
exclude_filter {
  repo_match: "^BaseOS$"
  arch { key: "x86_64" glob_match: "*-debugsource" }
  arch { key: "*" glob_match: ["kernel-rt*", "kernel-rt-debug*"] }
}
additional_multilib: "libfoo-devel"
module_configuration {
  platform { major: 9 minor: 2 patch: 0 }
  default {
    name: "nodejs"
    stream: "18"
    common_profile: "common"
    profile { stream: "18" name: ["minimal", "development"] }
  }
}
"#;

    #[test]
    fn test_parse_catalog_sync() {
        let CatalogFile::Sync(sync) = parse_catalog("sync.cfg", SYNC).unwrap() else {
            panic!("wrong kind");
        };
        assert_eq!(sync.package.len(), 2);
        let bash = &sync.package[0];
        assert_eq!(bash.package_type().unwrap(), PackageType::NormalFork);
        assert_eq!(bash.repository[0].multilib, vec!["x86_64"]);
        assert_eq!(bash.repository[0].include_filter, vec!["bash-devel.x86_64"]);
        assert_eq!(sync.package[1].repository[0].module_stream, vec!["18", "20"]);

        let filters = sync.exclude_filter[0].filter_strings();
        assert_eq!(filters, vec!["[x86_64]*-debugsource", "kernel-rt*", "kernel-rt-debug*"]);
        assert_eq!(sync.additional_multilib, vec!["libfoo-devel"]);

        let config: ModuleConfiguration = sync.module_configuration.unwrap().into();
        assert_eq!(config.platform.dist(), "el9.2.0");
        assert_eq!(config.default[0].common_profile, vec!["common"]);
        assert_eq!(config.default[0].profile[0].name, vec!["minimal", "development"]);
    }

    #[test]
    fn test_parse_group_install_and_extra_options() {
        let groups = "# kind: resf.peridot.v1.CatalogGroupInstallOptions\n\
            srpm { name: \"bash\" name: \"rpm-build\" scoped_package { name: \"python3*\" depends_on: \"python3-rpm-macros\" } }\n\
            build < name: [\"bash\", \"gcc\"] >\n";
        let CatalogFile::GroupInstallOptions(options) = parse_catalog("groups.cfg", groups).unwrap() else {
            panic!("wrong kind");
        };
        assert_eq!(options.srpm.name, vec!["bash", "rpm-build"]);
        assert_eq!(options.srpm.scoped_package[0].depends_on, vec!["python3-rpm-macros"]);
        assert_eq!(options.build.name, vec!["bash", "gcc"]);

        let extra = "# kind: resf.peridot.v1.CatalogExtraOptions\n\
            package_options { name: \"kernel\" with: \"debug\" without: [\"tools\"]; }\n";
        let CatalogFile::ExtraOptions(extra) = parse_catalog("extra.cfg", extra).unwrap() else {
            panic!("wrong kind");
        };
        assert_eq!(extra.package_options[0].with, vec!["debug"]);
        assert_eq!(extra.package_options[0].without, vec!["tools"]);
    }

    #[test]
    fn test_rejects_unknown_or_missing_kind() {
        let err = parse_catalog("x.cfg", "# kind: resf.peridot.v1.Nope\n").unwrap_err();
        assert!(err.to_string().contains("unknown format resf.peridot.v1.Nope"));
        let err = parse_catalog("x.cfg", "\npackage { name: \"a\" }").unwrap_err();
        assert!(err.to_string().contains("invalid format for x.cfg"));
        assert!(parse_catalog("x.cfg", "# kind: resf.peridot.v1.CatalogSync\npackage { name: \"a\"").is_err());
    }

    #[test]
    fn test_strings_concatenate_and_escape() {
        let value = parse_text("a: \"one\" 'two' b: \"q\\\"x\"").unwrap();
        assert_eq!(value["a"], "onetwo");
        assert_eq!(value["b"], "q\"x");
    }

    #[test]
    fn test_load_scans_cfg_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("nested")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(dir.path().join("nested/sync.cfg"), SYNC).unwrap();
        std::fs::write(dir.path().join(".git/ignored.cfg"), "garbage").unwrap();
        std::fs::write(dir.path().join("README.md"), "docs").unwrap();
        let catalogs = Catalogs::load(dir.path()).unwrap();
        assert_eq!(catalogs.sync.len(), 1);
        assert!(catalogs.extra_options.is_empty());
    }
}
