// src/rpmutils.rs

//! RPM filename helpers: NVR parsing, debug package detection, dist tags

use regex::Regex;
use std::sync::LazyLock;

static NVR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+)-([\w~%.+^]+)-(\w+(?:\.[\w~%+^]+)+?)(?:\.(\w+))?(?:\.rpm)?$").expect("valid regex")
});

static NVR_NO_ARCH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\S+)-([\w~%.+]+)-(\w+(?:\.[\w+]+)+?)(?:\.rpm)?$").expect("valid regex"));

static NVR_UNUSUAL_RELEASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\S+)-([\w~%.+^]+)-(\w+?)(?:\.(\w+))?(?:\.rpm)?$").expect("valid regex")
});

static EPOCH_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+):").expect("valid regex"));

static MODULE_DIST_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.module.+$").expect("valid regex"));

static IMPORT_DIST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r".+\.(el[^. \t\n]+)").expect("valid regex"));

static DEBUG_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:.*-debuginfo(?:-.*)?|.*-debuginfo-.*|.*-debugsource)$").expect("valid regex")
});

const DEBUG_SUFFIXES: &[&str] = &["-debuginfo", "-debugsource", "-debuginfo-common"];

/// Parsed `name-version-release[.arch][.rpm]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nvr {
    pub name: String,
    pub version: String,
    pub release: String,
    pub arch: String,
}

impl Nvr {
    /// Parse a filename, trying the unusual-release form first
    pub fn parse(input: &str) -> Option<Nvr> {
        if !NVR_RE.is_match(input) {
            return None;
        }
        let caps = NVR_UNUSUAL_RELEASE_RE
            .captures(input)
            .or_else(|| NVR_RE.captures(input))?;
        let group = |i| caps.get(i).map(|m| m.as_str().to_string()).unwrap_or_default();
        Some(Nvr {
            name: group(1),
            version: group(2),
            release: group(3),
            arch: group(4),
        })
    }

    /// Parse a bare `name-version-release`; `arch` is left empty
    pub fn parse_no_arch(input: &str) -> Option<Nvr> {
        let caps = NVR_NO_ARCH_RE.captures(input)?;
        Some(Nvr {
            name: caps[1].to_string(),
            version: caps[2].to_string(),
            release: caps[3].to_string(),
            arch: String::new(),
        })
    }

    /// `name-version-release`
    pub fn nvr(&self) -> String {
        format!("{}-{}-{}", self.name, self.version, self.release)
    }
}

/// Whether the input is a bare NVR without arch
pub fn is_nvr_no_arch(input: &str) -> bool {
    NVR_NO_ARCH_RE.is_match(input)
}

pub fn is_debug_package(name: &str) -> bool {
    DEBUG_RE.is_match(name)
}

/// Debug status of a full NVRA; `None` when the input is not an NVRA
pub fn is_debug_package_nvra(nvra: &str) -> Option<bool> {
    Nvr::parse(nvra).map(|nvr| is_debug_package(&nvr.name))
}

pub fn strip_debug_suffixes(name: &str) -> String {
    let mut ret = name;
    for suffix in DEBUG_SUFFIXES {
        ret = ret.strip_suffix(suffix).unwrap_or(ret);
    }
    ret.to_string()
}

/// Remove `-debuginfo` and `-debugsource` anywhere in the name
pub fn no_debug_name(name: &str) -> String {
    name.replace("-debuginfo", "").replace("-debugsource", "")
}

pub fn strip_epoch(nevra: &str) -> String {
    EPOCH_RE.replace_all(nevra, "").to_string()
}

pub fn strip_module_dist(release: &str) -> String {
    MODULE_DIST_RE.replace(release, "").to_string()
}

pub fn is_module_artifact(name: &str) -> bool {
    name.contains(".module+")
}

/// The `elN[_M]` dist tag carried in an import release, if any
pub fn import_dist(release: &str) -> Option<String> {
    IMPORT_DIST_RE
        .captures(release)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Basename without the `.rpm` suffix
pub fn strip_rpm_suffix(name: &str) -> &str {
    name.strip_suffix(".rpm").unwrap_or(name)
}

pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
