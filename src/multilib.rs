// src/multilib.rs

//! Multilib classification
//!
//! Decides whether a 32-bit package built for a compatible arch should be
//! published into a 64-bit repository. The rules follow the historic
//! python-multilib runtime and devel methods.

use crate::error::{Error, Result};
use crate::metadata::primary::{PackageFile, PrimaryPackage};
use glob::Pattern;
use std::collections::BTreeMap;
use std::path::Path;

const PREFER_64: &[&str] = &["gdb", "frysk", "systemtap", "systemtap-runtime", "ltrace", "strace"];
const ROOT_LIB_DIRS: &[&str] = &["/lib", "/lib64"];
const USR_LIB_DIRS: &[&str] = &["/usr/lib", "/usr/lib64"];
const OPROFILE_DIRS: &[&str] = &["/usr/lib/oprofile", "/usr/lib64/oprofile"];
const WINE_DIRS: &[&str] = &["/usr/lib/wine", "/usr/lib64/wine"];
const SANE_DIRS: &[&str] = &["/usr/lib/sane", "/usr/lib64/sane"];
const EXTRA_LIB_SUBDIRS: &[&str] = &[
    "alsa-lib",
    "dri",
    "gtk-2.0/modules",
    "gtk-2.0/immodules",
    "krb5/plugins",
    "sasl2",
    "vdpau",
];
const GTK2_GLOBS: &[&str] = &[
    "/usr/lib*/gtk-2.0/*/engines",
    "/usr/lib*/gtk-2.0/*/modules",
    "/usr/lib*/gtk-2.0/*/immodules",
    "/usr/lib*/gtk-2.0/*/loaders",
    "/usr/lib*/gtk-2.0/*/printbackends",
    "/usr/lib*/gtk-2.0/*/filesystems",
];
const PLUGIN_GLOBS: &[&str] = &[
    "/usr/lib*/qt*/plugins/*",
    "/usr/lib*/kde*/plugins/*",
    "/usr/lib*/qt5/qml/*",
    "/usr/lib*/gdk-pixbuf-2.0/*/loaders",
    "/usr/lib*/xine/plugins/*",
];

/// Host arch to compatible 32-bit arches
pub type ArchFamilies = BTreeMap<String, Vec<String>>;

pub fn default_families() -> ArchFamilies {
    let mut families = ArchFamilies::new();
    families.insert(
        "x86_64".to_string(),
        ["athlon", "i686", "i586", "i486", "i386"]
            .iter()
            .map(|s| s.to_string())
            .collect(),
    );
    for arch in ["aarch64", "ppc64le", "s390x"] {
        families.insert(arch.to_string(), Vec::new());
    }
    families
}

/// Compatible arches for a multilib host arch; unknown arches have none
pub fn compatible_arches<'a>(families: &'a ArchFamilies, arch: &str) -> &'a [String] {
    families.get(arch).map(|v| v.as_slice()).unwrap_or_default()
}

fn compile(pattern: &str) -> Result<Pattern> {
    Pattern::new(pattern)
        .map_err(|e| Error::InvalidArgument(format!("invalid multilib glob {pattern}: {e}")))
}

fn glob_match(pattern: &str, input: &str) -> bool {
    Pattern::new(pattern).map(|p| p.matches(input)).unwrap_or(false)
}

fn is_so_file(file_name: &str) -> bool {
    glob_match("*.so.*", file_name)
}

fn excluded(name: &str, exclude_filter: &[String]) -> Result<bool> {
    for filter in exclude_filter {
        if compile(filter)?.matches(name) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn split_path(path: &str) -> (String, String) {
    let p = Path::new(path);
    let dir = p
        .parent()
        .map(|d| d.to_string_lossy().into_owned())
        .unwrap_or_else(|| "/".to_string());
    let file = p
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_default();
    (dir, file)
}

fn by_dir() -> Vec<String> {
    let mut dirs = vec!["/etc/lsb-release.d".to_string()];
    for sub in EXTRA_LIB_SUBDIRS {
        for lib in USR_LIB_DIRS {
            dirs.push(format!("{lib}/{sub}"));
        }
    }
    for lib in ROOT_LIB_DIRS {
        dirs.push(format!("{lib}/security"));
    }
    dirs
}

/// Packages always wanted in both word sizes on 64-bit arches
pub fn multilib_method(pkg: &PrimaryPackage) -> bool {
    if !pkg.arch.contains("64") {
        return false;
    }
    if PREFER_64.contains(&pkg.name.as_str()) {
        return true;
    }
    pkg.name.starts_with("kernel")
        && pkg
            .provide_names()
            .any(|p| p == "kernel" || p == "kernel-devel")
}

fn file_is_runtime(dir: &str, file: &str, by_dir: &[String]) -> bool {
    let in_list = |list: &[&str]| list.contains(&dir);
    if (in_list(ROOT_LIB_DIRS) || in_list(USR_LIB_DIRS)) && is_so_file(file) {
        return true;
    }
    if by_dir.iter().any(|d| d == dir) {
        return true;
    }
    if dir == "/etc/ld.so.conf.d" && file.ends_with(".conf") {
        return true;
    }
    if in_list(ROOT_LIB_DIRS) && (file.starts_with("libnss_") || file.starts_with("libdb-")) {
        return true;
    }
    if !USR_LIB_DIRS.iter().any(|d| dir.starts_with(d)) {
        return false;
    }
    if dir.starts_with("/usr/lib/gtk-2.0") || dir.starts_with("/usr/lib64/gtk-2.0") {
        return GTK2_GLOBS.iter().any(|g| glob_match(g, dir));
    }
    if dir.starts_with("/usr/lib/gstreamer-") || dir.starts_with("/usr/lib64/gstreamer-") {
        return true;
    }
    if PLUGIN_GLOBS.iter().any(|g| glob_match(g, dir)) {
        return true;
    }
    (in_list(OPROFILE_DIRS) && is_so_file(file))
        || (in_list(WINE_DIRS) && file.ends_with(".so"))
        || (in_list(SANE_DIRS) && file.starts_with("libsane-"))
}

/// Runtime multilib: the package ships shared libraries or plugins
pub fn runtime_multilib(
    pkg: &PrimaryPackage,
    files: &[PackageFile],
    exclude_filter: &[String],
    include_list: &[String],
) -> Result<bool> {
    if excluded(&pkg.name, exclude_filter)? {
        return Ok(false);
    }
    if include_list.contains(&pkg.name) {
        return Ok(true);
    }
    if multilib_method(pkg) {
        return Ok(true);
    }
    if pkg.name.starts_with("kernel") && pkg.provide_names().any(|p| p == "kernel") {
        return Ok(false);
    }

    let by_dir = by_dir();
    Ok(files.iter().any(|f| {
        let (dir, file) = split_path(&f.path);
        file_is_runtime(&dir, &file, &by_dir)
    }))
}

/// Devel multilib: headers and static libraries that pair with runtime libs
pub fn devel_multilib(
    pkg: &PrimaryPackage,
    files: &[PackageFile],
    exclude_filter: &[String],
    include_list: &[String],
) -> Result<bool> {
    if excluded(&pkg.name, exclude_filter)? || exclude_filter.contains(&pkg.name) {
        return Ok(false);
    }
    if include_list.contains(&pkg.name) {
        return Ok(true);
    }
    if runtime_multilib(pkg, files, exclude_filter, include_list).unwrap_or(false) {
        return Ok(true);
    }
    if pkg.name.starts_with("ghc-") {
        return Ok(false);
    }
    if pkg.name.starts_with("kernel") {
        for prov in pkg.provide_names() {
            if prov == "kernel-devel" {
                return Ok(false);
            }
            if prov.ends_with("-devel") || prov.ends_with("-static") {
                return Ok(true);
            }
        }
    }
    Ok(pkg.name.ends_with("-devel") || pkg.name.ends_with("-static"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::primary::{RpmEntries, RpmEntry};

    fn pkg(name: &str, arch: &str) -> PrimaryPackage {
        PrimaryPackage {
            name: name.to_string(),
            arch: arch.to_string(),
            ..Default::default()
        }
    }

    fn files(paths: &[&str]) -> Vec<PackageFile> {
        paths
            .iter()
            .map(|p| PackageFile {
                kind: None,
                path: p.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_default_families() {
        let families = default_families();
        assert!(compatible_arches(&families, "x86_64").contains(&"i686".to_string()));
        assert!(compatible_arches(&families, "aarch64").is_empty());
        assert!(compatible_arches(&families, "riscv64").is_empty());
    }

    #[test]
    fn test_shared_library_is_runtime() {
        let glibc = pkg("glibc", "i686");
        let f = files(&["/lib/libc.so.6", "/usr/share/doc/glibc/README"]);
        assert!(runtime_multilib(&glibc, &f, &[], &[]).unwrap());
        assert!(devel_multilib(&glibc, &f, &[], &[]).unwrap());
    }

    #[test]
    fn test_plain_binary_is_not_runtime() {
        let p = pkg("bash", "i686");
        let f = files(&["/usr/bin/bash"]);
        assert!(!runtime_multilib(&p, &f, &[], &[]).unwrap());
        assert!(!devel_multilib(&p, &f, &[], &[]).unwrap());
    }

    #[test]
    fn test_exclude_and_include() {
        let p = pkg("glibc", "i686");
        let f = files(&["/lib/libc.so.6"]);
        assert!(!runtime_multilib(&p, &f, &["glib*".to_string()], &[]).unwrap());
        let q = pkg("bash", "i686");
        assert!(runtime_multilib(&q, &[], &[], &["bash".to_string()]).unwrap());
    }

    #[test]
    fn test_devel_rules() {
        assert!(devel_multilib(&pkg("zlib-devel", "i686"), &[], &[], &[]).unwrap());
        assert!(devel_multilib(&pkg("zlib-static", "i686"), &[], &[], &[]).unwrap());
        assert!(!devel_multilib(&pkg("ghc-base-devel", "i686"), &[], &[], &[]).unwrap());
    }

    #[test]
    fn test_kernel_provides() {
        let mut k = pkg("kernel-headers", "i686");
        k.format.provides = Some(RpmEntries {
            entries: vec![RpmEntry {
                name: "kernel-headers-devel".into(),
                ..Default::default()
            }],
        });
        assert!(devel_multilib(&k, &[], &[], &[]).unwrap());

        let mut k64 = pkg("kernel", "x86_64");
        k64.format.provides = Some(RpmEntries {
            entries: vec![RpmEntry {
                name: "kernel".into(),
                ..Default::default()
            }],
        });
        assert!(multilib_method(&k64));
    }

    #[test]
    fn test_plugin_dirs() {
        let p = pkg("qt5-qtbase", "i686");
        assert!(runtime_multilib(&p, &files(&["/usr/lib/qt5/plugins/platforms/libq.so"]), &[], &[]).unwrap());
        let g = pkg("gtk2-engines", "i686");
        assert!(runtime_multilib(&g, &files(&["/usr/lib/gtk-2.0/2.10.0/engines/libclear.so"]), &[], &[]).unwrap());
        let s = pkg("sane-backends-libs", "i686");
        assert!(runtime_multilib(&s, &files(&["/usr/lib/sane/libsane-hp.so.1"]), &[], &[]).unwrap());
    }
}
