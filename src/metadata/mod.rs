// src/metadata/mod.rs

//! Repository metadata codec
//!
//! Serde models for the yum/dnf repodata documents the composer rewrites:
//! primary, filelists, other, repomd and updateinfo (XML through
//! `quick-xml`), plus modulemd streams (YAML through `serde_yaml`).
//! Stored revision payloads are base64 of gzip; see [`codec`].

pub mod codec;
pub mod comps;
pub mod filelists;
pub mod modulemd;
pub mod other;
pub mod primary;
pub mod repomd;
pub mod updateinfo;

use crate::error::Result;
use serde::Serialize;

pub use codec::{compress_gz, decompress_gz, sha256_hex, PayloadDigest};
pub use filelists::{decode_filelists, encode_filelists, FilelistsPackage, FilelistsRoot};
pub use other::{decode_other, encode_other, OtherPackage, OtherRoot};
pub use primary::{decode_primary, encode_primary, PrimaryPackage, PrimaryRoot};
pub use repomd::{decode_repomd, encode_repomd, RepomdData, RepomdRoot};

pub const NS_COMMON: &str = "http://linux.duke.edu/metadata/common";
pub const NS_RPM: &str = "http://linux.duke.edu/metadata/rpm";
pub const NS_FILELISTS: &str = "http://linux.duke.edu/metadata/filelists";
pub const NS_OTHER: &str = "http://linux.duke.edu/metadata/other";
pub const NS_REPO: &str = "http://linux.duke.edu/metadata/repo";

const XML_HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

/// Serialize a document under `root_name` with an XML declaration
pub fn marshal_xml<T: Serialize>(root_name: &str, value: &T) -> Result<Vec<u8>> {
    let body = quick_xml::se::to_string_with_root(root_name, value)?;
    let mut out = String::with_capacity(XML_HEADER.len() + body.len());
    out.push_str(XML_HEADER);
    out.push_str(&body);
    Ok(out.into_bytes())
}
