// src/db/models/mod.rs

//! Data models for task store entities
//!
//! This module defines Rust structs that correspond to database tables
//! and provides methods for creating, reading and updating records.
//! Enums are stored by their serde names; string lists as JSON arrays.

mod build;
mod import;
mod package;
mod project;
mod repository;
mod task;

pub use build::{Batch, BatchKind, Build, NvraLock};
pub use import::{Import, ImportRevision};
pub use package::{ExtraOptions, Package, PackageType, PackageVersion, ProjectPackageVersion};
pub use project::{
    ExternalRepository, Key, ModuleConfiguration, ModuleDefault, ModulePlatform, ModuleStreamProfile,
    Project,
};
pub use repository::{ALL_REPOSITORY, Repository, RepositoryRevision};
pub use task::{Task, TaskArtifact, TaskLog, TaskStatus, TaskType};

use crate::error::{Error, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Serialized name of a unit enum, without quotes
pub(crate) fn enum_to_sql<T: Serialize>(value: &T) -> Result<String> {
    let s = serde_json::to_string(value).map_err(|e| Error::IoError(e.to_string()))?;
    Ok(s.trim_matches('"').to_string())
}

pub(crate) fn enum_from_sql<T: DeserializeOwned>(s: &str) -> Option<T> {
    serde_json::from_str(&format!("\"{}\"", s)).ok()
}

pub(crate) fn list_to_sql(list: &[String]) -> String {
    serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
}

pub(crate) fn list_from_sql(s: &str) -> Vec<String> {
    serde_json::from_str(s).unwrap_or_default()
}

pub(crate) fn json_to_sql(value: Option<&serde_json::Value>) -> Option<String> {
    value.map(|v| v.to_string())
}

pub(crate) fn json_from_sql(s: Option<String>) -> Option<serde_json::Value> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}
