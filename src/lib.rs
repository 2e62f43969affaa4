// src/lib.rs

//! Peridot Builder
//!
//! RPM build orchestration and yum repository composition.
//!
//! # Architecture
//!
//! - Task store: projects, packages, builds, tasks and repository revisions
//!   live in SQLite; revisions are append-only
//! - Workflows: imports, builds, module builds and composer runs are async
//!   workflows on a [`workflow::Controller`], made of retryable activities
//! - Workers: builds run in sandboxes from a [`worker::Provisioner`]
//! - Composer: repository metadata is rewritten per build under a
//!   project-scoped lease and served read-only by [`server`]

pub mod catalog;
pub mod config;
pub mod db;
mod error;
pub mod lease;
pub mod metadata;
pub mod multilib;
pub mod orchestrator;
pub mod rpmutils;
pub mod server;
pub mod store;
pub mod tools;
pub mod worker;
pub mod workflow;

pub use config::{BuilderConfig, Environment};
pub use error::{Error, Result};
pub use workflow::Controller;
