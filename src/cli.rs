// src/cli.rs
//! CLI definitions for the builder
//!
//! This module contains all command-line interface definitions using clap.
//! The actual command implementations are in the `commands` module.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "peridot-builder")]
#[command(version)]
#[command(about = "RPM build orchestration and yum repository composition", long_about = None)]
pub struct Cli {
    /// Configuration file
    #[arg(short, long, global = true, env = "PERIDOT_BUILDER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Recorded as the submitter of created tasks
    #[arg(long, global = true, env = "PERIDOT_SUBMITTER")]
    pub submitter: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the task store and blob store
    Init,

    /// Serve repositories over HTTP
    Serve {
        /// Override server.bind
        #[arg(long)]
        bind: Option<String>,
    },

    /// Project management
    #[command(subcommand)]
    Project(ProjectCommands),

    /// Import a package into dist-git
    Import {
        /// Project id or name
        project: String,

        package: String,

        /// Record revisions without activating them
        #[arg(long)]
        inactive: bool,
    },

    /// Build a package
    Build(BuildArgs),

    /// Build every stream of a module
    BuildModule(BuildArgs),

    /// Compose builds into the project's repositories
    UpdateRepo {
        project: String,

        build_ids: Vec<String>,

        /// Only update this repository
        #[arg(long)]
        repo: Option<String>,

        /// Remove the builds' packages instead of adding them
        #[arg(long)]
        delete: bool,

        #[arg(long)]
        force_non_modular: bool,

        /// Skip artifact signing
        #[arg(long)]
        no_sign: bool,

        /// Keep previous versions of updated packages
        #[arg(long)]
        no_delete_previous: bool,
    },

    /// Apply catalog files from a git repository
    SyncCatalog {
        project: String,

        /// Catalog repository URL
        scm_url: String,

        #[arg(short, long, default_value = "main")]
        branch: String,
    },

    /// Import pre-built RPMs (single RPMs or tarballs) into one build each
    RpmImport {
        project: String,

        /// Local RPM or `.tar` of RPMs
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Replace builds of an already imported NVRA
        #[arg(long)]
        force: bool,
    },

    /// Store a source file in the lookaside
    LookasideUpload {
        file: PathBuf,

        #[arg(long)]
        project: Option<String>,
    },

    /// Replace a project's repositories with another project's
    CloneSwap {
        /// Project receiving the repositories
        target: String,

        /// Project the repositories are copied from
        source: String,
    },

    /// Publish hashed variants of repositories
    HashedRepos {
        project: String,

        #[arg(required = true)]
        repositories: Vec<String>,
    },

    /// Attach errata to every repository of a project
    UpdateInfo {
        project: String,

        /// Product name advisories are looked up under
        product: String,
    },

    /// Task inspection
    #[command(subcommand)]
    Task(TaskCommands),
}

#[derive(Args)]
pub struct BuildArgs {
    pub project: String,

    pub package: String,

    /// Build this dist-git commit instead of the latest
    #[arg(long)]
    pub scm_hash: Option<String>,

    /// Build a side NVR (name-version-release)
    #[arg(long = "side-nvr")]
    pub side_nvrs: Vec<String>,

    /// Disable %check
    #[arg(long)]
    pub disable_checks: bool,

    /// Keep the build out of the repositories
    #[arg(long)]
    pub inactive: bool,

    /// Only build these module stream branches
    #[arg(long = "branch")]
    pub branches: Vec<String>,
}

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// Create a project
    Create {
        name: String,

        /// Major version of the target distribution
        #[arg(long)]
        major_version: i64,

        /// Comma separated build arches
        #[arg(long, value_delimiter = ',', default_value = "x86_64")]
        archs: Vec<String>,

        /// dist-git host packages are pushed to
        #[arg(long, default_value = "git.rockylinux.org")]
        target_host: String,

        #[arg(long, default_value = "staging/rpms")]
        target_prefix: String,

        /// Upstream dist-git host
        #[arg(long)]
        source_host: Option<String>,

        #[arg(long)]
        source_prefix: Option<String>,

        /// Import branches as `<prefix><major>-stream-*`
        #[arg(long)]
        stream_mode: bool,

        /// Armored public key; becomes the project's default signing key
        #[arg(long, requires = "gpg_id")]
        public_key: Option<PathBuf>,

        /// Key id the signer signs with
        #[arg(long)]
        gpg_id: Option<String>,
    },

    /// Show a project
    Show { project: String },
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Show a task and its subtasks
    Show { id: String },

    /// Print task logs
    Logs {
        id: String,

        /// Only lines after this log id
        #[arg(long, default_value_t = 0)]
        offset: i64,

        /// Include logs of every subtask
        #[arg(long)]
        tree: bool,
    },
}
