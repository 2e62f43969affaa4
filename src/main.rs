// src/main.rs

mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use commands::UpdateRepoArgs;
use peridot_builder::BuilderConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let config = BuilderConfig::load_or_default(cli.config.as_deref())?;
    let submitter = cli.submitter;

    match cli.command {
        Commands::Init => commands::cmd_init(&config),
        Commands::Serve { bind } => commands::cmd_serve(config, bind).await,
        Commands::Project(command) => commands::cmd_project(&config, command),
        Commands::Import {
            project,
            package,
            inactive,
        } => commands::cmd_import(config, project, package, inactive, submitter).await,
        Commands::Build(args) => commands::cmd_build(config, args, submitter).await,
        Commands::BuildModule(args) => commands::cmd_build_module(config, args, submitter).await,
        Commands::UpdateRepo {
            project,
            build_ids,
            repo,
            delete,
            force_non_modular,
            no_sign,
            no_delete_previous,
        } => {
            let args = UpdateRepoArgs {
                project,
                build_ids,
                repo,
                delete,
                force_non_modular,
                no_sign,
                no_delete_previous,
            };
            commands::cmd_update_repo(config, args).await
        }
        Commands::SyncCatalog {
            project,
            scm_url,
            branch,
        } => commands::cmd_sync_catalog(config, project, scm_url, branch, submitter).await,
        Commands::RpmImport { project, files, force } => {
            commands::cmd_rpm_import(config, project, files, force, submitter).await
        }
        Commands::LookasideUpload { file, project } => {
            commands::cmd_lookaside_upload(config, file, project, submitter).await
        }
        Commands::CloneSwap { target, source } => commands::cmd_clone_swap(config, target, source, submitter).await,
        Commands::HashedRepos { project, repositories } => {
            commands::cmd_hashed_repos(config, project, repositories, submitter).await
        }
        Commands::UpdateInfo { project, product } => {
            commands::cmd_update_info(config, project, product, submitter).await
        }
        Commands::Task(command) => commands::cmd_task(&config, command),
    }
}
