// src/db/schema.rs

//! Database schema definitions and migrations for the task store
//!
//! This module defines the SQLite schema for projects, packages, imports,
//! builds, tasks, repositories and orchestration state, and provides a
//! migration system to evolve the schema over time.

use crate::error::{Error, Result};
use rusqlite::Connection;
use tracing::{debug, info};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the schema version tracking table
fn init_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;
    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    init_schema_version(conn)?;

    let version = conn
        .query_row(
            "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok(version)
}

/// Set the schema version
fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        [version],
    )?;
    Ok(())
}

/// Apply all pending migrations to bring the database up to date
pub fn migrate(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    info!("Current schema version: {}", current_version);

    if current_version >= SCHEMA_VERSION {
        info!("Schema is up to date");
        return Ok(());
    }

    for version in (current_version + 1)..=SCHEMA_VERSION {
        info!("Applying migration to version {}", version);
        apply_migration(conn, version)?;
        set_schema_version(conn, version)?;
    }

    info!(
        "Schema migration complete. Now at version {}",
        SCHEMA_VERSION
    );
    Ok(())
}

/// Apply a specific migration version
fn apply_migration(conn: &Connection, version: i32) -> Result<()> {
    match version {
        1 => migrate_v1(conn),
        _ => Err(Error::InternalError(format!(
            "Unknown migration version: {}",
            version
        ))),
    }
}

/// Initial schema - Version 1
///
/// Creates all tables for the builder:
/// - projects, keys, module configuration, external repos
/// - packages and versions with per-project activation flags
/// - imports / import revisions, builds, batches
/// - tasks, artifacts, signatures, logs, NVRA locks
/// - repositories and append-only revisions
/// - orchestration history and leases
fn migrate_v1(conn: &Connection) -> Result<()> {
    debug!("Creating schema version 1");

    conn.execute_batch(
        "
        -- Projects: target distribution definitions
        CREATE TABLE projects (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            major_version INTEGER NOT NULL,
            archs TEXT NOT NULL DEFAULT '[]',
            dist_tag_override TEXT,
            target_gitlab_host TEXT NOT NULL,
            target_prefix TEXT NOT NULL,
            target_branch_prefix TEXT NOT NULL,
            source_git_host TEXT,
            source_prefix TEXT,
            source_branch_prefix TEXT,
            branch_suffix TEXT,
            cdn_url TEXT,
            stream_mode INTEGER NOT NULL DEFAULT 0,
            target_vendor TEXT NOT NULL DEFAULT 'redhat',
            additional_vendor TEXT NOT NULL DEFAULT '',
            follow_import_dist INTEGER NOT NULL DEFAULT 0,
            git_make_public INTEGER NOT NULL DEFAULT 0,
            vendor_macro TEXT,
            packager_macro TEXT,
            srpm_stage_packages TEXT NOT NULL DEFAULT '[]',
            build_stage_packages TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT
        );

        -- Module platform and defaults per project (at most one)
        CREATE TABLE project_module_configurations (
            project_id TEXT PRIMARY KEY,
            platform_major INTEGER NOT NULL,
            platform_minor INTEGER NOT NULL,
            platform_patch INTEGER NOT NULL,
            defaults TEXT NOT NULL DEFAULT '[]',
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        );

        -- Signing keys; a project may mark one as default
        CREATE TABLE keys (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            email TEXT NOT NULL,
            gpg_id TEXT NOT NULL,
            public_key TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE project_keys (
            project_id TEXT NOT NULL,
            key_id TEXT NOT NULL,
            default_key INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (project_id, key_id),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
            FOREIGN KEY (key_id) REFERENCES keys(id) ON DELETE CASCADE
        );

        -- Repositories outside the builder fed into mock configs
        CREATE TABLE external_repositories (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            url TEXT NOT NULL,
            priority INTEGER,
            module_hotfixes INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        );

        -- Packages: named units, shared between projects
        CREATE TABLE packages (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            package_type TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE project_packages (
            project_id TEXT NOT NULL,
            package_id TEXT NOT NULL,
            package_type_override TEXT,
            PRIMARY KEY (project_id, package_id),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE TABLE package_versions (
            id TEXT PRIMARY KEY,
            package_id TEXT NOT NULL,
            version TEXT NOT NULL,
            release TEXT NOT NULL,
            created_at TEXT NOT NULL,
            UNIQUE(package_id, version, release),
            FOREIGN KEY (package_id) REFERENCES packages(id) ON DELETE CASCADE
        );

        CREATE TABLE project_package_versions (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            package_id TEXT NOT NULL,
            package_version_id TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 0,
            active_in_repo INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE(project_id, package_version_id),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
            FOREIGN KEY (package_version_id) REFERENCES package_versions(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_ppv_project_package ON project_package_versions(project_id, package_id);

        -- rpmbuild flags and buildroot overrides per package
        CREATE TABLE extra_package_options (
            project_id TEXT NOT NULL,
            package_name TEXT NOT NULL,
            with_flags TEXT NOT NULL DEFAULT '[]',
            without_flags TEXT NOT NULL DEFAULT '[]',
            depends_on TEXT NOT NULL DEFAULT '[]',
            enable_module TEXT NOT NULL DEFAULT '[]',
            disable_module TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (project_id, package_name),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        );

        -- Tasks: the universal unit of durable work
        CREATE TABLE tasks (
            id TEXT PRIMARY KEY,
            created_at TEXT NOT NULL,
            finished_at TEXT,
            arch TEXT NOT NULL,
            type TEXT NOT NULL,
            status TEXT NOT NULL CHECK(status IN ('pending', 'running', 'succeeded', 'failed', 'canceled')),
            response TEXT,
            metadata TEXT,
            error_details TEXT,
            project_id TEXT,
            parent_task_id TEXT,
            submitter TEXT,
            FOREIGN KEY (parent_task_id) REFERENCES tasks(id)
        );

        CREATE INDEX idx_tasks_parent ON tasks(parent_task_id);
        CREATE INDEX idx_tasks_project ON tasks(project_id);

        CREATE TABLE task_artifacts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            name TEXT NOT NULL,
            hash_sha256 TEXT NOT NULL,
            arch TEXT NOT NULL,
            metadata TEXT,
            created_at TEXT NOT NULL,
            UNIQUE(task_id, name),
            FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_task_artifacts_name ON task_artifacts(name);

        CREATE TABLE task_artifact_signatures (
            task_artifact_id INTEGER NOT NULL,
            gpg_key_id TEXT NOT NULL,
            hash_sha256 TEXT NOT NULL,
            PRIMARY KEY (task_artifact_id, gpg_key_id),
            FOREIGN KEY (task_artifact_id) REFERENCES task_artifacts(id) ON DELETE CASCADE
        );

        -- Log lines grouped by task and top-level task
        CREATE TABLE task_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            task_id TEXT NOT NULL,
            parent_task_id TEXT NOT NULL,
            line TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX idx_task_logs_task ON task_logs(task_id);
        CREATE INDEX idx_task_logs_parent ON task_logs(parent_task_id);

        -- Imports
        CREATE TABLE imports (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            package_id TEXT NOT NULL,
            task_id TEXT NOT NULL,
            scm_url TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
            FOREIGN KEY (package_id) REFERENCES packages(id),
            FOREIGN KEY (task_id) REFERENCES tasks(id)
        );

        CREATE TABLE import_revisions (
            id TEXT PRIMARY KEY,
            import_id TEXT NOT NULL,
            scm_hash TEXT NOT NULL,
            scm_branch_name TEXT NOT NULL,
            scm_url TEXT NOT NULL,
            package_version_id TEXT NOT NULL,
            modular INTEGER NOT NULL DEFAULT 0,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            FOREIGN KEY (import_id) REFERENCES imports(id) ON DELETE CASCADE,
            FOREIGN KEY (package_version_id) REFERENCES package_versions(id)
        );

        CREATE INDEX idx_import_revisions_hash ON import_revisions(scm_hash);
        CREATE INDEX idx_import_revisions_pv ON import_revisions(package_version_id);

        -- Builds
        CREATE TABLE builds (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            package_id TEXT NOT NULL,
            package_version_id TEXT NOT NULL,
            task_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
            FOREIGN KEY (package_id) REFERENCES packages(id),
            FOREIGN KEY (package_version_id) REFERENCES package_versions(id),
            FOREIGN KEY (task_id) REFERENCES tasks(id)
        );

        CREATE INDEX idx_builds_task ON builds(task_id);
        CREATE INDEX idx_builds_package ON builds(package_id);

        CREATE TABLE build_tasks (
            build_id TEXT NOT NULL,
            task_id TEXT NOT NULL,
            PRIMARY KEY (build_id, task_id),
            FOREIGN KEY (build_id) REFERENCES builds(id) ON DELETE CASCADE
        );

        -- Batches of builds or imports
        CREATE TABLE batches (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            kind TEXT NOT NULL CHECK(kind IN ('build', 'import')),
            created_at TEXT NOT NULL,
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        );

        CREATE TABLE batch_items (
            batch_id TEXT NOT NULL,
            item_id TEXT NOT NULL,
            PRIMARY KEY (batch_id, item_id),
            FOREIGN KEY (batch_id) REFERENCES batches(id) ON DELETE CASCADE
        );

        -- NVRA locks: insertion locks, deletion releases
        CREATE TABLE nvrs (
            name TEXT PRIMARY KEY,
            created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        );

        -- Repositories
        CREATE TABLE repositories (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            name TEXT NOT NULL,
            internal_only INTEGER NOT NULL DEFAULT 0,
            packages TEXT NOT NULL DEFAULT '[]',
            exclude_filter TEXT NOT NULL DEFAULT '[]',
            include_filter TEXT NOT NULL DEFAULT '[]',
            additional_multilib TEXT NOT NULL DEFAULT '[]',
            exclude_multilib_filter TEXT NOT NULL DEFAULT '[]',
            multilib TEXT NOT NULL DEFAULT '[]',
            glob_include_filter TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            UNIQUE(project_id, name),
            FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE
        );

        -- Repository revisions: append-only, latest row per (repo, arch) is active
        CREATE TABLE repository_revisions (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            repository_id TEXT NOT NULL,
            arch TEXT NOT NULL,
            repomd_xml TEXT NOT NULL,
            primary_xml TEXT NOT NULL,
            filelists_xml TEXT NOT NULL,
            other_xml TEXT NOT NULL,
            updateinfo_xml TEXT NOT NULL DEFAULT '',
            module_defaults_yaml TEXT NOT NULL DEFAULT '',
            modules_yaml TEXT NOT NULL DEFAULT '',
            groups_xml TEXT NOT NULL DEFAULT '',
            url_mappings TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL,
            FOREIGN KEY (repository_id) REFERENCES repositories(id) ON DELETE CASCADE
        );

        CREATE INDEX idx_revisions_repo_arch ON repository_revisions(repository_id, arch);

        -- Orchestration: recorded side effects and activity results
        CREATE TABLE workflow_history (
            workflow_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL,
            recorded_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            PRIMARY KEY (workflow_id, seq)
        );

        -- Leases: exclusive named locks with expiry
        CREATE TABLE leases (
            name TEXT PRIMARY KEY,
            holder TEXT NOT NULL,
            expires_at INTEGER NOT NULL
        );
        ",
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

        let tables: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type = 'table' AND name IN
                 ('tasks', 'builds', 'repository_revisions', 'workflow_history', 'leases')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 5);
    }
}
