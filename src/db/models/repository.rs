// src/db/models/repository.rs

//! Repository and RepositoryRevision models
//!
//! A repository is a named, filtered view over the builds of a project.
//! Revisions are append-only; the newest row for a (repository, arch)
//! pair is the one served and the one the composer folds new builds into.

use super::{list_from_sql, list_to_sql};
use crate::db::{new_id, now};
use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Name of the repository every project carries
pub const ALL_REPOSITORY: &str = "all";

const REPOSITORY_COLUMNS: &str = "id, project_id, name, internal_only, packages, exclude_filter,
     include_filter, additional_multilib, exclude_multilib_filter, multilib, glob_include_filter,
     created_at";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub internal_only: bool,
    /// Packages published here; empty means every package
    pub packages: Vec<String>,
    pub exclude_filter: Vec<String>,
    pub include_filter: Vec<String>,
    pub additional_multilib: Vec<String>,
    pub exclude_multilib_filter: Vec<String>,
    /// Arches that receive multilib packages
    pub multilib: Vec<String>,
    /// Globs, optionally prefixed with `[arch]`
    pub glob_include_filter: Vec<String>,
    pub created_at: String,
}

impl Repository {
    pub fn new(project_id: &str, name: &str) -> Self {
        Self {
            id: new_id(),
            project_id: project_id.to_string(),
            name: name.to_string(),
            created_at: now(),
            ..Default::default()
        }
    }

    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO repositories ({REPOSITORY_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                &self.id,
                &self.project_id,
                &self.name,
                self.internal_only,
                list_to_sql(&self.packages),
                list_to_sql(&self.exclude_filter),
                list_to_sql(&self.include_filter),
                list_to_sql(&self.additional_multilib),
                list_to_sql(&self.exclude_multilib_filter),
                list_to_sql(&self.multilib),
                list_to_sql(&self.glob_include_filter),
                &self.created_at,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(f, _) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
                Error::AlreadyExists(format!("repository {}", self.name))
            }
            other => other.into(),
        })?;
        Ok(())
    }

    pub fn create_with_packages(
        conn: &Connection,
        project_id: &str,
        name: &str,
        internal_only: bool,
        packages: Vec<String>,
    ) -> Result<Self> {
        let mut repo = Self::new(project_id, name);
        repo.internal_only = internal_only;
        repo.packages = packages;
        repo.insert(conn)?;
        Ok(repo)
    }

    /// Create the `all` repository for a project if missing
    pub fn ensure_all(conn: &Connection, project_id: &str) -> Result<Self> {
        if let Some(repo) = Self::find_by_name(conn, project_id, ALL_REPOSITORY)? {
            return Ok(repo);
        }
        Self::create_with_packages(conn, project_id, ALL_REPOSITORY, false, Vec::new())
    }

    /// Persist the package list and every filter list
    pub fn set_options(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "UPDATE repositories SET packages = ?2, exclude_filter = ?3, include_filter = ?4,
             additional_multilib = ?5, exclude_multilib_filter = ?6, multilib = ?7,
             glob_include_filter = ?8
             WHERE id = ?1",
            params![
                &self.id,
                list_to_sql(&self.packages),
                list_to_sql(&self.exclude_filter),
                list_to_sql(&self.include_filter),
                list_to_sql(&self.additional_multilib),
                list_to_sql(&self.exclude_multilib_filter),
                list_to_sql(&self.multilib),
                list_to_sql(&self.glob_include_filter),
            ],
        )?;
        Ok(())
    }

    pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!("SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE id = ?1"))?;
        let repo = stmt.query_row([id], Self::from_row).optional()?;
        Ok(repo)
    }

    pub fn find_by_name(conn: &Connection, project_id: &str, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE project_id = ?1 AND name = ?2"
        ))?;
        let repo = stmt.query_row(params![project_id, name], Self::from_row).optional()?;
        Ok(repo)
    }

    /// Look up by id, falling back to name within the project
    pub fn find(conn: &Connection, id_or_name: &str, project_id: Option<&str>) -> Result<Self> {
        if let Some(repo) = Self::find_by_id(conn, id_or_name)? {
            if project_id.is_none_or(|p| p == repo.project_id) {
                return Ok(repo);
            }
        }
        if let Some(project_id) = project_id {
            if let Some(repo) = Self::find_by_name(conn, project_id, id_or_name)? {
                return Ok(repo);
            }
        }
        Err(Error::NotFound(format!("repository {}", id_or_name)))
    }

    /// Whether the package list admits a package
    pub fn publishes(&self, package_name: &str) -> bool {
        self.packages.is_empty() || self.packages.iter().any(|p| p == package_name)
    }

    /// Repositories of a project that publish `package_name`, newest first
    pub fn find_for_package(
        conn: &Connection,
        project_id: &str,
        package_name: &str,
        internal_only: bool,
    ) -> Result<Vec<Self>> {
        Ok(Self::find_for_project(conn, project_id, None, internal_only)?
            .into_iter()
            .filter(|r| r.publishes(package_name))
            .collect())
    }

    pub fn find_for_project(
        conn: &Connection,
        project_id: &str,
        id: Option<&str>,
        internal_only: bool,
    ) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories
             WHERE project_id = ?1 AND (?2 IS NULL OR id = ?2) AND internal_only = ?3
             ORDER BY created_at DESC"
        ))?;
        let repos = stmt
            .query_map(params![project_id, id, internal_only], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(repos)
    }

    /// Every repository of a project regardless of visibility
    pub fn list_all(conn: &Connection, project_id: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {REPOSITORY_COLUMNS} FROM repositories WHERE project_id = ?1 ORDER BY name"
        ))?;
        let repos = stmt
            .query_map([project_id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(repos)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            project_id: row.get(1)?,
            name: row.get(2)?,
            internal_only: row.get(3)?,
            packages: list_from_sql(&row.get::<_, String>(4)?),
            exclude_filter: list_from_sql(&row.get::<_, String>(5)?),
            include_filter: list_from_sql(&row.get::<_, String>(6)?),
            additional_multilib: list_from_sql(&row.get::<_, String>(7)?),
            exclude_multilib_filter: list_from_sql(&row.get::<_, String>(8)?),
            multilib: list_from_sql(&row.get::<_, String>(9)?),
            glob_include_filter: list_from_sql(&row.get::<_, String>(10)?),
            created_at: row.get(11)?,
        })
    }
}

const REVISION_COLUMNS: &str = "r.id, r.repository_id, r.arch, r.repomd_xml, r.primary_xml,
     r.filelists_xml, r.other_xml, r.updateinfo_xml, r.module_defaults_yaml, r.modules_yaml,
     r.groups_xml, r.url_mappings, r.created_at";

/// One immutable publication of a repository for one arch
///
/// Payloads are base64 text as stored: repomd and module defaults hold the
/// raw document, the others hold gzip output. Empty string means absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryRevision {
    pub id: String,
    pub repository_id: String,
    pub arch: String,
    pub repomd_xml: String,
    pub primary_xml: String,
    pub filelists_xml: String,
    pub other_xml: String,
    pub updateinfo_xml: String,
    pub module_defaults_yaml: String,
    pub modules_yaml: String,
    pub groups_xml: String,
    /// JSON object of rewritten href to blob key
    pub url_mappings: String,
    pub created_at: String,
}

impl RepositoryRevision {
    pub fn new(id: &str, repository_id: &str, arch: &str) -> Self {
        Self {
            id: id.to_string(),
            repository_id: repository_id.to_string(),
            arch: arch.to_string(),
            url_mappings: "{}".to_string(),
            ..Default::default()
        }
    }

    /// Append the revision; it becomes the latest for its (repository, arch)
    pub fn create(&mut self, conn: &Connection) -> Result<()> {
        self.created_at = now();
        conn.execute(
            "INSERT INTO repository_revisions (id, repository_id, arch, repomd_xml, primary_xml,
             filelists_xml, other_xml, updateinfo_xml, module_defaults_yaml, modules_yaml,
             groups_xml, url_mappings, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                &self.id,
                &self.repository_id,
                &self.arch,
                &self.repomd_xml,
                &self.primary_xml,
                &self.filelists_xml,
                &self.other_xml,
                &self.updateinfo_xml,
                &self.module_defaults_yaml,
                &self.modules_yaml,
                &self.groups_xml,
                &self.url_mappings,
                &self.created_at,
            ],
        )?;
        Ok(())
    }

    pub fn latest(conn: &Connection, repository_id: &str, arch: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {REVISION_COLUMNS} FROM repository_revisions r
             WHERE r.repository_id = ?1 AND r.arch = ?2
             ORDER BY r.seq DESC LIMIT 1"
        ))?;
        let revision = stmt.query_row(params![repository_id, arch], Self::from_row).optional()?;
        Ok(revision)
    }

    pub fn latest_by_project_name_arch(
        conn: &Connection,
        project_id: &str,
        repository_name: &str,
        arch: &str,
    ) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {REVISION_COLUMNS} FROM repository_revisions r
             INNER JOIN repositories repo ON repo.id = r.repository_id
             WHERE repo.project_id = ?1 AND repo.name = ?2 AND r.arch = ?3
             ORDER BY r.seq DESC LIMIT 1"
        ))?;
        let revision = stmt
            .query_row(params![project_id, repository_name, arch], Self::from_row)
            .optional()?;
        Ok(revision)
    }

    pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!("SELECT {REVISION_COLUMNS} FROM repository_revisions r WHERE r.id = ?1"))?;
        let revision = stmt.query_row([id], Self::from_row).optional()?;
        Ok(revision)
    }

    /// Arches with at least one revision for the repository
    pub fn arches(conn: &Connection, repository_id: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT arch FROM repository_revisions WHERE repository_id = ?1 ORDER BY arch",
        )?;
        let arches = stmt
            .query_map([repository_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(arches)
    }

    pub fn url_mapping(&self) -> BTreeMap<String, String> {
        serde_json::from_str(&self.url_mappings).unwrap_or_default()
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            repository_id: row.get(1)?,
            arch: row.get(2)?,
            repomd_xml: row.get(3)?,
            primary_xml: row.get(4)?,
            filelists_xml: row.get(5)?,
            other_xml: row.get(6)?,
            updateinfo_xml: row.get(7)?,
            module_defaults_yaml: row.get(8)?,
            modules_yaml: row.get(9)?,
            groups_xml: row.get(10)?,
            url_mappings: row.get(11)?,
            created_at: row.get(12)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Project;
    use crate::db::open_in_memory;

    fn project(conn: &Connection) -> Project {
        let project = Project::new("p", 9, vec!["x86_64".to_string()]);
        project.insert(conn).unwrap();
        project
    }

    #[test]
    fn test_find_for_package_honours_package_list() {
        let conn = open_in_memory().unwrap();
        let project = project(&conn);
        Repository::ensure_all(&conn, &project.id).unwrap();
        Repository::create_with_packages(&conn, &project.id, "BaseOS", false, vec!["bash".into()]).unwrap();
        Repository::create_with_packages(&conn, &project.id, "internal", true, vec![]).unwrap();

        let bash: Vec<_> = Repository::find_for_package(&conn, &project.id, "bash", false)
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert_eq!(bash.len(), 2);
        assert!(bash.contains(&"all".to_string()) && bash.contains(&"BaseOS".to_string()));

        let zsh = Repository::find_for_package(&conn, &project.id, "zsh", false).unwrap();
        assert_eq!(zsh.len(), 1);
        assert_eq!(zsh[0].name, ALL_REPOSITORY);

        let internal = Repository::find_for_package(&conn, &project.id, "zsh", true).unwrap();
        assert_eq!(internal[0].name, "internal");
    }

    #[test]
    fn test_duplicate_repository_name() {
        let conn = open_in_memory().unwrap();
        let project = project(&conn);
        Repository::create_with_packages(&conn, &project.id, "AppStream", false, vec![]).unwrap();
        let err = Repository::create_with_packages(&conn, &project.id, "AppStream", false, vec![]).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_latest_revision_is_last_appended() {
        let conn = open_in_memory().unwrap();
        let project = project(&conn);
        let repo = Repository::ensure_all(&conn, &project.id).unwrap();

        let mut first = RepositoryRevision::new("rev-1", &repo.id, "x86_64");
        first.primary_xml = "one".into();
        first.create(&conn).unwrap();
        let mut second = RepositoryRevision::new("rev-2", &repo.id, "x86_64");
        second.primary_xml = "two".into();
        second.create(&conn).unwrap();
        let mut other_arch = RepositoryRevision::new("rev-3", &repo.id, "aarch64");
        other_arch.create(&conn).unwrap();

        let latest = RepositoryRevision::latest(&conn, &repo.id, "x86_64").unwrap().unwrap();
        assert_eq!(latest.id, "rev-2");
        let by_name = RepositoryRevision::latest_by_project_name_arch(&conn, &project.id, "all", "aarch64")
            .unwrap()
            .unwrap();
        assert_eq!(by_name.id, "rev-3");
        assert_eq!(RepositoryRevision::arches(&conn, &repo.id).unwrap(), vec!["aarch64", "x86_64"]);
        assert!(latest.url_mapping().is_empty());
    }
}
