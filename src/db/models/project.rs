// src/db/models/project.rs

//! Project model and per-project configuration: module platform and
//! defaults, signing keys, external repositories

use super::{list_from_sql, list_to_sql};
use crate::db::{new_id, now};
use crate::error::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

const PROJECT_COLUMNS: &str = "id, name, major_version, archs, dist_tag_override, target_gitlab_host,
     target_prefix, target_branch_prefix, source_git_host, source_prefix, source_branch_prefix,
     branch_suffix, cdn_url, stream_mode, target_vendor, additional_vendor, follow_import_dist,
     git_make_public, vendor_macro, packager_macro, srpm_stage_packages, build_stage_packages,
     created_at, updated_at";

/// A target distribution definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub major_version: i64,
    pub archs: Vec<String>,
    pub dist_tag_override: Option<String>,
    pub target_gitlab_host: String,
    pub target_prefix: String,
    pub target_branch_prefix: String,
    pub source_git_host: Option<String>,
    pub source_prefix: Option<String>,
    pub source_branch_prefix: Option<String>,
    pub branch_suffix: Option<String>,
    pub cdn_url: Option<String>,
    pub stream_mode: bool,
    /// `redhat` or `suse`
    pub target_vendor: String,
    pub additional_vendor: String,
    pub follow_import_dist: bool,
    pub git_make_public: bool,
    pub vendor_macro: Option<String>,
    pub packager_macro: Option<String>,
    pub srpm_stage_packages: Vec<String>,
    pub build_stage_packages: Vec<String>,
    pub created_at: String,
    pub updated_at: Option<String>,
}

impl Project {
    pub fn new(name: &str, major_version: i64, archs: Vec<String>) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            major_version,
            archs,
            target_vendor: "redhat".to_string(),
            target_branch_prefix: "r".to_string(),
            created_at: now(),
            ..Default::default()
        }
    }

    /// `el<major>` unless overridden
    pub fn dist_tag(&self) -> String {
        self.dist_tag_override
            .clone()
            .unwrap_or_else(|| format!("el{}", self.major_version))
    }

    /// Dist-git branch builds are taken from: `<prefix><major><suffix>`
    pub fn target_branch(&self) -> String {
        format!(
            "{}{}{}",
            self.target_branch_prefix,
            self.major_version,
            self.branch_suffix.as_deref().unwrap_or_default()
        )
    }

    /// Upstream location of dist-git repositories
    pub fn upstream_prefix(&self) -> String {
        format!(
            "{}/{}",
            self.target_gitlab_host.trim_end_matches('/'),
            self.target_prefix.trim_matches('/')
        )
    }

    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            &format!(
                "INSERT INTO projects ({PROJECT_COLUMNS}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
                  ?19, ?20, ?21, ?22, ?23, ?24)"
            ),
            params![
                &self.id,
                &self.name,
                self.major_version,
                list_to_sql(&self.archs),
                &self.dist_tag_override,
                &self.target_gitlab_host,
                &self.target_prefix,
                &self.target_branch_prefix,
                &self.source_git_host,
                &self.source_prefix,
                &self.source_branch_prefix,
                &self.branch_suffix,
                &self.cdn_url,
                self.stream_mode,
                &self.target_vendor,
                &self.additional_vendor,
                self.follow_import_dist,
                self.git_make_public,
                &self.vendor_macro,
                &self.packager_macro,
                list_to_sql(&self.srpm_stage_packages),
                list_to_sql(&self.build_stage_packages),
                &self.created_at,
                &self.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Self>> {
        let mut stmt =
            conn.prepare(&format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE id = ?1"))?;
        let project = stmt.query_row([id], Self::from_row).optional()?;
        Ok(project)
    }

    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt =
            conn.prepare(&format!("SELECT {PROJECT_COLUMNS} FROM projects WHERE name = ?1"))?;
        let project = stmt.query_row([name], Self::from_row).optional()?;
        Ok(project)
    }

    /// Find by id, falling back to name
    pub fn resolve(conn: &Connection, id_or_name: &str) -> Result<Self> {
        if let Some(p) = Self::find_by_id(conn, id_or_name)? {
            return Ok(p);
        }
        Self::find_by_name(conn, id_or_name)?
            .ok_or_else(|| Error::NotFound(format!("project {}", id_or_name)))
    }

    pub fn list_all(conn: &Connection) -> Result<Vec<Self>> {
        let mut stmt =
            conn.prepare(&format!("SELECT {PROJECT_COLUMNS} FROM projects ORDER BY name ASC"))?;
        let projects = stmt
            .query_map([], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(projects)
    }

    /// Replace the srpm and build stage package lists
    pub fn set_build_root_packages(
        conn: &Connection,
        id: &str,
        srpm_packages: &[String],
        build_packages: &[String],
    ) -> Result<()> {
        conn.execute(
            "UPDATE projects SET srpm_stage_packages = ?1, build_stage_packages = ?2, updated_at = ?3
             WHERE id = ?4",
            params![list_to_sql(srpm_packages), list_to_sql(build_packages), now(), id],
        )?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let archs: String = row.get(3)?;
        let srpm: String = row.get(20)?;
        let build: String = row.get(21)?;
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            major_version: row.get(2)?,
            archs: list_from_sql(&archs),
            dist_tag_override: row.get(4)?,
            target_gitlab_host: row.get(5)?,
            target_prefix: row.get(6)?,
            target_branch_prefix: row.get(7)?,
            source_git_host: row.get(8)?,
            source_prefix: row.get(9)?,
            source_branch_prefix: row.get(10)?,
            branch_suffix: row.get(11)?,
            cdn_url: row.get(12)?,
            stream_mode: row.get(13)?,
            target_vendor: row.get(14)?,
            additional_vendor: row.get(15)?,
            follow_import_dist: row.get(16)?,
            git_make_public: row.get(17)?,
            vendor_macro: row.get(18)?,
            packager_macro: row.get(19)?,
            srpm_stage_packages: list_from_sql(&srpm),
            build_stage_packages: list_from_sql(&build),
            created_at: row.get(22)?,
            updated_at: row.get(23)?,
        })
    }
}

/// Module platform triple
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModulePlatform {
    pub major: i64,
    pub minor: i64,
    pub patch: i64,
}

impl ModulePlatform {
    /// `el<M>.<m>.<p>`
    pub fn dist(&self) -> String {
        format!("el{}.{}.{}", self.major, self.minor, self.patch)
    }

    /// `<M>0<m>0<p>` version prefix
    pub fn version_prefix(&self) -> String {
        format!("{}0{}0{}", self.major, self.minor, self.patch)
    }
}

/// Profiles installed by default for one stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleStreamProfile {
    pub stream: String,
    #[serde(default)]
    pub name: Vec<String>,
}

/// Default stream and profiles of a module
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleDefault {
    pub name: String,
    pub stream: String,
    #[serde(default)]
    pub profile: Vec<ModuleStreamProfile>,
    #[serde(default)]
    pub common_profile: Vec<String>,
}

/// Module platform and defaults for a project
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleConfiguration {
    pub platform: ModulePlatform,
    #[serde(default)]
    pub default: Vec<ModuleDefault>,
}

impl ModuleConfiguration {
    pub fn find(conn: &Connection, project_id: &str) -> Result<Option<Self>> {
        let config = conn
            .query_row(
                "SELECT platform_major, platform_minor, platform_patch, defaults
                 FROM project_module_configurations WHERE project_id = ?1",
                [project_id],
                |row| {
                    let defaults: String = row.get(3)?;
                    Ok(Self {
                        platform: ModulePlatform {
                            major: row.get(0)?,
                            minor: row.get(1)?,
                            patch: row.get(2)?,
                        },
                        default: serde_json::from_str(&defaults).unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(config)
    }

    /// Create or replace the configuration for a project
    pub fn save(&self, conn: &Connection, project_id: &str) -> Result<()> {
        let defaults = serde_json::to_string(&self.default)?;
        conn.execute(
            "INSERT INTO project_module_configurations
             (project_id, platform_major, platform_minor, platform_patch, defaults)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (project_id) DO UPDATE SET platform_major = ?2, platform_minor = ?3,
             platform_patch = ?4, defaults = ?5",
            params![
                project_id,
                self.platform.major,
                self.platform.minor,
                self.platform.patch,
                defaults
            ],
        )?;
        Ok(())
    }
}

/// A signing key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Key {
    pub id: String,
    pub name: String,
    pub email: String,
    pub gpg_id: String,
    pub public_key: String,
    pub created_at: String,
}

impl Key {
    pub fn new(name: &str, email: &str, gpg_id: &str, public_key: &str) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            email: email.to_string(),
            gpg_id: gpg_id.to_string(),
            public_key: public_key.to_string(),
            created_at: now(),
        }
    }

    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO keys (id, name, email, gpg_id, public_key, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &self.id,
                &self.name,
                &self.email,
                &self.gpg_id,
                &self.public_key,
                &self.created_at
            ],
        )?;
        Ok(())
    }

    pub fn attach_to_project(
        conn: &Connection,
        project_id: &str,
        key_id: &str,
        default_key: bool,
    ) -> Result<()> {
        if default_key {
            conn.execute(
                "UPDATE project_keys SET default_key = 0 WHERE project_id = ?1",
                [project_id],
            )?;
        }
        conn.execute(
            "INSERT INTO project_keys (project_id, key_id, default_key) VALUES (?1, ?2, ?3)
             ON CONFLICT (project_id, key_id) DO UPDATE SET default_key = ?3",
            params![project_id, key_id, default_key],
        )?;
        Ok(())
    }

    pub fn default_for_project(conn: &Connection, project_id: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT k.id, k.name, k.email, k.gpg_id, k.public_key, k.created_at
             FROM keys k INNER JOIN project_keys pk ON pk.key_id = k.id
             WHERE pk.project_id = ?1 AND pk.default_key = 1",
        )?;
        let key = stmt.query_row([project_id], Self::from_row).optional()?;
        Ok(key)
    }

    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, email, gpg_id, public_key, created_at FROM keys WHERE name = ?1",
        )?;
        let key = stmt.query_row([name], Self::from_row).optional()?;
        Ok(key)
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            email: row.get(2)?,
            gpg_id: row.get(3)?,
            public_key: row.get(4)?,
            created_at: row.get(5)?,
        })
    }
}

/// A repository outside the builder made available to build roots
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalRepository {
    pub id: String,
    pub project_id: String,
    pub url: String,
    pub priority: Option<i64>,
    pub module_hotfixes: bool,
    pub created_at: String,
}

impl ExternalRepository {
    pub fn create(
        conn: &Connection,
        project_id: &str,
        url: &str,
        priority: Option<i64>,
        module_hotfixes: bool,
    ) -> Result<Self> {
        let repo = Self {
            id: new_id(),
            project_id: project_id.to_string(),
            url: url.to_string(),
            priority,
            module_hotfixes,
            created_at: now(),
        };
        conn.execute(
            "INSERT INTO external_repositories (id, project_id, url, priority, module_hotfixes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &repo.id,
                &repo.project_id,
                &repo.url,
                repo.priority,
                repo.module_hotfixes,
                &repo.created_at
            ],
        )?;
        Ok(repo)
    }

    pub fn list_for_project(conn: &Connection, project_id: &str) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, project_id, url, priority, module_hotfixes, created_at
             FROM external_repositories WHERE project_id = ?1 ORDER BY created_at DESC",
        )?;
        let repos = stmt
            .query_map([project_id], |row| {
                Ok(Self {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    url: row.get(2)?,
                    priority: row.get(3)?,
                    module_hotfixes: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(repos)
    }

    pub fn delete(conn: &Connection, project_id: &str, id: &str) -> Result<bool> {
        let rows = conn.execute(
            "DELETE FROM external_repositories WHERE project_id = ?1 AND id = ?2",
            params![project_id, id],
        )?;
        Ok(rows > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    #[test]
    fn test_project_roundtrip_and_branch() {
        let conn = open_in_memory().unwrap();
        let mut project = Project::new("Rocky Linux 9", 9, vec!["x86_64".into(), "aarch64".into()]);
        project.target_gitlab_host = "https://git.rockylinux.org".into();
        project.target_prefix = "/staging/".into();
        project.branch_suffix = Some("-beta".into());
        project.insert(&conn).unwrap();

        let stored = Project::resolve(&conn, "Rocky Linux 9").unwrap();
        assert_eq!(stored.archs, vec!["x86_64", "aarch64"]);
        assert_eq!(stored.target_branch(), "r9-beta");
        assert_eq!(stored.dist_tag(), "el9");
        assert_eq!(stored.upstream_prefix(), "https://git.rockylinux.org/staging");
    }

    #[test]
    fn test_default_key_switches() {
        let conn = open_in_memory().unwrap();
        let project = Project::new("p", 8, vec![]);
        project.insert(&conn).unwrap();
        let a = Key::new("a", "a@x", "AAAA", "pub-a");
        let b = Key::new("b", "b@x", "BBBB", "pub-b");
        a.insert(&conn).unwrap();
        b.insert(&conn).unwrap();

        Key::attach_to_project(&conn, &project.id, &a.id, true).unwrap();
        Key::attach_to_project(&conn, &project.id, &b.id, true).unwrap();
        let key = Key::default_for_project(&conn, &project.id).unwrap().unwrap();
        assert_eq!(key.gpg_id, "BBBB");
    }

    #[test]
    fn test_module_configuration_upsert() {
        let conn = open_in_memory().unwrap();
        let project = Project::new("p", 8, vec![]);
        project.insert(&conn).unwrap();

        let mut config = ModuleConfiguration {
            platform: ModulePlatform { major: 8, minor: 6, patch: 0 },
            default: vec![ModuleDefault {
                name: "nodejs".into(),
                stream: "18".into(),
                profile: vec![],
                common_profile: vec!["18".into()],
            }],
        };
        config.save(&conn, &project.id).unwrap();
        config.platform.minor = 7;
        config.save(&conn, &project.id).unwrap();

        let stored = ModuleConfiguration::find(&conn, &project.id).unwrap().unwrap();
        assert_eq!(stored.platform.dist(), "el8.7.0");
        assert_eq!(stored.platform.version_prefix(), "80700");
        assert_eq!(stored.default[0].name, "nodejs");
    }
}
