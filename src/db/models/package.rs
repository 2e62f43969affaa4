// src/db/models/package.rs

//! Package, PackageVersion and per-project version activation

use super::{enum_from_sql, enum_to_sql, list_from_sql, list_to_sql};
use crate::db::{new_id, now};
use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

/// How a package is sourced and whether it participates in modules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageType {
    Normal,
    NormalFork,
    ModuleFork,
    ModuleForkComponent,
    NormalForkModule,
    NormalForkModuleComponent,
    ModuleForkModuleComponent,
    NormalSrc,
}

impl PackageType {
    /// Package can be built as a module
    pub fn is_module(self) -> bool {
        matches!(
            self,
            PackageType::ModuleFork
                | PackageType::NormalForkModule
                | PackageType::ModuleForkModuleComponent
        )
    }

    /// Imported from an upstream dist-git through the source transform
    pub fn is_fork(self) -> bool {
        !matches!(self, PackageType::NormalSrc)
    }
}

/// A named package
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub id: String,
    pub name: String,
    pub package_type: PackageType,
    /// Effective per-project override when loaded through a project
    pub package_type_override: Option<PackageType>,
    pub created_at: String,
}

impl Package {
    pub fn new(name: &str, package_type: PackageType) -> Self {
        Self {
            id: new_id(),
            name: name.to_string(),
            package_type,
            package_type_override: None,
            created_at: now(),
        }
    }

    /// Type after applying the project override
    pub fn effective_type(&self) -> PackageType {
        self.package_type_override.unwrap_or(self.package_type)
    }

    pub fn insert(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO packages (id, name, package_type, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                &self.id,
                &self.name,
                enum_to_sql(&self.package_type)?,
                &self.created_at
            ],
        )?;
        Ok(())
    }

    pub fn find_by_name(conn: &Connection, name: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, package_type, NULL, created_at FROM packages WHERE name = ?1",
        )?;
        let pkg = stmt.query_row([name], Self::from_row).optional()?;
        Ok(pkg)
    }

    pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, name, package_type, NULL, created_at FROM packages WHERE id = ?1",
        )?;
        let pkg = stmt.query_row([id], Self::from_row).optional()?;
        Ok(pkg)
    }

    /// Add (or re-type) a package in a project
    pub fn add_to_project(
        conn: &Connection,
        project_id: &str,
        package_id: &str,
        package_type_override: Option<PackageType>,
    ) -> Result<()> {
        let override_str = package_type_override.map(|t| enum_to_sql(&t)).transpose()?;
        conn.execute(
            "INSERT INTO project_packages (project_id, package_id, package_type_override)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (project_id, package_id) DO UPDATE SET package_type_override = ?3",
            params![project_id, package_id, override_str],
        )?;
        Ok(())
    }

    /// Packages in a project, optionally narrowed by exact name or substring
    pub fn list_in_project(
        conn: &Connection,
        project_id: &str,
        name_exact: Option<&str>,
        name_contains: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT p.id, p.name, p.package_type, pp.package_type_override, p.created_at
             FROM packages p
             INNER JOIN project_packages pp ON pp.package_id = p.id
             WHERE pp.project_id = ?1
               AND (?2 IS NULL OR p.name = ?2)
               AND (?3 IS NULL OR instr(lower(p.name), lower(?3)) > 0)
             ORDER BY p.name ASC
             LIMIT ?4 OFFSET ?5",
        )?;
        let packages = stmt
            .query_map(
                params![project_id, name_exact, name_contains, limit, offset],
                Self::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(packages)
    }

    /// Package by name as seen by a project
    pub fn find_in_project(conn: &Connection, project_id: &str, name: &str) -> Result<Option<Self>> {
        Ok(Self::list_in_project(conn, project_id, Some(name), None, 1, 0)?
            .into_iter()
            .next())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let type_str: String = row.get(2)?;
        let override_str: Option<String> = row.get(3)?;
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            package_type: enum_from_sql(&type_str).unwrap_or(PackageType::NormalFork),
            package_type_override: override_str.and_then(|s| enum_from_sql(&s)),
            created_at: row.get(4)?,
        })
    }
}

/// (package, version, release)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageVersion {
    pub id: String,
    pub package_id: String,
    pub version: String,
    pub release: String,
    pub created_at: String,
}

impl PackageVersion {
    pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, package_id, version, release, created_at FROM package_versions WHERE id = ?1",
        )?;
        let pv = stmt.query_row([id], Self::from_row).optional()?;
        Ok(pv)
    }

    pub fn find_id(
        conn: &Connection,
        package_id: &str,
        version: &str,
        release: &str,
    ) -> Result<Option<String>> {
        let id = conn
            .query_row(
                "SELECT id FROM package_versions WHERE package_id = ?1 AND version = ?2 AND release = ?3",
                params![package_id, version, release],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }

    pub fn create(conn: &Connection, package_id: &str, version: &str, release: &str) -> Result<String> {
        let id = new_id();
        conn.execute(
            "INSERT INTO package_versions (id, package_id, version, release, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![&id, package_id, version, release, now()],
        )?;
        Ok(id)
    }

    /// Existing id for (package, version, release) or a new row
    pub fn ensure(conn: &Connection, package_id: &str, version: &str, release: &str) -> Result<String> {
        match Self::find_id(conn, package_id, version, release)? {
            Some(id) => Ok(id),
            None => Self::create(conn, package_id, version, release),
        }
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            package_id: row.get(1)?,
            version: row.get(2)?,
            release: row.get(3)?,
            created_at: row.get(4)?,
        })
    }
}

/// Project × package version with its activation flags
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectPackageVersion {
    pub id: String,
    pub project_id: String,
    pub package_id: String,
    pub package_version_id: String,
    pub active: bool,
    pub active_in_repo: bool,
}

impl ProjectPackageVersion {
    /// Attach a version to a project; re-attaching only updates `active`
    pub fn attach(
        conn: &Connection,
        project_id: &str,
        package_id: &str,
        package_version_id: &str,
        active: bool,
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO project_package_versions
             (id, project_id, package_id, package_version_id, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (project_id, package_version_id) DO UPDATE SET active = excluded.active",
            params![new_id(), project_id, package_id, package_version_id, active, now()],
        )?;
        Ok(())
    }

    pub fn find(
        conn: &Connection,
        project_id: &str,
        package_version_id: &str,
    ) -> Result<Option<Self>> {
        let row = conn
            .query_row(
                "SELECT id, project_id, package_id, package_version_id, active, active_in_repo
                 FROM project_package_versions WHERE project_id = ?1 AND package_version_id = ?2",
                params![project_id, package_version_id],
                |row| {
                    Ok(Self {
                        id: row.get(0)?,
                        project_id: row.get(1)?,
                        package_id: row.get(2)?,
                        package_version_id: row.get(3)?,
                        active: row.get(4)?,
                        active_in_repo: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Clear `active` on every version of a package in a project
    pub fn deactivate_by_package(conn: &Connection, project_id: &str, package_id: &str) -> Result<()> {
        conn.execute(
            "UPDATE project_package_versions SET active = 0 WHERE project_id = ?1 AND package_id = ?2",
            params![project_id, package_id],
        )?;
        Ok(())
    }

    /// Move `active_in_repo` for a package to exactly this version
    pub fn make_active_in_repo(
        conn: &Connection,
        package_version_id: &str,
        package_id: &str,
        project_id: &str,
    ) -> Result<()> {
        conn.execute(
            "UPDATE project_package_versions SET active_in_repo = 0 WHERE package_id = ?1 AND project_id = ?2",
            params![package_id, project_id],
        )?;
        conn.execute(
            "UPDATE project_package_versions SET active_in_repo = 1
             WHERE package_version_id = ?1 AND project_id = ?2",
            params![package_version_id, project_id],
        )?;
        Ok(())
    }
}

/// Per-package rpmbuild flags and build root overrides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraOptions {
    pub project_id: String,
    pub package_name: String,
    pub with_flags: Vec<String>,
    pub without_flags: Vec<String>,
    pub depends_on: Vec<String>,
    pub enable_module: Vec<String>,
    pub disable_module: Vec<String>,
}

impl ExtraOptions {
    pub fn find(conn: &Connection, project_id: &str, package_name: &str) -> Result<Option<Self>> {
        let options = conn
            .query_row(
                "SELECT project_id, package_name, with_flags, without_flags, depends_on,
                 enable_module, disable_module
                 FROM extra_package_options WHERE project_id = ?1 AND package_name = ?2",
                params![project_id, package_name],
                |row| {
                    let with: String = row.get(2)?;
                    let without: String = row.get(3)?;
                    let depends: String = row.get(4)?;
                    let enable: String = row.get(5)?;
                    let disable: String = row.get(6)?;
                    Ok(Self {
                        project_id: row.get(0)?,
                        package_name: row.get(1)?,
                        with_flags: list_from_sql(&with),
                        without_flags: list_from_sql(&without),
                        depends_on: list_from_sql(&depends),
                        enable_module: list_from_sql(&enable),
                        disable_module: list_from_sql(&disable),
                    })
                },
            )
            .optional()?;
        Ok(options)
    }

    pub fn set_flags(
        conn: &Connection,
        project_id: &str,
        package_name: &str,
        with_flags: &[String],
        without_flags: &[String],
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO extra_package_options (project_id, package_name, with_flags, without_flags)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (project_id, package_name) DO UPDATE SET with_flags = ?3, without_flags = ?4",
            params![
                project_id,
                package_name,
                list_to_sql(with_flags),
                list_to_sql(without_flags)
            ],
        )?;
        Ok(())
    }

    pub fn set_group_install_options(
        conn: &Connection,
        project_id: &str,
        package_name: &str,
        depends_on: &[String],
        enable_module: &[String],
        disable_module: &[String],
    ) -> Result<()> {
        conn.execute(
            "INSERT INTO extra_package_options (project_id, package_name, depends_on, enable_module, disable_module)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (project_id, package_name) DO UPDATE SET depends_on = ?3,
             enable_module = ?4, disable_module = ?5",
            params![
                project_id,
                package_name,
                list_to_sql(depends_on),
                list_to_sql(enable_module),
                list_to_sql(disable_module)
            ],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Project;
    use crate::db::open_in_memory;

    #[test]
    fn test_make_active_in_repo_is_exclusive() {
        let conn = open_in_memory().unwrap();
        let project = Project::new("p", 9, vec!["x86_64".into()]);
        project.insert(&conn).unwrap();
        let pkg = Package::new("bash", PackageType::NormalFork);
        pkg.insert(&conn).unwrap();
        Package::add_to_project(&conn, &project.id, &pkg.id, None).unwrap();

        let v1 = PackageVersion::ensure(&conn, &pkg.id, "5.1", "1.el9").unwrap();
        let v2 = PackageVersion::ensure(&conn, &pkg.id, "5.1", "2.el9").unwrap();
        assert_eq!(PackageVersion::ensure(&conn, &pkg.id, "5.1", "1.el9").unwrap(), v1);

        ProjectPackageVersion::attach(&conn, &project.id, &pkg.id, &v1, true).unwrap();
        ProjectPackageVersion::attach(&conn, &project.id, &pkg.id, &v2, true).unwrap();
        ProjectPackageVersion::make_active_in_repo(&conn, &v1, &pkg.id, &project.id).unwrap();
        ProjectPackageVersion::make_active_in_repo(&conn, &v2, &pkg.id, &project.id).unwrap();

        let a = ProjectPackageVersion::find(&conn, &project.id, &v1).unwrap().unwrap();
        let b = ProjectPackageVersion::find(&conn, &project.id, &v2).unwrap().unwrap();
        assert!(!a.active_in_repo);
        assert!(b.active_in_repo);
    }

    #[test]
    fn test_project_type_override() {
        let conn = open_in_memory().unwrap();
        let project = Project::new("p", 9, vec![]);
        project.insert(&conn).unwrap();
        let pkg = Package::new("nodejs", PackageType::NormalFork);
        pkg.insert(&conn).unwrap();
        Package::add_to_project(&conn, &project.id, &pkg.id, Some(PackageType::NormalForkModule))
            .unwrap();

        let found = Package::find_in_project(&conn, &project.id, "nodejs").unwrap().unwrap();
        assert!(found.effective_type().is_module());
        assert!(Package::find_in_project(&conn, &project.id, "perl").unwrap().is_none());
    }

    #[test]
    fn test_extra_options_merge() {
        let conn = open_in_memory().unwrap();
        let project = Project::new("p", 9, vec![]);
        project.insert(&conn).unwrap();
        ExtraOptions::set_flags(&conn, &project.id, "gcc", &["bootstrap".into()], &[]).unwrap();
        ExtraOptions::set_group_install_options(&conn, &project.id, "gcc", &[], &["llvm:rhel8".into()], &[])
            .unwrap();

        let opts = ExtraOptions::find(&conn, &project.id, "gcc").unwrap().unwrap();
        assert_eq!(opts.with_flags, vec!["bootstrap"]);
        assert_eq!(opts.enable_module, vec!["llvm:rhel8"]);
    }
}
