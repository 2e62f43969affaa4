// src/db/models/import.rs

//! Import and ImportRevision models

use crate::db::{new_id, now};
use crate::error::Result;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};

/// An import operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Import {
    pub id: String,
    pub project_id: String,
    pub package_id: String,
    pub task_id: String,
    pub scm_url: String,
    pub created_at: String,
}

impl Import {
    pub fn create(
        conn: &Connection,
        scm_url: &str,
        task_id: &str,
        package_id: &str,
        project_id: &str,
    ) -> Result<Self> {
        let import = Self {
            id: new_id(),
            project_id: project_id.to_string(),
            package_id: package_id.to_string(),
            task_id: task_id.to_string(),
            scm_url: scm_url.to_string(),
            created_at: now(),
        };
        conn.execute(
            "INSERT INTO imports (id, project_id, package_id, task_id, scm_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                &import.id,
                &import.project_id,
                &import.package_id,
                &import.task_id,
                &import.scm_url,
                &import.created_at
            ],
        )?;
        Ok(import)
    }

    pub fn list_in_project(conn: &Connection, project_id: &str, limit: i64, offset: i64) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(
            "SELECT id, project_id, package_id, task_id, scm_url, created_at FROM imports
             WHERE project_id = ?1 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3",
        )?;
        let imports = stmt
            .query_map(params![project_id, limit, offset], |row| {
                Ok(Self {
                    id: row.get(0)?,
                    project_id: row.get(1)?,
                    package_id: row.get(2)?,
                    task_id: row.get(3)?,
                    scm_url: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(imports)
    }
}

const REVISION_COLUMNS: &str = "ir.id, ir.import_id, ir.scm_hash, ir.scm_branch_name, ir.scm_url,
     ir.package_version_id, ir.modular, ir.active, ir.created_at, pv.version, pv.release";

/// A commit pushed to the target VCS for one branch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportRevision {
    pub id: String,
    pub import_id: String,
    pub scm_hash: String,
    pub scm_branch_name: String,
    pub scm_url: String,
    pub package_version_id: String,
    pub modular: bool,
    pub active: bool,
    pub created_at: String,
    pub version: String,
    pub release: String,
}

impl ImportRevision {
    pub fn create(
        conn: &Connection,
        import_id: &str,
        scm_hash: &str,
        scm_branch_name: &str,
        scm_url: &str,
        package_version_id: &str,
        modular: bool,
    ) -> Result<String> {
        let id = new_id();
        conn.execute(
            "INSERT INTO import_revisions
             (id, import_id, scm_hash, scm_branch_name, scm_url, package_version_id, modular, active, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            params![
                &id,
                import_id,
                scm_hash,
                scm_branch_name,
                scm_url,
                package_version_id,
                modular,
                now()
            ],
        )?;
        Ok(id)
    }

    /// Active revisions of the active version(s) of a package, newest first
    pub fn latest_for_package_in_project(
        conn: &Connection,
        package_name: &str,
        project_id: &str,
    ) -> Result<Vec<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT DISTINCT {REVISION_COLUMNS}
             FROM import_revisions ir
             INNER JOIN project_package_versions ppv ON ppv.package_version_id = ir.package_version_id
             INNER JOIN package_versions pv ON pv.id = ir.package_version_id
             INNER JOIN packages p ON p.id = ppv.package_id
             WHERE p.name = ?1 AND ppv.project_id = ?2 AND ppv.active = 1 AND ir.active = 1
             ORDER BY ir.created_at DESC"
        ))?;
        let revisions = stmt
            .query_map(params![package_name, project_id], Self::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(revisions)
    }

    pub fn find_by_scm_hash(conn: &Connection, scm_hash: &str) -> Result<Option<Self>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {REVISION_COLUMNS}
             FROM import_revisions ir
             INNER JOIN package_versions pv ON pv.id = ir.package_version_id
             WHERE ir.scm_hash = ?1
             ORDER BY ir.created_at DESC LIMIT 1"
        ))?;
        let revision = stmt.query_row([scm_hash], Self::from_row).optional()?;
        Ok(revision)
    }

    pub fn deactivate_by_package_version(conn: &Connection, package_version_id: &str) -> Result<()> {
        conn.execute(
            "UPDATE import_revisions SET active = 0 WHERE package_version_id = ?1",
            [package_version_id],
        )?;
        Ok(())
    }

    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            import_id: row.get(1)?,
            scm_hash: row.get(2)?,
            scm_branch_name: row.get(3)?,
            scm_url: row.get(4)?,
            package_version_id: row.get(5)?,
            modular: row.get(6)?,
            active: row.get(7)?,
            created_at: row.get(8)?,
            version: row.get(9)?,
            release: row.get(10)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{
        Package, PackageType, PackageVersion, Project, ProjectPackageVersion, Task, TaskType,
    };
    use crate::db::open_in_memory;

    #[test]
    fn test_latest_revisions_follow_active_version() {
        let conn = open_in_memory().unwrap();
        let project = Project::new("p", 9, vec![]);
        project.insert(&conn).unwrap();
        let pkg = Package::new("bash", PackageType::NormalFork);
        pkg.insert(&conn).unwrap();
        let task = Task::new("noarch", TaskType::Import, Some(&project.id), None);
        task.insert(&conn).unwrap();
        let import = Import::create(&conn, "https://git/rpms/bash", &task.id, &pkg.id, &project.id).unwrap();

        let old = PackageVersion::ensure(&conn, &pkg.id, "5.1", "1.el9").unwrap();
        ProjectPackageVersion::attach(&conn, &project.id, &pkg.id, &old, true).unwrap();
        ImportRevision::create(&conn, &import.id, "aaa", "r9", "u", &old, false).unwrap();

        ProjectPackageVersion::deactivate_by_package(&conn, &project.id, &pkg.id).unwrap();
        let new = PackageVersion::ensure(&conn, &pkg.id, "5.1", "2.el9").unwrap();
        ProjectPackageVersion::attach(&conn, &project.id, &pkg.id, &new, true).unwrap();
        ImportRevision::create(&conn, &import.id, "bbb", "r9", "u", &new, false).unwrap();

        let latest = ImportRevision::latest_for_package_in_project(&conn, "bash", &project.id).unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].scm_hash, "bbb");
        assert_eq!(latest[0].release, "2.el9");

        let by_hash = ImportRevision::find_by_scm_hash(&conn, "aaa").unwrap().unwrap();
        assert_eq!(by_hash.release, "1.el9");
    }
}
