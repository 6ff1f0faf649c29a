//! Enumerating Git repositories and streaming them through `gitaly-backup`.

mod catalog;
mod gitaly_backup;

#[cfg(test)]
pub(crate) use catalog::memory;
pub use catalog::{
    GroupWikiRecord, ObjectPoolRecord, PgRepositoryCatalog, ProjectRecord, RepositoryCatalog,
    SnippetRecord,
};
pub use gitaly_backup::{BackupType, GitalyBackup, GitalyBackupOptions};

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Keyset batch size used while enumerating repositories.
pub const BATCH_SIZE: i64 = 1000;

/// One line of the `gitaly-backup` stdin protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepositoryJob {
    pub storage_name: String,
    pub relative_path: String,
    pub gl_project_path: String,
    pub always_create: bool,
}

/// `REPOSITORIES_STORAGES`, `REPOSITORIES_PATHS` and `SKIP_REPOSITORIES_PATHS`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepositoryFilter {
    pub storages: Vec<String>,
    pub paths: Vec<String>,
    pub skip_paths: Vec<String>,
}

impl RepositoryFilter {
    pub fn is_empty(&self) -> bool {
        self.storages.is_empty() && self.paths.is_empty() && self.skip_paths.is_empty()
    }
}

/// `path` is one of `filters` or lies below one of them.
pub fn path_matches(path: &str, filters: &[String]) -> bool {
    filters.iter().any(|filter| {
        let filter = filter.trim_end_matches('/');
        path == filter
            || path
                .strip_prefix(filter)
                .is_some_and(|rest| rest.starts_with('/'))
    })
}

/// `@hashed/6b/86/6b86b273...` style disk path, without the `.git` suffix.
pub fn hashed_disk_path(root: &str, id: i64) -> String {
    let hash = hex::encode(Sha256::digest(id.to_string().as_bytes()));
    format!("{}/{}/{}/{}", root, &hash[0..2], &hash[2..4], hash)
}

impl ProjectRecord {
    fn disk_path(&self) -> String {
        match &self.disk_path {
            Some(disk_path) if !disk_path.is_empty() => disk_path.clone(),
            _ if self.storage_version.unwrap_or(0) >= 1 => hashed_disk_path("@hashed", self.id),
            _ => self.full_path.clone(),
        }
    }

    /// Project repository, wiki, and design repository when one exists.
    pub fn jobs(&self) -> Vec<RepositoryJob> {
        let disk_path = self.disk_path();
        let mut jobs = vec![
            RepositoryJob {
                storage_name: self.storage.clone(),
                relative_path: format!("{}.git", disk_path),
                gl_project_path: self.full_path.clone(),
                always_create: true,
            },
            RepositoryJob {
                storage_name: self.storage.clone(),
                relative_path: format!("{}.wiki.git", disk_path),
                gl_project_path: format!("{}.wiki", self.full_path),
                always_create: false,
            },
        ];
        if self.has_design {
            jobs.push(RepositoryJob {
                storage_name: self.storage.clone(),
                relative_path: format!("{}.design.git", disk_path),
                gl_project_path: format!("{}.design", self.full_path),
                always_create: false,
            });
        }
        jobs
    }
}

impl SnippetRecord {
    pub fn job(&self) -> RepositoryJob {
        let gl_project_path = match &self.project_path {
            Some(project_path) => format!("{}/snippets/{}", project_path, self.id),
            None => format!("snippets/{}", self.id),
        };
        RepositoryJob {
            storage_name: self.storage.clone(),
            relative_path: format!("{}.git", hashed_disk_path("@snippets", self.id)),
            gl_project_path,
            always_create: false,
        }
    }
}

impl GroupWikiRecord {
    pub fn job(&self) -> RepositoryJob {
        RepositoryJob {
            storage_name: self.storage.clone(),
            relative_path: format!("{}.wiki.git", hashed_disk_path("@groups", self.group_id)),
            gl_project_path: format!("{}.wiki", self.full_path),
            always_create: false,
        }
    }
}
