//! The three kinds of data a backup is made of.

mod database;
mod files;
mod repositories;

pub use database::{DatabaseTarget, DatabaseTools};
pub use files::{pipeline_succeeded, FilesStrategy, FilesTarget, FilesTools};
pub use repositories::RepositoriesTarget;

use std::path::Path;

use async_trait::async_trait;

use crate::errors::Result;

/// Something that can be written into, and read back from, one backup destination.
#[async_trait]
pub trait BackupTarget: Send {
    async fn dump(&mut self, destination: &Path, backup_id: &str) -> Result<()>;

    async fn restore(&mut self, source: &Path, backup_id: &str) -> Result<()>;

    /// Shown (and confirmed) before `restore` runs.
    fn pre_restore_warning(&self) -> Option<String> {
        None
    }

    /// Shown (and confirmed) after `restore` returns.
    fn post_restore_warning(&self) -> Option<String> {
        None
    }
}

pub enum Target {
    Database(DatabaseTarget),
    Files(FilesTarget),
    Repositories(RepositoriesTarget),
}

#[async_trait]
impl BackupTarget for Target {
    async fn dump(&mut self, destination: &Path, backup_id: &str) -> Result<()> {
        match self {
            Target::Database(t) => t.dump(destination, backup_id).await,
            Target::Files(t) => t.dump(destination, backup_id).await,
            Target::Repositories(t) => t.dump(destination, backup_id).await,
        }
    }

    async fn restore(&mut self, source: &Path, backup_id: &str) -> Result<()> {
        match self {
            Target::Database(t) => t.restore(source, backup_id).await,
            Target::Files(t) => t.restore(source, backup_id).await,
            Target::Repositories(t) => t.restore(source, backup_id).await,
        }
    }

    fn pre_restore_warning(&self) -> Option<String> {
        match self {
            Target::Database(t) => t.pre_restore_warning(),
            Target::Files(t) => t.pre_restore_warning(),
            Target::Repositories(t) => t.pre_restore_warning(),
        }
    }

    fn post_restore_warning(&self) -> Option<String> {
        match self {
            Target::Database(t) => t.post_restore_warning(),
            Target::Files(t) => t.post_restore_warning(),
            Target::Repositories(t) => t.post_restore_warning(),
        }
    }
}
