use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use super::BackupTarget;
use crate::errors::{BackupError, Result};
use crate::repositories::{BackupType, GitalyBackup, RepositoryCatalog, RepositoryFilter, BATCH_SIZE};
use crate::shell::ShellCommand;

/// Every Git repository GitLab knows about, moved by `gitaly-backup`.
pub struct RepositoriesTarget {
    gitaly: GitalyBackup,
    catalog: Arc<dyn RepositoryCatalog>,
    filter: RepositoryFilter,
    /// All configured storage names.
    storages: Vec<String>,
    /// Triggers pool recreation; gets the pool id as its last argument.
    pool_scheduler: Option<ShellCommand>,
}

impl RepositoriesTarget {
    pub fn new(
        gitaly: GitalyBackup,
        catalog: Arc<dyn RepositoryCatalog>,
        filter: RepositoryFilter,
        storages: Vec<String>,
    ) -> Self {
        Self {
            gitaly,
            catalog,
            filter,
            storages,
            pool_scheduler: None,
        }
    }

    pub fn with_pool_scheduler(mut self, scheduler: Option<ShellCommand>) -> Self {
        self.pool_scheduler = scheduler;
        self
    }

    async fn enqueue_all(&mut self) -> Result<usize> {
        let mut enqueued = 0;

        let mut after_id = 0;
        loop {
            let batch = self.catalog.projects(&self.filter, after_id, BATCH_SIZE).await?;
            let Some(last) = batch.last() else { break };
            after_id = last.id;
            for project in &batch {
                for job in project.jobs() {
                    self.gitaly.enqueue(&job).await?;
                    enqueued += 1;
                }
            }
            if (batch.len() as i64) < BATCH_SIZE {
                break;
            }
        }

        let mut after_id = 0;
        loop {
            let batch = self.catalog.snippets(&self.filter, after_id, BATCH_SIZE).await?;
            let Some(last) = batch.last() else { break };
            after_id = last.id;
            for snippet in &batch {
                self.gitaly.enqueue(&snippet.job()).await?;
                enqueued += 1;
            }
            if (batch.len() as i64) < BATCH_SIZE {
                break;
            }
        }

        let mut after_id = 0;
        loop {
            let batch = self.catalog.group_wikis(&self.filter, after_id, BATCH_SIZE).await?;
            let Some(last) = batch.last() else { break };
            after_id = last.group_id;
            for wiki in &batch {
                self.gitaly.enqueue(&wiki.job()).await?;
                enqueued += 1;
            }
            if (batch.len() as i64) < BATCH_SIZE {
                break;
            }
        }

        Ok(enqueued)
    }

    /// Restored pool repositories are stale. Every pool with a source project
    /// goes back to `none` and, when a scheduler is configured, is queued for
    /// recreation. A failed schedule is logged; the pool stays at `none`.
    async fn restore_object_pools(&self) -> Result<()> {
        for pool in self.catalog.object_pools().await? {
            if pool.source_project_id.is_none() {
                warn!(
                    "Object pool {} has no source project, skipping",
                    pool.disk_path
                );
                continue;
            }
            self.catalog.reset_object_pool(pool.id).await?;

            let Some(scheduler) = &self.pool_scheduler else {
                info!(
                    "Object pool {} ... reset, recreation left to GitLab",
                    pool.disk_path
                );
                continue;
            };
            let command = scheduler.clone().arg(pool.id.to_string());
            match command.output().await {
                Ok(output) if output.status.success() => {
                    info!("Object pool {} ... scheduled", pool.disk_path)
                }
                Ok(output) => warn!(
                    "Scheduling object pool {} failed with {}: {}",
                    pool.disk_path,
                    output.status,
                    output.stderr.trim()
                ),
                Err(e) => warn!("Scheduling object pool {} failed: {}", pool.disk_path, e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BackupTarget for RepositoriesTarget {
    async fn dump(&mut self, destination: &Path, backup_id: &str) -> Result<()> {
        self.gitaly
            .start(BackupType::Create, destination, backup_id, None)
            .await?;

        let enqueued = self.enqueue_all().await;
        let finished = self.gitaly.finish().await;
        let count = enqueued?;
        finished?;

        info!("Backed up {} repositories", count);
        Ok(())
    }

    async fn restore(&mut self, source: &Path, backup_id: &str) -> Result<()> {
        // Wiping storages is only safe when every repository comes back.
        let remove_all = if self.filter.is_empty() {
            Some(self.storages.as_slice())
        } else {
            None
        };
        self.gitaly
            .start(BackupType::Restore, source, backup_id, remove_all)
            .await?;

        let enqueued = self.enqueue_all().await;
        let finished = self.gitaly.finish().await;

        // gitaly-backup failures are reported, not raised; catalog failures
        // are raised once the pools have been reset.
        let mut catalog_failure = None;
        match enqueued {
            Ok(count) if finished.is_ok() => info!("Restored {} repositories", count),
            Ok(_) => {}
            Err(BackupError::GitalyBackup(reason)) => {
                error!("Enqueueing repositories for restore failed: {}", reason)
            }
            Err(e) => catalog_failure = Some(e),
        }
        if let Err(e) = finished {
            error!("Restoring repositories failed: {}", e);
        }

        self.restore_object_pools().await?;
        match catalog_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
