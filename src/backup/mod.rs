//! Runs the targets in order and turns their output into one backup archive.

pub(crate) mod archive;
mod definitions;
pub(crate) mod s3_upload;

use archive::{BackupInformation, BACKUP_INFORMATION_FILE};
pub use definitions::build_manager;

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{info, warn};

use crate::config::{RunOptions, SpacesConfig, BACKUP_FILE_SUFFIX};
use crate::errors::{BackupError, Result};
use crate::targets::{BackupTarget, Target};

/// `<10 digit timestamp>[_YYYY_MM_DD[_<version>[-pre|-rcN][-ee]]]_gitlab_backup.tar`
const OLD_BACKUP_PATTERN: &str =
    r"^(\d{10})(?:_\d{4}_\d{2}_\d{2}(_\d+\.\d+\.\d+((-|\.)(pre|rc\d))?(-ee)?)?)?_gitlab_backup\.tar$";

pub struct TaskDefinition {
    pub target: Target,
    pub enabled: bool,
    pub human_name: String,
    /// Relative to the backup path.
    pub destination_path: String,
    /// The archive is valid without this destination.
    pub destination_optional: bool,
}

#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub gitlab_version: String,
    pub installation_type: String,
    pub keep_time: u64,
    pub archive_permissions: u32,
    pub db_version: String,
    pub tar_version: String,
    pub spaces_config: Option<SpacesConfig>,
}

enum BackupSource {
    /// Artifacts already lie unpacked in the backup path.
    NonTarred,
    Tarball(PathBuf),
}

pub struct Manager {
    backup_path: PathBuf,
    definitions: Vec<(String, TaskDefinition)>,
    settings: ManagerSettings,
    options: RunOptions,
}

impl Manager {
    pub fn new(
        backup_path: impl Into<PathBuf>,
        definitions: Vec<(String, TaskDefinition)>,
        settings: ManagerSettings,
        options: RunOptions,
    ) -> Self {
        Self {
            backup_path: backup_path.into(),
            definitions,
            settings,
            options,
        }
    }

    /// Dumps every task, writes the metadata and packs the archive.
    /// Returns the backup id.
    pub async fn create(&mut self) -> Result<String> {
        let now = Utc::now();
        let backup_id = match &self.options.backup {
            Some(id) => id.clone(),
            None => generate_backup_id(now, &self.settings.gitlab_version),
        };

        fs::create_dir_all(&self.backup_path)?;
        let result = self.run_create(&backup_id, now).await;

        if !self.options.skipped("tar") {
            self.cleanup_backup_contents();
        }
        self.remove_tmp();

        result?;
        info!("Backup {} is done.", backup_id);
        Ok(backup_id)
    }

    async fn run_create(&mut self, backup_id: &str, now: DateTime<Utc>) -> Result<()> {
        let full_backup_id = if self.options.incremental {
            self.prepare_incremental().await?
        } else {
            backup_id.to_string()
        };

        for index in 0..self.definitions.len() {
            self.run_create_task(index, &full_backup_id).await?;
        }

        self.write_backup_information(backup_id, &full_backup_id, now)?;

        if self.options.skipped("tar") {
            info!("Packing up backup tar file ... [SKIPPED]");
            return Ok(());
        }

        let tar_file = self.pack(backup_id).await?;
        self.upload(&tar_file).await?;
        self.remove_old(now)
    }

    /// Lays the previous backup out in the backup path and returns the id of
    /// the full backup its chain started from.
    async fn prepare_incremental(&mut self) -> Result<String> {
        let previous = self
            .options
            .previous_backup
            .clone()
            .or_else(|| self.options.backup.clone());

        match self.select_backup(previous.as_deref())? {
            // Updated in place, so it stays unpacked.
            BackupSource::NonTarred => {
                if !self.options.skipped("tar") {
                    self.options.skip.push("tar".to_string());
                }
            }
            BackupSource::Tarball(tar_file) => self.unpack(&tar_file).await?,
        }

        let information = BackupInformation::read(&self.backup_path)?;
        self.verify_version(&information)?;
        Ok(information.full_backup_id.unwrap_or(information.backup_id))
    }

    async fn run_create_task(&mut self, index: usize, backup_id: &str) -> Result<()> {
        let (name, definition) = &mut self.definitions[index];

        if !definition.enabled {
            info!("Dumping {} ... [DISABLED]", definition.human_name);
            return Ok(());
        }
        if self.options.skipped(name) {
            info!("Dumping {} ... [SKIPPED]", definition.human_name);
            return Ok(());
        }

        info!("Dumping {} ... ", definition.human_name);
        let destination = self.backup_path.join(&definition.destination_path);
        definition.target.dump(&destination, backup_id).await?;
        info!("Dumping {} ... done", definition.human_name);
        Ok(())
    }

    fn write_backup_information(&self, backup_id: &str, full_backup_id: &str, now: DateTime<Utc>) -> Result<()> {
        let information = BackupInformation {
            backup_id: backup_id.to_string(),
            full_backup_id: Some(full_backup_id.to_string()),
            backup_created_at: now,
            gitlab_version: self.settings.gitlab_version.clone(),
            db_version: self.settings.db_version.clone(),
            tar_version: self.settings.tar_version.clone(),
            installation_type: self.settings.installation_type.clone(),
            skipped: self.options.skip.clone(),
            repositories_storages: self.options.repositories_storages.clone(),
            repositories_paths: self.options.repositories_paths.clone(),
            skip_repositories_paths: self.options.skip_repositories_paths.clone(),
        };
        information.write(&self.backup_path)
    }

    /// Metadata plus the destination of every task that ran.
    fn backup_contents(&self) -> Vec<String> {
        let mut contents = vec![BACKUP_INFORMATION_FILE.to_string()];
        for (name, definition) in &self.definitions {
            if !definition.enabled || self.options.skipped(name) {
                continue;
            }
            let exists = self.backup_path.join(&definition.destination_path).exists();
            if exists || !definition.destination_optional {
                contents.push(definition.destination_path.clone());
            }
        }
        contents
    }

    async fn pack(&self, backup_id: &str) -> Result<PathBuf> {
        let tar_file = self.backup_path.join(format!("{}{}", backup_id, BACKUP_FILE_SUFFIX));
        info!("Creating backup archive: {} ... ", tar_file.display());

        let backup_path = self.backup_path.clone();
        let contents = self.backup_contents();
        let mode = self.settings.archive_permissions;
        let target = tar_file.clone();
        tokio::task::spawn_blocking(move || archive::pack(&backup_path, &contents, &target, mode))
            .await
            .map_err(|e| BackupError::Backup(format!("Backup failed: {}", e)))?
            .map_err(|e| BackupError::Backup(format!("Backup failed: {}", e)))?;

        info!("Creating backup archive: {} ... done", tar_file.display());
        Ok(tar_file)
    }

    async fn upload(&self, tar_file: &Path) -> Result<()> {
        if self.options.skipped("remote") {
            info!("Uploading backup archive to remote storage ... [SKIPPED]");
            return Ok(());
        }
        let Some(spaces_config) = &self.settings.spaces_config else {
            info!("Uploading backup archive to remote storage ... [SKIPPED]");
            return Ok(());
        };

        let file_name = tar_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let key = s3_upload::object_key(spaces_config, &file_name);

        info!(
            "Uploading backup archive to remote storage {} ... ",
            spaces_config.bucket_name
        );
        s3_upload::upload_file_to_s3(spaces_config, tar_file, &key).await?;
        info!(
            "Uploading backup archive to remote storage {} ... done{}",
            spaces_config.bucket_name,
            s3_upload::encryption_note(spaces_config)
        );
        Ok(())
    }

    fn remove_old(&self, now: DateTime<Utc>) -> Result<()> {
        if self.settings.keep_time == 0 {
            info!("Deleting old backups ... [SKIPPED]");
            return Ok(());
        }

        info!("Deleting old backups ... ");
        let names = list_backup_files(&self.backup_path)?;
        let mut removed = 0;
        for name in expired_backups(&names, now.timestamp(), self.settings.keep_time)? {
            match fs::remove_file(self.backup_path.join(&name)) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Deleting old backups ... {}: {}", name, e),
            }
        }
        info!("Deleting old backups ... done. ({} removed)", removed);
        Ok(())
    }

    /// Restores the selected backup, task by task.
    pub async fn restore(&mut self) -> Result<()> {
        fs::create_dir_all(&self.backup_path)?;
        let result = self.run_restore().await;
        self.remove_tmp();
        result
    }

    async fn run_restore(&mut self) -> Result<()> {
        let unpacked = match self.select_backup(self.options.backup.as_deref())? {
            BackupSource::NonTarred => false,
            BackupSource::Tarball(tar_file) => {
                self.unpack(&tar_file).await?;
                true
            }
        };

        let result = self.restore_unpacked().await;
        if unpacked {
            self.cleanup_backup_contents();
        }
        result
    }

    async fn restore_unpacked(&mut self) -> Result<()> {
        let information = BackupInformation::read(&self.backup_path)?;
        self.verify_version(&information)?;

        for index in 0..self.definitions.len() {
            self.run_restore_task(index, &information).await?;
        }

        info!("Restore task is done.");
        Ok(())
    }

    fn select_backup(&self, backup_id: Option<&str>) -> Result<BackupSource> {
        if self.backup_path.join(BACKUP_INFORMATION_FILE).exists() {
            info!(
                "Non tarred backup found in {}, using that",
                self.backup_path.display()
            );
            return Ok(BackupSource::NonTarred);
        }

        if let Some(backup_id) = backup_id {
            let file_name = format!("{}{}", backup_id, BACKUP_FILE_SUFFIX);
            let tar_file = self.backup_path.join(&file_name);
            if !tar_file.exists() {
                return Err(BackupError::Backup(format!(
                    "The backup file {} does not exist!",
                    file_name
                )));
            }
            return Ok(BackupSource::Tarball(tar_file));
        }

        let backups = list_backup_files(&self.backup_path)?;
        match backups.as_slice() {
            [] => Err(BackupError::Backup(format!(
                "No backups found in {}\nPlease make sure that file name ends with {}",
                self.backup_path.display(),
                BACKUP_FILE_SUFFIX
            ))),
            [only] => Ok(BackupSource::Tarball(self.backup_path.join(only))),
            many => {
                let listing: Vec<String> = many
                    .iter()
                    .map(|name| format!("  {}", name.trim_end_matches(BACKUP_FILE_SUFFIX)))
                    .collect();
                Err(BackupError::Backup(format!(
                    "Found more than one backup:\n{}\n\nSpecify the backup to restore with BACKUP=<id>",
                    listing.join("\n")
                )))
            }
        }
    }

    async fn unpack(&self, tar_file: &Path) -> Result<()> {
        info!("Unpacking backup ... ");
        let source = tar_file.to_path_buf();
        let backup_path = self.backup_path.clone();
        let unpacked = tokio::task::spawn_blocking(move || archive::unpack(&source, &backup_path))
            .await
            .map_err(|e| BackupError::Backup(format!("Unpacking backup failed: {}", e)))?;
        if let Err(e) = unpacked {
            return Err(BackupError::Backup(format!("Unpacking backup failed: {}", e)));
        }
        info!("Unpacking backup ... done");
        Ok(())
    }

    fn verify_version(&self, information: &BackupInformation) -> Result<()> {
        if information.gitlab_version != self.settings.gitlab_version {
            return Err(BackupError::Backup(format!(
                "GitLab version mismatch:\n  \
                 Your current GitLab version ({}) differs from the GitLab version in the backup!\n  \
                 Please switch to the following version and try again:\n  \
                 version: {}",
                self.settings.gitlab_version, information.gitlab_version
            )));
        }
        Ok(())
    }

    async fn run_restore_task(&mut self, index: usize, information: &BackupInformation) -> Result<()> {
        let force = self.options.force;
        let (name, definition) = &mut self.definitions[index];

        if !definition.enabled {
            info!("Restoring {} ... [DISABLED]", definition.human_name);
            return Ok(());
        }
        if self.options.skipped(name) || information.skipped(name) {
            info!("Restoring {} ... [SKIPPED]", definition.human_name);
            return Ok(());
        }

        let source = self.backup_path.join(&definition.destination_path);
        if definition.destination_optional && !source.exists() {
            info!("Restoring {} ... [SKIPPED]", definition.human_name);
            return Ok(());
        }

        info!("Restoring {} ... ", definition.human_name);

        if let Some(warning) = definition.target.pre_restore_warning() {
            warn!("{}", warning);
            confirm(force).await?;
        }

        definition.target.restore(&source, &information.backup_id).await?;
        info!("Restoring {} ... done", definition.human_name);

        if let Some(warning) = definition.target.post_restore_warning() {
            warn!("{}", warning);
            confirm(force).await?;
        }
        Ok(())
    }

    /// Removes the metadata file and every task destination.
    fn cleanup_backup_contents(&self) {
        let mut paths = vec![self.backup_path.join(BACKUP_INFORMATION_FILE)];
        paths.extend(
            self.definitions
                .iter()
                .map(|(_, d)| self.backup_path.join(&d.destination_path)),
        );
        for path in paths {
            if let Err(e) = remove_path(&path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            }
        }
    }

    fn remove_tmp(&self) {
        let tmp = self.backup_path.join("tmp");
        if let Err(e) = remove_path(&tmp) {
            warn!("Failed to remove {}: {}", tmp.display(), e);
        }
    }
}

async fn confirm(force: bool) -> Result<()> {
    if force {
        return Ok(());
    }
    let answer = tokio::task::spawn_blocking(crate::utils::ask_to_continue)
        .await
        .map_err(|e| BackupError::Backup(format!("Confirmation prompt failed: {}", e)))?;
    if answer.is_err() {
        info!("Quitting...");
    }
    answer
}

fn remove_path(path: &Path) -> std::io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// `<unix timestamp>_<YYYY_MM_DD>_<gitlab version>`
pub fn generate_backup_id(now: DateTime<Utc>, gitlab_version: &str) -> String {
    format!("{}_{}_{}", now.timestamp(), now.format("%Y_%m_%d"), gitlab_version)
}

/// Archive file names in `backup_path`, newest id first.
fn list_backup_files(backup_path: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(backup_path)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.ends_with(BACKUP_FILE_SUFFIX) && entry.file_type()?.is_file() {
            names.push(name);
        }
    }
    names.sort_by(|a, b| b.cmp(a));
    Ok(names)
}

/// Names among `names` whose leading timestamp is older than `now - keep_time`.
pub fn expired_backups(names: &[String], now: i64, keep_time: u64) -> Result<Vec<String>> {
    let pattern = Regex::new(OLD_BACKUP_PATTERN)?;
    let cutoff = i64::try_from(keep_time).map_or(i64::MIN, |keep| now.saturating_sub(keep));
    Ok(names
        .iter()
        .filter(|name| {
            pattern
                .captures(name)
                .and_then(|c| c[1].parse::<i64>().ok())
                .is_some_and(|timestamp| timestamp < cutoff)
        })
        .cloned()
        .collect())
}
