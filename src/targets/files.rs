use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use super::BackupTarget;
use crate::errors::{BackupError, Result};
use crate::shell::{Pipeline, ShellCommand};

/// rsync: "some files vanished before they could be transferred".
const RSYNC_VANISHED_FILES: i32 = 24;

const TAR_NONCRITICAL_WARNING: &str = r"(?m)^g?tar: \.: Cannot mkdir: No such file or directory$";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilesStrategy {
    /// Tar the live directory.
    Direct,
    /// rsync into a staging directory first, then tar the copy.
    Copy,
}

#[derive(Debug, Clone)]
pub struct FilesTools {
    pub tar: PathBuf,
    pub rsync: PathBuf,
    pub compress: ShellCommand,
    pub decompress: ShellCommand,
}

impl Default for FilesTools {
    fn default() -> Self {
        Self {
            tar: PathBuf::from("tar"),
            rsync: PathBuf::from("rsync"),
            compress: ShellCommand::new("gzip", ["-c", "-1"]),
            decompress: ShellCommand::new("gzip", ["-cd"]),
        }
    }
}

/// One blob directory (uploads, LFS objects, ...) packed into `<name>.tar.gz`.
pub struct FilesTarget {
    name: String,
    app_files_dir: PathBuf,
    excludes: Vec<String>,
    strategy: FilesStrategy,
    tmp_path: PathBuf,
    tools: FilesTools,
}

impl FilesTarget {
    pub fn new(
        name: impl Into<String>,
        app_files_dir: impl Into<PathBuf>,
        excludes: Vec<String>,
        strategy: FilesStrategy,
        tmp_path: impl Into<PathBuf>,
        tools: FilesTools,
    ) -> Self {
        Self {
            name: name.into(),
            app_files_dir: app_files_dir.into(),
            excludes,
            strategy,
            tmp_path: tmp_path.into(),
            tools,
        }
    }

    fn file_backup_error(&self, tarball: &Path, reason: impl Into<String>) -> BackupError {
        BackupError::FileBackup {
            app_files_dir: self.app_files_dir.clone(),
            backup_tarball: tarball.to_path_buf(),
            reason: reason.into(),
        }
    }

    async fn rsync_to(&self, staging: &Path, tarball: &Path) -> Result<()> {
        let basename = self
            .app_files_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut args = vec![
            "-a".to_string(),
            "--delete".to_string(),
            "--exclude=lost+found".to_string(),
        ];
        args.extend(
            self.excludes
                .iter()
                .map(|e| format!("--exclude=/{}/{}", basename, e)),
        );
        args.push(self.app_files_dir.to_string_lossy().into_owned());
        args.push(staging.to_string_lossy().into_owned());
        let rsync = ShellCommand::new(&self.tools.rsync, args);

        let mut output = rsync.output().await?;
        if output.status.code() == Some(RSYNC_VANISHED_FILES) {
            warn!(
                "Warning: files vanished while copying {}, retrying once",
                self.app_files_dir.display()
            );
            output = rsync.output().await?;
        }

        if !output.status.success() {
            return Err(self.file_backup_error(
                tarball,
                format!("rsync exited with {}: {}", output.status, output.stderr.trim()),
            ));
        }
        Ok(())
    }

    async fn tar_directory(&self, dir: &Path, tarball: &Path) -> Result<()> {
        let mut args = vec!["--exclude=lost+found".to_string()];
        args.extend(self.excludes.iter().map(|e| format!("--exclude=./{}", e)));
        args.extend([
            "-C".to_string(),
            dir.to_string_lossy().into_owned(),
            "-cf".to_string(),
            "-".to_string(),
            ".".to_string(),
        ]);

        let tar = ShellCommand::new(&self.tools.tar, args);
        let result = Pipeline::new(vec![tar, self.tools.compress.clone()])
            .run(None, Some(tarball))
            .await?;

        if !pipeline_succeeded(&result.status_list[0], &result.status_list[1], &result.stderr) {
            return Err(self.file_backup_error(
                tarball,
                format!(
                    "pipeline exited with {}: {}",
                    result.describe_statuses(),
                    result.stderr.trim()
                ),
            ));
        }
        Ok(())
    }

    /// Every variant names `moved`, which may already hold part of the old content.
    fn move_error(&self, e: std::io::Error, source: &Path, moved: &Path) -> BackupError {
        match e.kind() {
            ErrorKind::PermissionDenied => BackupError::Backup(format!(
                "### NOTICE ###\n\
                 As part of restore, the task tried to move existing content from {dir}.\n\
                 However, that directory contains files or folders the current user may not move.\n\
                 To proceed, move the content of {dir} to a secure location so that\n\
                 {dir} is empty, then run the restore task again.\n\
                 Entries moved so far are in {moved}.",
                dir = self.app_files_dir.display(),
                moved = moved.display()
            )),
            ErrorKind::ResourceBusy => BackupError::Backup(format!(
                "### NOTICE ###\n\
                 As part of restore, the task tried to move `{dir}` aside before restoring.\n\
                 This could not be completed, perhaps `{dir}` is a mountpoint?\n\n\
                 To complete the restore, move the contents of `{dir}` to a\n\
                 different location and run the restore task again.\n\
                 Entries moved so far are in {moved}.",
                dir = self.app_files_dir.display(),
                moved = moved.display()
            )),
            _ => BackupError::Backup(format!(
                "Failed to move {} aside: {}. Entries moved so far are in {}.",
                source.display(),
                e,
                moved.display()
            )),
        }
    }

    /// Moves current content out of the way into `<tmp>/<name>.<timestamp>`.
    fn backup_existing_files_dir(&self, timestamp: i64) -> Result<()> {
        let entries = match fs::read_dir(&self.app_files_dir) {
            Ok(entries) => entries.collect::<std::io::Result<Vec<_>>>()?,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if entries.is_empty() {
            return Ok(());
        }

        let target = unique_path(&self.tmp_path.join(format!("{}.{}", self.name, timestamp)));
        fs::create_dir_all(&target)?;
        info!(
            "Moving existing content of {} to {}",
            self.app_files_dir.display(),
            target.display()
        );

        for entry in entries {
            let destination = target.join(entry.file_name());
            move_entry(&entry.path(), &destination)
                .map_err(|e| self.move_error(e, &entry.path(), &target))?;
        }
        Ok(())
    }
}

/// `rename`, falling back to copy and remove when `destination` sits on
/// another filesystem.
fn move_entry(source: &Path, destination: &Path) -> std::io::Result<()> {
    match fs::rename(source, destination) {
        Err(e) if e.kind() == ErrorKind::CrossesDevices => {
            copy_tree(source, destination)?;
            if fs::symlink_metadata(source)?.is_dir() {
                fs::remove_dir_all(source)
            } else {
                fs::remove_file(source)
            }
        }
        result => result,
    }
}

/// Copies a file, symlink or directory tree, keeping modes and links.
fn copy_tree(source: &Path, destination: &Path) -> std::io::Result<()> {
    // Children first, so a read-only directory gets its mode after it is filled.
    for entry in WalkDir::new(source).follow_links(false).contents_first(true) {
        let entry = entry.map_err(std::io::Error::from)?;
        let relative = entry.path().strip_prefix(source).unwrap_or(Path::new(""));
        let to = if relative.as_os_str().is_empty() {
            destination.to_path_buf()
        } else {
            destination.join(relative)
        };

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&to)?;
            fs::set_permissions(&to, entry.metadata().map_err(std::io::Error::from)?.permissions())?;
            continue;
        }
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent)?;
        }
        if file_type.is_symlink() {
            std::os::unix::fs::symlink(fs::read_link(entry.path())?, &to)?;
        } else {
            fs::copy(entry.path(), &to)?;
        }
    }
    Ok(())
}

#[async_trait]
impl BackupTarget for FilesTarget {
    async fn dump(&mut self, tarball: &Path, _backup_id: &str) -> Result<()> {
        if let Some(parent) = tarball.parent() {
            fs::create_dir_all(parent)?;
        }

        match self.strategy {
            FilesStrategy::Direct => self.tar_directory(&self.app_files_dir, tarball).await,
            FilesStrategy::Copy => {
                fs::create_dir_all(&self.tmp_path)?;
                // Removed when it goes out of scope.
                let staging = tempfile::Builder::new()
                    .prefix(&format!("{}.", self.name))
                    .tempdir_in(&self.tmp_path)?;
                self.rsync_to(staging.path(), tarball).await?;

                let copied = match self.app_files_dir.file_name() {
                    Some(name) => staging.path().join(name),
                    None => staging.path().to_path_buf(),
                };
                self.tar_directory(&copied, tarball).await
            }
        }
    }

    async fn restore(&mut self, tarball: &Path, _backup_id: &str) -> Result<()> {
        if !tarball.exists() {
            return Err(BackupError::Backup(format!(
                "Backup file {} does not exist",
                tarball.display()
            )));
        }

        self.backup_existing_files_dir(chrono::Utc::now().timestamp())?;
        fs::create_dir_all(&self.app_files_dir)?;

        let tar = ShellCommand::new(
            &self.tools.tar,
            [
                "--unlink-first".to_string(),
                "--recursive-unlink".to_string(),
                "-C".to_string(),
                self.app_files_dir.to_string_lossy().into_owned(),
                "-xf".to_string(),
                "-".to_string(),
            ],
        );
        let result = Pipeline::new(vec![self.tools.decompress.clone(), tar])
            .discard_output()
            .run(Some(tarball), None)
            .await?;

        if !pipeline_succeeded(&result.status_list[1], &result.status_list[0], &result.stderr) {
            return Err(BackupError::Backup(format!(
                "Restore operation failed: {}",
                result.stderr.trim()
            )));
        }
        Ok(())
    }
}

/// The compressor must succeed. tar may also exit 1 ("some files differ"), or 2
/// when its only complaint is the harmless `.: Cannot mkdir` warning.
pub fn pipeline_succeeded(tar_status: &ExitStatus, compress_status: &ExitStatus, output: &str) -> bool {
    if !compress_status.success() {
        return false;
    }
    match tar_status.code() {
        Some(0) => true,
        Some(1) => {
            warn!("Ignoring tar exit status 1 'Some files differ'");
            true
        }
        Some(2) => {
            static NONCRITICAL: OnceLock<Option<Regex>> = OnceLock::new();
            let noncritical = NONCRITICAL
                .get_or_init(|| Regex::new(TAR_NONCRITICAL_WARNING).ok())
                .as_ref()
                .is_some_and(|re| re.is_match(output));
            if noncritical {
                warn!("Ignoring non-success exit status 2 due to output of non-critical warning(s)");
            }
            noncritical
        }
        _ => false,
    }
}

fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }
    let mut suffix = 1;
    loop {
        let candidate = PathBuf::from(format!("{}.{}", path.display(), suffix));
        if !candidate.exists() {
            return candidate;
        }
        suffix += 1;
    }
}
