use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tar::{Archive, Builder};

use crate::errors::{BackupError, Result};

pub const BACKUP_INFORMATION_FILE: &str = "backup_information.json";

/// Metadata stored next to the artifacts of every backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInformation {
    pub backup_id: String,
    /// Id of the full backup an incremental chain starts from.
    #[serde(default)]
    pub full_backup_id: Option<String>,
    pub backup_created_at: DateTime<Utc>,
    pub gitlab_version: String,
    pub db_version: String,
    pub tar_version: String,
    pub installation_type: String,
    #[serde(default)]
    pub skipped: Vec<String>,
    #[serde(default)]
    pub repositories_storages: Vec<String>,
    #[serde(default)]
    pub repositories_paths: Vec<String>,
    #[serde(default)]
    pub skip_repositories_paths: Vec<String>,
}

impl BackupInformation {
    pub fn write(&self, backup_path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(backup_path.join(BACKUP_INFORMATION_FILE), json)?;
        Ok(())
    }

    pub fn read(backup_path: &Path) -> Result<Self> {
        let path = backup_path.join(BACKUP_INFORMATION_FILE);
        let content = fs::read_to_string(&path).map_err(|e| {
            BackupError::Backup(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn skipped(&self, name: &str) -> bool {
        self.skipped.iter().any(|s| s == name)
    }
}

/// Packs `entries` (relative to `backup_path`) into an uncompressed tar at
/// `tar_file`, created with `mode`.
pub fn pack(backup_path: &Path, entries: &[String], tar_file: &Path, mode: u32) -> Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(tar_file)?;
    // Honour the configured mode even when the file already existed.
    fs::set_permissions(tar_file, fs::Permissions::from_mode(mode))?;

    let mut builder = Builder::new(file);
    builder.follow_symlinks(false);

    for entry in entries {
        let path = backup_path.join(entry);
        if path.is_dir() {
            builder.append_dir_all(entry, &path)?;
        } else {
            builder.append_path_with_name(&path, entry)?;
        }
    }

    let file = builder.into_inner()?;
    file.sync_all()?;
    Ok(())
}

/// Extracts `tar_file` into `backup_path`.
pub fn unpack(tar_file: &Path, backup_path: &Path) -> Result<()> {
    let mut archive = Archive::new(File::open(tar_file)?);
    archive.set_preserve_permissions(true);
    archive.set_overwrite(true);
    archive.unpack(backup_path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn information() -> BackupInformation {
        BackupInformation {
            backup_id: "1546300800_2019_01_01_16.9.1".to_string(),
            full_backup_id: None,
            backup_created_at: DateTime::parse_from_rfc3339("2019-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            gitlab_version: "16.9.1".to_string(),
            db_version: "pg_dump (PostgreSQL) 16.2".to_string(),
            tar_version: "tar (GNU tar) 1.35".to_string(),
            installation_type: "source".to_string(),
            skipped: vec!["registry".to_string()],
            repositories_storages: vec![],
            repositories_paths: vec![],
            skip_repositories_paths: vec![],
        }
    }

    #[test]
    fn test_information_file_survives_a_write_and_read() {
        let dir = tempdir().unwrap();
        information().write(dir.path()).unwrap();

        let read = BackupInformation::read(dir.path()).unwrap();
        assert_eq!(read, information());
        assert!(read.skipped("registry"));
        assert!(!read.skipped("db"));
    }

    #[test]
    fn test_missing_information_file_is_a_backup_error() {
        let dir = tempdir().unwrap();
        assert!(matches!(BackupInformation::read(dir.path()), Err(BackupError::Backup(_))));
    }

    #[test]
    fn test_pack_sets_mode_and_unpack_restores_entries() {
        let src = tempdir().unwrap();
        fs::create_dir_all(src.path().join("db")).unwrap();
        fs::write(src.path().join("db/database.sql.gz"), b"dump").unwrap();
        fs::write(src.path().join("uploads.tar.gz"), b"uploads").unwrap();
        fs::write(src.path().join("not-included"), b"x").unwrap();
        let tar_file = src.path().join("1_gitlab_backup.tar");

        pack(
            src.path(),
            &["db".to_string(), "uploads.tar.gz".to_string()],
            &tar_file,
            0o640,
        )
        .unwrap();
        let mode = fs::metadata(&tar_file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);

        let dest = tempdir().unwrap();
        unpack(&tar_file, dest.path()).unwrap();
        assert_eq!(fs::read(dest.path().join("db/database.sql.gz")).unwrap(), b"dump");
        assert_eq!(fs::read(dest.path().join("uploads.tar.gz")).unwrap(), b"uploads");
        assert!(!dest.path().join("not-included").exists());
    }

    #[test]
    fn test_pack_fails_on_missing_entry() {
        let src = tempdir().unwrap();
        let tar_file = src.path().join("1_gitlab_backup.tar");
        assert!(pack(src.path(), &["repositories".to_string()], &tar_file, 0o600).is_err());
    }
}
