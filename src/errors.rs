use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Generic backup/restore failure surfaced to the operator as-is.
    #[error("{0}")]
    Backup(String),

    #[error(
        "Failed to create full backup of database `{database}` on host `{host}` to {}: {reason}",
        dump_file.display()
    )]
    DatabaseBackup {
        database: String,
        host: String,
        dump_file: PathBuf,
        reason: String,
    },

    #[error(
        "Failed to create full backup of {} to {}: {reason}",
        app_files_dir.display(),
        backup_tarball.display()
    )]
    FileBackup {
        app_files_dir: PathBuf,
        backup_tarball: PathBuf,
        reason: String,
    },

    #[error("gitaly-backup: {0}")]
    GitalyBackup(String),

    #[error("Failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Operation aborted: {0}")]
    Aborted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Invalid pattern: {0}")]
    Regex(#[from] regex::Error),

    #[error("Storage operation failed: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, BackupError>;
