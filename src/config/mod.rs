mod context;
mod options;

pub use context::BackupContext;
pub use options::{RunOptions, BACKUP_FILE_SUFFIX};

use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::targets::FilesStrategy;

pub const DEFAULT_COMPRESS_CMD: &str = "gzip -c -1";
pub const DEFAULT_DECOMPRESS_CMD: &str = "gzip -cd";
pub const DEFAULT_ARCHIVE_PERMISSIONS: u32 = 0o600;

/// psql stderr lines matching one of these are not reported as restore errors.
pub const DEFAULT_RESTORE_IGNORED_ERRORS: &[&str] = &["WARNING:", "does not exist$", "must be owner of"];

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
    pub folder_prefix: Option<String>,
    /// `AES256`, or with `encryption_key` the SSE-C algorithm.
    pub encryption: Option<String>,
    pub encryption_key: Option<String>,
    /// `aws:kms` and friends; wins over `encryption`.
    pub server_side_encryption: Option<String>,
    pub server_side_encryption_kms_key_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonDatabaseConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub schemas: Vec<String>,
    pub database_tasks: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonFileSetConfig {
    pub name: String,
    pub human_name: Option<String>,
    pub app_files_dir: PathBuf,
    #[serde(default)]
    pub excludes: Vec<String>,
    pub strategy: Option<FilesStrategy>,
    #[serde(default)]
    pub destination_optional: bool,
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonGitalyStorageConfig {
    pub name: String,
    pub address: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRepositoriesConfig {
    pub enabled: Option<bool>,
    pub gitaly_backup_path: Option<PathBuf>,
    #[serde(default)]
    pub storages: Vec<JsonGitalyStorageConfig>,
    pub max_parallelism: Option<u32>,
    pub max_parallelism_per_storage: Option<u32>,
    /// Run once per reset object pool with the pool id appended.
    pub object_pool_schedule_cmd: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonCompressionConfig {
    pub compress_cmd: Option<String>,
    pub decompress_cmd: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub backup_path: Option<PathBuf>,
    pub gitlab_version: Option<String>,
    pub installation_type: Option<String>,
    pub keep_time: Option<u64>,
    /// Octal string such as `"0640"`.
    pub archive_permissions: Option<String>,
    pub databases: Option<Vec<JsonDatabaseConfig>>,
    pub files: Option<Vec<JsonFileSetConfig>>,
    pub repositories: Option<JsonRepositoriesConfig>,
    pub compression: Option<JsonCompressionConfig>,
    pub restore_ignored_errors: Option<Vec<String>>,
    pub s3_storage: Option<JsonS3StorageConfig>,
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub folder_prefix: Option<String>,
    pub encryption: Option<S3Encryption>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum S3Encryption {
    /// SSE-S3 or SSE-KMS, the bucket side holds the key.
    Managed {
        algorithm: String,
        kms_key_id: Option<String>,
    },
    /// SSE-C, the key is sent along with the upload.
    CustomerKey { algorithm: String, key: String },
}

impl S3Encryption {
    pub fn algorithm(&self) -> &str {
        match self {
            S3Encryption::Managed { algorithm, .. } | S3Encryption::CustomerKey { algorithm, .. } => algorithm,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSettings {
    pub name: String,
    pub url: String,
    pub schemas: Vec<String>,
    pub database_tasks: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSetSettings {
    pub name: String,
    pub human_name: String,
    pub app_files_dir: PathBuf,
    pub excludes: Vec<String>,
    pub strategy: FilesStrategy,
    pub destination_optional: bool,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitalyStorage {
    pub name: String,
    pub address: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoriesSettings {
    pub enabled: bool,
    pub gitaly_backup_path: Option<PathBuf>,
    pub storages: Vec<GitalyStorage>,
    pub max_parallelism: Option<u32>,
    pub max_parallelism_per_storage: Option<u32>,
    pub object_pool_schedule_cmd: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub backup_path: PathBuf,
    pub gitlab_version: String,
    pub installation_type: String,
    /// Seconds; `0` keeps every archive.
    pub keep_time: u64,
    pub archive_permissions: u32,
    pub databases: Vec<DatabaseSettings>,
    pub file_sets: Vec<FileSetSettings>,
    pub repositories: RepositoriesSettings,
    pub compress_cmd: String,
    pub decompress_cmd: String,
    pub restore_ignored_errors: Vec<String>,
    pub spaces_config: Option<SpacesConfig>,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })?;

        Self::from_raw(raw_json_config)
    }

    pub fn from_raw(raw_json_config: RawJsonConfig) -> Result<Self> {
        let backup_path = raw_json_config
            .backup_path
            .clone()
            .context("backup_path must be set in config.json")?;
        if backup_path.to_string_lossy().is_empty() {
            anyhow::bail!("backup_path cannot be empty in config.json.");
        }

        let gitlab_version = raw_json_config
            .gitlab_version
            .clone()
            .filter(|v| !v.trim().is_empty())
            .context("gitlab_version must be set in config.json")?;

        let archive_permissions = match &raw_json_config.archive_permissions {
            Some(mode) => parse_octal_mode(mode)?,
            None => DEFAULT_ARCHIVE_PERMISSIONS,
        };

        let databases = load_databases(&raw_json_config)?;
        let file_sets = load_file_sets(&raw_json_config)?;
        let repositories = load_repositories(&raw_json_config);

        let compression = raw_json_config.compression.as_ref();
        let compress_cmd = compression
            .and_then(|c| c.compress_cmd.clone())
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_COMPRESS_CMD.to_string());
        let decompress_cmd = compression
            .and_then(|c| c.decompress_cmd.clone())
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_DECOMPRESS_CMD.to_string());

        let restore_ignored_errors = raw_json_config
            .restore_ignored_errors
            .clone()
            .unwrap_or_else(|| {
                DEFAULT_RESTORE_IGNORED_ERRORS
                    .iter()
                    .map(|s| s.to_string())
                    .collect()
            });

        let spaces_config = raw_json_config.s3_storage.as_ref().and_then(load_spaces_config);

        Ok(AppConfig {
            backup_path,
            gitlab_version,
            installation_type: raw_json_config
                .installation_type
                .clone()
                .unwrap_or_else(|| "gitlab-backup-cli".to_string()),
            keep_time: raw_json_config.keep_time.unwrap_or(0),
            archive_permissions,
            databases,
            file_sets,
            repositories,
            compress_cmd,
            decompress_cmd,
            restore_ignored_errors,
            spaces_config,
        })
    }
}

fn load_spaces_config(s3_raw: &JsonS3StorageConfig) -> Option<SpacesConfig> {
    if let (Some(bucket), Some(region), Some(key_id), Some(secret), Some(endpoint)) = (
        s3_raw.bucket_name.as_ref().filter(|s| !s.is_empty()),
        s3_raw.region.as_ref().filter(|s| !s.is_empty()),
        s3_raw.access_key_id.as_ref().filter(|s| !s.is_empty()),
        s3_raw.secret_access_key.as_ref().filter(|s| !s.is_empty()),
        s3_raw.endpoint_url.as_ref().filter(|s| !s.is_empty()),
    ) {
        Some(SpacesConfig {
            bucket_name: bucket.clone(),
            region: region.clone(),
            access_key_id: key_id.clone(),
            secret_access_key: secret.clone(),
            endpoint_url: endpoint.clone(),
            folder_prefix: s3_raw.folder_prefix.clone().filter(|s| !s.is_empty()),
            encryption: load_s3_encryption(s3_raw),
        })
    } else {
        // Only warn when some S3 fields were provided
        if s3_raw.bucket_name.is_some()
            || s3_raw.region.is_some()
            || s3_raw.access_key_id.is_some()
            || s3_raw.secret_access_key.is_some()
            || s3_raw.endpoint_url.is_some()
        {
            tracing::warn!(
                "S3 configuration is present in config.json but some required fields (bucket_name, region, access_key_id, secret_access_key, endpoint_url) are missing or empty. Remote upload will be disabled."
            );
        }
        None
    }
}

fn load_s3_encryption(s3_raw: &JsonS3StorageConfig) -> Option<S3Encryption> {
    let non_empty = |value: &Option<String>| value.clone().filter(|s| !s.trim().is_empty());

    if let Some(algorithm) = non_empty(&s3_raw.server_side_encryption) {
        return Some(S3Encryption::Managed {
            algorithm,
            kms_key_id: non_empty(&s3_raw.server_side_encryption_kms_key_id),
        });
    }
    let algorithm = non_empty(&s3_raw.encryption)?;
    Some(match non_empty(&s3_raw.encryption_key) {
        Some(key) => S3Encryption::CustomerKey { algorithm, key },
        None => S3Encryption::Managed {
            algorithm,
            kms_key_id: None,
        },
    })
}

fn load_databases(raw_config: &RawJsonConfig) -> Result<Vec<DatabaseSettings>> {
    let databases = raw_config
        .databases
        .as_ref()
        .filter(|dbs| !dbs.is_empty())
        .context("databases must list at least one database in config.json")?;

    let mut settings: Vec<DatabaseSettings> = Vec::with_capacity(databases.len());
    for db in databases {
        if db.name.trim().is_empty() || db.url.trim().is_empty() {
            anyhow::bail!("Every entry in databases needs a non-empty name and url");
        }
        if settings.iter().any(|s| s.name == db.name) {
            anyhow::bail!("Database `{}` is configured more than once", db.name);
        }
        settings.push(DatabaseSettings {
            name: db.name.clone(),
            url: db.url.clone(),
            schemas: db.schemas.clone(),
            database_tasks: db.database_tasks.unwrap_or(true),
        });
    }

    if !settings.iter().any(|s| s.name == crate::database::MAIN_DATABASE) {
        anyhow::bail!(
            "databases in config.json must contain an entry named `{}`",
            crate::database::MAIN_DATABASE
        );
    }

    Ok(settings)
}

fn load_file_sets(raw_config: &RawJsonConfig) -> Result<Vec<FileSetSettings>> {
    let mut file_sets: Vec<FileSetSettings> = Vec::new();
    for set in raw_config.files.iter().flatten() {
        if matches!(set.name.as_str(), "db" | "repositories" | "tar" | "remote") {
            anyhow::bail!("File set name `{}` is reserved", set.name);
        }
        if file_sets.iter().any(|f| f.name == set.name) {
            anyhow::bail!("File set `{}` is configured more than once", set.name);
        }
        file_sets.push(FileSetSettings {
            name: set.name.clone(),
            human_name: set.human_name.clone().unwrap_or_else(|| set.name.clone()),
            app_files_dir: set.app_files_dir.clone(),
            excludes: set.excludes.clone(),
            strategy: set.strategy.unwrap_or(FilesStrategy::Direct),
            destination_optional: set.destination_optional,
            enabled: set.enabled.unwrap_or(true),
        });
    }
    Ok(file_sets)
}

fn load_repositories(raw_config: &RawJsonConfig) -> RepositoriesSettings {
    match &raw_config.repositories {
        Some(repos) => RepositoriesSettings {
            enabled: repos.enabled.unwrap_or(true),
            gitaly_backup_path: repos.gitaly_backup_path.clone(),
            storages: repos
                .storages
                .iter()
                .map(|s| GitalyStorage {
                    name: s.name.clone(),
                    address: s.address.clone(),
                    token: s.token.clone(),
                })
                .collect(),
            max_parallelism: repos.max_parallelism,
            max_parallelism_per_storage: repos.max_parallelism_per_storage,
            object_pool_schedule_cmd: repos
                .object_pool_schedule_cmd
                .clone()
                .filter(|c| !c.trim().is_empty()),
        },
        None => RepositoriesSettings {
            enabled: false,
            gitaly_backup_path: None,
            storages: Vec::new(),
            max_parallelism: None,
            max_parallelism_per_storage: None,
            object_pool_schedule_cmd: None,
        },
    }
}

fn parse_octal_mode(mode: &str) -> Result<u32> {
    let digits = mode.trim().trim_start_matches("0o");
    let parsed = u32::from_str_radix(digits, 8)
        .with_context(|| format!("archive_permissions `{}` is not an octal file mode", mode))?;
    if parsed > 0o7777 {
        anyhow::bail!("archive_permissions `{}` is out of range", mode);
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: serde_json::Value) -> RawJsonConfig {
        serde_json::from_value(value).unwrap()
    }

    fn minimal() -> serde_json::Value {
        json!({
            "backup_path": "/var/opt/gitlab/backups",
            "gitlab_version": "16.9.1",
            "databases": [{ "name": "main", "url": "postgres://localhost/gitlabhq_production" }]
        })
    }

    #[test]
    fn test_minimal_config_gets_defaults() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(raw(minimal()))?;

        assert_eq!(config.keep_time, 0);
        assert_eq!(config.archive_permissions, 0o600);
        assert_eq!(config.compress_cmd, "gzip -c -1");
        assert_eq!(config.decompress_cmd, "gzip -cd");
        assert_eq!(config.restore_ignored_errors.len(), 3);
        assert!(!config.repositories.enabled);
        assert!(config.file_sets.is_empty());
        assert!(config.spaces_config.is_none());
        assert!(config.databases[0].database_tasks);
        Ok(())
    }

    #[test]
    fn test_full_config() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(raw(json!({
            "backup_path": "/backups",
            "gitlab_version": "16.9.1-ee",
            "keep_time": 604800,
            "archive_permissions": "0640",
            "databases": [
                { "name": "main", "url": "postgres://localhost/gitlabhq", "schemas": ["public"] },
                { "name": "ci", "url": "postgres://localhost/gitlabhq", "database_tasks": false }
            ],
            "files": [
                { "name": "uploads", "app_files_dir": "/srv/uploads", "excludes": ["tmp"] },
                { "name": "registry", "human_name": "container registry images",
                  "app_files_dir": "/srv/registry", "strategy": "copy", "enabled": false }
            ],
            "repositories": {
                "storages": [{ "name": "default", "address": "unix:/gitaly.socket", "token": "t" }],
                "max_parallelism": 4
            },
            "compression": { "compress_cmd": "zstd -c", "decompress_cmd": "zstd -cd" },
            "restore_ignored_errors": ["^NOTICE:"],
            "s3_storage": {
                "bucket_name": "backups", "region": "us-east-1", "access_key_id": "id",
                "secret_access_key": "secret", "endpoint_url": "https://s3.example.com",
                "folder_prefix": ""
            }
        })))?;

        assert_eq!(config.keep_time, 604800);
        assert_eq!(config.archive_permissions, 0o640);
        assert!(!config.databases[1].database_tasks);
        assert_eq!(config.file_sets[0].human_name, "uploads");
        assert_eq!(config.file_sets[0].strategy, FilesStrategy::Direct);
        assert_eq!(config.file_sets[1].strategy, FilesStrategy::Copy);
        assert!(!config.file_sets[1].enabled);
        assert!(config.repositories.enabled);
        assert_eq!(config.repositories.max_parallelism, Some(4));
        assert_eq!(config.compress_cmd, "zstd -c");
        assert_eq!(config.restore_ignored_errors, vec!["^NOTICE:".to_string()]);
        let spaces = config.spaces_config.unwrap();
        assert_eq!(spaces.bucket_name, "backups");
        assert_eq!(spaces.folder_prefix, None);
        Ok(())
    }

    #[test]
    fn test_rejects_missing_main_database() {
        let mut value = minimal();
        value["databases"] = json!([{ "name": "ci", "url": "postgres://localhost/ci" }]);
        assert!(AppConfig::from_raw(raw(value)).is_err());
    }

    #[test]
    fn test_rejects_reserved_file_set_names() {
        let mut value = minimal();
        value["files"] = json!([{ "name": "tar", "app_files_dir": "/x" }]);
        assert!(AppConfig::from_raw(raw(value)).is_err());
    }

    #[test]
    fn test_s3_encryption_settings() -> anyhow::Result<()> {
        let s3 = |extra: serde_json::Value| {
            let mut block = json!({
                "bucket_name": "backups", "region": "us-east-1", "access_key_id": "id",
                "secret_access_key": "secret", "endpoint_url": "https://s3.example.com"
            });
            if let (Some(block), Some(extra)) = (block.as_object_mut(), extra.as_object()) {
                block.extend(extra.clone());
            }
            let mut value = minimal();
            value["s3_storage"] = block;
            AppConfig::from_raw(raw(value)).map(|c| c.spaces_config.and_then(|s| s.encryption))
        };

        assert_eq!(s3(json!({}))?, None);
        assert_eq!(
            s3(json!({ "encryption": "AES256" }))?,
            Some(S3Encryption::Managed { algorithm: "AES256".to_string(), kms_key_id: None })
        );
        assert_eq!(
            s3(json!({ "encryption": "AES256", "encryption_key": "0123456789abcdef0123456789abcdef" }))?,
            Some(S3Encryption::CustomerKey {
                algorithm: "AES256".to_string(),
                key: "0123456789abcdef0123456789abcdef".to_string()
            })
        );
        let kms = s3(json!({
            "encryption": "AES256",
            "server_side_encryption": "aws:kms",
            "server_side_encryption_kms_key_id": "arn:aws:kms:12345"
        }))?;
        assert_eq!(
            kms,
            Some(S3Encryption::Managed {
                algorithm: "aws:kms".to_string(),
                kms_key_id: Some("arn:aws:kms:12345".to_string())
            })
        );
        assert_eq!(kms.map(|e| e.algorithm().to_string()), Some("aws:kms".to_string()));
        Ok(())
    }

    #[test]
    fn test_incomplete_s3_block_disables_upload() -> anyhow::Result<()> {
        let mut value = minimal();
        value["s3_storage"] = json!({ "bucket_name": "backups" });
        let config = AppConfig::from_raw(raw(value))?;
        assert!(config.spaces_config.is_none());
        Ok(())
    }

    #[test]
    fn test_parse_octal_mode() -> anyhow::Result<()> {
        assert_eq!(parse_octal_mode("0600")?, 0o600);
        assert_eq!(parse_octal_mode("0o644")?, 0o644);
        assert!(parse_octal_mode("rw-r--r--").is_err());
        assert!(parse_octal_mode("17777").is_err());
        Ok(())
    }
}
