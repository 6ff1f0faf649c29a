use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::DatabaseSettings;
use crate::database::{DatabaseConfiguration, MAIN_DATABASE};
use crate::errors::{BackupError, Result};

/// Settings shared by every target of one run. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct BackupContext {
    backup_path: PathBuf,
    databases: Vec<DatabaseConfiguration>,
    multi_database: bool,
}

impl BackupContext {
    pub fn new(
        backup_path: impl Into<PathBuf>,
        databases: &[DatabaseSettings],
        pg_overrides: &BTreeMap<String, String>,
    ) -> Result<Self> {
        let databases = databases
            .iter()
            .map(|db| {
                DatabaseConfiguration::new(
                    &db.name,
                    &db.url,
                    db.schemas.clone(),
                    db.database_tasks,
                    pg_overrides,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self::from_configurations(backup_path, databases))
    }

    pub fn from_configurations(
        backup_path: impl Into<PathBuf>,
        databases: Vec<DatabaseConfiguration>,
    ) -> Self {
        let multi_database = databases.iter().filter(|db| db.database_tasks()).count() > 1;
        Self {
            backup_path: backup_path.into(),
            databases,
            multi_database,
        }
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Databases that own their data; shared connections are left out.
    pub fn task_databases(&self) -> impl Iterator<Item = &DatabaseConfiguration> {
        self.databases.iter().filter(|db| db.database_tasks())
    }

    pub fn multi_database(&self) -> bool {
        self.multi_database
    }

    pub fn main_database(&self) -> Result<&DatabaseConfiguration> {
        self.databases
            .iter()
            .find(|db| db.is_main())
            .ok_or_else(|| BackupError::Backup(format!("No `{}` database configured", MAIN_DATABASE)))
    }

    /// Scratch space for staging copies and displaced files.
    pub fn tmp_path(&self) -> PathBuf {
        self.backup_path.join("tmp")
    }
}
