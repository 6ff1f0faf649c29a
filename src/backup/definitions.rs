use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use super::{Manager, ManagerSettings, TaskDefinition};
use crate::config::{AppConfig, BackupContext, RunOptions};
use crate::database::PgAdapter;
use crate::repositories::{GitalyBackup, GitalyBackupOptions, PgRepositoryCatalog, RepositoryFilter};
use crate::shell::ShellCommand;
use crate::targets::{
    DatabaseTarget, DatabaseTools, FilesStrategy, FilesTarget, FilesTools, RepositoriesTarget, Target,
};
use crate::utils::{find_executable, find_tar_executable, tool_version};

/// Wires the configured databases, repositories and file sets into a [`Manager`].
///
/// Client tools are looked up in `PATH` only for tasks that will actually run.
pub async fn build_manager(app: &AppConfig, options: RunOptions) -> Result<Manager> {
    let context = Arc::new(
        BackupContext::new(&app.backup_path, &app.databases, &options.pg_overrides)
            .context("Invalid database configuration")?,
    );

    let compress = ShellCommand::parse(&app.compress_cmd).context("Invalid compress_cmd")?;
    let decompress = ShellCommand::parse(&app.decompress_cmd).context("Invalid decompress_cmd")?;
    let tar = find_tar_executable()?;

    let mut definitions: Vec<(String, TaskDefinition)> = Vec::new();

    let db_runs = !options.skipped("db");
    let pg_dump = resolve("pg_dump", db_runs)?;
    let database = DatabaseTarget::new(
        context.clone(),
        Arc::new(PgAdapter),
        DatabaseTools {
            pg_dump: pg_dump.clone(),
            psql: resolve("psql", db_runs)?,
            compress: compress.clone(),
            decompress: decompress.clone(),
        },
        &app.restore_ignored_errors,
        options.force,
    )
    .context("Invalid restore_ignored_errors pattern")?;
    definitions.push((
        "db".to_string(),
        TaskDefinition {
            target: Target::Database(database),
            enabled: true,
            human_name: "database".to_string(),
            destination_path: "db".to_string(),
            destination_optional: false,
        },
    ));

    let repositories = &app.repositories;
    let repositories_run = repositories.enabled && !options.skipped("repositories");
    let gitaly_binary = match &repositories.gitaly_backup_path {
        Some(path) => path.clone(),
        None => resolve("gitaly-backup", repositories_run)?,
    };
    let gitaly = GitalyBackup::new(GitalyBackupOptions {
        binary: gitaly_binary,
        storages: repositories.storages.clone(),
        max_parallelism: repositories.max_parallelism,
        max_parallelism_per_storage: repositories.max_parallelism_per_storage,
        incremental: options.incremental,
    });
    let catalog = PgRepositoryCatalog::connect_lazy(context.main_database()?)?;
    let filter = RepositoryFilter {
        storages: options.repositories_storages.clone(),
        paths: options.repositories_paths.clone(),
        skip_paths: options.skip_repositories_paths.clone(),
    };
    let storage_names = repositories.storages.iter().map(|s| s.name.clone()).collect();
    let pool_scheduler = repositories
        .object_pool_schedule_cmd
        .as_deref()
        .map(ShellCommand::parse)
        .transpose()
        .context("Invalid object_pool_schedule_cmd")?;
    definitions.push((
        "repositories".to_string(),
        TaskDefinition {
            target: Target::Repositories(
                RepositoriesTarget::new(gitaly, Arc::new(catalog), filter, storage_names)
                    .with_pool_scheduler(pool_scheduler),
            ),
            enabled: repositories.enabled,
            human_name: "repositories".to_string(),
            destination_path: "repositories".to_string(),
            destination_optional: false,
        },
    ));

    for set in &app.file_sets {
        let set_runs = set.enabled && !options.skipped(&set.name);
        let rsync = match set.strategy {
            FilesStrategy::Copy => resolve("rsync", set_runs)?,
            FilesStrategy::Direct => PathBuf::from("rsync"),
        };
        let target = FilesTarget::new(
            &set.name,
            &set.app_files_dir,
            set.excludes.clone(),
            set.strategy,
            context.tmp_path(),
            FilesTools {
                tar: tar.clone(),
                rsync,
                compress: compress.clone(),
                decompress: decompress.clone(),
            },
        );
        definitions.push((
            set.name.clone(),
            TaskDefinition {
                target: Target::Files(target),
                enabled: set.enabled,
                human_name: set.human_name.clone(),
                destination_path: format!("{}.tar.gz", set.name),
                destination_optional: set.destination_optional,
            },
        ));
    }

    let settings = ManagerSettings {
        gitlab_version: app.gitlab_version.clone(),
        installation_type: app.installation_type.clone(),
        keep_time: app.keep_time,
        archive_permissions: app.archive_permissions,
        db_version: tool_version(&pg_dump).await,
        tar_version: tool_version(&tar).await,
        spaces_config: app.spaces_config.clone(),
    };

    Ok(Manager::new(app.backup_path.clone(), definitions, settings, options))
}

/// A missing tool is only fatal when its task is going to run.
fn resolve(name: &str, required: bool) -> Result<PathBuf> {
    if required {
        find_executable(name)
    } else {
        Ok(which::which(name).unwrap_or_else(|_| PathBuf::from(name)))
    }
}
