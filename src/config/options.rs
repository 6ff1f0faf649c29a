use std::collections::BTreeMap;

use crate::database::collect_overrides;

/// Suffix of every packed backup archive.
pub const BACKUP_FILE_SUFFIX: &str = "_gitlab_backup.tar";

/// Per-run switches read from the environment (`SKIP=db,uploads`, `BACKUP=...`, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    pub skip: Vec<String>,
    /// Backup id to restore, or to use instead of a generated one.
    pub backup: Option<String>,
    pub force: bool,
    /// Build on a previous backup instead of starting from scratch.
    pub incremental: bool,
    /// Backup an incremental one builds on; falls back to `backup`.
    pub previous_backup: Option<String>,
    pub repositories_storages: Vec<String>,
    pub repositories_paths: Vec<String>,
    pub skip_repositories_paths: Vec<String>,
    pub pg_overrides: BTreeMap<String, String>,
}

impl RunOptions {
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let vars: BTreeMap<String, String> = vars.into_iter().collect();
        let get = |key: &str| vars.get(key).map(|v| v.trim()).filter(|v| !v.is_empty());

        let backup = get("BACKUP").map(normalize_backup_id);
        let force = get("FORCE").is_some_and(is_truthy) || get("force").is_some_and(is_truthy);

        RunOptions {
            skip: get("SKIP").map(split_list).unwrap_or_default(),
            backup,
            force,
            incremental: get("INCREMENTAL").is_some_and(is_truthy),
            previous_backup: get("PREVIOUS_BACKUP").map(normalize_backup_id),
            repositories_storages: get("REPOSITORIES_STORAGES").map(split_list).unwrap_or_default(),
            repositories_paths: get("REPOSITORIES_PATHS").map(split_list).unwrap_or_default(),
            skip_repositories_paths: get("SKIP_REPOSITORIES_PATHS").map(split_list).unwrap_or_default(),
            pg_overrides: collect_overrides(vars.clone()),
        }
    }

    pub fn skipped(&self, name: &str) -> bool {
        self.skip.iter().any(|s| s == name)
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "yes" | "true" | "1")
}

/// Accepts `BACKUP=/path/to/<id>_gitlab_backup.tar` as well as a bare id.
fn normalize_backup_id(value: &str) -> String {
    let base = value.rsplit('/').next().unwrap_or(value);
    base.strip_suffix(BACKUP_FILE_SUFFIX).unwrap_or(base).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(vars: &[(&str, &str)]) -> RunOptions {
        RunOptions::from_vars(vars.iter().map(|(k, v)| (k.to_string(), v.to_string())))
    }

    #[test]
    fn test_parses_skip_and_repository_filters() {
        let opts = options(&[
            ("SKIP", "db, uploads,,tar"),
            ("REPOSITORIES_STORAGES", "default,ssd"),
            ("REPOSITORIES_PATHS", "group-a,group-b/project"),
            ("SKIP_REPOSITORIES_PATHS", "group-a/ignored"),
        ]);

        assert_eq!(opts.skip, vec!["db", "uploads", "tar"]);
        assert!(opts.skipped("uploads"));
        assert!(!opts.skipped("repositories"));
        assert_eq!(opts.repositories_storages, vec!["default", "ssd"]);
        assert_eq!(opts.repositories_paths.len(), 2);
        assert_eq!(opts.skip_repositories_paths, vec!["group-a/ignored"]);
    }

    #[test]
    fn test_backup_id_is_reduced_to_the_id() {
        assert_eq!(
            options(&[("BACKUP", "/backups/1546300800_2019_01_01_16.9.1_gitlab_backup.tar")]).backup,
            Some("1546300800_2019_01_01_16.9.1".to_string())
        );
        assert_eq!(options(&[("BACKUP", "manual")]).backup, Some("manual".to_string()));
        assert_eq!(options(&[("BACKUP", "  ")]).backup, None);
    }

    #[test]
    fn test_force_accepts_both_spellings() {
        assert!(options(&[("FORCE", "yes")]).force);
        assert!(options(&[("force", "yes")]).force);
        assert!(options(&[("FORCE", "TRUE")]).force);
        assert!(!options(&[("FORCE", "no")]).force);
        assert!(!options(&[]).force);
    }

    #[test]
    fn test_incremental_switches() {
        let opts = options(&[
            ("INCREMENTAL", "yes"),
            ("PREVIOUS_BACKUP", "/ignored/path/some_previous_backup"),
        ]);
        assert!(opts.incremental);
        assert_eq!(opts.previous_backup, Some("some_previous_backup".to_string()));

        let opts = options(&[("INCREMENTAL", "false")]);
        assert!(!opts.incremental);
        assert_eq!(opts.previous_backup, None);
    }

    #[test]
    fn test_collects_pg_overrides() {
        let opts = options(&[("GITLAB_BACKUP_PGHOST", "replica"), ("PGHOST", "primary")]);
        assert_eq!(opts.pg_overrides.len(), 1);
        assert_eq!(opts.pg_overrides["GITLAB_BACKUP_PGHOST"], "replica");
    }
}
