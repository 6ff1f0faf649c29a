use std::str::FromStr;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::{Connection, Executor, PgConnection};
use tracing::{debug, info, warn};

use super::DatabaseConfiguration;
use crate::errors::{BackupError, Result};

/// Session timeouts relaxed while a backup holds a snapshot open.
pub const RELAXED_TIMEOUTS: &[&str] = &[
    "statement_timeout",
    "lock_timeout",
    "idle_in_transaction_session_timeout",
];

/// A live connection to one logical database, able to export a snapshot that
/// `pg_dump --snapshot` can attach to.
#[async_trait]
pub trait SnapshotConnection: Send {
    fn configuration(&self) -> &DatabaseConfiguration;

    /// Set only between [`export_snapshot`](Self::export_snapshot) and
    /// [`release_snapshot`](Self::release_snapshot).
    fn snapshot_id(&self) -> Option<&str>;

    /// Opens a repeatable-read transaction and exports its snapshot.
    /// Calling it twice without a release is the caller's bug.
    async fn export_snapshot(&mut self) -> Result<String>;

    /// Ends the snapshot transaction. No-op when nothing was exported.
    async fn release_snapshot(&mut self) -> Result<()>;

    /// Puts back the timeouts that were relaxed when the connection opened.
    async fn restore_timeouts(&mut self) -> Result<()>;
}

/// What the backup engine needs from the application's database layer.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    async fn connect(&self, config: &DatabaseConfiguration) -> Result<Box<dyn SnapshotConnection>>;

    /// Removes every table of the database ahead of a restore.
    async fn drop_all_tables(&self, config: &DatabaseConfiguration) -> Result<()>;
}

/// [`DatabaseAdapter`] talking to PostgreSQL through `sqlx`.
#[derive(Debug, Default, Clone)]
pub struct PgAdapter;

#[async_trait]
impl DatabaseAdapter for PgAdapter {
    async fn connect(&self, config: &DatabaseConfiguration) -> Result<Box<dyn SnapshotConnection>> {
        let connection = PgDatabaseConnection::connect(config).await?;
        Ok(Box::new(connection))
    }

    async fn drop_all_tables(&self, config: &DatabaseConfiguration) -> Result<()> {
        let mut conn = PgConnection::connect_with(&connect_options(config)?).await?;

        let schemas: Vec<String> = if config.schemas().is_empty() {
            vec!["public".to_string()]
        } else {
            config.schemas().to_vec()
        };

        for schema in &schemas {
            let tables: Vec<String> = sqlx::query_scalar(
                "SELECT tablename::text FROM pg_catalog.pg_tables WHERE schemaname = $1 ORDER BY tablename",
            )
            .bind(schema)
            .fetch_all(&mut conn)
            .await?;

            info!(
                "Dropping {} tables from schema `{}` of database `{}`",
                tables.len(),
                schema,
                config.name()
            );

            for table in tables {
                let statement = format!(
                    "DROP TABLE IF EXISTS {}.{} CASCADE",
                    quote_ident(schema),
                    quote_ident(&table)
                );
                conn.execute(statement.as_str()).await?;
            }
        }

        conn.close().await?;
        Ok(())
    }
}

/// Builds `sqlx` connect options from the effective (override-aware) settings.
pub fn connect_options(config: &DatabaseConfiguration) -> Result<PgConnectOptions> {
    let mut options = PgConnectOptions::new()
        .host(config.host())
        .database(config.database());

    if let Some(port) = config.port() {
        options = options.port(port);
    }
    if let Some(username) = config.username() {
        options = options.username(username);
    }
    if let Some(password) = config.password() {
        options = options.password(password);
    }
    if let Some(mode) = config.ssl_mode() {
        let mode = PgSslMode::from_str(mode).map_err(|e| {
            BackupError::Backup(format!("Invalid sslmode `{}` for database `{}`: {}", mode, config.name(), e))
        })?;
        options = options.ssl_mode(mode);
    }

    Ok(options)
}

pub struct PgDatabaseConnection {
    config: DatabaseConfiguration,
    conn: PgConnection,
    snapshot_id: Option<String>,
    saved_timeouts: Vec<(String, String)>,
}

impl PgDatabaseConnection {
    /// Connects, remembers the current timeouts and disables them so a long
    /// dump cannot be cut short by the session holding the snapshot.
    pub async fn connect(config: &DatabaseConfiguration) -> Result<Self> {
        debug!("Connecting to database `{}` on {}", config.name(), config.host());
        let mut conn = PgConnection::connect_with(&connect_options(config)?).await?;

        let mut saved_timeouts = Vec::with_capacity(RELAXED_TIMEOUTS.len());
        for setting in RELAXED_TIMEOUTS {
            let value: String = sqlx::query_scalar("SELECT current_setting($1)")
                .bind(setting)
                .fetch_one(&mut conn)
                .await?;
            conn.execute(format!("SET {} = 0", setting).as_str()).await?;
            saved_timeouts.push((setting.to_string(), value));
        }

        Ok(Self {
            config: config.clone(),
            conn,
            snapshot_id: None,
            saved_timeouts,
        })
    }
}

#[async_trait]
impl SnapshotConnection for PgDatabaseConnection {
    fn configuration(&self) -> &DatabaseConfiguration {
        &self.config
    }

    fn snapshot_id(&self) -> Option<&str> {
        self.snapshot_id.as_deref()
    }

    async fn export_snapshot(&mut self) -> Result<String> {
        self.conn
            .execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
            .await?;
        let snapshot_id: String = sqlx::query_scalar("SELECT pg_export_snapshot()")
            .fetch_one(&mut self.conn)
            .await?;

        info!(
            "Exported snapshot {} for database `{}`",
            snapshot_id,
            self.config.name()
        );
        self.snapshot_id = Some(snapshot_id.clone());
        Ok(snapshot_id)
    }

    async fn release_snapshot(&mut self) -> Result<()> {
        if self.snapshot_id.take().is_none() {
            return Ok(());
        }
        self.conn.execute("ROLLBACK").await?;
        debug!("Released snapshot for database `{}`", self.config.name());
        Ok(())
    }

    async fn restore_timeouts(&mut self) -> Result<()> {
        for (setting, value) in &self.saved_timeouts {
            let statement = format!("SET {} = {}", setting, quote_literal(value));
            if let Err(e) = self.conn.execute(statement.as_str()).await {
                warn!(
                    "Failed to restore {} on database `{}`: {}",
                    setting,
                    self.config.name(),
                    e
                );
                return Err(e.into());
            }
        }
        Ok(())
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_quoting_escapes_embedded_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("5min'"), "'5min'''");
    }

    #[test]
    fn test_connect_options_rejects_unknown_ssl_mode() {
        let config = DatabaseConfiguration::new(
            "main",
            "postgres://localhost/gitlabhq?sslmode=sometimes",
            vec![],
            true,
            &BTreeMap::new(),
        )
        .unwrap();
        assert!(connect_options(&config).is_err());
    }

    #[test]
    fn test_connect_options_accepts_libpq_ssl_modes() {
        let config = DatabaseConfiguration::new(
            "main",
            "postgres://gitlab:pw@localhost:5433/gitlabhq?sslmode=require",
            vec![],
            true,
            &BTreeMap::new(),
        )
        .unwrap();
        let options = connect_options(&config).unwrap();
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_database(), Some("gitlabhq"));
    }
}
