use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::RepositoryJob;
use crate::config::GitalyStorage;
use crate::errors::{BackupError, Result};
use crate::shell::ShellCommand;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupType {
    Create,
    Restore,
}

impl BackupType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupType::Create => "create",
            BackupType::Restore => "restore",
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupType {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(BackupType::Create),
            "restore" => Ok(BackupType::Restore),
            other => Err(BackupError::GitalyBackup(format!("unknown backup type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GitalyBackupOptions {
    pub binary: PathBuf,
    pub storages: Vec<GitalyStorage>,
    pub max_parallelism: Option<u32>,
    pub max_parallelism_per_storage: Option<u32>,
    /// Adds `-incremental` to `create` runs.
    pub incremental: bool,
}

#[derive(Serialize)]
struct ServerEntry<'a> {
    address: &'a str,
    token: &'a str,
}

struct RunningBackup {
    child: Child,
    stdin: ChildStdin,
    output_drain: JoinHandle<()>,
}

/// One `gitaly-backup` process: started, fed line-delimited JSON jobs, finished.
pub struct GitalyBackup {
    options: GitalyBackupOptions,
    running: Option<RunningBackup>,
}

impl GitalyBackup {
    pub fn new(options: GitalyBackupOptions) -> Self {
        Self {
            options,
            running: None,
        }
    }

    pub fn build_args(
        &self,
        backup_type: BackupType,
        backup_repos_path: &Path,
        backup_id: &str,
        remove_all_repositories: Option<&[String]>,
    ) -> Vec<String> {
        let mut args = vec![
            backup_type.as_str().to_string(),
            "-path".to_string(),
            backup_repos_path.to_string_lossy().into_owned(),
            "-layout".to_string(),
            "manifest".to_string(),
        ];
        if let Some(parallel) = self.options.max_parallelism {
            args.push("-parallel".to_string());
            args.push(parallel.to_string());
        }
        if let Some(parallel) = self.options.max_parallelism_per_storage {
            args.push("-parallel-storage".to_string());
            args.push(parallel.to_string());
        }
        if self.options.incremental && backup_type == BackupType::Create {
            args.push("-incremental".to_string());
        }
        if let Some(storages) = remove_all_repositories.filter(|s| !s.is_empty()) {
            args.push("-remove-all-repositories".to_string());
            args.push(storages.join(","));
        }
        args.push("-id".to_string());
        args.push(backup_id.to_string());
        args
    }

    /// Base64 JSON map of storage name to address and token.
    pub fn gitaly_servers(&self) -> Result<String> {
        let servers: BTreeMap<&str, ServerEntry<'_>> = self
            .options
            .storages
            .iter()
            .map(|s| {
                (
                    s.name.as_str(),
                    ServerEntry {
                        address: &s.address,
                        token: s.token.as_deref().unwrap_or(""),
                    },
                )
            })
            .collect();
        Ok(STANDARD.encode(serde_json::to_vec(&servers)?))
    }

    pub async fn start(
        &mut self,
        backup_type: BackupType,
        backup_repos_path: &Path,
        backup_id: &str,
        remove_all_repositories: Option<&[String]>,
    ) -> Result<()> {
        if self.running.is_some() {
            return Err(BackupError::GitalyBackup(
                "already started, call finish before starting again".to_string(),
            ));
        }

        if backup_type == BackupType::Create {
            tokio::fs::create_dir_all(backup_repos_path).await?;
        }

        let args = self.build_args(backup_type, backup_repos_path, backup_id, remove_all_repositories);
        let command = ShellCommand::new(&self.options.binary, args)
            .env([("GITALY_SERVERS", self.gitaly_servers()?)]);
        info!("Starting {}", command);

        let mut child = command
            .to_command()
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| BackupError::Spawn {
                program: command.program().to_string(),
                source,
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackupError::GitalyBackup("stdin not captured".to_string()))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let output_drain = tokio::spawn(async move {
            tokio::join!(log_lines(stdout), log_lines(stderr));
        });

        self.running = Some(RunningBackup {
            child,
            stdin,
            output_drain,
        });
        Ok(())
    }

    pub async fn enqueue(&mut self, job: &RepositoryJob) -> Result<()> {
        let running = self
            .running
            .as_mut()
            .ok_or_else(|| BackupError::GitalyBackup("not started".to_string()))?;

        let mut line = serde_json::to_vec(job)?;
        line.push(b'\n');
        running
            .stdin
            .write_all(&line)
            .await
            .map_err(|e| BackupError::GitalyBackup(format!("failed to enqueue {}: {}", job.relative_path, e)))
    }

    /// Closes stdin and waits for the process to work through its queue.
    pub async fn finish(&mut self) -> Result<()> {
        let RunningBackup {
            mut child,
            mut stdin,
            output_drain,
        } = self
            .running
            .take()
            .ok_or_else(|| BackupError::GitalyBackup("not started".to_string()))?;

        // A child that already exited leaves a broken pipe behind; wait() reports why.
        if let Err(e) = stdin.shutdown().await {
            debug!("closing gitaly-backup stdin: {}", e);
        }
        drop(stdin);

        let status = child.wait().await?;
        if let Err(e) = output_drain.await {
            debug!("gitaly-backup output reader failed: {}", e);
        }

        if !status.success() {
            return Err(BackupError::GitalyBackup(match status.code() {
                Some(code) => format!("exit status {}", code),
                None => format!("terminated: {}", status),
            }));
        }
        Ok(())
    }
}

async fn log_lines<R: AsyncRead + Unpin>(reader: Option<R>) {
    let Some(reader) = reader else { return };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!("gitaly-backup: {}", line);
    }
}
