use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::debug;

use super::ShellCommand;
use crate::errors::{BackupError, Result};

/// Permissions of files written by the last stage of a pipeline.
const OUTPUT_FILE_MODE: u32 = 0o600;

/// Commands whose stdout/stdin are chained, e.g. `pg_dump | gzip`.
#[derive(Debug, Clone)]
pub struct Pipeline {
    commands: Vec<ShellCommand>,
    discard_output: bool,
}

/// Outcome of one [`Pipeline::run`]: stderr of every stage, concatenated in
/// stage order, and one exit status per stage.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub stderr: String,
    pub status_list: Vec<ExitStatus>,
}

impl PipelineResult {
    pub fn success(&self) -> bool {
        self.status_list.iter().all(ExitStatus::success)
    }

    /// Human readable statuses for error messages, e.g. `[0, 2]`.
    pub fn describe_statuses(&self) -> String {
        let codes: Vec<String> = self
            .status_list
            .iter()
            .map(|s| match s.code() {
                Some(code) => code.to_string(),
                None => s.to_string(),
            })
            .collect();
        format!("[{}]", codes.join(", "))
    }
}

impl Pipeline {
    pub fn new(commands: Vec<ShellCommand>) -> Self {
        Self {
            commands,
            discard_output: false,
        }
    }

    /// Sends the last stage's stdout to `/dev/null` when no output file is given.
    pub fn discard_output(mut self) -> Self {
        self.discard_output = true;
        self
    }

    /// Spawns every stage at once and waits for all of them.
    ///
    /// `input` replaces the first stage's stdin, `output` the last stage's
    /// stdout. Each stage's stderr is drained by its own task while the stages
    /// run, so a chatty process can never stall on a full pipe.
    ///
    /// A stage that cannot be launched is an error of this call, not part of
    /// the returned [`PipelineResult`]; stages already started are killed
    /// when their handles drop.
    pub async fn run(&self, input: Option<&Path>, output: Option<&Path>) -> Result<PipelineResult> {
        if self.commands.is_empty() {
            return Err(BackupError::Backup("Cannot run an empty pipeline".to_string()));
        }

        let last = self.commands.len() - 1;
        let mut children: Vec<Child> = Vec::with_capacity(self.commands.len());
        let mut drains: Vec<JoinHandle<std::io::Result<Vec<u8>>>> = Vec::with_capacity(self.commands.len());

        let mut next_stdin: Option<Stdio> = match input {
            Some(path) => Some(Stdio::from(File::open(path)?)),
            None => None,
        };

        for (index, shell_command) in self.commands.iter().enumerate() {
            let mut command = shell_command.to_command();
            debug!("Pipeline stage {}: {}", index, shell_command);

            if let Some(stdin) = next_stdin.take() {
                command.stdin(stdin);
            }

            if index == last {
                match output {
                    Some(path) => {
                        let file = OpenOptions::new()
                            .write(true)
                            .create(true)
                            .truncate(true)
                            .mode(OUTPUT_FILE_MODE)
                            .open(path)?;
                        command.stdout(Stdio::from(file));
                    }
                    None if self.discard_output => {
                        command.stdout(Stdio::null());
                    }
                    None => {}
                }
            } else {
                command.stdout(Stdio::piped());
            }
            command.stderr(Stdio::piped());

            let mut child = command.spawn().map_err(|source| BackupError::Spawn {
                program: shell_command.program().to_string(),
                source,
            })?;

            if index != last {
                let stdout = child.stdout.take().ok_or_else(|| {
                    BackupError::Backup(format!("No stdout captured for `{}`", shell_command))
                })?;
                next_stdin = Some(stdout.try_into()?);
            }

            if let Some(mut stderr) = child.stderr.take() {
                drains.push(tokio::spawn(async move {
                    let mut buf = Vec::new();
                    stderr.read_to_end(&mut buf).await?;
                    Ok(buf)
                }));
            }

            children.push(child);
        }

        let mut status_list = Vec::with_capacity(children.len());
        for child in children.iter_mut() {
            status_list.push(child.wait().await?);
        }

        let mut stderr = String::new();
        for drain in drains {
            let bytes = drain
                .await
                .map_err(|e| BackupError::Backup(format!("stderr reader failed: {}", e)))??;
            stderr.push_str(&String::from_utf8_lossy(&bytes));
        }

        Ok(PipelineResult {
            stderr,
            status_list,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::process::ExitStatusExt;
    use tempfile::tempdir;

    fn sh(script: &str) -> ShellCommand {
        ShellCommand::new("sh", ["-c", script])
    }

    #[tokio::test]
    async fn test_chains_stdout_into_next_stdin_and_writes_output_file() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.txt");
        let output = dir.path().join("out.txt");
        std::fs::write(&input, "hello pipeline\n").unwrap();

        let pipeline = Pipeline::new(vec![
            ShellCommand::new("cat", Vec::<String>::new()),
            ShellCommand::new("tr", ["a-z", "A-Z"]),
        ]);
        let result = pipeline.run(Some(&input), Some(&output)).await.unwrap();

        assert!(result.success());
        assert_eq!(result.status_list.len(), 2);
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "HELLO PIPELINE\n");
        let mode = std::fs::metadata(&output).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_collects_stderr_and_per_stage_statuses() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out");

        let pipeline = Pipeline::new(vec![
            sh("echo first >&2; echo data"),
            sh("cat >/dev/null; echo second >&2; exit 3"),
        ]);
        let result = pipeline.run(None, Some(&output)).await.unwrap();

        assert!(!result.success());
        assert_eq!(result.status_list[0].code(), Some(0));
        assert_eq!(result.status_list[1].code(), Some(3));
        assert!(result.stderr.contains("first"));
        assert!(result.stderr.contains("second"));
        assert_eq!(result.describe_statuses(), "[0, 3]");
    }

    #[tokio::test]
    async fn test_large_stderr_does_not_deadlock() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out");

        // Far more than a pipe buffer on every stage.
        let pipeline = Pipeline::new(vec![
            sh("head -c 2000000 /dev/zero | tr '\\0' x >&2; echo done"),
            sh("cat; head -c 2000000 /dev/zero | tr '\\0' y >&2"),
        ]);
        let result = pipeline.run(None, Some(&output)).await.unwrap();

        assert!(result.success());
        assert_eq!(result.stderr.len(), 4_000_000);
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "done\n");
    }

    #[tokio::test]
    async fn test_launch_failure_is_an_error_not_a_result() {
        let pipeline = Pipeline::new(vec![
            sh("echo data"),
            ShellCommand::new("/nonexistent/compressor", Vec::<String>::new()),
        ]);

        match pipeline.run(None, None).await {
            Err(BackupError::Spawn { program, .. }) => assert_eq!(program, "/nonexistent/compressor"),
            other => panic!("expected spawn error, got {:?}", other.map(|r| r.status_list)),
        }
    }

    #[tokio::test]
    async fn test_discard_output_swallows_last_stdout() {
        let result = Pipeline::new(vec![sh("echo noisy")])
            .discard_output()
            .run(None, None)
            .await
            .unwrap();
        assert!(result.success());
        assert!(result.stderr.is_empty());
    }

    #[test]
    fn test_success_requires_every_stage() {
        let result = PipelineResult {
            stderr: String::new(),
            status_list: vec![ExitStatus::from_raw(0), ExitStatus::from_raw(1 << 8)],
        };
        assert!(!result.success());
    }
}
