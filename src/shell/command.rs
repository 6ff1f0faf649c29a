use std::collections::BTreeMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};

use tokio::process::Command;

use crate::errors::{BackupError, Result};

/// An executable with its arguments and extra environment. Nothing runs until
/// the command is handed to a [`super::Pipeline`] or [`ShellCommand::output`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
}

/// Captured result of a single command run with [`ShellCommand::output`].
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ShellCommand {
    pub fn new<P, I, S>(program: P, args: I) -> Self
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.as_ref().to_string_lossy().into_owned(),
            args: args.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
        }
    }

    /// Splits a configured command line such as `gzip -c -1` on whitespace.
    pub fn parse(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace();
        let program = parts.next().ok_or_else(|| {
            BackupError::Backup(format!("Empty command line: {:?}", command_line))
        })?;
        Ok(Self::new(program, parts))
    }

    /// Adds variables to the child's environment only; the calling process's
    /// environment is never touched.
    pub fn env<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(&self.env).kill_on_drop(true);
        command
    }

    /// Runs the command to completion and captures everything it printed.
    pub async fn output(&self) -> Result<CommandOutput> {
        let output = self
            .to_command()
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| BackupError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        Ok(CommandOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl std::fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}
