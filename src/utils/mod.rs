use anyhow::{Context, Result};
use std::io::{stdin, stdout, Write};
use std::path::{Path, PathBuf};
use which::which;

use crate::errors::BackupError;
use crate::shell::ShellCommand;

/// Finds `name` in the system PATH.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).with_context(|| {
        format!(
            "{} executable not found in PATH. Please ensure it is installed and in your PATH.",
            name
        )
    })
}

/// GNU tar, preferring `gtar` where `tar` is a BSD tar.
pub fn find_tar_executable() -> Result<PathBuf> {
    which("gtar")
        .or_else(|_| which("tar"))
        .context("Neither gtar nor tar found in PATH. Please install GNU tar.")
}

/// First line of `<program> --version`, or `unknown`.
pub async fn tool_version(program: &Path) -> String {
    let output = ShellCommand::new(program, ["--version"]).output().await;
    match output {
        Ok(output) if output.status.success() => output
            .stdout
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .unwrap_or_else(|| "unknown".to_string()),
        _ => "unknown".to_string(),
    }
}

/// Blocks until the operator answers `yes` or `no`.
pub fn ask_to_continue() -> crate::errors::Result<()> {
    loop {
        print!("Do you want to continue (yes/no)? ");
        stdout().flush()?;

        let mut input = String::new();
        if stdin().read_line(&mut input)? == 0 {
            return Err(BackupError::Aborted("no answer on stdin".to_string()));
        }
        match input.trim() {
            "yes" => return Ok(()),
            "no" => return Err(BackupError::Aborted("Restore aborted by user".to_string())),
            _ => continue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::write_script;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_tool_version_reads_first_line() {
        let dir = tempdir().unwrap();
        let tool = write_script(dir.path(), "pg_dump", "echo 'pg_dump (PostgreSQL) 16.2'\necho extra");
        assert_eq!(tool_version(&tool).await, "pg_dump (PostgreSQL) 16.2");
    }

    #[tokio::test]
    async fn test_tool_version_falls_back_to_unknown() {
        let dir = tempdir().unwrap();
        let failing = write_script(dir.path(), "tar", "exit 2");
        assert_eq!(tool_version(&failing).await, "unknown");
        assert_eq!(tool_version(&dir.path().join("missing")).await, "unknown");
    }

    #[test]
    fn test_find_executable_reports_missing_tool() {
        let err = find_executable("definitely-not-a-real-tool-xyz").unwrap_err();
        assert!(err.to_string().contains("definitely-not-a-real-tool-xyz"));
    }
}
