//! GitLab Backup Tool
//!
//! Creates and restores GitLab backups: databases, Git repositories and blob directories

mod backup;
mod config;
mod database;
mod errors;
mod log;
mod repositories;
mod shell;
mod targets;
#[cfg(test)]
mod test_support;
mod utils;

use anyhow::{Context, Result};
use config::{AppConfig, RunOptions};
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

const CONFIG_PATH_VAR: &str = "GITLAB_BACKUP_CONFIG";

/// Main entry point for the backup/restore tool
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    log::init();

    match run_app().await {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    let config_path = env::var(CONFIG_PATH_VAR)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"));
    let app_config = AppConfig::load_from_json(&config_path).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            config_path.display()
        )
    })?;

    let args: Vec<String> = env::args().collect();
    let choice = if args.len() > 1 {
        args[1].trim().to_string()
    } else {
        prompt_choice()?
    };

    match choice.as_str() {
        "1" | "create" | "backup" => {
            println!("🚀 Starting Backup Process...");
            let mut manager = backup::build_manager(&app_config, RunOptions::from_env()).await?;
            let backup_id = manager.create().await.context("Backup process failed")?;
            println!("Backup id: {}", backup_id);
        }
        "2" | "restore" => {
            println!("🔄 Starting Restore Process...");
            let mut manager = backup::build_manager(&app_config, RunOptions::from_env()).await?;
            manager.restore().await.context("Restore process failed")?;
        }
        _ => {
            println!("❌ Invalid choice. Please enter '1' (create) or '2' (restore).");
            anyhow::bail!("Invalid operation choice");
        }
    }
    Ok(())
}

/// Prompts user to select backup or restore operation
fn prompt_choice() -> Result<String> {
    use std::io::{stdin, stdout, Write};

    println!("Select an operation:");
    println!("1. Create Backup (or type 'create')");
    println!("2. Restore Backup (or type 'restore')");
    print!("Enter your choice: ");
    stdout().flush().context("Failed to flush stdout")?;

    let mut input = String::new();
    stdin().read_line(&mut input).context("Failed to read user input")?;
    Ok(input.trim().to_string())
}
