use anyhow::{Context, Result};
use backup_sync::settings::DEFAULT_SETTINGS_FILE;
use backup_sync::AppSettings;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod daemon;
mod telemetry;

use daemon::{BackupDaemon, ExitPrompt};
use telemetry::TelemetrySystem;

#[derive(Parser)]
#[command(name = "backup-sync-daemon")]
#[command(about = "Long-running backup and repository sync service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (overrides the configuration file)
    #[arg(short, long)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon in the foreground until interrupted
    Run {
        /// Run the exit-time shutdown sync without asking
        #[arg(short, long)]
        yes: bool,
    },
    /// Inspect or generate configuration
    Config {
        #[command(subcommand)]
        action: ConfigActions,
    },
}

#[derive(Subcommand)]
enum ConfigActions {
    /// Validate configuration file
    Validate,
    /// Show current configuration
    Show,
    /// Generate default configuration
    Generate {
        /// Output path for configuration
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { yes } => {
            let settings = load_settings(cli.config.as_ref()).await?;
            let mut telemetry = TelemetrySystem::new()?;
            telemetry.initialize_logging(&settings.logging, cli.log_level.as_deref())?;

            let prompt = if yes { ExitPrompt::AssumeYes } else { ExitPrompt::Ask };
            BackupDaemon::new(settings, telemetry)?.run(prompt).await
        }
        Commands::Config { action } => match action {
            ConfigActions::Validate => validate_config(cli.config.as_ref()).await,
            ConfigActions::Show => show_config(cli.config.as_ref()).await,
            ConfigActions::Generate { output } => generate_config(output.as_ref()).await,
        },
    }
}

async fn load_settings(config_path: Option<&PathBuf>) -> Result<AppSettings> {
    AppSettings::resolve(config_path.map(PathBuf::as_path))
        .await
        .with_context(|| match config_path {
            Some(path) => format!("Failed to load configuration from {}", path.display()),
            None => format!("Failed to load {}", DEFAULT_SETTINGS_FILE),
        })
}

async fn validate_config(config_path: Option<&PathBuf>) -> Result<()> {
    let path = config_path
        .cloned()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_FILE));

    let result = match AppSettings::load(&path).await {
        Ok(settings) => settings.validate().map(|_| settings),
        Err(e) => Err(e),
    };
    match result {
        Ok(settings) => {
            println!("✓ Configuration is valid");
            println!("Database: {}@{}:{}", settings.database.name, settings.database.host, settings.database.port);
            println!("Backups:  {}", settings.paths.backup_dir.display());
            println!("Metrics:  {}", if settings.metrics.enabled { "enabled" } else { "disabled" });
            Ok(())
        }
        Err(e) => {
            println!("✗ Configuration validation failed: {}", e);
            Err(e.into())
        }
    }
}

async fn show_config(config_path: Option<&PathBuf>) -> Result<()> {
    let settings = load_settings(config_path).await?;
    println!("{}", settings.to_toml()?);
    Ok(())
}

async fn generate_config(output_path: Option<&PathBuf>) -> Result<()> {
    let settings = AppSettings::default();
    let toml_content = settings.to_toml()?;

    if let Some(path) = output_path {
        tokio::fs::write(path, toml_content).await?;
        println!("Configuration generated at {}", path.display());
    } else {
        println!("{}", toml_content);
    }

    Ok(())
}
