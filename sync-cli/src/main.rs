use anyhow::{bail, Context, Result};
use backup_sync::config::{parse_setting_value, setting_keys};
use backup_sync::settings::DEFAULT_SETTINGS_FILE;
use backup_sync::{
    format_bytes, AppSettings, ConfigStore, ProgressChannel, ProgressReporter, SyncEvent, SyncKind,
    SyncOrchestrator, SyncResult,
};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "backup-sync")]
#[command(about = "Back up the database and keep the repository in sync")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Host settings file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level
    #[arg(short, long, global = true, default_value = "warn")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Dump the database into a new backup file
    Backup,
    /// Restore a backup (the latest one unless --file is given)
    Restore {
        /// Backup filename inside the backup directory
        #[arg(long)]
        file: Option<String>,
    },
    /// Run the startup sync (restore the latest backup)
    Startup,
    /// Run the shutdown sync (backup, then push)
    Shutdown,
    /// Back up the database and push without gating
    DbOnly,
    /// Pull repository changes
    Pull,
    /// Commit and push repository changes
    Push,
    /// Check whether the remote is reachable
    Check,
    /// List backups, newest first
    List,
    /// Apply the retention policy to the backup directory
    Cleanup {
        /// Days to retain (defaults to the stored sync setting)
        #[arg(long)]
        retention_days: Option<u32>,
    },
    /// Show stored bookkeeping and backup inventory
    Status,
    /// Inspect or change the persisted sync settings
    Config {
        #[command(subcommand)]
        action: ConfigActions,
    },
    /// Manage the host settings file
    Settings {
        #[command(subcommand)]
        action: SettingsActions,
    },
}

#[derive(Subcommand)]
enum ConfigActions {
    /// Print every sync setting
    Show,
    /// Print one sync setting
    Get { key: String },
    /// Change one sync setting
    Set { key: String, value: String },
}

#[derive(Subcommand)]
enum SettingsActions {
    /// Print or write a default settings file
    Generate {
        /// Output path for the settings file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Check that a settings file parses and is usable
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let settings = AppSettings::resolve(cli.config.as_deref())
        .await
        .with_context(|| match &cli.config {
            Some(path) => format!("Failed to load settings from {}", path.display()),
            None => format!("Failed to load {}", DEFAULT_SETTINGS_FILE),
        })?;
    debug!(backup_dir = %settings.paths.backup_dir.display(), "Settings loaded");

    match cli.command {
        Commands::Settings { action } => match action {
            SettingsActions::Generate { output } => generate_settings(output).await,
            SettingsActions::Validate => validate_settings(&settings),
        },
        Commands::Config { action } => run_config(&settings, action),
        command => run_sync_command(settings, command).await,
    }
}

async fn run_sync_command(settings: AppSettings, command: Commands) -> Result<()> {
    let orchestrator = SyncOrchestrator::from_settings(&settings);

    let result = match command {
        Commands::Backup => {
            let database = orchestrator.database().clone();
            with_progress(|progress| async move { database.backup(&progress).await }).await
        }
        Commands::Restore { file } => {
            let backup = match file {
                Some(name) => match orchestrator.catalog().get_backup_by_filename(&name) {
                    Some(backup) => Some(backup),
                    None => bail!("No backup named {} in {}", name, settings.paths.backup_dir.display()),
                },
                None => None,
            };
            let database = orchestrator.database().clone();
            with_progress(|progress| async move { database.restore(backup, &progress).await }).await
        }
        Commands::Startup => run_kind(&orchestrator, SyncKind::Startup).await?,
        Commands::Shutdown => run_kind(&orchestrator, SyncKind::Shutdown).await?,
        Commands::DbOnly => run_kind(&orchestrator, SyncKind::DbOnly).await?,
        Commands::Pull => run_kind(&orchestrator, SyncKind::GitPull).await?,
        Commands::Push => run_kind(&orchestrator, SyncKind::GitPush).await?,
        Commands::Check => {
            if orchestrator.vcs().check_connection().await {
                println!("✅ Remote reachable");
                return Ok(());
            }
            println!("❌ Remote not reachable");
            std::process::exit(1);
        }
        Commands::List => {
            list_backups(&orchestrator);
            return Ok(());
        }
        Commands::Cleanup { retention_days } => {
            let days = retention_days.unwrap_or_else(|| orchestrator.config().backup_retention_days);
            let (deleted, kept) = orchestrator.catalog().cleanup_old_backups(days);
            println!("Retention {} days: deleted {}, kept {}", days, deleted, kept);
            return Ok(());
        }
        Commands::Status => {
            show_status(&orchestrator);
            return Ok(());
        }
        Commands::Config { .. } | Commands::Settings { .. } => bail!("Not a sync command"),
    };

    report(&result)
}

/// Run an adapter call while printing its progress.
async fn with_progress<F, Fut>(call: F) -> SyncResult
where
    F: FnOnce(ProgressReporter) -> Fut,
    Fut: std::future::Future<Output = SyncResult>,
{
    let (reporter, mut channel) = ProgressChannel::new();
    let printer = tokio::spawn(async move {
        while let Some(update) = channel.recv().await {
            print_progress(update.percent, &update.message);
        }
    });
    let result = call(reporter).await;
    let _ = printer.await;
    result
}

async fn run_kind(orchestrator: &SyncOrchestrator, kind: SyncKind) -> Result<SyncResult> {
    let Some(mut handle) = orchestrator.start(kind) else {
        bail!("A sync is already in progress");
    };
    info!(%kind, run_id = %handle.run_id(), "Sync dispatched");

    while let Some(event) = handle.next_event().await {
        match event {
            SyncEvent::Started { kind, .. } => println!("Starting {}", kind),
            SyncEvent::Progress { percent, message, .. } => print_progress(percent, &message),
            SyncEvent::Finished { state, .. } => println!("Finished: {}", state),
        }
    }

    let result = handle.wait().await;
    for step in orchestrator.status().results {
        let mark = if step.success { "✓" } else { "✗" };
        println!("  {} {:<8} {} ({} ms)", mark, step.operation, step.message, step.duration_ms);
    }
    Ok(result)
}

fn print_progress(percent: u8, message: &str) {
    println!("[{:>3}%] {}", percent, message);
}

fn report(result: &SyncResult) -> Result<()> {
    if result.success {
        println!("✅ {}", result.message);
        Ok(())
    } else {
        println!("❌ {}", result.message);
        std::process::exit(1);
    }
}

fn list_backups(orchestrator: &SyncOrchestrator) {
    let catalog = orchestrator.catalog();
    let backups = catalog.list_backups();
    if backups.is_empty() {
        println!("No backups in {}", catalog.backup_dir().display());
        return;
    }

    for backup in &backups {
        let marker = if backup.is_migrated() { " (migrated)" } else { "" };
        println!(
            "{}  {:>10}  {}{}",
            backup.timestamp.format("%Y-%m-%d %H:%M:%S"),
            backup.size_human(),
            backup.filename,
            marker
        );
    }
    println!(
        "{} backups, {} total",
        backups.len(),
        format_bytes(backups.iter().map(|b| b.size_bytes).sum())
    );
}

fn show_status(orchestrator: &SyncOrchestrator) {
    let config = orchestrator.config();
    let catalog = orchestrator.catalog();

    let last_sync = if config.last_sync_time.is_empty() {
        "never".to_string()
    } else {
        format!("{} ({})", config.last_sync_time, config.last_sync_type)
    };
    println!("Last sync:      {}", last_sync);
    if config.auto_sync_enabled {
        println!("Auto-sync:      every {}h", config.auto_sync_interval_hours);
    } else {
        println!("Auto-sync:      disabled");
    }
    println!("Retention:      {} days", config.backup_retention_days);
    println!("Backup dir:     {}", catalog.backup_dir().display());
    println!(
        "Backups:        {} ({})",
        catalog.list_backups().len(),
        format_bytes(catalog.total_size())
    );
    match catalog.get_latest_backup() {
        Some(latest) => println!("Latest backup:  {} ({})", latest.filename, latest.size_human()),
        None => println!("Latest backup:  none"),
    }
}

fn run_config(settings: &AppSettings, action: ConfigActions) -> Result<()> {
    let store = ConfigStore::new(&settings.paths.settings_file);

    match action {
        ConfigActions::Show => {
            println!("{}", serde_json::to_string_pretty(&store.load())?);
            Ok(())
        }
        ConfigActions::Get { key } => match store.get(&key) {
            Some(value) => {
                println!("{}", value);
                Ok(())
            }
            None => bail!("Unknown setting '{}' (known: {})", key, setting_keys().join(", ")),
        },
        ConfigActions::Set { key, value } => {
            if !setting_keys().contains(&key) {
                bail!("Unknown setting '{}' (known: {})", key, setting_keys().join(", "));
            }
            if !store.set(&key, parse_setting_value(&value)) {
                bail!("Could not store {} = {}", key, value);
            }
            println!("{} = {}", key, value);
            Ok(())
        }
    }
}

async fn generate_settings(output: Option<PathBuf>) -> Result<()> {
    let settings = AppSettings::default();
    match output {
        Some(path) => {
            settings
                .save(&path)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            println!("Settings generated at {}", path.display());
        }
        None => println!("{}", settings.to_toml()?),
    }
    Ok(())
}

fn validate_settings(settings: &AppSettings) -> Result<()> {
    match settings.validate() {
        Ok(()) => {
            println!("✓ Settings are valid");
            let db = &settings.database;
            println!("Database:    {}@{}:{}/{}", db.user, db.host, db.port, db.name);
            println!("Backup dir:  {}", settings.paths.backup_dir.display());
            println!("Repository:  {}", settings.paths.repo_dir.display());
            Ok(())
        }
        Err(e) => {
            println!("✗ Settings validation failed: {}", e);
            Err(e.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parses_nested_commands() {
        let cli = Cli::try_parse_from(["backup-sync", "restore", "--file", "backup_2024-01-01_09-00-00.sql"]).unwrap();
        assert!(matches!(cli.command, Commands::Restore { file: Some(_) }));

        let cli = Cli::try_parse_from(["backup-sync", "config", "set", "auto_sync_enabled", "true"]).unwrap();
        assert!(matches!(cli.command, Commands::Config { action: ConfigActions::Set { .. } }));

        let cli = Cli::try_parse_from(["backup-sync", "db-only", "--config", "x.toml"]).unwrap();
        assert!(matches!(cli.command, Commands::DbOnly));
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));
    }
}
