//! Database backup and restore through the PostgreSQL client tools
//!
//! Both operations shell out (`pg_dump` for backups, `psql` for restores of
//! plain SQL dumps) under a hard timeout and always come back with a
//! [`SyncResult`]; nothing in here returns an error to the caller.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::catalog::{BackupCatalog, BackupInfo};
use crate::credentials::{read_db_password, PG_PASSWORD_VAR};
use crate::error::{truncate_message, Result, SyncError, MAX_MESSAGE_LEN};
use crate::process::{run_tool, tool_command, ToolOutput};
use crate::progress::{format_bytes, ProgressReporter};
use crate::settings::{AppSettings, DatabaseTarget};
use crate::status::SyncResult;

pub const DUMP_TOOL: &str = "pg_dump";
pub const RESTORE_TOOL: &str = "psql";

/// Stderr fragments that indicate a harmless condition during restore.
const BENIGN_PATTERNS: &[&str] = &["NOTICE", "does not exist", "already exists"];

/// Restore stderr split into harmless and genuine lines
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreDiagnostics {
    pub benign: usize,
    pub errors: Vec<String>,
}

impl RestoreDiagnostics {
    pub fn from_stderr(stderr: &str) -> Self {
        let mut diagnostics = Self::default();
        for line in stderr.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if is_benign(line) {
                diagnostics.benign += 1;
            } else {
                diagnostics.errors.push(line.to_string());
            }
        }
        diagnostics
    }

    pub fn warning_count(&self) -> usize {
        self.benign + self.errors.len()
    }
}

fn is_benign(line: &str) -> bool {
    BENIGN_PATTERNS.iter().any(|pattern| line.contains(pattern))
}

/// Database side of a sync
#[derive(Debug, Clone)]
pub struct DatabaseSync {
    catalog: Arc<BackupCatalog>,
    target: DatabaseTarget,
    env_file: PathBuf,
    timeout: Duration,
}

impl DatabaseSync {
    pub fn new(
        catalog: Arc<BackupCatalog>,
        target: DatabaseTarget,
        env_file: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            catalog,
            target,
            env_file: env_file.into(),
            timeout,
        }
    }

    pub fn from_settings(settings: &AppSettings, catalog: Arc<BackupCatalog>) -> Self {
        Self::new(
            catalog,
            settings.database.clone(),
            settings.paths.env_file.clone(),
            settings.timeouts.database,
        )
    }

    pub fn catalog(&self) -> &Arc<BackupCatalog> {
        &self.catalog
    }

    /// Dump the database into a new timestamped backup file.
    #[instrument(skip_all, fields(database = %self.target.name))]
    pub async fn backup(&self, progress: &ProgressReporter) -> SyncResult {
        let started = Instant::now();
        let outcome = self.run_backup(progress).await;
        let result = SyncResult::from_outcome("backup", started, outcome);
        result.log();
        result
    }

    /// Restore `backup`, or the latest backup when `None`.
    #[instrument(skip_all, fields(database = %self.target.name))]
    pub async fn restore(&self, backup: Option<BackupInfo>, progress: &ProgressReporter) -> SyncResult {
        let started = Instant::now();
        let outcome = self.run_restore(backup, progress).await;
        let result = SyncResult::from_outcome("restore", started, outcome);
        result.log();
        result
    }

    /// Restore the latest backup.
    pub async fn quick_restore(&self, progress: &ProgressReporter) -> SyncResult {
        self.restore(None, progress).await
    }

    async fn run_backup(&self, progress: &ProgressReporter) -> Result<String> {
        progress.report(10, format!("Locating {}", DUMP_TOOL));
        let tool = self
            .catalog
            .find_pg_tool(DUMP_TOOL)
            .ok_or_else(|| SyncError::tool_not_found(DUMP_TOOL))?;

        progress.report(20, "Preparing backup file");
        self.catalog.ensure_backup_dir()?;
        let path = self.catalog.generate_backup_path();

        progress.report(40, "Dumping database");
        let mut command = self.command(&tool);
        command
            .arg("--clean")
            .arg("--if-exists")
            .arg("-f")
            .arg(&path);

        let output = match run_tool(command, "backup", self.timeout).await {
            Ok(output) => output,
            Err(e) => {
                remove_partial(&path);
                return Err(e);
            }
        };
        if !output.success() {
            remove_partial(&path);
            return Err(SyncError::process_error(DUMP_TOOL, failure_excerpt(&output)));
        }

        progress.report(90, "Verifying backup");
        let size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        progress.report(100, "Backup complete");
        Ok(format!("Backup created: {} ({})", filename, format_bytes(size)))
    }

    async fn run_restore(&self, backup: Option<BackupInfo>, progress: &ProgressReporter) -> Result<String> {
        progress.report(10, format!("Locating {}", RESTORE_TOOL));
        let tool = self
            .catalog
            .find_pg_tool(RESTORE_TOOL)
            .ok_or_else(|| SyncError::tool_not_found(RESTORE_TOOL))?;

        let backup = match backup {
            Some(backup) => backup,
            None => match self.catalog.get_latest_backup() {
                Some(latest) => latest,
                None => {
                    progress.report(100, "No backups to restore");
                    return Err(SyncError::NoBackupAvailable);
                }
            },
        };
        if !backup.filepath.is_file() {
            return Err(SyncError::BackupNotFound(backup.filepath));
        }

        progress.report(30, format!("Restoring {}", backup.filename));
        let mut command = self.command(&tool);
        command.arg("-q").arg("-f").arg(&backup.filepath);
        let output = run_tool(command, "restore", self.timeout).await?;

        progress.report(90, "Checking restore output");
        let diagnostics = RestoreDiagnostics::from_stderr(&output.stderr);
        if !output.success() && !diagnostics.errors.is_empty() {
            let first = diagnostics.errors.first().map(String::as_str).unwrap_or_default();
            return Err(SyncError::process_error(
                RESTORE_TOOL,
                truncate_message(first, MAX_MESSAGE_LEN),
            ));
        }

        progress.report(100, "Restore complete");
        let warnings = diagnostics.warning_count();
        if warnings > 0 {
            debug!(warnings, benign = diagnostics.benign, "Restore finished with warnings");
            Ok(format!("Restored {} ({} warnings)", backup.filename, warnings))
        } else {
            Ok(format!("Restored {}", backup.filename))
        }
    }

    /// Base invocation with connection arguments and credentials.
    fn command(&self, tool: &Path) -> Command {
        let mut command = tool_command(tool);
        command
            .arg("-h")
            .arg(&self.target.host)
            .arg("-p")
            .arg(self.target.port.to_string())
            .arg("-U")
            .arg(&self.target.user)
            .arg("-d")
            .arg(&self.target.name);
        if let Some(password) = read_db_password(&self.env_file) {
            command.env(PG_PASSWORD_VAR, password);
        }
        command
    }
}

fn failure_excerpt(output: &ToolOutput) -> String {
    let stderr = output.stderr.trim();
    if stderr.is_empty() {
        match output.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "terminated by signal".to_string(),
        }
    } else {
        truncate_message(stderr, MAX_MESSAGE_LEN)
    }
}

fn remove_partial(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Could not remove partial backup");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restore_diagnostics() {
        let stderr = "\
NOTICE:  table \"orders\" does not exist, skipping
psql:backup.sql:12: ERROR:  relation \"orders\" already exists

psql:backup.sql:40: ERROR:  permission denied for schema public
";
        let diagnostics = RestoreDiagnostics::from_stderr(stderr);
        assert_eq!(diagnostics.benign, 2);
        assert_eq!(diagnostics.errors.len(), 1);
        assert!(diagnostics.errors[0].contains("permission denied"));
        assert_eq!(diagnostics.warning_count(), 3);
    }

    #[test]
    fn test_failure_excerpt() {
        let output = ToolOutput {
            exit_code: Some(1),
            stdout: String::new(),
            stderr: "x".repeat(300),
        };
        assert_eq!(failure_excerpt(&output).len(), MAX_MESSAGE_LEN);

        let silent = ToolOutput {
            exit_code: Some(2),
            ..Default::default()
        };
        assert_eq!(failure_excerpt(&silent), "exit code 2");
    }
}
