//! Repository pull/push through the git command line

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Local;
use tracing::{debug, instrument, warn};

use crate::catalog::BackupCatalog;
use crate::error::{truncate_message, Result, SyncError, MAX_MESSAGE_LEN};
use crate::process::{run_tool, tool_command, ToolOutput};
use crate::progress::ProgressReporter;
use crate::settings::{AppSettings, ToolTimeouts};
use crate::status::SyncResult;

pub const VCS_TOOL: &str = "git";

pub const MSG_UP_TO_DATE: &str = "Already up to date";
pub const MSG_PULLED: &str = "Updates pulled";
pub const MSG_NOTHING_TO_PUSH: &str = "Nothing to push";
pub const MSG_PUSHED: &str = "Changes pushed";

/// Repository side of a sync
#[derive(Debug, Clone)]
pub struct VcsSync {
    catalog: Arc<BackupCatalog>,
    repo_dir: PathBuf,
    timeouts: ToolTimeouts,
}

impl VcsSync {
    pub fn new(catalog: Arc<BackupCatalog>, repo_dir: impl Into<PathBuf>, timeouts: ToolTimeouts) -> Self {
        Self {
            catalog,
            repo_dir: repo_dir.into(),
            timeouts,
        }
    }

    pub fn from_settings(settings: &AppSettings, catalog: Arc<BackupCatalog>) -> Self {
        Self::new(catalog, settings.paths.repo_dir.clone(), settings.timeouts.clone())
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    /// Fetch and merge from the default remote.
    #[instrument(skip_all, fields(repo = %self.repo_dir.display()))]
    pub async fn pull(&self, progress: &ProgressReporter) -> SyncResult {
        let started = Instant::now();
        let outcome = self.run_pull(progress).await;
        let result = SyncResult::from_outcome("pull", started, outcome);
        result.log();
        result
    }

    /// Stage everything, commit with a timestamped message, and push.
    #[instrument(skip_all, fields(repo = %self.repo_dir.display()))]
    pub async fn push(&self, progress: &ProgressReporter) -> SyncResult {
        let started = Instant::now();
        let outcome = self.run_push(progress).await;
        let result = SyncResult::from_outcome("push", started, outcome);
        result.log();
        result
    }

    /// Whether the default remote answers within the probe timeout.
    pub async fn check_connection(&self) -> bool {
        match self
            .git(&["ls-remote", "--quiet", "--heads"], self.timeouts.connection_probe)
            .await
        {
            Ok(output) if output.success() => true,
            Ok(output) => {
                debug!(stderr = %output.stderr.trim(), "Remote not reachable");
                false
            }
            Err(e) => {
                debug!(error = %e, "Connection probe failed");
                false
            }
        }
    }

    async fn run_pull(&self, progress: &ProgressReporter) -> Result<String> {
        progress.report(10, "Pulling changes");
        let output = self.git(&["pull"], self.timeouts.vcs).await?;
        if !output.success() {
            return Err(SyncError::process_error("git pull", excerpt(&output)));
        }
        progress.report(100, "Pull complete");

        let text = output.combined().to_lowercase();
        if text.contains("already up to date") || text.contains("already up-to-date") {
            Ok(MSG_UP_TO_DATE.to_string())
        } else {
            Ok(MSG_PULLED.to_string())
        }
    }

    async fn run_push(&self, progress: &ProgressReporter) -> Result<String> {
        progress.report(10, "Staging changes");
        // Staging and committing are best-effort; the push decides the outcome.
        match self.git(&["add", "--all"], self.timeouts.vcs_stage).await {
            Ok(output) if !output.success() => warn!(stderr = %output.stderr.trim(), "git add failed"),
            Err(e) => warn!(error = %e, "git add failed"),
            Ok(_) => {}
        }

        progress.report(30, "Committing changes");
        let message = commit_message();
        match self.git(&["commit", "-m", &message], self.timeouts.vcs_stage).await {
            Ok(output) if output.success() => debug!(%message, "Committed local changes"),
            Ok(output) => debug!(stdout = %output.stdout.trim(), "Nothing committed"),
            Err(e) => warn!(error = %e, "git commit failed"),
        }

        progress.report(60, "Pushing changes");
        let output = self.git(&["push"], self.timeouts.vcs).await?;
        if !output.success() {
            return Err(SyncError::process_error("git push", excerpt(&output)));
        }
        progress.report(100, "Push complete");

        if output.combined().to_lowercase().contains("everything up-to-date") {
            Ok(MSG_NOTHING_TO_PUSH.to_string())
        } else {
            Ok(MSG_PUSHED.to_string())
        }
    }

    async fn git(&self, args: &[&str], timeout: Duration) -> Result<ToolOutput> {
        let tool = self
            .catalog
            .find_tool(VCS_TOOL)
            .ok_or_else(|| SyncError::tool_not_found(VCS_TOOL))?;
        let mut command = tool_command(&tool);
        command
            .args(args)
            .current_dir(&self.repo_dir)
            .env("GIT_TERMINAL_PROMPT", "0");
        run_tool(command, &format!("git {}", args[0]), timeout).await
    }
}

fn commit_message() -> String {
    format!("Auto-sync: {}", Local::now().format("%Y-%m-%d %H:%M:%S"))
}

fn excerpt(output: &ToolOutput) -> String {
    let text = if output.stderr.trim().is_empty() {
        output.stdout.trim()
    } else {
        output.stderr.trim()
    };
    if text.is_empty() {
        format!("exit code {:?}", output.exit_code)
    } else {
        truncate_message(text, MAX_MESSAGE_LEN)
    }
}
