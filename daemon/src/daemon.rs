use anyhow::Result;
use backup_sync::{AppSettings, SyncEvent, SyncKind, SyncOrchestrator, SyncResult};
use std::collections::HashMap;
use std::io::IsTerminal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, instrument, warn};

use crate::telemetry::TelemetrySystem;

pub struct BackupDaemon {
    settings: AppSettings,
    orchestrator: SyncOrchestrator,
    telemetry: TelemetrySystem,
    tasks: HashMap<String, tokio::task::JoinHandle<()>>,
}

/// How the exit-time shutdown sync is confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitPrompt {
    /// Ask on an interactive terminal, run unattended otherwise
    Ask,
    /// Run without asking
    AssumeYes,
}

impl BackupDaemon {
    pub fn new(settings: AppSettings, telemetry: TelemetrySystem) -> Result<Self> {
        info!("Initializing backup sync daemon");
        settings.validate()?;

        let orchestrator = SyncOrchestrator::from_settings(&settings);

        Ok(Self {
            settings,
            orchestrator,
            telemetry,
            tasks: HashMap::new(),
        })
    }

    #[instrument(skip(self), fields(session_id = %self.telemetry.session_id()))]
    pub async fn run(mut self, exit_prompt: ExitPrompt) -> Result<()> {
        info!("Starting backup sync daemon");

        let recorder = self.telemetry.spawn_event_recorder(&self.orchestrator);
        self.tasks.insert("metrics_recorder".to_string(), recorder);

        if self.settings.metrics.enabled {
            let server = self
                .telemetry
                .start_metrics_server(&self.settings.metrics, self.orchestrator.clone())
                .await?;
            self.tasks.insert("metrics_server".to_string(), server);
        }

        let config = self.orchestrator.config();
        if config.sync_on_startup {
            self.run_to_completion(SyncKind::Startup).await;
        } else {
            debug!("Startup sync disabled");
        }

        self.orchestrator.start_auto_sync();
        info!(
            auto_sync = self.orchestrator.auto_sync_active(),
            interval_hours = config.auto_sync_interval_hours,
            "Backup sync daemon started successfully"
        );

        wait_for_shutdown_signal().await;

        self.orchestrator.stop_auto_sync();
        wait_until_idle(&self.orchestrator).await;

        if self.orchestrator.config().sync_on_exit_ask {
            if confirm_shutdown_sync(exit_prompt).await {
                self.run_to_completion(SyncKind::Shutdown).await;
            } else {
                info!("Shutdown sync skipped");
            }
        }

        self.shutdown();
        Ok(())
    }

    async fn run_to_completion(&self, kind: SyncKind) -> Option<SyncResult> {
        match self.orchestrator.run(kind).await {
            Some(result) => {
                if !result.success {
                    warn!(%kind, message = %result.message, "Sync did not succeed");
                }
                Some(result)
            }
            None => {
                warn!(%kind, "Sync skipped, another operation is running");
                None
            }
        }
    }

    fn shutdown(&mut self) {
        for (name, handle) in self.tasks.drain() {
            debug!("Stopping task: {}", name);
            handle.abort();
        }
        info!("Backup sync daemon stopped");
    }
}

/// Let an in-flight auto-sync finish before the shutdown sync.
async fn wait_until_idle(orchestrator: &SyncOrchestrator) {
    // Subscribe before checking so a run finishing in between is not missed.
    let mut events = orchestrator.subscribe();
    if !orchestrator.is_busy() {
        return;
    }
    info!("Waiting for the running sync to finish");
    loop {
        match events.recv().await {
            Ok(SyncEvent::Finished { .. }) | Err(RecvError::Closed) => break,
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {
                if !orchestrator.is_busy() {
                    break;
                }
            }
        }
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Ctrl+C received, shutting down"),
                    _ = terminate.recv() => info!("SIGTERM received, shutting down"),
                }
                return;
            }
            Err(e) => warn!("Could not install SIGTERM handler: {}", e),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl+C received, shutting down"),
        Err(e) => warn!("Could not listen for Ctrl+C: {}", e),
    }
}

async fn confirm_shutdown_sync(prompt: ExitPrompt) -> bool {
    if prompt == ExitPrompt::AssumeYes || !std::io::stdin().is_terminal() {
        return true;
    }

    let answer = tokio::task::spawn_blocking(|| {
        use std::io::Write;
        print!("Back up the database and push before exiting? [Y/n] ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        std::io::stdin().read_line(&mut line).map(|_| line)
    })
    .await;

    match answer {
        Ok(Ok(line)) => parse_answer(&line),
        _ => true,
    }
}

/// Empty input takes the default (yes).
fn parse_answer(line: &str) -> bool {
    !matches!(line.trim().to_lowercase().as_str(), "n" | "no")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_answer() {
        assert!(parse_answer("\n"));
        assert!(parse_answer("y\n"));
        assert!(parse_answer("Yes"));
        assert!(!parse_answer("n\n"));
        assert!(!parse_answer(" NO "));
    }

    #[tokio::test]
    async fn test_assume_yes_never_prompts() {
        assert!(confirm_shutdown_sync(ExitPrompt::AssumeYes).await);
    }

    fn isolated_orchestrator() -> SyncOrchestrator {
        let root = std::env::temp_dir().join(format!("backup-sync-daemon-{}", uuid::Uuid::new_v4()));
        let mut settings = AppSettings::default();
        settings.paths.backup_dir = root.join("backups");
        settings.paths.repo_dir = root.join("repo");
        settings.paths.settings_file = root.join("sync_settings.json");
        settings.paths.env_file = root.join(".env");
        SyncOrchestrator::from_settings(&settings)
    }

    #[tokio::test]
    async fn test_wait_until_idle_returns_when_idle() {
        let orchestrator = isolated_orchestrator();
        tokio::time::timeout(std::time::Duration::from_secs(1), wait_until_idle(&orchestrator))
            .await
            .expect("idle orchestrator does not block");
    }

    #[tokio::test]
    async fn test_wait_until_idle_follows_running_sync() {
        let orchestrator = isolated_orchestrator();
        // The repository directory does not exist, so the pull fails fast.
        let handle = orchestrator.git_pull().expect("run starts");

        tokio::time::timeout(std::time::Duration::from_secs(30), wait_until_idle(&orchestrator))
            .await
            .expect("wait ends with the run");
        assert!(!orchestrator.is_busy());
        assert!(!handle.wait().await.success);
    }
}
