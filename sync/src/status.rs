//! Sync state machine and per-step results

use std::time::Instant;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SyncError};

/// Overall state of the orchestrator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    #[default]
    Idle,
    Syncing,
    Success,
    Error,
    Offline,
    Partial,
}

impl SyncState {
    /// Terminal state for a finished run, derived only from its results.
    pub fn from_results(results: &[SyncResult]) -> Self {
        if results.is_empty() {
            return SyncState::Idle;
        }
        let succeeded = results.iter().filter(|r| r.success).count();
        if succeeded == results.len() {
            SyncState::Success
        } else if succeeded == 0 {
            SyncState::Error
        } else {
            SyncState::Partial
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncState::Idle => write!(f, "idle"),
            SyncState::Syncing => write!(f, "syncing"),
            SyncState::Success => write!(f, "success"),
            SyncState::Error => write!(f, "error"),
            SyncState::Offline => write!(f, "offline"),
            SyncState::Partial => write!(f, "partial"),
        }
    }
}

/// Outcome of one completed step. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub operation: String,
    pub success: bool,
    pub message: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Local>,
}

impl SyncResult {
    pub fn new(
        operation: impl Into<String>,
        success: bool,
        message: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            operation: operation.into(),
            success,
            message: message.into(),
            duration_ms,
            timestamp: Local::now(),
        }
    }

    pub fn success(operation: impl Into<String>, message: impl Into<String>, duration_ms: u64) -> Self {
        Self::new(operation, true, message, duration_ms)
    }

    pub fn failure(operation: impl Into<String>, message: impl Into<String>, duration_ms: u64) -> Self {
        Self::new(operation, false, message, duration_ms)
    }

    /// Emit the result at info level on success, warn otherwise.
    pub fn log(&self) {
        if self.success {
            info!(operation = %self.operation, duration_ms = self.duration_ms, "{}", self.message);
        } else {
            warn!(operation = %self.operation, duration_ms = self.duration_ms, "{}", self.message);
        }
    }

    /// Convert an adapter outcome into a result at the adapter boundary.
    ///
    /// Soft errors become successes carrying the error text, timeouts pin the
    /// duration to the timeout budget, and every other error is truncated.
    pub fn from_outcome(operation: &str, started: Instant, outcome: Result<String>) -> Self {
        let elapsed = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(message) => Self::success(operation, message, elapsed),
            Err(err) if err.is_soft() => Self::success(operation, err.to_string(), elapsed),
            Err(SyncError::Timeout { timeout, .. }) => {
                let err = SyncError::timeout(operation, timeout);
                Self::failure(operation, err.user_message(), timeout.as_millis() as u64)
            }
            Err(err) => Self::failure(operation, err.user_message(), elapsed),
        }
    }
}

/// Aggregate status of the current or most recent run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub current_operation: String,
    pub progress_percent: u8,
    pub progress_message: String,
    pub results: Vec<SyncResult>,
    pub started_at: Option<DateTime<Local>>,
    pub finished_at: Option<DateTime<Local>>,
}

impl SyncStatus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a run: clears prior results and resets progress.
    pub fn start(&mut self, operation: impl Into<String>) {
        self.state = SyncState::Syncing;
        self.current_operation = operation.into();
        self.progress_percent = 0;
        self.progress_message.clear();
        self.results.clear();
        self.started_at = Some(Local::now());
        self.finished_at = None;
    }

    pub fn add_result(&mut self, result: SyncResult) {
        self.results.push(result);
    }

    pub fn set_progress(&mut self, percent: u8, message: impl Into<String>) {
        self.progress_percent = percent.min(100);
        self.progress_message = message.into();
    }

    /// End a run. The only place a terminal state is derived.
    pub fn finish(&mut self) -> SyncState {
        self.state = SyncState::from_results(&self.results);
        self.progress_percent = 100;
        self.finished_at = Some(Local::now());
        self.state
    }

    /// Mark connectivity as unavailable before any attempt is made.
    pub fn set_offline(&mut self) {
        self.state = SyncState::Offline;
    }

    pub fn is_syncing(&self) -> bool {
        self.state == SyncState::Syncing
    }

    pub fn total_duration_ms(&self) -> u64 {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => (end - start).num_milliseconds().max(0) as u64,
            _ => 0,
        }
    }

    pub fn all_success(&self) -> bool {
        !self.results.is_empty() && self.results.iter().all(|r| r.success)
    }

    pub fn has_errors(&self) -> bool {
        self.results.iter().any(|r| !r.success)
    }

    /// First failing step, if any.
    pub fn first_error(&self) -> Option<&SyncResult> {
        self.results.iter().find(|r| !r.success)
    }

    /// Human-readable one-liner keyed off the state.
    pub fn summary(&self) -> String {
        match self.state {
            SyncState::Idle => "Not synced yet".to_string(),
            SyncState::Syncing => format!("Syncing: {}", self.current_operation),
            SyncState::Success => format!("Sync completed ({} ms)", self.total_duration_ms()),
            SyncState::Error => match self.first_error() {
                Some(result) => format!("Sync failed: {}", result.message),
                None => "Sync failed".to_string(),
            },
            SyncState::Offline => "Offline - sync unavailable".to_string(),
            SyncState::Partial => {
                let ok = self.results.iter().filter(|r| r.success).count();
                format!("Partially synced: {}/{} steps succeeded", ok, self.results.len())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use test_case::test_case;

    fn results(flags: &[bool]) -> Vec<SyncResult> {
        flags
            .iter()
            .enumerate()
            .map(|(i, ok)| SyncResult::new(format!("step{}", i), *ok, "", 1))
            .collect()
    }

    #[test_case(&[] => SyncState::Idle; "no results")]
    #[test_case(&[true] => SyncState::Success; "single success")]
    #[test_case(&[true, true, true] => SyncState::Success; "all success")]
    #[test_case(&[true, false] => SyncState::Partial; "mixed")]
    #[test_case(&[false, true, false] => SyncState::Partial; "mixed failure first")]
    #[test_case(&[false] => SyncState::Error; "single failure")]
    #[test_case(&[false, false] => SyncState::Error; "all failed")]
    fn test_finish_derives_state(flags: &[bool]) -> SyncState {
        let mut status = SyncStatus::new();
        status.start("test");
        for result in results(flags) {
            status.add_result(result);
        }
        let state = status.finish();
        assert_eq!(status.state, state);
        assert_eq!(status.progress_percent, 100);
        assert!(status.finished_at.is_some());
        state
    }

    #[test]
    fn test_start_resets_previous_run() {
        let mut status = SyncStatus::new();
        status.start("first");
        status.add_result(SyncResult::failure("backup", "boom", 5));
        status.set_progress(70, "halfway");
        status.finish();

        status.start("second");
        assert!(status.is_syncing());
        assert!(status.results.is_empty());
        assert_eq!(status.progress_percent, 0);
        assert_eq!(status.current_operation, "second");
        assert!(status.finished_at.is_none());
    }

    #[test]
    fn test_offline_is_never_derived() {
        let mut status = SyncStatus::new();
        status.set_offline();
        assert_eq!(status.state, SyncState::Offline);
        assert_eq!(status.summary(), "Offline - sync unavailable");

        status.start("pull");
        assert_ne!(status.finish(), SyncState::Offline);
    }

    #[test]
    fn test_derived_properties() {
        let mut status = SyncStatus::new();
        assert_eq!(status.total_duration_ms(), 0);
        assert!(!status.all_success());

        status.start("shutdown");
        status.add_result(SyncResult::success("backup", "ok", 10));
        status.add_result(SyncResult::failure("push", "rejected", 10));
        status.finish();

        assert!(!status.all_success());
        assert!(status.has_errors());
        assert_eq!(status.first_error().map(|r| r.operation.as_str()), Some("push"));
        assert_eq!(status.summary(), "Partially synced: 1/2 steps succeeded");
    }

    #[test]
    fn test_from_outcome_classification() {
        let started = Instant::now();

        let ok = SyncResult::from_outcome("backup", started, Ok("done".into()));
        assert!(ok.success);

        let soft = SyncResult::from_outcome("restore", started, Err(SyncError::NoBackupAvailable));
        assert!(soft.success);
        assert!(soft.message.contains("No backups"));

        let timeout = SyncResult::from_outcome(
            "backup",
            started,
            Err(SyncError::timeout("pg_dump", Duration::from_secs(15))),
        );
        assert!(!timeout.success);
        assert_eq!(timeout.duration_ms, 15_000);
        assert_eq!(timeout.message, "backup timed out after 15s");

        let long = SyncResult::from_outcome(
            "backup",
            started,
            Err(SyncError::process_error("pg_dump", "x".repeat(500))),
        );
        assert!(!long.success);
        assert!(long.message.chars().count() <= crate::error::MAX_MESSAGE_LEN);
    }
}
