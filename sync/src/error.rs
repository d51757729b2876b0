//! Error types for backup and sync operations

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;

/// Longest message an adapter surfaces to callers
pub const MAX_MESSAGE_LEN: usize = 100;

/// Error type shared by the adapters and the orchestrator
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Dump, restore or VCS binary could not be located
    #[error("{tool} not found")]
    ToolNotFound { tool: String },

    /// Child process exceeded its time budget
    #[error("{operation} timed out after {}s", timeout.as_secs())]
    Timeout { operation: String, timeout: Duration },

    /// Nonzero exit code or disqualifying stderr content
    #[error("{operation} failed: {message}")]
    ExternalProcess { operation: String, message: String },

    /// Restore requested with nothing to restore
    #[error("No backups available to restore")]
    NoBackupAvailable,

    /// Selected backup file is gone from disk
    #[error("Backup file not found: {}", .0.display())]
    BackupNotFound(PathBuf),

    /// Settings file unreadable or unwritable
    #[error("Configuration I/O error: {0}")]
    ConfigIo(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Catch-all around adapter calls
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl SyncError {
    /// Create a new external process error
    pub fn process_error(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ExternalProcess {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Create a new tool-not-found error
    pub fn tool_not_found(tool: impl Into<String>) -> Self {
        Self::ToolNotFound { tool: tool.into() }
    }

    /// Soft errors are reported to callers as successful results.
    pub fn is_soft(&self) -> bool {
        matches!(self, Self::NoBackupAvailable)
    }

    /// Message suitable for a `SyncResult`, bounded to [`MAX_MESSAGE_LEN`].
    pub fn user_message(&self) -> String {
        truncate_message(&self.to_string(), MAX_MESSAGE_LEN)
    }
}

/// Trim `message` and cut it to at most `max` characters.
pub fn truncate_message(message: &str, max: usize) -> String {
    let trimmed = message.trim();
    match trimmed.char_indices().nth(max) {
        Some((idx, _)) => trimmed[..idx].to_string(),
        None => trimmed.to_string(),
    }
}
