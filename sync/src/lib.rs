//! Backup Sync Library
//!
//! Coordinates database backups and restores through the PostgreSQL client
//! tools and repository pull/push through git, providing:
//! - A single-flight orchestrator with weighted progress reporting
//! - A backup catalog with day-based retention thinning
//! - Bounded child-process execution with output classification
//! - Persisted sync settings that degrade to defaults instead of failing

pub mod catalog;
pub mod config;
pub mod credentials;
pub mod database;
pub mod error;
pub mod orchestrator;
pub mod process;
pub mod progress;
pub mod settings;
pub mod status;
pub mod vcs;

// Re-export main types
pub use catalog::{BackupCatalog, BackupInfo, RetentionPlan};
pub use config::{ConfigStore, SyncConfiguration};
pub use database::DatabaseSync;
pub use error::{Result, SyncError};
pub use orchestrator::{SyncEvent, SyncHandle, SyncKind, SyncOrchestrator};
pub use progress::{format_bytes, ProgressChannel, ProgressReporter, ProgressUpdate};
pub use settings::AppSettings;
pub use status::{SyncResult, SyncState, SyncStatus};
pub use vcs::VcsSync;

// Test modules
#[cfg(test)]
mod test_support;
#[cfg(all(test, unix))]
mod adapter_tests;
