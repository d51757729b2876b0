//! Backup file catalog
//!
//! Backups live in a single directory and are named
//! `backup_<YYYY-MM-DD_HH-MM-SS>.sql`, optionally with a `_migrated` suffix
//! before the extension for files carried over from an older layout. The
//! timestamp format sorts lexically in chronological order, so the filename
//! is the only metadata a backup needs.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::progress::format_bytes;

pub const BACKUP_PREFIX: &str = "backup_";
pub const BACKUP_EXTENSION: &str = ".sql";
pub const MIGRATED_SUFFIX: &str = "_migrated";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Backups up to this many days old are never thinned.
pub const GRACE_PERIOD_DAYS: i64 = 7;

/// PostgreSQL major versions probed in installation directories, newest first.
const PG_VERSIONS: &[u32] = &[17, 16, 15, 14, 13, 12];

/// Read-only view over one backup file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupInfo {
    pub filepath: PathBuf,
    pub filename: String,
    pub timestamp: NaiveDateTime,
    pub size_bytes: u64,
}

impl BackupInfo {
    pub fn new(filepath: impl Into<PathBuf>, timestamp: NaiveDateTime, size_bytes: u64) -> Self {
        let filepath = filepath.into();
        let filename = filepath
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            filepath,
            filename,
            timestamp,
            size_bytes,
        }
    }

    /// Build from a file on disk; `None` if the name is not a backup name.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let (timestamp, _) = parse_backup_filename(name)?;
        let size_bytes = std::fs::metadata(path).ok()?.len();
        Some(Self::new(path, timestamp, size_bytes))
    }

    pub fn date(&self) -> NaiveDate {
        self.timestamp.date()
    }

    pub fn is_migrated(&self) -> bool {
        parse_backup_filename(&self.filename)
            .map(|(_, migrated)| migrated)
            .unwrap_or(false)
    }

    pub fn size_human(&self) -> String {
        format_bytes(self.size_bytes)
    }
}

/// Filename for a backup taken at `timestamp`.
pub fn backup_filename(timestamp: NaiveDateTime) -> String {
    format!(
        "{}{}{}",
        BACKUP_PREFIX,
        timestamp.format(TIMESTAMP_FORMAT),
        BACKUP_EXTENSION
    )
}

/// Parse a backup filename into its timestamp and whether it carries the
/// migrated suffix.
pub fn parse_backup_filename(name: &str) -> Option<(NaiveDateTime, bool)> {
    let stem = name.strip_prefix(BACKUP_PREFIX)?.strip_suffix(BACKUP_EXTENSION)?;
    let (stamp, migrated) = match stem.strip_suffix(MIGRATED_SUFFIX) {
        Some(stamp) => (stamp, true),
        None => (stem, false),
    };
    let timestamp = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    Some((timestamp, migrated))
}

/// Which backups survive a retention pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    pub keep: Vec<BackupInfo>,
    pub delete: Vec<BackupInfo>,
}

/// Decide which backups to delete.
///
/// Backups are grouped by calendar day. Days within the grace period keep
/// everything, days within `retention_days` keep only their most recent
/// backup, and older days keep nothing.
pub fn plan_retention(backups: &[BackupInfo], retention_days: u32, today: NaiveDate) -> RetentionPlan {
    let mut by_day: BTreeMap<NaiveDate, Vec<&BackupInfo>> = BTreeMap::new();
    for backup in backups {
        by_day.entry(backup.date()).or_default().push(backup);
    }

    let mut plan = RetentionPlan::default();
    for (day, mut group) in by_day {
        group.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.filename.cmp(&a.filename)));
        let age_days = (today - day).num_days();

        if age_days <= GRACE_PERIOD_DAYS {
            plan.keep.extend(group.into_iter().cloned());
        } else if age_days <= i64::from(retention_days) {
            let mut group = group.into_iter();
            if let Some(newest) = group.next() {
                plan.keep.push(newest.clone());
            }
            plan.delete.extend(group.cloned());
        } else {
            plan.delete.extend(group.into_iter().cloned());
        }
    }
    plan
}

/// Enumerates, prunes and locates tooling for backups in one directory
#[derive(Debug)]
pub struct BackupCatalog {
    backup_dir: PathBuf,
    search_dirs: Vec<PathBuf>,
    search_system: bool,
    tool_cache: Mutex<HashMap<String, PathBuf>>,
}

impl BackupCatalog {
    pub fn new(backup_dir: impl Into<PathBuf>) -> Self {
        Self {
            backup_dir: backup_dir.into(),
            search_dirs: Vec::new(),
            search_system: true,
            tool_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Directories probed before any well-known installation path.
    pub fn with_search_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.search_dirs = dirs;
        self
    }

    /// Only probe the configured search directories.
    pub fn without_system_search(mut self) -> Self {
        self.search_system = false;
        self
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    pub fn ensure_backup_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.backup_dir)
    }

    /// Destination path for a new backup stamped with the current time.
    pub fn generate_backup_path(&self) -> PathBuf {
        self.backup_path_for(Local::now().naive_local())
    }

    pub fn backup_path_for(&self, timestamp: NaiveDateTime) -> PathBuf {
        self.backup_dir.join(backup_filename(timestamp))
    }

    /// All parseable backups, newest first. Unparseable names are skipped.
    pub fn list_backups(&self) -> Vec<BackupInfo> {
        let entries = match std::fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %self.backup_dir.display(), error = %e, "Backup directory not readable");
                return Vec::new();
            }
        };

        let mut backups: Vec<BackupInfo> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| BackupInfo::from_path(&entry.path()))
            .collect();

        backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.filename.cmp(&a.filename)));
        backups
    }

    pub fn get_latest_backup(&self) -> Option<BackupInfo> {
        self.list_backups().into_iter().next()
    }

    pub fn get_backup_by_filename(&self, filename: &str) -> Option<BackupInfo> {
        self.list_backups().into_iter().find(|b| b.filename == filename)
    }

    pub fn total_size(&self) -> u64 {
        self.list_backups().iter().map(|b| b.size_bytes).sum()
    }

    /// Delete one backup by name. Names that are not backups are refused.
    pub fn delete_backup(&self, filename: &str) -> bool {
        let Some(backup) = self.get_backup_by_filename(filename) else {
            return false;
        };
        match std::fs::remove_file(&backup.filepath) {
            Ok(()) => {
                info!(file = %backup.filename, "Deleted backup");
                true
            }
            Err(e) => {
                warn!(file = %backup.filename, error = %e, "Failed to delete backup");
                false
            }
        }
    }

    /// Apply the retention policy relative to today. Returns `(deleted, kept)`.
    pub fn cleanup_old_backups(&self, retention_days: u32) -> (usize, usize) {
        self.cleanup_old_backups_at(retention_days, Local::now().date_naive())
    }

    /// Apply the retention policy relative to `today`. Deletion is best-effort:
    /// a file that cannot be removed is neither counted as deleted nor kept.
    pub fn cleanup_old_backups_at(&self, retention_days: u32, today: NaiveDate) -> (usize, usize) {
        let backups = self.list_backups();
        let plan = plan_retention(&backups, retention_days, today);

        let mut deleted = 0;
        for backup in &plan.delete {
            match std::fs::remove_file(&backup.filepath) {
                Ok(()) => {
                    debug!(file = %backup.filename, "Removed expired backup");
                    deleted += 1;
                }
                Err(e) => warn!(file = %backup.filename, error = %e, "Could not remove expired backup"),
            }
        }

        if deleted > 0 {
            info!(deleted, kept = plan.keep.len(), retention_days, "Backup retention applied");
        }
        (deleted, plan.keep.len())
    }

    /// Locate a PostgreSQL client tool, caching the first hit per name.
    pub fn find_pg_tool(&self, name: &str) -> Option<PathBuf> {
        self.resolve(name, true)
    }

    /// Locate any executable via the search directories and PATH.
    pub fn find_tool(&self, name: &str) -> Option<PathBuf> {
        self.resolve(name, false)
    }

    fn resolve(&self, name: &str, probe_pg_dirs: bool) -> Option<PathBuf> {
        if let Some(path) = self.tool_cache.lock().get(name) {
            return Some(path.clone());
        }

        let file_name = format!("{}{}", name, std::env::consts::EXE_SUFFIX);
        let mut candidates = self.search_dirs.clone();
        if self.search_system && probe_pg_dirs {
            candidates.extend(pg_install_dirs());
        }

        let found = candidates
            .into_iter()
            .map(|dir| dir.join(&file_name))
            .find(|path| path.is_file())
            .or_else(|| {
                if self.search_system {
                    which::which(name).ok()
                } else {
                    None
                }
            });

        match &found {
            Some(path) => {
                debug!(tool = name, path = %path.display(), "Resolved tool");
                self.tool_cache.lock().insert(name.to_string(), path.clone());
            }
            None => warn!(tool = name, "Tool not found"),
        }
        found
    }
}

/// Well-known PostgreSQL binary directories, newest version first.
fn pg_install_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    for version in PG_VERSIONS {
        if cfg!(windows) {
            dirs.push(PathBuf::from(format!(r"C:\Program Files\PostgreSQL\{}\bin", version)));
            dirs.push(PathBuf::from(format!(r"C:\Program Files (x86)\PostgreSQL\{}\bin", version)));
        } else if cfg!(target_os = "macos") {
            dirs.push(PathBuf::from(format!("/opt/homebrew/opt/postgresql@{}/bin", version)));
            dirs.push(PathBuf::from(format!("/usr/local/opt/postgresql@{}/bin", version)));
            dirs.push(PathBuf::from(format!(
                "/Applications/Postgres.app/Contents/Versions/{}/bin",
                version
            )));
        } else {
            dirs.push(PathBuf::from(format!("/usr/lib/postgresql/{}/bin", version)));
            dirs.push(PathBuf::from(format!("/usr/pgsql-{}/bin", version)));
        }
    }
    dirs
}
