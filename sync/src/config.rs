//! Persisted sync settings
//!
//! A flat JSON record holding the user-facing sync switches plus last-run
//! bookkeeping. Reading never fails: missing keys, unknown keys and values of
//! the wrong type all fall back to the defaults below. Writing reports a
//! boolean instead of an error.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Result, SyncError};

pub const DEFAULT_AUTO_SYNC_INTERVAL_HOURS: u32 = 2;
pub const DEFAULT_BACKUP_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfiguration {
    pub sync_on_startup: bool,
    pub sync_on_exit_ask: bool,
    pub auto_sync_enabled: bool,
    pub auto_sync_interval_hours: u32,
    pub last_sync_time: String,
    pub last_sync_type: String,
    pub backup_retention_days: u32,
}

impl Default for SyncConfiguration {
    fn default() -> Self {
        Self {
            sync_on_startup: true,
            sync_on_exit_ask: true,
            auto_sync_enabled: false,
            auto_sync_interval_hours: DEFAULT_AUTO_SYNC_INTERVAL_HOURS,
            last_sync_time: String::new(),
            last_sync_type: String::new(),
            backup_retention_days: DEFAULT_BACKUP_RETENTION_DAYS,
        }
    }
}

impl SyncConfiguration {
    /// Build a configuration from an arbitrary JSON value, key by key.
    ///
    /// Each known key is taken from `value` only if it deserializes on its own;
    /// anything else keeps its default.
    pub fn from_value(value: &Value) -> Self {
        let defaults = Self::default();
        let Some(incoming) = value.as_object() else {
            return defaults;
        };
        let mut merged = match serde_json::to_value(&defaults) {
            Ok(Value::Object(map)) => map,
            _ => return defaults,
        };

        let known: Vec<String> = merged.keys().cloned().collect();
        for key in known {
            if let Some(candidate) = incoming.get(&key) {
                let mut trial = merged.clone();
                trial.insert(key.clone(), candidate.clone());
                if serde_json::from_value::<Self>(Value::Object(trial)).is_ok() {
                    merged.insert(key, candidate.clone());
                } else {
                    debug!(key = %key, "Ignoring malformed setting");
                }
            }
        }

        serde_json::from_value(Value::Object(merged)).unwrap_or(defaults)
    }
}

/// File-backed store for [`SyncConfiguration`]
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings, returning defaults on any read or parse error.
    pub fn load(&self) -> SyncConfiguration {
        match self.read_value() {
            Ok(Some(value)) => SyncConfiguration::from_value(&value),
            Ok(None) => SyncConfiguration::default(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read sync settings, using defaults");
                SyncConfiguration::default()
            }
        }
    }

    /// Persist the full record. Returns `false` on failure.
    pub fn save(&self, config: &SyncConfiguration) -> bool {
        match self.write(config) {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to save sync settings");
                false
            }
        }
    }

    /// Read a single setting by key.
    pub fn get(&self, key: &str) -> Option<Value> {
        match serde_json::to_value(self.load()) {
            Ok(Value::Object(map)) => map.get(key).cloned(),
            _ => None,
        }
    }

    /// Update a single setting and persist. Unknown keys and ill-typed values
    /// are rejected with `false`.
    pub fn set(&self, key: &str, value: Value) -> bool {
        let current = self.load();
        let mut map = match serde_json::to_value(&current) {
            Ok(Value::Object(map)) => map,
            _ => return false,
        };
        if !map.contains_key(key) {
            warn!(key, "Unknown sync setting");
            return false;
        }
        map.insert(key.to_string(), value);
        match serde_json::from_value::<SyncConfiguration>(Value::Object(map)) {
            Ok(updated) => self.save(&updated),
            Err(e) => {
                warn!(key, error = %e, "Rejected sync setting");
                false
            }
        }
    }

    fn read_value(&self) -> Result<Option<Value>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let value: Value = serde_json::from_str(&content)?;
        Ok(Some(value))
    }

    fn write(&self, config: &SyncConfiguration) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SyncError::ConfigIo(format!("{}: {}", parent.display(), e)))?;
            }
        }
        let content = serde_json::to_string_pretty(config)?;
        std::fs::write(&self.path, content)
            .map_err(|e| SyncError::ConfigIo(format!("{}: {}", self.path.display(), e)))?;
        Ok(())
    }
}

/// Parse a command-line style value into JSON: booleans and integers are
/// recognised, everything else is kept as a string.
pub fn parse_setting_value(raw: &str) -> Value {
    if let Ok(b) = raw.parse::<bool>() {
        return Value::Bool(b);
    }
    if let Ok(n) = raw.parse::<u64>() {
        return Value::from(n);
    }
    Value::String(raw.to_string())
}

/// Keys accepted by [`ConfigStore::set`].
pub fn setting_keys() -> Vec<String> {
    match serde_json::to_value(SyncConfiguration::default()) {
        Ok(Value::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, ConfigStore) {
        let temp = TempDir::new().unwrap();
        let store = ConfigStore::new(temp.path().join("sync_settings.json"));
        (temp, store)
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let (_temp, store) = store();
        let config = store.load();
        assert_eq!(config, SyncConfiguration::default());
        assert_eq!(config.auto_sync_interval_hours, 2);
        assert_eq!(config.backup_retention_days, 30);
    }

    #[test]
    fn test_malformed_file_yields_defaults() {
        let (_temp, store) = store();
        std::fs::write(store.path(), "{ not json").unwrap();
        assert_eq!(store.load(), SyncConfiguration::default());
    }

    #[test]
    fn test_partial_and_ill_typed_keys_merge_with_defaults() {
        let (_temp, store) = store();
        let raw = json!({
            "auto_sync_enabled": true,
            "auto_sync_interval_hours": "six",
            "backup_retention_days": 14,
            "unknown_key": 42
        });
        std::fs::write(store.path(), raw.to_string()).unwrap();

        let config = store.load();
        assert!(config.auto_sync_enabled);
        assert_eq!(config.auto_sync_interval_hours, DEFAULT_AUTO_SYNC_INTERVAL_HOURS);
        assert_eq!(config.backup_retention_days, 14);
        assert!(config.sync_on_startup);
    }

    #[test]
    fn test_save_then_load() {
        let (_temp, store) = store();
        let config = SyncConfiguration {
            last_sync_time: "2024-01-10 12:00:00".into(),
            last_sync_type: "shutdown".into(),
            ..Default::default()
        };
        assert!(store.save(&config));
        assert_eq!(store.load(), config);
    }

    #[test]
    fn test_save_failure_reports_false() {
        let temp = TempDir::new().unwrap();
        // The parent "directory" is a regular file.
        let blocker = temp.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let store = ConfigStore::new(blocker.join("sync_settings.json"));
        assert!(!store.save(&SyncConfiguration::default()));
    }

    #[test]
    fn test_get_and_set() {
        let (_temp, store) = store();
        assert_eq!(store.get("auto_sync_interval_hours"), Some(json!(2)));

        assert!(store.set("auto_sync_interval_hours", json!(6)));
        assert_eq!(store.load().auto_sync_interval_hours, 6);

        assert!(!store.set("auto_sync_interval_hours", json!("soon")));
        assert!(!store.set("no_such_key", json!(true)));
        assert_eq!(store.get("no_such_key"), None);
    }

    #[test]
    fn test_parse_setting_value() {
        assert_eq!(parse_setting_value("true"), json!(true));
        assert_eq!(parse_setting_value("12"), json!(12));
        assert_eq!(parse_setting_value("db_only"), json!("db_only"));
    }
}
