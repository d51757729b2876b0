//! Shared helpers for the test modules

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use tempfile::TempDir;

use crate::catalog::{backup_filename, BackupCatalog, BackupInfo};
use crate::config::ConfigStore;
use crate::database::DatabaseSync;
use crate::orchestrator::SyncOrchestrator;
use crate::settings::{DatabaseTarget, ToolTimeouts};
use crate::vcs::VcsSync;

pub fn timestamp(y: i32, m: u32, d: u32, h: u32, mi: u32, s: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(y, m, d)
        .unwrap()
        .and_hms_opt(h, mi, s)
        .unwrap()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// In-memory backup record, no file behind it
pub fn backup_at(ts: NaiveDateTime) -> BackupInfo {
    BackupInfo::new(PathBuf::from("/backups").join(backup_filename(ts)), ts, 1024)
}

/// Create an empty-ish backup file named for `ts`
pub fn write_backup(dir: &Path, ts: NaiveDateTime) -> PathBuf {
    let path = dir.join(backup_filename(ts));
    std::fs::write(&path, "-- dump\n").unwrap();
    path
}

pub fn short_timeouts() -> ToolTimeouts {
    ToolTimeouts {
        database: Duration::from_secs(5),
        vcs: Duration::from_secs(5),
        vcs_stage: Duration::from_secs(5),
        connection_probe: Duration::from_secs(5),
    }
}

pub const DUMP_OK: &str = r#"
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -f) out="$2"; shift ;;
  esac
  shift
done
printf -- '-- dump\n' > "$out"
if [ -n "$PGPASSWORD" ]; then printf -- '-- password:%s\n' "$PGPASSWORD" >> "$out"; fi
"#;

pub const DUMP_FAIL: &str = r#"
echo "pg_dump: error: connection to server on socket failed" >&2
exit 1
"#;

pub const RESTORE_OK: &str = r#"
echo "$@" > "$(dirname "$0")/psql.args"
"#;

pub const GIT_CLEAN: &str = r#"
echo "$@" >> "$(dirname "$0")/git.log"
case "$1" in
  ls-remote) exit 0 ;;
  pull) echo "Already up to date."; exit 0 ;;
  add) exit 0 ;;
  commit) echo "nothing to commit, working tree clean"; exit 1 ;;
  push) echo "Everything up-to-date" >&2; exit 0 ;;
esac
"#;

pub const GIT_CHANGES: &str = r#"
echo "$@" >> "$(dirname "$0")/git.log"
case "$1" in
  ls-remote) exit 0 ;;
  pull) echo "Updating 1a2b3c..4d5e6f"; echo "Fast-forward"; exit 0 ;;
  add) exit 0 ;;
  commit) echo "[main 4d5e6f] Auto-sync"; exit 0 ;;
  push) echo "To origin" >&2; echo "   1a2b3c..4d5e6f  main -> main" >&2; exit 0 ;;
esac
"#;

pub const GIT_OFFLINE: &str = r#"
echo "$@" >> "$(dirname "$0")/git.log"
echo "fatal: unable to access remote: Could not resolve host" >&2
exit 128
"#;

/// Temp workspace with fake tools, a backup directory and a repo directory
pub struct Fixture {
    pub temp: TempDir,
    pub tools: PathBuf,
    pub backups: PathBuf,
    pub repo: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let tools = temp.path().join("bin");
        let backups = temp.path().join("backups");
        let repo = temp.path().join("repo");
        for dir in [&tools, &backups, &repo] {
            std::fs::create_dir_all(dir).unwrap();
        }
        Self {
            temp,
            tools,
            backups,
            repo,
        }
    }

    /// Install an executable shell script under the tools directory.
    #[cfg(unix)]
    pub fn tool(&self, name: &str, body: &str) -> PathBuf {
        use std::io::Write;
        use std::os::unix::fs::PermissionsExt;

        let path = self.tools.join(name);
        {
            let mut file = std::fs::File::create(&path).unwrap();
            writeln!(file, "#!/bin/sh").unwrap();
            file.write_all(body.as_bytes()).unwrap();
            file.sync_all().unwrap();
        }
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub fn env_file(&self) -> PathBuf {
        self.temp.path().join(".env")
    }

    pub fn settings_file(&self) -> PathBuf {
        self.temp.path().join("sync_settings.json")
    }

    pub fn git_log(&self) -> String {
        std::fs::read_to_string(self.tools.join("git.log")).unwrap_or_default()
    }

    pub fn catalog(&self) -> Arc<BackupCatalog> {
        Arc::new(
            BackupCatalog::new(&self.backups)
                .with_search_dirs(vec![self.tools.clone()])
                .without_system_search(),
        )
    }

    pub fn database(&self, catalog: Arc<BackupCatalog>, timeout: Duration) -> DatabaseSync {
        DatabaseSync::new(catalog, DatabaseTarget::default(), self.env_file(), timeout)
    }

    pub fn vcs(&self, catalog: Arc<BackupCatalog>) -> VcsSync {
        VcsSync::new(catalog, &self.repo, short_timeouts())
    }

    pub fn orchestrator(&self) -> SyncOrchestrator {
        let catalog = self.catalog();
        let database = self.database(Arc::clone(&catalog), Duration::from_secs(5));
        let vcs = self.vcs(catalog);
        SyncOrchestrator::new(database, vcs, ConfigStore::new(self.settings_file()))
    }
}
