//! Database and VCS adapter tests against scripted stand-ins for the tools

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serial_test::serial;

    use crate::catalog::BackupInfo;
    use crate::progress::{ProgressChannel, ProgressReporter};
    use crate::test_support::*;
    use crate::vcs::{MSG_NOTHING_TO_PUSH, MSG_PULLED, MSG_PUSHED, MSG_UP_TO_DATE};

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    #[serial]
    async fn test_backup_creates_file_with_password_from_env() {
        let fixture = Fixture::new();
        fixture.tool("pg_dump", DUMP_OK);
        std::fs::write(fixture.env_file(), "# local\nDB_PASSWORD=\"s3cret\"\n").unwrap();
        let catalog = fixture.catalog();
        let database = fixture.database(Arc::clone(&catalog), TIMEOUT);

        let result = database.backup(&ProgressReporter::silent()).await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.operation, "backup");
        assert!(result.message.starts_with("Backup created: backup_"));

        let backups = catalog.list_backups();
        assert_eq!(backups.len(), 1);
        let content = std::fs::read_to_string(&backups[0].filepath).unwrap();
        assert!(content.contains("password:s3cret"));
    }

    #[tokio::test]
    #[serial]
    async fn test_backup_progress_is_monotonic_and_completes() {
        let fixture = Fixture::new();
        fixture.tool("pg_dump", DUMP_OK);
        let database = fixture.database(fixture.catalog(), TIMEOUT);

        let (reporter, mut channel) = ProgressChannel::new();
        let result = database.backup(&reporter).await;
        drop(reporter);
        assert!(result.success);

        let mut percents = Vec::new();
        while let Some(update) = channel.recv().await {
            percents.push(update.percent);
        }
        assert!(percents.windows(2).all(|w| w[0] <= w[1]), "{:?}", percents);
        assert_eq!(percents.last(), Some(&100));
    }

    #[tokio::test]
    #[serial]
    async fn test_backup_failure_removes_partial_file() {
        let fixture = Fixture::new();
        fixture.tool("pg_dump", DUMP_FAIL);
        let catalog = fixture.catalog();
        let database = fixture.database(Arc::clone(&catalog), TIMEOUT);

        let result = database.backup(&ProgressReporter::silent()).await;
        assert!(!result.success);
        assert!(result.message.contains("connection to server"), "{}", result.message);
        assert!(catalog.list_backups().is_empty());
    }

    #[tokio::test]
    #[serial]
    async fn test_backup_timeout() {
        let fixture = Fixture::new();
        fixture.tool(
            "pg_dump",
            r#"
for arg in "$@"; do out="$arg"; done
printf -- '-- partial\n' > "$out"
exec sleep 10
"#,
        );
        let catalog = fixture.catalog();
        let database = fixture.database(Arc::clone(&catalog), Duration::from_secs(1));

        let result = database.backup(&ProgressReporter::silent()).await;
        assert!(!result.success);
        assert_eq!(result.message, "backup timed out after 1s");
        assert_eq!(result.duration_ms, 1000);
        assert!(catalog.list_backups().is_empty());
    }

    #[tokio::test]
    async fn test_backup_without_tool() {
        let fixture = Fixture::new();
        let database = fixture.database(fixture.catalog(), TIMEOUT);

        let result = database.backup(&ProgressReporter::silent()).await;
        assert!(!result.success);
        assert_eq!(result.message, "pg_dump not found");
    }

    #[tokio::test]
    #[serial]
    async fn test_restore_without_backups_is_soft_success() {
        let fixture = Fixture::new();
        fixture.tool("psql", RESTORE_OK);
        let database = fixture.database(fixture.catalog(), TIMEOUT);

        let (reporter, mut channel) = ProgressChannel::new();
        let result = database.quick_restore(&reporter).await;
        drop(reporter);
        assert!(result.success);
        assert_eq!(result.operation, "restore");
        assert_eq!(result.message, "No backups available to restore");

        let mut last = None;
        while let Some(update) = channel.recv().await {
            last = Some(update.percent);
        }
        assert_eq!(last, Some(100));
    }

    #[tokio::test]
    #[serial]
    async fn test_quick_restore_uses_latest_backup() {
        let fixture = Fixture::new();
        fixture.tool("psql", RESTORE_OK);
        write_backup(&fixture.backups, timestamp(2024, 1, 1, 9, 0, 0));
        write_backup(&fixture.backups, timestamp(2024, 1, 2, 9, 0, 0));
        let database = fixture.database(fixture.catalog(), TIMEOUT);

        let result = database.quick_restore(&ProgressReporter::silent()).await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.message, "Restored backup_2024-01-02_09-00-00.sql");

        let args = std::fs::read_to_string(fixture.tools.join("psql.args")).unwrap();
        assert!(args.contains("-q"));
        assert!(args.contains("backup_2024-01-02_09-00-00.sql"));
        assert!(args.contains("-d business"));
    }

    #[tokio::test]
    #[serial]
    async fn test_restore_tolerates_benign_diagnostics() {
        let fixture = Fixture::new();
        fixture.tool(
            "psql",
            r#"
echo 'psql:backup.sql:3: NOTICE:  table "orders" does not exist, skipping' >&2
echo 'psql:backup.sql:9: ERROR:  relation "orders" already exists' >&2
exit 3
"#,
        );
        write_backup(&fixture.backups, timestamp(2024, 1, 1, 9, 0, 0));
        let database = fixture.database(fixture.catalog(), TIMEOUT);

        let result = database.quick_restore(&ProgressReporter::silent()).await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.message, "Restored backup_2024-01-01_09-00-00.sql (2 warnings)");
    }

    #[tokio::test]
    #[serial]
    async fn test_restore_reports_genuine_errors() {
        let fixture = Fixture::new();
        fixture.tool(
            "psql",
            r#"
echo 'psql:backup.sql:40: ERROR:  permission denied for schema public' >&2
exit 3
"#,
        );
        write_backup(&fixture.backups, timestamp(2024, 1, 1, 9, 0, 0));
        let database = fixture.database(fixture.catalog(), TIMEOUT);

        let result = database.quick_restore(&ProgressReporter::silent()).await;
        assert!(!result.success);
        assert!(result.message.starts_with("psql failed: "));
        assert!(result.message.contains("permission denied"));
    }

    #[tokio::test]
    #[serial]
    async fn test_restore_explicit_missing_file() {
        let fixture = Fixture::new();
        fixture.tool("psql", RESTORE_OK);
        let database = fixture.database(fixture.catalog(), TIMEOUT);
        let missing = BackupInfo::new(
            fixture.backups.join("backup_2024-01-01_09-00-00.sql"),
            timestamp(2024, 1, 1, 9, 0, 0),
            0,
        );

        let result = database.restore(Some(missing), &ProgressReporter::silent()).await;
        assert!(!result.success);
        assert!(result.message.starts_with("Backup file not found"));
        assert!(!fixture.tools.join("psql.args").exists());
    }

    #[tokio::test]
    #[serial]
    async fn test_pull_up_to_date() {
        let fixture = Fixture::new();
        fixture.tool("git", GIT_CLEAN);
        let vcs = fixture.vcs(fixture.catalog());

        let result = vcs.pull(&ProgressReporter::silent()).await;
        assert!(result.success);
        assert_eq!(result.operation, "pull");
        assert_eq!(result.message, MSG_UP_TO_DATE);
    }

    #[tokio::test]
    #[serial]
    async fn test_pull_with_changes() {
        let fixture = Fixture::new();
        fixture.tool("git", GIT_CHANGES);
        let vcs = fixture.vcs(fixture.catalog());

        let result = vcs.pull(&ProgressReporter::silent()).await;
        assert!(result.success);
        assert_eq!(result.message, MSG_PULLED);
    }

    #[tokio::test]
    #[serial]
    async fn test_push_with_nothing_to_commit_still_succeeds() {
        let fixture = Fixture::new();
        fixture.tool("git", GIT_CLEAN);
        let vcs = fixture.vcs(fixture.catalog());

        let result = vcs.push(&ProgressReporter::silent()).await;
        assert!(result.success, "{}", result.message);
        assert_eq!(result.message, MSG_NOTHING_TO_PUSH);

        let log = fixture.git_log();
        let commands: Vec<&str> = log.lines().collect();
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0], "add --all");
        assert!(commands[1].starts_with("commit -m Auto-sync: "));
        assert_eq!(commands[2], "push");
    }

    #[tokio::test]
    #[serial]
    async fn test_push_with_changes() {
        let fixture = Fixture::new();
        fixture.tool("git", GIT_CHANGES);
        let vcs = fixture.vcs(fixture.catalog());

        let result = vcs.push(&ProgressReporter::silent()).await;
        assert!(result.success);
        assert_eq!(result.message, MSG_PUSHED);
    }

    #[tokio::test]
    #[serial]
    async fn test_push_failure_and_offline_check() {
        let fixture = Fixture::new();
        fixture.tool("git", GIT_OFFLINE);
        let vcs = fixture.vcs(fixture.catalog());

        assert!(!vcs.check_connection().await);
        let result = vcs.push(&ProgressReporter::silent()).await;
        assert!(!result.success);
        assert!(result.message.starts_with("git push failed: "));
        assert!(result.message.contains("Could not resolve host"));
    }

    #[tokio::test]
    #[serial]
    async fn test_connection_check_runs_in_repo() {
        let fixture = Fixture::new();
        fixture.tool(
            "git",
            r#"
pwd > "$(dirname "$0")/git.cwd"
[ "$GIT_TERMINAL_PROMPT" = "0" ] || exit 1
exit 0
"#,
        );
        let vcs = fixture.vcs(fixture.catalog());

        assert!(vcs.check_connection().await);
        let cwd = std::fs::read_to_string(fixture.tools.join("git.cwd")).unwrap();
        let expected = fixture.repo.canonicalize().unwrap();
        assert_eq!(std::path::Path::new(cwd.trim()).canonicalize().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_missing_git() {
        let fixture = Fixture::new();
        let vcs = fixture.vcs(fixture.catalog());

        assert!(!vcs.check_connection().await);
        let result = vcs.pull(&ProgressReporter::silent()).await;
        assert!(!result.success);
        assert_eq!(result.message, "git not found");
    }
}
