//! Single-flight orchestration of database and repository syncs
//!
//! One [`SyncOrchestrator`] is built at process start and cloned into every
//! caller. It owns the only [`SyncStatus`], guarantees that at most one
//! operation runs at a time, and composes the database and VCS adapters into
//! the five [`SyncKind`]s. Each run streams [`SyncEvent`]s both to the caller
//! that started it (through its [`SyncHandle`]) and to every process-wide
//! subscriber.

use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::Local;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::catalog::BackupCatalog;
use crate::config::{ConfigStore, SyncConfiguration};
use crate::database::DatabaseSync;
use crate::error::{truncate_message, MAX_MESSAGE_LEN};
use crate::progress::{ProgressChannel, ProgressReporter};
use crate::settings::AppSettings;
use crate::status::{SyncResult, SyncState, SyncStatus};
use crate::vcs::VcsSync;

const EVENT_BUFFER: usize = 256;
const SECONDS_PER_HOUR: u64 = 3600;

/// The operations the orchestrator knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncKind {
    /// Restore the latest backup
    Startup,
    /// Backup, then push; both must succeed
    Shutdown,
    /// Backup, then an ungated push
    DbOnly,
    GitPull,
    GitPush,
}

impl SyncKind {
    pub const ALL: [SyncKind; 5] = [
        SyncKind::Startup,
        SyncKind::Shutdown,
        SyncKind::DbOnly,
        SyncKind::GitPull,
        SyncKind::GitPush,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SyncKind::Startup => "startup",
            SyncKind::Shutdown => "shutdown",
            SyncKind::DbOnly => "db_only",
            SyncKind::GitPull => "git_pull",
            SyncKind::GitPush => "git_push",
        }
    }
}

impl std::fmt::Display for SyncKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SyncKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown sync kind '{}'", s))
    }
}

/// Lifecycle notifications for one run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    Started {
        run_id: Uuid,
        kind: SyncKind,
    },
    Progress {
        run_id: Uuid,
        kind: SyncKind,
        percent: u8,
        message: String,
    },
    Finished {
        run_id: Uuid,
        kind: SyncKind,
        state: SyncState,
        result: SyncResult,
    },
}

impl SyncEvent {
    pub fn run_id(&self) -> Uuid {
        match self {
            SyncEvent::Started { run_id, .. }
            | SyncEvent::Progress { run_id, .. }
            | SyncEvent::Finished { run_id, .. } => *run_id,
        }
    }

    pub fn kind(&self) -> SyncKind {
        match self {
            SyncEvent::Started { kind, .. }
            | SyncEvent::Progress { kind, .. }
            | SyncEvent::Finished { kind, .. } => *kind,
        }
    }
}

/// Caller-side view of a dispatched run
#[derive(Debug)]
pub struct SyncHandle {
    run_id: Uuid,
    kind: SyncKind,
    events: mpsc::UnboundedReceiver<SyncEvent>,
    join: JoinHandle<SyncResult>,
}

impl SyncHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn kind(&self) -> SyncKind {
        self.kind
    }

    /// Next event of this run; `None` after `Finished` has been delivered.
    pub async fn next_event(&mut self) -> Option<SyncEvent> {
        self.events.recv().await
    }

    /// Wait for the run to complete.
    pub async fn wait(self) -> SyncResult {
        match self.join.await {
            Ok(result) => result,
            Err(e) => SyncResult::failure(
                self.kind.as_str(),
                truncate_message(&format!("Unexpected error: {}", e), MAX_MESSAGE_LEN),
                0,
            ),
        }
    }
}

struct Inner {
    database: DatabaseSync,
    vcs: VcsSync,
    store: ConfigStore,
    config: RwLock<SyncConfiguration>,
    status: RwLock<SyncStatus>,
    busy: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
    auto_sync: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = self.auto_sync.get_mut().take() {
            handle.abort();
        }
    }
}

/// Releases the single-flight slot, including when a worker panics.
struct BusyGuard(Arc<Inner>);

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.0.busy.store(false, Ordering::SeqCst);
    }
}

/// Long-lived sync service; clones share one instance.
#[derive(Clone)]
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("busy", &self.is_busy())
            .field("state", &self.inner.status.read().state)
            .finish()
    }
}

impl SyncOrchestrator {
    /// Build the service; settings are loaded from `store` immediately.
    pub fn new(database: DatabaseSync, vcs: VcsSync, store: ConfigStore) -> Self {
        let config = store.load();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        info!(settings = %store.path().display(), "Sync orchestrator initialised");
        Self {
            inner: Arc::new(Inner {
                database,
                vcs,
                store,
                config: RwLock::new(config),
                status: RwLock::new(SyncStatus::new()),
                busy: AtomicBool::new(false),
                events,
                auto_sync: Mutex::new(None),
            }),
        }
    }

    /// Wire the catalog and both adapters from host settings.
    pub fn from_settings(settings: &AppSettings) -> Self {
        let catalog = Arc::new(
            BackupCatalog::new(&settings.paths.backup_dir).with_search_dirs(settings.paths.tool_dirs.clone()),
        );
        let database = DatabaseSync::from_settings(settings, Arc::clone(&catalog));
        let vcs = VcsSync::from_settings(settings, catalog);
        let store = ConfigStore::new(&settings.paths.settings_file);
        Self::new(database, vcs, store)
    }

    pub fn catalog(&self) -> &Arc<BackupCatalog> {
        self.inner.database.catalog()
    }

    pub fn database(&self) -> &DatabaseSync {
        &self.inner.database
    }

    pub fn vcs(&self) -> &VcsSync {
        &self.inner.vcs
    }

    /// Process-wide event stream covering every run.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn status(&self) -> SyncStatus {
        self.inner.status.read().clone()
    }

    pub fn config(&self) -> SyncConfiguration {
        self.inner.config.read().clone()
    }

    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::SeqCst)
    }

    /// Record that connectivity is unavailable. Ignored while a run is active.
    pub fn mark_offline(&self) {
        if !self.is_busy() {
            self.inner.status.write().set_offline();
        }
    }

    /// Mutate and persist the settings. Auto-sync is restarted when its
    /// switch or interval changed. Returns whether the save succeeded.
    pub fn update_config(&self, update: impl FnOnce(&mut SyncConfiguration)) -> bool {
        let (saved, reschedule) = {
            let mut config = self.inner.config.write();
            let before = (config.auto_sync_enabled, config.auto_sync_interval_hours);
            update(&mut config);
            let after = (config.auto_sync_enabled, config.auto_sync_interval_hours);
            (self.inner.store.save(&config), before != after)
        };
        if reschedule {
            self.start_auto_sync();
        }
        saved
    }

    /// Dispatch `kind` on a background worker.
    ///
    /// Returns `None` without touching any state if a run is already in
    /// flight or no tokio runtime is available.
    pub fn start(&self, kind: SyncKind) -> Option<SyncHandle> {
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(%kind, "No async runtime available, sync not started");
            return None;
        }
        if self
            .inner
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!(%kind, "Sync already in progress, ignoring request");
            return None;
        }

        self.inner.status.write().start(kind.as_str());
        let run_id = Uuid::new_v4();
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let guard = BusyGuard(Arc::clone(&self.inner));
        let join = tokio::spawn(run_worker(guard, kind, run_id, op_tx));

        Some(SyncHandle {
            run_id,
            kind,
            events: op_rx,
            join,
        })
    }

    /// Dispatch `kind` and wait for it. `None` if a run was already active.
    pub async fn run(&self, kind: SyncKind) -> Option<SyncResult> {
        match self.start(kind) {
            Some(handle) => Some(handle.wait().await),
            None => None,
        }
    }

    pub fn startup_sync(&self) -> Option<SyncHandle> {
        self.start(SyncKind::Startup)
    }

    pub fn shutdown_sync(&self) -> Option<SyncHandle> {
        self.start(SyncKind::Shutdown)
    }

    pub fn db_only_sync(&self) -> Option<SyncHandle> {
        self.start(SyncKind::DbOnly)
    }

    pub fn git_pull(&self) -> Option<SyncHandle> {
        self.start(SyncKind::GitPull)
    }

    pub fn git_push(&self) -> Option<SyncHandle> {
        self.start(SyncKind::GitPush)
    }

    /// (Re)arm the auto-sync timer from the current settings.
    pub fn start_auto_sync(&self) {
        self.stop_auto_sync();
        let config = self.config();
        if !config.auto_sync_enabled {
            debug!("Auto-sync disabled");
            return;
        }
        let hours = u64::from(config.auto_sync_interval_hours.max(1));
        self.start_auto_sync_every(Duration::from_secs(hours * SECONDS_PER_HOUR));
    }

    /// Arm the auto-sync timer with an explicit period.
    pub fn start_auto_sync_every(&self, interval: Duration) {
        self.stop_auto_sync();
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("No async runtime available, auto-sync not started");
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(run_auto_sync(weak, interval));
        *self.inner.auto_sync.lock() = Some(handle);
        info!(interval_secs = interval.as_secs(), "Auto-sync armed");
    }

    pub fn stop_auto_sync(&self) {
        if let Some(handle) = self.inner.auto_sync.lock().take() {
            handle.abort();
            debug!("Auto-sync stopped");
        }
    }

    pub fn auto_sync_active(&self) -> bool {
        self.inner
            .auto_sync
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }
}

async fn run_auto_sync(inner: Weak<Inner>, interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let orchestrator = SyncOrchestrator { inner };
        if orchestrator.is_busy() {
            debug!("Sync in flight, skipping auto-sync tick");
            continue;
        }
        if orchestrator.start(SyncKind::DbOnly).is_some() {
            info!("Auto-sync triggered");
        }
    }
}

#[instrument(skip(guard, kind, run_id, op_tx), fields(run_id = %run_id, kind = %kind))]
async fn run_worker(
    guard: BusyGuard,
    kind: SyncKind,
    run_id: Uuid,
    op_tx: mpsc::UnboundedSender<SyncEvent>,
) -> SyncResult {
    let inner = Arc::clone(&guard.0);
    let started = Instant::now();
    emit(&inner, &op_tx, SyncEvent::Started { run_id, kind });
    info!("Sync started");

    let (reporter, mut channel) = ProgressChannel::new();
    let pump = {
        let inner = Arc::clone(&inner);
        let op_tx = op_tx.clone();
        tokio::spawn(async move {
            while let Some(update) = channel.recv().await {
                inner.status.write().set_progress(update.percent, update.message.clone());
                emit(
                    &inner,
                    &op_tx,
                    SyncEvent::Progress {
                        run_id,
                        kind,
                        percent: update.percent,
                        message: update.message,
                    },
                );
            }
        })
    };

    let outcome = execute(&inner, kind, reporter.clone()).await;
    if outcome.success {
        reporter.report(100, "Complete");
    }
    // Dropping the last reporter lets the pump drain and end.
    drop(reporter);
    let _ = pump.await;

    let result = SyncResult::new(
        kind.as_str(),
        outcome.success,
        outcome.message,
        started.elapsed().as_millis() as u64,
    );
    let state = inner.status.write().finish();
    persist_bookkeeping(&inner, kind);
    result.log();
    info!(%state, duration_ms = result.duration_ms, "Sync finished");

    drop(guard);
    emit(
        &inner,
        &op_tx,
        SyncEvent::Finished {
            run_id,
            kind,
            state,
            result: result.clone(),
        },
    );
    result
}

struct Outcome {
    success: bool,
    message: String,
}

impl From<&SyncResult> for Outcome {
    fn from(result: &SyncResult) -> Self {
        Self {
            success: result.success,
            message: result.message.clone(),
        }
    }
}

async fn execute(inner: &Arc<Inner>, kind: SyncKind, progress: ProgressReporter) -> Outcome {
    match kind {
        SyncKind::Startup => {
            let database = inner.database.clone();
            let reporter = progress.clone();
            let restore = guarded("restore", async move { database.quick_restore(&reporter).await }).await;
            record(inner, &restore);
            Outcome::from(&restore)
        }
        SyncKind::Shutdown => {
            let backup = backup_step(inner, progress.scoped(0, 50)).await;
            let push = push_step(inner, progress.scoped(50, 100)).await;
            match (backup.success, push.success) {
                (false, _) => Outcome::from(&backup),
                (true, false) => Outcome::from(&push),
                (true, true) => Outcome {
                    success: true,
                    message: format!("{}; {}", backup.message, push.message),
                },
            }
        }
        SyncKind::DbOnly => {
            let backup = backup_step(inner, progress.scoped(0, 50)).await;
            let push = push_step(inner, progress.scoped(50, 100)).await;
            if !push.success {
                debug!(message = %push.message, "Push after database backup failed");
            }
            Outcome::from(&backup)
        }
        SyncKind::GitPull => {
            progress.report(0, "Checking connection");
            let vcs = inner.vcs.clone();
            let reachable = guarded("pull", async move {
                let started = Instant::now();
                if vcs.check_connection().await {
                    SyncResult::success("pull", "Remote reachable", started.elapsed().as_millis() as u64)
                } else {
                    SyncResult::failure("pull", "Remote not reachable", started.elapsed().as_millis() as u64)
                }
            })
            .await;
            if !reachable.success {
                record(inner, &reachable);
                return Outcome::from(&reachable);
            }

            let vcs = inner.vcs.clone();
            let reporter = progress.scoped(10, 100);
            let pull = guarded("pull", async move { vcs.pull(&reporter).await }).await;
            record(inner, &pull);
            Outcome::from(&pull)
        }
        SyncKind::GitPush => {
            let push = push_step(inner, progress).await;
            Outcome::from(&push)
        }
    }
}

async fn backup_step(inner: &Arc<Inner>, progress: ProgressReporter) -> SyncResult {
    let database = inner.database.clone();
    let result = guarded("backup", async move { database.backup(&progress).await }).await;
    record(inner, &result);

    if result.success {
        let retention_days = inner.config.read().backup_retention_days;
        let catalog = Arc::clone(inner.database.catalog());
        match tokio::task::spawn_blocking(move || catalog.cleanup_old_backups(retention_days)).await {
            Ok((deleted, kept)) => debug!(deleted, kept, "Retention pass after backup"),
            Err(e) => warn!(error = %e, "Retention pass failed"),
        }
    }
    result
}

async fn push_step(inner: &Arc<Inner>, progress: ProgressReporter) -> SyncResult {
    let vcs = inner.vcs.clone();
    let result = guarded("push", async move { vcs.push(&progress).await }).await;
    record(inner, &result);
    result
}

/// Run one adapter call as its own task so a panic becomes a failed result.
async fn guarded<F>(operation: &'static str, step: F) -> SyncResult
where
    F: Future<Output = SyncResult> + Send + 'static,
{
    let started = Instant::now();
    match tokio::spawn(step).await {
        Ok(result) => result,
        Err(e) => {
            warn!(operation, error = %e, "Sync step aborted");
            SyncResult::failure(
                operation,
                truncate_message(&format!("Unexpected error: {}", e), MAX_MESSAGE_LEN),
                started.elapsed().as_millis() as u64,
            )
        }
    }
}

fn record(inner: &Inner, result: &SyncResult) {
    inner.status.write().add_result(result.clone());
}

fn persist_bookkeeping(inner: &Inner, kind: SyncKind) {
    let mut config = inner.config.write();
    config.last_sync_time = Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    config.last_sync_type = kind.as_str().to_string();
    if !inner.store.save(&config) {
        warn!("Could not persist last sync bookkeeping");
    }
}

fn emit(inner: &Inner, op_tx: &mpsc::UnboundedSender<SyncEvent>, event: SyncEvent) {
    let _ = op_tx.send(event.clone());
    let _ = inner.events.send(event);
}
