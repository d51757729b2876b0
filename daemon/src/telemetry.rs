//! Telemetry module for logging and metrics collection
//!
//! This module provides:
//! - Structured logging with console/JSON formatters and a rolling log file
//! - Prometheus metrics fed from the orchestrator's event stream
//! - An HTTP endpoint exposing `/metrics` and `/status`

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use backup_sync::settings::{LoggingSettings, MetricsSettings};
use backup_sync::{SyncEvent, SyncOrchestrator};
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry};
use std::path::Path;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

/// Prometheus metrics registry and collectors
#[derive(Clone)]
pub struct DaemonMetrics {
    registry: Registry,

    pub operations_total: IntCounterVec,
    pub operation_duration: HistogramVec,
    pub in_progress: IntGauge,
    pub backups_on_disk: IntGauge,
}

impl DaemonMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let operations_total = IntCounterVec::new(
            Opts::new("backup_sync_operations_total", "Total number of finished sync operations"),
            &["operation", "outcome"],
        )?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "backup_sync_operation_duration_seconds",
                "Duration of sync operations in seconds",
            )
            .buckets(vec![0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 30.0, 60.0, 120.0]),
            &["operation"],
        )?;

        let in_progress = IntGauge::new("backup_sync_in_progress", "1 while a sync operation is running")?;

        let backups_on_disk = IntGauge::new("backup_sync_backups_on_disk", "Number of backup files in the catalog")?;

        registry.register(Box::new(operations_total.clone()))?;
        registry.register(Box::new(operation_duration.clone()))?;
        registry.register(Box::new(in_progress.clone()))?;
        registry.register(Box::new(backups_on_disk.clone()))?;

        Ok(Self {
            registry,
            operations_total,
            operation_duration,
            in_progress,
            backups_on_disk,
        })
    }

    /// Fold one orchestrator event into the collectors.
    pub fn record(&self, event: &SyncEvent) {
        match event {
            SyncEvent::Started { .. } => self.in_progress.set(1),
            SyncEvent::Progress { .. } => {}
            SyncEvent::Finished { kind, result, .. } => {
                self.in_progress.set(0);
                let outcome = if result.success { "success" } else { "failure" };
                self.operations_total
                    .with_label_values(&[kind.as_str(), outcome])
                    .inc();
                self.operation_duration
                    .with_label_values(&[kind.as_str()])
                    .observe(result.duration_ms as f64 / 1000.0);
            }
        }
    }

    /// Prometheus text exposition of every registered collector.
    pub fn encode(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Telemetry system for the daemon
pub struct TelemetrySystem {
    metrics: DaemonMetrics,
    _file_guard: Option<WorkerGuard>,
    session_id: String,
}

#[derive(Clone)]
struct HttpState {
    metrics: DaemonMetrics,
    orchestrator: SyncOrchestrator,
}

impl TelemetrySystem {
    pub fn new() -> Result<Self> {
        Ok(Self {
            metrics: DaemonMetrics::new()?,
            _file_guard: None,
            session_id: Uuid::new_v4().to_string(),
        })
    }

    /// Install the global subscriber. `level` overrides the configured level.
    pub fn initialize_logging(&mut self, settings: &LoggingSettings, level: Option<&str>) -> Result<()> {
        let level = level.unwrap_or(&settings.level);
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("backup_sync={0},backup_sync_daemon={0}", level)));

        let console_layer = if settings.json {
            fmt::layer().json().with_current_span(true).boxed()
        } else {
            fmt::layer().with_target(true).boxed()
        };

        let (file_layer, guard) = match &settings.file {
            Some(log_path) => {
                let dir = log_path.parent().unwrap_or_else(|| Path::new("."));
                if !dir.as_os_str().is_empty() {
                    std::fs::create_dir_all(dir)?;
                }
                let file_name = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("backup-sync-daemon.log"));
                let (non_blocking, guard) = tracing_appender::non_blocking(rolling::daily(dir, file_name));
                let layer = fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .json()
                    .with_current_span(true)
                    .with_span_list(true);
                (Some(layer), Some(guard))
            }
            None => (None, None),
        };

        tracing_subscriber::registry()
            .with(filter)
            .with(console_layer)
            .with(file_layer)
            .init();
        self._file_guard = guard;

        info!(session_id = %self.session_id, "Telemetry system initialized");
        Ok(())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Keep the collectors in step with the orchestrator's event stream.
    pub fn spawn_event_recorder(&self, orchestrator: &SyncOrchestrator) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        let catalog = std::sync::Arc::clone(orchestrator.catalog());
        let mut events = orchestrator.subscribe();
        metrics.backups_on_disk.set(catalog.list_backups().len() as i64);

        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        metrics.record(&event);
                        if matches!(event, SyncEvent::Finished { .. }) {
                            metrics.backups_on_disk.set(catalog.list_backups().len() as i64);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => warn!(skipped, "Metrics recorder lagged behind sync events"),
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Metrics recorder stopped");
        })
    }

    pub fn create_metrics_server(&self, orchestrator: SyncOrchestrator) -> Router {
        router(HttpState {
            metrics: self.metrics.clone(),
            orchestrator,
        })
    }

    /// Bind and serve the metrics endpoint in the background.
    pub async fn start_metrics_server(
        &self,
        settings: &MetricsSettings,
        orchestrator: SyncOrchestrator,
    ) -> Result<JoinHandle<()>> {
        let bind_addr = format!("{}:{}", settings.bind_address, settings.port);
        let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
        let app = self.create_metrics_server(orchestrator);
        info!("Metrics server listening on {}", bind_addr);

        Ok(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Metrics server failed: {}", e);
            }
        }))
    }
}

fn router(state: HttpState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<HttpState>) -> Response {
    match state.metrics.encode() {
        Ok(output) => (StatusCode::OK, output).into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}

async fn status_handler(State(state): State<HttpState>) -> Response {
    Json(state.orchestrator.status()).into_response()
}
