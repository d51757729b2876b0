//! Progress reporting for sync operations
//!
//! Adapters report `(percent, message)` pairs through a [`ProgressReporter`].
//! A reporter may be narrowed to a sub-range of its parent with
//! [`ProgressReporter::scoped`], which is how composed operations weight their
//! steps. All reporters derived from one channel share a high-water mark, so
//! the percentages a receiver sees never decrease.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{Result, SyncError};

/// One progress report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub percent: u8,
    pub message: String,
}

/// Receiving end of a progress channel
pub struct ProgressChannel {
    receiver: mpsc::UnboundedReceiver<ProgressUpdate>,
}

impl ProgressChannel {
    /// Create a new progress channel
    pub fn new() -> (ProgressReporter, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let reporter = ProgressReporter {
            sender: Some(sender),
            start: 0,
            end: 100,
            high_water: Arc::new(AtomicU8::new(0)),
        };
        (reporter, Self { receiver })
    }

    /// Receive the next update; `None` once every reporter is dropped.
    pub async fn recv(&mut self) -> Option<ProgressUpdate> {
        self.receiver.recv().await
    }

    /// Try to receive an update without blocking
    pub fn try_recv(&mut self) -> Result<ProgressUpdate> {
        self.receiver.try_recv().map_err(|e| match e {
            mpsc::error::TryRecvError::Empty => SyncError::Unexpected("No progress events available".to_string()),
            mpsc::error::TryRecvError::Disconnected => {
                SyncError::Unexpected("Progress channel disconnected".to_string())
            }
        })
    }

    /// Close the channel
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

/// Sending end of a progress channel, mapped onto a percent sub-range
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    sender: Option<mpsc::UnboundedSender<ProgressUpdate>>,
    start: u8,
    end: u8,
    high_water: Arc<AtomicU8>,
}

impl ProgressReporter {
    /// Reporter that discards everything.
    pub fn silent() -> Self {
        Self {
            sender: None,
            start: 0,
            end: 100,
            high_water: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Report `percent` of this reporter's own range.
    ///
    /// Values above 100 are clamped, values below the last reported overall
    /// percentage are raised to it. A closed receiver is ignored.
    pub fn report(&self, percent: u8, message: impl Into<String>) {
        let Some(sender) = &self.sender else {
            return;
        };
        let mapped = self.map(percent);
        let previous = self.high_water.fetch_max(mapped, Ordering::SeqCst);
        let _ = sender.send(ProgressUpdate {
            percent: previous.max(mapped),
            message: message.into(),
        });
    }

    /// Narrow to `start..=end` percent of this reporter's range.
    pub fn scoped(&self, start: u8, end: u8) -> Self {
        let (start, end) = (start.min(100), end.min(100).max(start.min(100)));
        Self {
            sender: self.sender.clone(),
            start: self.map(start),
            end: self.map(end),
            high_water: Arc::clone(&self.high_water),
        }
    }

    /// Overall percentage that `percent` of this range corresponds to.
    pub fn map(&self, percent: u8) -> u8 {
        let percent = u16::from(percent.min(100));
        let span = u16::from(self.end - self.start);
        (u16::from(self.start) + span * percent / 100) as u8
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}
