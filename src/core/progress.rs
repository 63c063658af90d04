//! Live status of an upload.
//!
//! Status events flow over an optional `mpsc` channel to whoever drives the
//! upload (the CLI prints them). Sending never blocks the transfer: when the
//! consumer lags, intermediate progress ticks are dropped.

use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TransferStatus {
    Discovering,
    Converting {
        file: String,
    },
    /// The device accepted `START` and is waiting for data.
    Ready,
    InProgress {
        total_bytes: u64,
        bytes_sent: u64,
        current_file: String,
        percentage: u8,
    },
    Complete,
    Failed(String),
}

/// Non-blocking sender half for [`TransferStatus`] events.
#[derive(Clone, Default)]
pub struct ProgressReporter {
    tx: Option<mpsc::Sender<TransferStatus>>,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::Sender<TransferStatus>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A reporter that discards every event.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn report(&self, status: TransferStatus) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(status);
        }
    }

    pub fn progress(&self, current_file: &str, bytes_sent: u64, total_bytes: u64) {
        self.report(TransferStatus::InProgress {
            total_bytes,
            bytes_sent,
            current_file: current_file.to_string(),
            percentage: percentage(bytes_sent, total_bytes),
        });
    }
}

pub fn percentage(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as f64 / total as f64) * 100.0) as u8
}
