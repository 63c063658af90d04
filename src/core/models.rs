use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Address of a reader that accepts uploads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceEndpoint {
    pub host: String,
    pub port: u16,
    pub discovered_at: DateTime<Utc>,
}

impl DeviceEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            discovered_at: Utc::now(),
        }
    }

    /// WebSocket URL of the upload endpoint (root path).
    pub fn ws_url(&self) -> String {
        format!("ws://{}:{}/", self.host, self.port)
    }
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// One file to send to the device.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    source_path: PathBuf,
    destination_path: String,
    chunk_size: usize,
    file_name: Option<String>,
}

impl UploadRequest {
    /// Returns `None` when `chunk_size` is zero.
    pub fn new(
        source_path: impl Into<PathBuf>,
        destination_path: impl Into<String>,
        chunk_size: usize,
    ) -> Option<Self> {
        if chunk_size == 0 {
            return None;
        }
        Some(Self {
            source_path: source_path.into(),
            destination_path: destination_path.into(),
            chunk_size,
            file_name: None,
        })
    }

    /// Upload under a different name than the source file's basename.
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    /// Send the bytes of `path` instead, still under the original name.
    pub fn with_source(mut self, path: impl Into<PathBuf>) -> Self {
        if self.file_name.is_none() {
            self.file_name = Some(self.file_name());
        }
        self.source_path = path.into();
        self
    }

    pub fn source_path(&self) -> &Path {
        &self.source_path
    }

    pub fn destination_path(&self) -> &str {
        &self.destination_path
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Basename the device stores the file under.
    pub fn file_name(&self) -> String {
        let name = match &self.file_name {
            Some(name) => name.as_str(),
            None => self
                .source_path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("book.epub"),
        };
        name.rsplit(['/', '\\']).next().unwrap_or(name).to_string()
    }

    /// Path of the file on the device once stored.
    pub fn device_path(&self) -> String {
        let name = self.file_name();
        if self.destination_path.ends_with('/') {
            format!("{}{}", self.destination_path, name)
        } else {
            format!("{}/{}", self.destination_path, name)
        }
    }
}

/// An image resource inside an archive, as seen by the rewriter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAsset {
    pub archive_path: String,
    pub media_type: String,
    pub pixel_width: u32,
    pub pixel_height: u32,
}

/// Result of converting one image, keyed by its full archive path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ConversionOutcome {
    Converted {
        new_path: String,
        new_media_type: String,
        /// Further pages produced by a light-novel split, in reading order.
        extra_pages: Vec<String>,
    },
    Skipped {
        reason: String,
    },
    Failed {
        reason: String,
    },
}

impl ConversionOutcome {
    pub fn is_converted(&self) -> bool {
        matches!(self, ConversionOutcome::Converted { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConversionOutcome::Failed { .. })
    }
}
