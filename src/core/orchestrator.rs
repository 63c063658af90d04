use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tempfile::TempDir;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::config::{MAX_CHUNK_SIZE, normalize_upload_path};
use crate::context::AppContext;
use crate::core::discovery::DiscoveryClient;
use crate::core::models::{DeviceEndpoint, UploadRequest};
use crate::core::progress::{ProgressReporter, TransferStatus};
use crate::core::session::{self, DeleteReport, SessionState, SessionTimeouts};
use crate::device::DeviceFiles;
use crate::epub::rewriter::{ArchiveRewriter, RewriteOptions, RewriteReport};
use crate::error::TransferError;

/// Discovery cycles closer together than this reuse the previous result.
const DISCOVERY_MIN_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum UploadResult {
    Done,
    Failed(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct UploadReport {
    pub upload_id: Uuid,
    pub source: PathBuf,
    pub device: DeviceEndpoint,
    /// Where the file lives on the device.
    pub device_path: String,
    pub bytes_sent: u64,
    pub conversion: Option<RewriteReport>,
    pub result: UploadResult,
    /// Present when `result` is `Failed`.
    pub error: Option<TransferError>,
}

impl UploadReport {
    pub fn is_success(&self) -> bool {
        self.result == UploadResult::Done
    }
}

#[derive(Default)]
struct DiscoveryCache {
    last_attempt: Option<Instant>,
    last_endpoint: Option<DeviceEndpoint>,
}

/// Temporary directory that is removed when dropped, on every exit path.
/// Removal failures are logged. Shared through an `Arc` with the conversion
/// worker so a cancelled upload cannot remove it mid-write.
struct ScopedTempDir {
    dir: Option<TempDir>,
}

impl ScopedTempDir {
    fn new() -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("crosspoint-").tempdir()?;
        debug!(path = %dir.path().display(), "Created temp directory");
        Ok(Self { dir: Some(dir) })
    }

    fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(|d| d.path())
    }
}

impl Drop for ScopedTempDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            match dir.close() {
                Ok(()) => debug!(path = %path.display(), "Removed temp directory"),
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temp directory"),
            }
        }
    }
}

/// Drives uploads end to end: discovery, optional conversion, transfer.
pub struct Uploader {
    ctx: AppContext,
    discovery: Mutex<DiscoveryCache>,
}

impl Uploader {
    pub fn new(ctx: AppContext) -> Self {
        Self {
            ctx,
            discovery: Mutex::new(DiscoveryCache::default()),
        }
    }

    fn static_endpoint(&self) -> DeviceEndpoint {
        let device = &self.ctx.config.device;
        DeviceEndpoint::new(device.host.clone(), device.port)
    }

    /// Find the device, falling back to the configured static address.
    pub async fn resolve_endpoint(&self) -> DeviceEndpoint {
        let config = &self.ctx.config;
        if !config.discovery.enabled {
            return self.static_endpoint();
        }

        let recent = {
            let mut cache = match self.discovery.lock() {
                Ok(cache) => cache,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Instant::now();
            match cache.last_attempt {
                Some(at) if now.duration_since(at) < DISCOVERY_MIN_INTERVAL => {
                    Some(cache.last_endpoint.clone())
                }
                _ => {
                    cache.last_attempt = Some(now);
                    None
                }
            }
        };

        if let Some(previous) = recent {
            debug!("Discovery ran moments ago, reusing its result");
            return previous.unwrap_or_else(|| self.static_endpoint());
        }

        let found = DiscoveryClient::new(config.discovery.clone())
            .with_host(config.device.host.clone())
            .discover()
            .await;

        if let Ok(mut cache) = self.discovery.lock() {
            cache.last_endpoint = found.clone();
        }

        match found {
            Some(endpoint) => endpoint,
            None => {
                let fallback = self.static_endpoint();
                info!(device = %fallback, "Using configured device address");
                fallback
            }
        }
    }

    /// Upload one file. Transfer failures and cancellation are reported in
    /// the returned report, never as an error.
    pub async fn upload(&self, request: UploadRequest, reporter: ProgressReporter) -> UploadReport {
        let upload_id = Uuid::now_v7();
        let span = info_span!("upload", id = %upload_id, file = %request.file_name());

        async {
            let shutdown = self.ctx.shutdown.clone();
            let resolved = OnceLock::new();
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    warn!("Upload cancelled");
                    UploadReport {
                        upload_id,
                        source: request.source_path().to_path_buf(),
                        device: resolved.get().cloned().unwrap_or_else(|| self.static_endpoint()),
                        device_path: request.device_path(),
                        bytes_sent: 0,
                        conversion: None,
                        result: UploadResult::Cancelled,
                        error: None,
                    }
                }
                report = self.run_upload(upload_id, request.clone(), reporter, &resolved) => report,
            }
        }
        .instrument(span)
        .await
    }

    async fn run_upload(
        &self,
        upload_id: Uuid,
        request: UploadRequest,
        reporter: ProgressReporter,
        resolved: &OnceLock<DeviceEndpoint>,
    ) -> UploadReport {
        let config = &self.ctx.config;
        let source = request.source_path().to_path_buf();
        let destination = normalize_upload_path(request.destination_path());
        let chunk_size = request.chunk_size().min(MAX_CHUNK_SIZE);

        let Some(normalized) = UploadRequest::new(source.clone(), destination, chunk_size) else {
            let error = TransferError::Source("chunk size must be greater than 0".to_string());
            return UploadReport {
                upload_id,
                source,
                device: self.static_endpoint(),
                device_path: request.device_path(),
                bytes_sent: 0,
                conversion: None,
                result: UploadResult::Failed(error.reason().to_string()),
                error: Some(error),
            };
        };
        let normalized = normalized.with_file_name(request.file_name());

        reporter.report(TransferStatus::Discovering);
        let endpoint = self.resolve_endpoint().await;
        let _ = resolved.set(endpoint.clone());
        info!(
            device = %endpoint,
            source = %source.display(),
            destination = %normalized.destination_path(),
            "Uploading"
        );

        // Held until the transfer finishes; dropping it removes the
        // converted archive, including when this future is cancelled.
        let mut workspace: Option<Arc<ScopedTempDir>> = None;
        let mut conversion = None;

        let options = RewriteOptions::from_config(&config.conversion);
        if options.enabled {
            reporter.report(TransferStatus::Converting {
                file: normalized.file_name(),
            });
            match ScopedTempDir::new() {
                Ok(dir) => {
                    let dir = Arc::new(dir);
                    conversion =
                        convert_in(Arc::clone(&dir), &source, &normalized.file_name(), options).await;
                    workspace = Some(dir);
                }
                Err(e) => warn!(error = %e, "Could not create temp directory, uploading original"),
            }
        }

        let session_request = match &conversion {
            Some(report) => normalized.with_source(report.output.clone()),
            None => normalized,
        };

        self.ensure_destination(&endpoint, session_request.destination_path())
            .await;

        let timeouts = SessionTimeouts::from_config(&config.device);
        let session = session::upload_file(&endpoint, &session_request, timeouts, reporter).await;
        drop(workspace);

        let (result, error) = match session.state {
            SessionState::Done => {
                info!(
                    bytes = session.bytes_sent,
                    device_path = %session_request.device_path(),
                    "Upload finished"
                );
                (UploadResult::Done, None)
            }
            SessionState::Failed(e) => (UploadResult::Failed(e.reason().to_string()), Some(e)),
            other => {
                let e = TransferError::Protocol(format!("session stopped in {:?}", other));
                (UploadResult::Failed(e.reason().to_string()), Some(e))
            }
        };

        UploadReport {
            upload_id,
            source,
            device: endpoint,
            device_path: session_request.device_path(),
            bytes_sent: session.bytes_sent,
            conversion,
            result,
            error,
        }
    }

    /// Create the destination directory over HTTP before `START`. Failures
    /// are logged; the device then reports the problem on the socket.
    async fn ensure_destination(&self, endpoint: &DeviceEndpoint, dir: &str) {
        if dir.trim_matches('/').is_empty() {
            return;
        }
        let device = &self.ctx.config.device;
        let timeout = Duration::from_secs(device.connect_timeout_secs.max(1));
        let result = match DeviceFiles::new(&endpoint.host, device.http_port, timeout) {
            Ok(files) => files.ensure_dir(dir).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!(dir = %dir, "Destination directory ready"),
            Err(e) => warn!(dir = %dir, error = %e, "Could not create destination directory"),
        }
    }

    /// Delete files on the device over a single connection.
    pub async fn delete(&self, paths: &[String]) -> Result<DeleteReport, TransferError> {
        let endpoint = self.resolve_endpoint().await;
        let timeouts = SessionTimeouts::from_config(&self.ctx.config.device);
        let shutdown = self.ctx.shutdown.clone();

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(TransferError::Protocol("cancelled".to_string())),
            report = session::delete_files(&endpoint, paths, timeouts) => report,
        }
    }
}

/// Rewrite `source` into `dir` on the blocking pool. Returns `None` when the
/// archive was left unchanged.
async fn convert_in(
    dir: Arc<ScopedTempDir>,
    source: &Path,
    file_name: &str,
    options: RewriteOptions,
) -> Option<RewriteReport> {
    let dir_path = dir.path()?;
    let stem = Path::new(file_name)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("book");
    let dest = dir_path.join(format!("{}_baseline.epub", stem));
    let source_owned = source.to_path_buf();

    let result = tokio::task::spawn_blocking(move || {
        let report = ArchiveRewriter::new(options).rewrite(&source_owned, &dest);
        drop(dir);
        report
    })
    .await;

    match result {
        Ok(report) if report.output != source => Some(report),
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "Conversion task failed, uploading original");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_scoped_temp_dir_removed_on_drop() {
        let dir = ScopedTempDir::new().unwrap();
        let path = dir.path().unwrap().to_path_buf();
        std::fs::write(path.join("x.epub"), b"data").unwrap();
        assert!(path.exists());

        drop(dir);
        assert!(!path.exists());
    }

    #[test]
    fn test_scoped_temp_dir_outlives_cancelled_owner() {
        let dir = Arc::new(ScopedTempDir::new().unwrap());
        let path = dir.path().unwrap().to_path_buf();
        let worker = Arc::clone(&dir);

        // The upload side goes away first, the conversion worker is still writing.
        drop(dir);
        assert!(path.exists());
        std::fs::write(path.join("late.epub"), b"data").unwrap();

        drop(worker);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_resolve_endpoint_without_discovery_uses_static_host() {
        let mut config = AppConfig::default();
        config.discovery.enabled = false;
        config.device.host = "10.1.2.3".to_string();
        config.device.port = 8181;

        let uploader = Uploader::new(AppContext::new(config));
        let endpoint = uploader.resolve_endpoint().await;
        assert_eq!(endpoint.host, "10.1.2.3");
        assert_eq!(endpoint.port, 8181);
    }

    #[tokio::test]
    async fn test_discovery_rate_limited() {
        let mut config = AppConfig::default();
        config.device.host = "127.0.0.1".to_string();
        config.discovery.ports = vec![9];
        config.discovery.timeout_ms = 20;
        config.discovery.attempts = 1;

        let uploader = Uploader::new(AppContext::new(config));
        let first = uploader.resolve_endpoint().await;

        let started = Instant::now();
        let second = uploader.resolve_endpoint().await;
        assert!(started.elapsed() < Duration::from_millis(20));
        assert_eq!(first.host, second.host);
        assert_eq!(first.port, second.port);
    }

    #[tokio::test]
    async fn test_upload_missing_file_reports_failure() {
        let mut config = AppConfig::default();
        config.discovery.enabled = false;
        config.device.host = "127.0.0.1".to_string();
        config.device.port = 9;
        config.device.connect_timeout_secs = 1;

        let uploader = Uploader::new(AppContext::new(config));
        let request = UploadRequest::new("/definitely/missing.epub", "/", 2048).unwrap();
        let report = uploader.upload(request, ProgressReporter::disabled()).await;

        assert!(!report.is_success());
        assert!(matches!(report.result, UploadResult::Failed(_)));
        assert_eq!(report.bytes_sent, 0);
    }

    #[tokio::test]
    async fn test_cancelled_upload() {
        let mut config = AppConfig::default();
        config.discovery.enabled = false;

        let ctx = AppContext::new(config);
        ctx.shutdown.cancel();
        let uploader = Uploader::new(ctx);
        let request = UploadRequest::new("/tmp/book.epub", "/", 2048).unwrap();
        let report = uploader.upload(request, ProgressReporter::disabled()).await;

        assert_eq!(report.result, UploadResult::Cancelled);
    }
}
