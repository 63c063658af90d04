//! Upload session state machine.
//!
//! ```text
//! Connecting -> AwaitingReady -> Streaming -> AwaitingDone -> Done
//!      \              \              \              \
//!       +--------------+--------------+--------------+--> Failed
//! ```
//!
//! A session owns exactly one [`DeviceLink`]. Whichever path reaches a
//! terminal state, the link is closed once and then dropped. Dropping the
//! session future mid-flight drops the link, which closes the socket.

use std::path::Path;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::DeviceConfig;
use crate::core::link::{DeviceLink, WsLink};
use crate::core::models::{DeviceEndpoint, UploadRequest};
use crate::core::progress::{ProgressReporter, TransferStatus};
use crate::core::protocol::{DeviceMessage, delete_command, start_command};
use crate::error::TransferError;
use crate::logging::LogThrottle;

/// Bounds for every blocking step of a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    pub connect: Duration,
    /// Wait for `READY`, and separately for `DONE`.
    pub reply: Duration,
    /// Wait for a single frame to be accepted by the transport.
    pub send: Duration,
}

impl SessionTimeouts {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            connect: Duration::from_secs(config.connect_timeout_secs),
            reply: Duration::from_secs(config.reply_timeout_secs),
            send: Duration::from_secs(config.send_timeout_secs),
        }
    }
}

impl Default for SessionTimeouts {
    fn default() -> Self {
        Self::from_config(&DeviceConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    AwaitingReady,
    Streaming,
    AwaitingDone,
    Done,
    Failed(TransferError),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed(_))
    }
}

/// Terminal state of a session plus what made it onto the wire.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub state: SessionState,
    pub bytes_sent: u64,
    pub frames_sent: u64,
}

impl SessionReport {
    pub fn into_result(self) -> Result<u64, TransferError> {
        match self.state {
            SessionState::Done => Ok(self.bytes_sent),
            SessionState::Failed(err) => Err(err),
            other => Err(TransferError::Protocol(format!(
                "session ended in non-terminal state {:?}",
                other
            ))),
        }
    }
}

/// Connect to `endpoint` over WebSocket and run a full upload.
pub async fn upload_file(
    endpoint: &DeviceEndpoint,
    upload: &UploadRequest,
    timeouts: SessionTimeouts,
    reporter: ProgressReporter,
) -> SessionReport {
    let span = info_span!("session", device = %endpoint, file = %upload.file_name());

    async {
        match timeout(timeouts.connect, WsLink::connect(endpoint)).await {
            Ok(Ok(link)) => {
                TransferSession::new(link, timeouts)
                    .with_reporter(reporter)
                    .run(upload)
                    .await
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Connection failed");
                failed_before_connect(TransferError::Connect(e.to_string()))
            }
            Err(_) => {
                warn!(timeout_secs = timeouts.connect.as_secs(), "Connection timed out");
                failed_before_connect(TransferError::Connect(format!(
                    "timed out after {:?}",
                    timeouts.connect
                )))
            }
        }
    }
    .instrument(span)
    .await
}

fn failed_before_connect(error: TransferError) -> SessionReport {
    SessionReport {
        state: SessionState::Failed(error),
        bytes_sent: 0,
        frames_sent: 0,
    }
}

enum Outgoing {
    Text(String),
    Binary(Vec<u8>),
}

pub struct TransferSession<L: DeviceLink> {
    link: Option<L>,
    state: SessionState,
    timeouts: SessionTimeouts,
    reporter: ProgressReporter,
    bytes_sent: u64,
    frames_sent: u64,
}

impl<L: DeviceLink> TransferSession<L> {
    /// Wrap an already-connected link. The session starts in `Connecting`
    /// and leaves it once `START` is on the wire.
    pub fn new(link: L, timeouts: SessionTimeouts) -> Self {
        Self {
            link: Some(link),
            state: SessionState::Connecting,
            timeouts,
            reporter: ProgressReporter::disabled(),
            bytes_sent: 0,
            frames_sent: 0,
        }
    }

    pub fn with_reporter(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Drive the session to a terminal state.
    pub async fn run(mut self, upload: &UploadRequest) -> SessionReport {
        let result = self.exchange(upload).await;

        match result {
            Ok(()) => {
                self.transition(SessionState::Done);
                self.reporter.report(TransferStatus::Complete);
                info!(bytes = self.bytes_sent, "Upload complete");
            }
            Err(e) => {
                warn!(error = %e, reason = e.reason(), "Upload failed");
                self.reporter.report(TransferStatus::Failed(e.to_string()));
                self.transition(SessionState::Failed(e));
            }
        }

        self.close_link().await;

        SessionReport {
            state: self.state.clone(),
            bytes_sent: self.bytes_sent,
            frames_sent: self.frames_sent,
        }
    }

    async fn exchange(&mut self, upload: &UploadRequest) -> Result<(), TransferError> {
        let path = upload.source_path();
        let file_name = upload.file_name();
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| TransferError::Source(format!("{}: {}", path.display(), e)))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| TransferError::Source(format!("{}: {}", path.display(), e)))?
            .len();

        // Connecting -> AwaitingReady
        let start = start_command(&file_name, size, upload.destination_path());
        debug!(command = %start, "Sending START");
        self.send(Outgoing::Text(start), "START").await?;
        self.transition(SessionState::AwaitingReady);

        self.await_ready().await?;
        self.reporter.report(TransferStatus::Ready);
        self.transition(SessionState::Streaming);

        self.stream_file(&mut file, path, &file_name, size, upload.chunk_size())
            .await?;
        self.transition(SessionState::AwaitingDone);

        self.await_done().await
    }

    async fn await_ready(&mut self) -> Result<(), TransferError> {
        let reply = match timeout(self.timeouts.reply, self.link_mut()?.recv_text()).await {
            Err(_) => {
                return Err(TransferError::Timeout(
                    "no reply to START".to_string(),
                ));
            }
            Ok(Err(e)) => {
                return Err(TransferError::Protocol(format!(
                    "connection lost waiting for READY: {}",
                    e
                )));
            }
            Ok(Ok(text)) => text,
        };

        debug!(reply = %reply, "Received");
        match DeviceMessage::parse(&reply) {
            DeviceMessage::Ready => Ok(()),
            DeviceMessage::Error(message) => Err(TransferError::Device(message)),
            _ => Err(TransferError::Protocol(format!(
                "unexpected reply to START: {}",
                reply
            ))),
        }
    }

    async fn stream_file(
        &mut self,
        file: &mut tokio::fs::File,
        path: &Path,
        file_name: &str,
        size: u64,
        chunk_size: usize,
    ) -> Result<(), TransferError> {
        debug!(chunk_size, size, "Starting binary transfer");

        let mut buf = vec![0u8; chunk_size.max(1)];
        let mut last_logged_quarter = 0u64;
        let mut throttle = LogThrottle::new(Duration::from_secs(2));

        while self.bytes_sent < size {
            let remaining = (size - self.bytes_sent).min(buf.len() as u64) as usize;
            let n = read_chunk(file, &mut buf[..remaining])
                .await
                .map_err(|e| TransferError::Source(format!("{}: {}", path.display(), e)))?;
            if n == 0 {
                return Err(TransferError::Source(format!(
                    "{} shrank during upload ({} of {} bytes read)",
                    path.display(),
                    self.bytes_sent,
                    size
                )));
            }

            self.send(Outgoing::Binary(buf[..n].to_vec()), "binary frame")
                .await?;
            self.bytes_sent += n as u64;
            self.frames_sent += 1;

            self.reporter.progress(file_name, self.bytes_sent, size);

            let quarter = self.bytes_sent * 4 / size;
            if quarter > last_logged_quarter {
                last_logged_quarter = quarter;
                info!(
                    percent = quarter * 25,
                    bytes_sent = self.bytes_sent,
                    "Progress"
                );
            } else if throttle.should_log() {
                debug!(bytes_sent = self.bytes_sent, total = size, frames = self.frames_sent, "Streaming");
            }
        }

        Ok(())
    }

    async fn await_done(&mut self) -> Result<(), TransferError> {
        let deadline = Instant::now() + self.timeouts.reply;

        loop {
            let reply = match timeout_at(deadline, self.link_mut()?.recv_text()).await {
                Err(_) => {
                    return Err(TransferError::Timeout(
                        "no DONE after transfer".to_string(),
                    ));
                }
                Ok(Err(e)) => {
                    return Err(TransferError::Timeout(format!(
                        "connection lost waiting for DONE: {}",
                        e
                    )));
                }
                Ok(Ok(text)) => text,
            };

            debug!(reply = %reply, "Received");
            match DeviceMessage::parse(&reply) {
                DeviceMessage::Done => return Ok(()),
                DeviceMessage::Error(message) => return Err(TransferError::Device(message)),
                other => debug!(reply = ?other, "Ignoring reply while waiting for DONE"),
            }
        }
    }

    /// Run one bounded send on the link.
    async fn send(&mut self, frame: Outgoing, what: &str) -> Result<(), TransferError> {
        let limit = self.timeouts.send;
        let link = self.link_mut()?;
        let result = match frame {
            Outgoing::Text(text) => timeout(limit, link.send_text(&text)).await,
            Outgoing::Binary(data) => timeout(limit, link.send_binary(data)).await,
        };
        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TransferError::Protocol(format!(
                "sending {} failed: {}",
                what, e
            ))),
            Err(_) => Err(TransferError::Timeout(format!("sending {}", what))),
        }
    }

    fn link_mut(&mut self) -> Result<&mut L, TransferError> {
        self.link
            .as_mut()
            .ok_or_else(|| TransferError::Protocol("link already closed".to_string()))
    }

    fn transition(&mut self, next: SessionState) {
        debug!(from = ?self.state, to = ?next, "Session state");
        self.state = next;
    }

    async fn close_link(&mut self) {
        if let Some(mut link) = self.link.take() {
            if let Err(e) = link.close().await {
                debug!(error = %e, "Error closing link");
            }
        }
    }
}

/// Fill `buf` from `file`, stopping early only at EOF.
async fn read_chunk(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match file.read(&mut buf[total..]).await? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}

/// Per-path result of a batch delete.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeleteReport {
    pub deleted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Delete several files over a single connection.
pub async fn delete_files(
    endpoint: &DeviceEndpoint,
    paths: &[String],
    timeouts: SessionTimeouts,
) -> Result<DeleteReport, TransferError> {
    let mut link = match timeout(timeouts.connect, WsLink::connect(endpoint)).await {
        Ok(Ok(link)) => link,
        Ok(Err(e)) => return Err(TransferError::Connect(e.to_string())),
        Err(_) => return Err(TransferError::Connect("timed out".to_string())),
    };

    let report = delete_over_link(&mut link, paths, timeouts).await;

    if let Err(e) = link.close().await {
        debug!(error = %e, "Error closing link");
    }

    info!(
        deleted = report.deleted.len(),
        failed = report.failed.len(),
        "Delete complete"
    );
    Ok(report)
}

/// Issue `DELETE:<path>` for each path, collecting per-path results.
pub async fn delete_over_link<L: DeviceLink>(
    link: &mut L,
    paths: &[String],
    timeouts: SessionTimeouts,
) -> DeleteReport {
    let mut report = DeleteReport::default();

    for (i, path) in paths.iter().enumerate() {
        debug!(index = i + 1, total = paths.len(), path = %path, "Sending DELETE");

        let outcome = async {
            timeout(timeouts.send, link.send_text(&delete_command(path)))
                .await
                .map_err(|_| "timed out sending DELETE".to_string())?
                .map_err(|e| e.to_string())?;
            let reply = timeout(timeouts.reply, link.recv_text())
                .await
                .map_err(|_| "timed out waiting for reply".to_string())?
                .map_err(|e| e.to_string())?;
            match DeviceMessage::parse(&reply) {
                DeviceMessage::Ok => Ok(()),
                DeviceMessage::Error(message) => Err(message),
                _ => Err(format!("unexpected reply: {}", reply)),
            }
        }
        .await;

        match outcome {
            Ok(()) => {
                debug!(path = %path, "Deleted");
                report.deleted.push(path.clone());
            }
            Err(reason) => {
                warn!(path = %path, reason = %reason, "Delete failed");
                report.failed.push((path.clone(), reason));
            }
        }
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::link::LinkError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    enum Reply {
        Text(&'static str),
        Closed,
        Hang,
    }

    /// In-memory link that plays back scripted replies and records traffic.
    #[derive(Clone, Default)]
    struct Recorder {
        texts: Arc<Mutex<Vec<String>>>,
        frames: Arc<Mutex<Vec<Vec<u8>>>>,
        closes: Arc<AtomicUsize>,
    }

    struct ScriptedLink {
        replies: VecDeque<Reply>,
        recorder: Recorder,
    }

    impl ScriptedLink {
        fn new(replies: Vec<Reply>) -> (Self, Recorder) {
            let recorder = Recorder::default();
            (
                Self {
                    replies: replies.into(),
                    recorder: recorder.clone(),
                },
                recorder,
            )
        }
    }

    #[async_trait]
    impl DeviceLink for ScriptedLink {
        async fn send_text(&mut self, text: &str) -> Result<(), LinkError> {
            self.recorder.texts.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), LinkError> {
            self.recorder.frames.lock().unwrap().push(data);
            Ok(())
        }

        async fn recv_text(&mut self) -> Result<String, LinkError> {
            match self.replies.pop_front() {
                Some(Reply::Text(text)) => Ok(text.to_string()),
                Some(Reply::Closed) | None => Err(LinkError::Closed),
                Some(Reply::Hang) => std::future::pending().await,
            }
        }

        async fn close(&mut self) -> Result<(), LinkError> {
            self.recorder.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_timeouts() -> SessionTimeouts {
        SessionTimeouts {
            connect: Duration::from_millis(200),
            reply: Duration::from_millis(100),
            send: Duration::from_millis(100),
        }
    }

    fn upload_for(path: &Path, chunk_size: usize) -> UploadRequest {
        UploadRequest::new(path, "/books/test.epub", chunk_size)
            .unwrap()
            .with_file_name("test.epub")
    }

    #[tokio::test]
    async fn test_ready_stream_done() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("test.epub");
        std::fs::write(&path, vec![7u8; 100]).unwrap();

        let (link, recorder) =
            ScriptedLink::new(vec![Reply::Text("READY"), Reply::Text("DONE")]);
        let report = TransferSession::new(link, fast_timeouts())
            .run(&upload_for(&path, 2048))
            .await;

        assert_eq!(report.state, SessionState::Done);
        assert_eq!(report.bytes_sent, 100);
        assert_eq!(
            recorder.texts.lock().unwrap().as_slice(),
            ["START:test.epub:100:/books/test.epub".to_string()]
        );
        let frames = recorder.frames.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 100);
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_frames_respect_chunk_size_and_order() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("big.epub");
        let content: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();

        let (link, recorder) =
            ScriptedLink::new(vec![Reply::Text("READY"), Reply::Text("DONE")]);
        let report = TransferSession::new(link, fast_timeouts())
            .run(&upload_for(&path, 2048))
            .await;

        assert_eq!(report.state, SessionState::Done);
        assert_eq!(report.frames_sent, 3);

        let frames = recorder.frames.lock().unwrap();
        let sizes: Vec<usize> = frames.iter().map(|f| f.len()).collect();
        assert_eq!(sizes, vec![2048, 2048, 904]);
        assert_eq!(frames.concat(), content);
    }

    #[tokio::test]
    async fn test_error_after_start_sends_no_frames() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("test.epub");
        std::fs::write(&path, vec![1u8; 100]).unwrap();

        let (link, recorder) = ScriptedLink::new(vec![Reply::Text("ERROR:disk full")]);
        let report = TransferSession::new(link, fast_timeouts())
            .run(&upload_for(&path, 2048))
            .await;

        match &report.state {
            SessionState::Failed(err) => assert_eq!(err.reason(), "disk full"),
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(recorder.frames.lock().unwrap().is_empty());
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unexpected_ready_reply_is_protocol_failure() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("test.epub");
        std::fs::write(&path, b"abc").unwrap();

        let (link, recorder) = ScriptedLink::new(vec![Reply::Text("HELLO")]);
        let report = TransferSession::new(link, fast_timeouts())
            .run(&upload_for(&path, 2048))
            .await;

        let err = report.into_result().unwrap_err();
        assert_eq!(err.reason(), "protocol");
        assert!(recorder.frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_drop_before_ready_is_protocol_failure() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("test.epub");
        std::fs::write(&path, b"abc").unwrap();

        let (link, _recorder) = ScriptedLink::new(vec![Reply::Closed]);
        let report = TransferSession::new(link, fast_timeouts())
            .run(&upload_for(&path, 2048))
            .await;

        assert_eq!(report.into_result().unwrap_err().reason(), "protocol");
    }

    #[tokio::test]
    async fn test_silent_device_times_out() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("test.epub");
        std::fs::write(&path, b"abc").unwrap();

        let (link, recorder) = ScriptedLink::new(vec![Reply::Hang]);
        let report = TransferSession::new(link, fast_timeouts())
            .run(&upload_for(&path, 2048))
            .await;

        assert_eq!(report.into_result().unwrap_err().reason(), "timeout");
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disconnect_before_done_is_timeout() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("test.epub");
        std::fs::write(&path, b"abc").unwrap();

        let (link, _recorder) = ScriptedLink::new(vec![Reply::Text("READY"), Reply::Closed]);
        let report = TransferSession::new(link, fast_timeouts())
            .run(&upload_for(&path, 2048))
            .await;

        assert_eq!(report.bytes_sent, 3);
        assert_eq!(report.into_result().unwrap_err().reason(), "timeout");
    }

    #[tokio::test]
    async fn test_error_after_stream_reports_device_message() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("test.epub");
        std::fs::write(&path, b"abc").unwrap();

        let (link, _recorder) = ScriptedLink::new(vec![
            Reply::Text("READY"),
            Reply::Text("progress 100"),
            Reply::Text("ERROR:write failed"),
        ]);
        let report = TransferSession::new(link, fast_timeouts())
            .run(&upload_for(&path, 2048))
            .await;

        assert_eq!(report.into_result().unwrap_err().reason(), "write failed");
    }

    #[tokio::test]
    async fn test_missing_source_never_sends_start() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("missing.epub");

        let (link, recorder) = ScriptedLink::new(vec![Reply::Text("READY")]);
        let report = TransferSession::new(link, fast_timeouts())
            .run(&upload_for(&path, 2048))
            .await;

        assert_eq!(report.into_result().unwrap_err().reason(), "source");
        assert!(recorder.texts.lock().unwrap().is_empty());
        assert_eq!(recorder.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop a listener so the port is (very likely) closed
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let temp = tempdir().unwrap();
        let path = temp.path().join("test.epub");
        std::fs::write(&path, b"abc").unwrap();

        let endpoint = DeviceEndpoint::new("127.0.0.1", port);
        let report = upload_file(
            &endpoint,
            &upload_for(&path, 2048),
            fast_timeouts(),
            ProgressReporter::disabled(),
        )
        .await;

        assert_eq!(report.into_result().unwrap_err().reason(), "connect");
    }

    #[tokio::test]
    async fn test_delete_over_link_collects_results() {
        let (mut link, recorder) = ScriptedLink::new(vec![
            Reply::Text("OK"),
            Reply::Text("ERROR:not found"),
            Reply::Text("WAT"),
        ]);
        let paths = vec![
            "/a.epub".to_string(),
            "/b.epub".to_string(),
            "/c.epub".to_string(),
        ];

        let report = delete_over_link(&mut link, &paths, fast_timeouts()).await;

        assert_eq!(report.deleted, vec!["/a.epub".to_string()]);
        assert_eq!(report.failed.len(), 2);
        assert_eq!(report.failed[0], ("/b.epub".to_string(), "not found".to_string()));
        assert!(report.failed[1].1.contains("unexpected"));
        assert_eq!(
            recorder.texts.lock().unwrap()[0],
            "DELETE:/a.epub".to_string()
        );
    }
}
