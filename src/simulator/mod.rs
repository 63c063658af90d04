//! Simulated reader for local testing.
//!
//! Serves the same surfaces a real device does:
//!
//! - WebSocket upload/delete endpoint at `/` on the upload port
//! - `GET /api/files`, `GET /download` and `POST /mkdir` on the HTTP port
//! - a UDP responder answering discovery probes
//!
//! Uploaded files are written under a local root directory. The
//! [`Behavior`] knob makes the device misbehave in the ways the client must
//! survive.

mod files;
mod websocket;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use axum::{
    Router,
    routing::{get, post},
};
use serde::Serialize;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::models::DeviceEndpoint;

/// How the simulated device answers uploads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Behavior {
    #[default]
    Normal,
    /// Answer every `START` with `ERROR:<message>`.
    RejectStart(String),
    /// Accept all bytes, then answer `ERROR:<message>` instead of `DONE`.
    FailAfterUpload(String),
    /// Accept the connection and never reply.
    Silent,
}

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub root: PathBuf,
    pub bind: IpAddr,
    /// WebSocket port; 0 picks a free one.
    pub ws_port: u16,
    /// HTTP file API port; 0 picks a free one.
    pub http_port: u16,
    /// UDP discovery port; `None` disables the responder.
    pub discovery_port: Option<u16>,
    pub behavior: Behavior,
}

impl SimulatorConfig {
    /// Loopback-only simulator on ephemeral ports.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            bind: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ws_port: 0,
            http_port: 0,
            discovery_port: None,
            behavior: Behavior::Normal,
        }
    }

    pub fn with_behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn with_discovery_port(mut self, port: u16) -> Self {
        self.discovery_port = Some(port);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredFile {
    /// Device-side path, e.g. `/books/a.epub`.
    pub path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SimulatorStats {
    pub connections: u64,
    pub uploads: Vec<StoredFile>,
    pub deleted: Vec<String>,
    pub created_dirs: Vec<String>,
    pub rejected: u64,
}

pub(crate) struct SimState {
    pub(crate) root: PathBuf,
    pub(crate) behavior: Behavior,
    pub(crate) stats: Mutex<SimulatorStats>,
}

impl SimState {
    pub(crate) fn record<F: FnOnce(&mut SimulatorStats)>(&self, f: F) {
        let mut stats = match self.stats.lock() {
            Ok(stats) => stats,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut stats);
    }

    /// Map a device path onto the root directory. `..` is refused.
    pub(crate) fn local_path(&self, device_path: &str) -> Option<PathBuf> {
        resolve_under(&self.root, device_path)
    }
}

pub struct DeviceSimulator {
    config: SimulatorConfig,
}

impl DeviceSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self { config }
    }

    /// Bind every listener and start serving in background tasks.
    pub async fn start(self) -> Result<SimulatorHandle> {
        let config = self.config;
        tokio::fs::create_dir_all(&config.root)
            .await
            .with_context(|| format!("Failed to create {}", config.root.display()))?;

        let state = Arc::new(SimState {
            root: config.root.clone(),
            behavior: config.behavior.clone(),
            stats: Mutex::new(SimulatorStats::default()),
        });
        let shutdown = CancellationToken::new();
        let mut tasks = Vec::new();

        let ws_listener = TcpListener::bind((config.bind, config.ws_port))
            .await
            .context("Failed to bind WebSocket listener")?;
        let ws_addr = ws_listener.local_addr()?;
        let ws_app = Router::new()
            .route("/", get(websocket::ws_handler))
            .with_state(state.clone());
        tasks.push(serve(ws_listener, ws_app, shutdown.clone()));

        let http_listener = TcpListener::bind((config.bind, config.http_port))
            .await
            .context("Failed to bind HTTP listener")?;
        let http_addr = http_listener.local_addr()?;
        let http_app = Router::new()
            .route("/api/files", get(files::list_files))
            .route("/download", get(files::download))
            .route("/mkdir", post(files::mkdir))
            .with_state(state.clone());
        tasks.push(serve(http_listener, http_app, shutdown.clone()));

        let discovery_addr = match config.discovery_port {
            Some(port) => {
                let socket = UdpSocket::bind((config.bind, port))
                    .await
                    .context("Failed to bind discovery socket")?;
                let addr = socket.local_addr()?;
                tasks.push(tokio::spawn(respond_to_probes(
                    socket,
                    ws_addr.port(),
                    shutdown.clone(),
                )));
                Some(addr)
            }
            None => None,
        };

        info!(
            ws = %ws_addr,
            http = %http_addr,
            discovery = ?discovery_addr,
            root = %config.root.display(),
            behavior = ?config.behavior,
            "Simulated device listening"
        );

        Ok(SimulatorHandle {
            ws_addr,
            http_addr,
            discovery_addr,
            state,
            shutdown,
            tasks,
        })
    }
}

/// Running simulator. Dropping it leaves the tasks running until
/// [`SimulatorHandle::shutdown`] is called or the runtime stops.
pub struct SimulatorHandle {
    pub ws_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub discovery_addr: Option<SocketAddr>,
    state: Arc<SimState>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SimulatorHandle {
    /// Upload endpoint as a client would discover it.
    pub fn endpoint(&self) -> DeviceEndpoint {
        DeviceEndpoint::new(self.ws_addr.ip().to_string(), self.ws_addr.port())
    }

    pub fn root(&self) -> &Path {
        &self.state.root
    }

    pub fn stats(&self) -> SimulatorStats {
        match self.state.stats.lock() {
            Ok(stats) => stats.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Simulator task ended abnormally");
            }
        }
        debug!("Simulated device stopped");
    }
}

fn serve(listener: TcpListener, app: Router, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;
        if let Err(e) = result {
            warn!(error = %e, "Simulator server stopped");
        }
    })
}

async fn respond_to_probes(socket: UdpSocket, ws_port: u16, shutdown: CancellationToken) {
    let reply = format!("crosspoint (simulator);{}", ws_port);
    let mut buf = [0u8; 512];

    loop {
        let received = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => received,
        };
        match received {
            Ok((len, peer)) => {
                debug!(peer = %peer, bytes = len, "Discovery probe");
                if let Err(e) = socket.send_to(reply.as_bytes(), peer).await {
                    warn!(peer = %peer, error = %e, "Failed to answer probe");
                }
            }
            Err(e) => {
                warn!(error = %e, "Discovery socket error");
                break;
            }
        }
    }
}

fn resolve_under(root: &Path, device_path: &str) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(device_path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(resolved)
}
