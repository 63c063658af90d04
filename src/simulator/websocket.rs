//! Upload and delete endpoint of the simulated device.

use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use tracing::{debug, info, warn};

use super::{Behavior, SimState, StoredFile};
use crate::core::protocol::StartCommand;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<SimState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// An upload between `READY` and the last byte.
struct Receiving {
    device_path: String,
    local_path: PathBuf,
    expected: u64,
    data: Vec<u8>,
}

async fn handle_socket(mut socket: WebSocket, state: Arc<SimState>) {
    state.record(|s| s.connections += 1);
    let mut receiving: Option<Receiving> = None;

    while let Some(msg) = socket.recv().await {
        let replies = match msg {
            Ok(Message::Text(text)) => handle_text(text.as_str(), &state, &mut receiving).await,
            Ok(Message::Binary(bytes)) => handle_binary(&bytes, &state, &mut receiving)
                .await
                .into_iter()
                .collect(),
            Ok(Message::Close(_)) => break,
            Ok(_) => Vec::new(),
            Err(e) => {
                debug!(error = %e, "WebSocket receive error");
                break;
            }
        };

        for reply in replies {
            if socket.send(Message::Text(reply.into())).await.is_err() {
                return;
            }
        }
    }

    if let Some(partial) = receiving {
        warn!(
            path = %partial.device_path,
            received = partial.data.len(),
            expected = partial.expected,
            "Connection closed mid-upload, discarding"
        );
    }
    debug!("WebSocket connection closed");
}

async fn handle_text(text: &str, state: &SimState, receiving: &mut Option<Receiving>) -> Vec<String> {
    if state.behavior == Behavior::Silent {
        debug!(message = %text, "Ignoring message");
        return Vec::new();
    }

    if let Some(path) = text.strip_prefix("DELETE:") {
        return vec![delete(path, state).await];
    }

    let Some(start) = StartCommand::parse(text) else {
        return vec![format!("ERROR:unknown command {}", text)];
    };

    if let Behavior::RejectStart(message) = &state.behavior {
        state.record(|s| s.rejected += 1);
        return vec![format!("ERROR:{}", message)];
    }

    if start.file_name.contains(['/', '\\']) {
        return vec!["ERROR:invalid file name".to_string()];
    }
    let device_path = join_device_path(&start.destination, &start.file_name);
    let Some(local_path) = state.local_path(&device_path) else {
        return vec!["ERROR:invalid path".to_string()];
    };

    info!(path = %device_path, size = start.size, "Receiving upload");
    let upload = Receiving {
        device_path,
        local_path,
        expected: start.size,
        data: Vec::with_capacity(start.size.min(64 * 1024 * 1024) as usize),
    };

    if upload.expected == 0 {
        *receiving = None;
        return vec!["READY".to_string(), finish(upload, state).await];
    }

    *receiving = Some(upload);
    vec!["READY".to_string()]
}

async fn handle_binary(bytes: &[u8], state: &SimState, receiving: &mut Option<Receiving>) -> Option<String> {
    let Some(upload) = receiving.as_mut() else {
        if state.behavior == Behavior::Silent {
            return None;
        }
        return Some("ERROR:unexpected data".to_string());
    };

    upload.data.extend_from_slice(bytes);
    if (upload.data.len() as u64) < upload.expected {
        return None;
    }

    let upload = receiving.take()?;
    Some(finish(upload, state).await)
}

async fn finish(upload: Receiving, state: &SimState) -> String {
    if let Behavior::FailAfterUpload(message) = &state.behavior {
        state.record(|s| s.rejected += 1);
        return format!("ERROR:{}", message);
    }
    if upload.data.len() as u64 != upload.expected {
        return format!(
            "ERROR:size mismatch (expected {}, got {})",
            upload.expected,
            upload.data.len()
        );
    }

    if let Some(parent) = upload.local_path.parent()
        && let Err(e) = tokio::fs::create_dir_all(parent).await
    {
        return format!("ERROR:{}", e);
    }
    if let Err(e) = tokio::fs::write(&upload.local_path, &upload.data).await {
        return format!("ERROR:{}", e);
    }

    info!(path = %upload.device_path, bytes = upload.expected, "Upload stored");
    state.record(|s| {
        s.uploads.push(StoredFile {
            path: upload.device_path.clone(),
            size: upload.expected,
        })
    });
    "DONE".to_string()
}

async fn delete(path: &str, state: &SimState) -> String {
    let Some(local) = state.local_path(path) else {
        return "ERROR:invalid path".to_string();
    };
    match tokio::fs::remove_file(&local).await {
        Ok(()) => {
            info!(path = %path, "Deleted");
            state.record(|s| s.deleted.push(path.to_string()));
            "OK".to_string()
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => "ERROR:file not found".to_string(),
        Err(e) => format!("ERROR:{}", e),
    }
}

pub(super) fn join_device_path(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir.ends_with('/') {
        format!("{}{}", if dir.is_empty() { "/" } else { dir }, name)
    } else {
        format!("{}/{}", dir, name)
    }
}
