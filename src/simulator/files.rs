//! HTTP file API of the simulated device: listing, download, mkdir.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Form, Query, State};
use axum::http::StatusCode;
use axum::{Json, body::Bytes};
use tracing::{debug, warn};

use super::SimState;
use crate::device::RemoteEntry;

pub async fn list_files(
    State(state): State<Arc<SimState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Json<Vec<RemoteEntry>>, StatusCode> {
    let path = query.get("path").map(String::as_str).unwrap_or("/");
    let dir = state.local_path(path).ok_or(StatusCode::BAD_REQUEST)?;

    let mut reader = tokio::fs::read_dir(&dir)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;

    let mut entries = Vec::new();
    while let Ok(Some(entry)) = reader.next_entry().await {
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_directory = meta.is_dir();
        entries.push(RemoteEntry {
            is_epub: !is_directory && name.to_ascii_lowercase().ends_with(".epub"),
            size: if is_directory { 0 } else { meta.len() },
            name,
            is_directory,
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(Json(entries))
}

pub async fn download(
    State(state): State<Arc<SimState>>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Bytes, StatusCode> {
    let path = query.get("path").ok_or(StatusCode::BAD_REQUEST)?;
    let local = state.local_path(path).ok_or(StatusCode::BAD_REQUEST)?;
    let data = tokio::fs::read(&local).await.map_err(|_| StatusCode::NOT_FOUND)?;
    debug!(path = %path, bytes = data.len(), "Serving download");
    Ok(Bytes::from(data))
}

/// `name` may be nested; every missing level is created. An existing
/// directory answers 400.
pub async fn mkdir(
    State(state): State<Arc<SimState>>,
    Form(form): Form<HashMap<String, String>>,
) -> StatusCode {
    let (Some(name), Some(parent)) = (form.get("name"), form.get("path")) else {
        return StatusCode::BAD_REQUEST;
    };
    let device_path = super::websocket::join_device_path(parent, name);
    let Some(local) = state.local_path(&device_path) else {
        return StatusCode::FORBIDDEN;
    };
    if local.exists() {
        return StatusCode::BAD_REQUEST;
    }
    match tokio::fs::create_dir_all(&local).await {
        Ok(()) => {
            debug!(path = %device_path, "Created directory");
            state.record(|stats| stats.created_dirs.push(device_path));
            StatusCode::OK
        }
        Err(e) => {
            warn!(path = %device_path, error = %e, "mkdir failed");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
