//! Client for the device's HTTP file API.
//!
//! - `GET /api/files?path=<dir>` answers with a JSON array describing the
//!   directory's children. Listing walks the tree and collects EPUB files.
//! - `GET /download?path=<file>` streams a stored file back.
//! - `POST /mkdir` with form fields `name` and `path` creates `name` (which
//!   may be nested) under `path`. HTTP 400 means it already exists.

use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::config::DeviceConfig;
use crate::error::DeviceApiError;

/// One child of a directory as reported by the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    pub name: String,
    #[serde(default)]
    pub is_directory: bool,
    #[serde(default)]
    pub is_epub: bool,
    #[serde(default)]
    pub size: u64,
}

/// An EPUB stored on the device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteBook {
    pub path: String,
    pub size: u64,
}

pub struct DeviceFiles {
    client: reqwest::Client,
    base_url: String,
}

impl DeviceFiles {
    pub fn new(host: &str, http_port: u16, timeout: Duration) -> Result<Self, DeviceApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: format!("http://{}:{}", host, http_port),
        })
    }

    pub fn from_config(config: &DeviceConfig) -> Result<Self, DeviceApiError> {
        Self::new(
            &config.host,
            config.http_port,
            Duration::from_secs(config.connect_timeout_secs.max(1)),
        )
    }

    /// Children of a single directory.
    pub async fn list_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, DeviceApiError> {
        let url = format!("{}/api/files", self.base_url);
        debug!(url = %url, path = %path, "Listing device directory");

        let response = self.client.get(&url).query(&[("path", path)]).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeviceApiError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }

        Ok(response.json::<Vec<RemoteEntry>>().await?)
    }

    /// Stream the file at `path` into `writer`. Returns the byte count.
    pub async fn download<W>(&self, path: &str, writer: &mut W) -> Result<u64, DeviceApiError>
    where
        W: AsyncWrite + Unpin,
    {
        let url = format!("{}/download", self.base_url);
        debug!(url = %url, path = %path, "Downloading from device");

        let mut response = self.client.get(&url).query(&[("path", path)]).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DeviceApiError::Status {
                status: status.as_u16(),
                path: path.to_string(),
            });
        }

        let mut written = 0u64;
        while let Some(chunk) = response.chunk().await? {
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;
        info!(path = %path, bytes = written, "Downloaded");
        Ok(written)
    }

    /// Create directory `name` under `parent`. Returns `false` when it
    /// already existed.
    pub async fn mkdir(&self, name: &str, parent: &str) -> Result<bool, DeviceApiError> {
        let url = format!("{}/mkdir", self.base_url);
        let response = self
            .client
            .post(&url)
            .form(&[("name", name), ("path", parent)])
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {
                debug!(name = %name, parent = %parent, "Created device directory");
                Ok(true)
            }
            StatusCode::BAD_REQUEST => {
                debug!(name = %name, parent = %parent, "Device directory already exists");
                Ok(false)
            }
            status => Err(DeviceApiError::Status {
                status: status.as_u16(),
                path: join_path(parent, name),
            }),
        }
    }

    /// Make sure the absolute device directory `dir` exists, creating every
    /// missing level with a single request.
    pub async fn ensure_dir(&self, dir: &str) -> Result<(), DeviceApiError> {
        let nested = dir.trim_matches('/');
        if nested.is_empty() {
            return Ok(());
        }
        self.mkdir(nested, "/").await.map(|_| ())
    }

    /// Every EPUB under `root`, depth first.
    ///
    /// Failure to list `root` itself is an error; a subdirectory that cannot
    /// be listed is logged and skipped.
    pub async fn list_books(&self, root: &str) -> Result<Vec<RemoteBook>, DeviceApiError> {
        let mut books = Vec::new();
        let mut pending = vec![root.to_string()];
        let mut first = true;

        while let Some(dir) = pending.pop() {
            let entries = match self.list_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if first => return Err(e),
                Err(e) => {
                    warn!(path = %dir, error = %e, "Skipping unreadable directory");
                    continue;
                }
            };
            first = false;

            let mut subdirs = Vec::new();
            for entry in entries {
                if entry.name.is_empty() {
                    continue;
                }
                let path = join_path(&dir, &entry.name);
                if entry.is_directory {
                    subdirs.push(path);
                } else if entry.is_epub {
                    books.push(RemoteBook {
                        path,
                        size: entry.size,
                    });
                }
            }
            // Reversed so the stack visits subdirectories in listing order.
            pending.extend(subdirs.into_iter().rev());
        }

        Ok(books)
    }
}

fn join_path(dir: &str, name: &str) -> String {
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}
