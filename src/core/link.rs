//! Message transport between the session and the device.
//!
//! [`DeviceLink`] is the seam the session state machine drives; [`WsLink`]
//! is the WebSocket implementation used against real devices.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::core::models::DeviceEndpoint;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("connection closed")]
    Closed,

    #[error("{0}")]
    Io(String),
}

/// A single bidirectional connection to the device.
#[async_trait]
pub trait DeviceLink: Send {
    async fn send_text(&mut self, text: &str) -> Result<(), LinkError>;

    async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), LinkError>;

    /// Wait for the next text message. Other frame types are skipped.
    async fn recv_text(&mut self) -> Result<String, LinkError>;

    async fn close(&mut self) -> Result<(), LinkError>;
}

pub struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsLink {
    pub async fn connect(endpoint: &DeviceEndpoint) -> Result<Self, LinkError> {
        let url = endpoint.ws_url();
        debug!(url = %url, "Connecting");
        let (stream, response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(map_ws_error)?;
        debug!(status = %response.status(), "WebSocket handshake OK");
        Ok(Self { stream })
    }
}

#[async_trait]
impl DeviceLink for WsLink {
    async fn send_text(&mut self, text: &str) -> Result<(), LinkError> {
        self.stream
            .send(Message::text(text))
            .await
            .map_err(map_ws_error)
    }

    async fn send_binary(&mut self, data: Vec<u8>) -> Result<(), LinkError> {
        self.stream
            .send(Message::binary(data))
            .await
            .map_err(map_ws_error)
    }

    async fn recv_text(&mut self) -> Result<String, LinkError> {
        loop {
            match self.stream.next().await {
                None => return Err(LinkError::Closed),
                Some(Err(e)) => return Err(map_ws_error(e)),
                Some(Ok(Message::Text(text))) => return Ok(text.as_str().to_string()),
                Some(Ok(Message::Close(frame))) => {
                    debug!(frame = ?frame, "Device closed connection");
                    return Err(LinkError::Closed);
                }
                // Pongs to pings are queued by tungstenite and flushed on the next write
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(other)) => {
                    debug!(len = other.len(), "Ignoring non-text frame");
                    continue;
                }
            }
        }
    }

    async fn close(&mut self) -> Result<(), LinkError> {
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(map_ws_error(e)),
        }
    }
}

fn map_ws_error(error: tungstenite::Error) -> LinkError {
    match error {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            LinkError::Closed
        }
        other => LinkError::Io(other.to_string()),
    }
}
