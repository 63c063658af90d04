//! Error types shared across the upload and conversion paths.
//!
//! Network failures terminate an upload attempt and are reported to the
//! caller. Archive failures abort a conversion and fall back to the original
//! file. Image failures never escape a single image: they are recorded as a
//! `ConversionOutcome::Failed` and the original bytes are kept.

use thiserror::Error;

/// Terminal failure of a transfer session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    /// The WebSocket connection could not be established.
    #[error("connect: {0}")]
    Connect(String),

    /// The device sent something the protocol does not allow at this point,
    /// or the connection dropped mid-exchange.
    #[error("protocol: {0}")]
    Protocol(String),

    /// A bounded wait expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The device answered `ERROR:<message>`.
    #[error("device error: {0}")]
    Device(String),

    /// The local file to upload could not be read.
    #[error("source: {0}")]
    Source(String),
}

impl TransferError {
    /// Short reason token for the failure.
    ///
    /// Device errors report the device's own message verbatim.
    pub fn reason(&self) -> &str {
        match self {
            TransferError::Connect(_) => "connect",
            TransferError::Protocol(_) => "protocol",
            TransferError::Timeout(_) => "timeout",
            TransferError::Device(message) => message,
            TransferError::Source(_) => "source",
        }
    }
}

/// Unrecoverable failure while reading or rewriting an EPUB archive.
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Failed to read ZIP archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML parse error: {0}")]
    Xml(#[from] quick_xml::Error),

    #[error("No package document found in archive")]
    MissingPackage,

    #[error("Invalid EPUB: {0}")]
    Invalid(String),
}

/// Failure of a single image transform.
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("decode failed: {0}")]
    Decode(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("unsupported media type: {0}")]
    Unsupported(String),
}

/// Failure talking to the device's HTTP file API.
#[derive(Debug, Error)]
pub enum DeviceApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("device returned HTTP {status} for {path}")]
    Status { status: u16, path: String },

    #[error("local write failed: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_tokens() {
        assert_eq!(TransferError::Connect("refused".into()).reason(), "connect");
        assert_eq!(TransferError::Protocol("bad".into()).reason(), "protocol");
        assert_eq!(TransferError::Timeout("READY".into()).reason(), "timeout");
        assert_eq!(TransferError::Device("disk full".into()).reason(), "disk full");
    }

    #[test]
    fn test_display_carries_detail() {
        let err = TransferError::Connect("connection refused".into());
        assert_eq!(err.to_string(), "connect: connection refused");
    }
}
