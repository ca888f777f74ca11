//! Error types for snapshot discovery and download.
//!
//! Per-peer failures ([`TransportError`]) are absorbed by the stage that hit
//! them and end up as diagnostics. Only [`FinderError`] reaches the caller.

use std::path::PathBuf;
use thiserror::Error;

/// Failure talking to a single peer
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("unexpected HTTP status {0}")]
    Status(u16),
    #[error("error reading response body: {0}")]
    Body(String),
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Timeouts and refused/unreachable connections share a diagnostics bucket.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Connect(_))
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if let Some(status) = err.status() {
            TransportError::Status(status.as_u16())
        } else if err.is_body() || err.is_decode() {
            TransportError::Body(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

/// Errors that end a run
#[derive(Debug, Error)]
pub enum FinderError {
    /// The download directory cannot be used; retrying will not help.
    #[error("local resource error at {}: {source}", path.display())]
    Resource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FinderError {
    pub fn resource(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FinderError::Resource {
            path: path.into(),
            source,
        }
    }
}
