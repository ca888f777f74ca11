//! HTTP surface of a snapshot-serving peer.
//!
//! Peers answer `HEAD /snapshot.tar.bz2` and `HEAD /incremental-snapshot.tar.bz2`
//! with a redirect whose `Location` names the real archive. [`SnapshotTransport`]
//! exposes that as [`locate`](SnapshotTransport::locate), plus a streaming
//! `GET` for throughput sampling and transfers.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::{CONTENT_LENGTH, LOCATION};
use reqwest::{redirect, Client};
use std::time::{Duration, Instant};

use crate::artifact::ArtifactKind;
use crate::error::TransportError;
use crate::peers::Peer;

/// Chunked response body
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Redirect target of a probe and how long the peer took to answer
#[derive(Debug, Clone, PartialEq)]
pub struct Located {
    pub location: String,
    pub latency: Duration,
}

impl Located {
    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }
}

/// Open response body
pub struct Transfer {
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

#[async_trait]
pub trait SnapshotTransport: Send + Sync {
    /// Probe the conventional path for `kind`.
    ///
    /// `Ok(None)` means the peer answered without redirect metadata.
    async fn locate(
        &self,
        peer: &Peer,
        kind: ArtifactKind,
        timeout: Duration,
    ) -> Result<Option<Located>, TransportError>;

    /// Start a streaming GET of `path` on `peer`, following redirects.
    async fn open(&self, peer: &Peer, path: &str) -> Result<Transfer, TransportError>;
}

/// reqwest-backed transport
#[derive(Clone)]
pub struct HttpTransport {
    probe_client: Client,
    transfer_client: Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> anyhow::Result<Self> {
        use anyhow::Context;

        Ok(Self {
            probe_client: Client::builder()
                .redirect(redirect::Policy::none())
                .connect_timeout(connect_timeout)
                .pool_max_idle_per_host(0)
                .build()
                .context("failed to create probe HTTP client")?,
            transfer_client: Client::builder()
                .connect_timeout(connect_timeout.max(Duration::from_secs(5)))
                .build()
                .context("failed to create transfer HTTP client")?,
        })
    }
}

#[async_trait]
impl SnapshotTransport for HttpTransport {
    async fn locate(
        &self,
        peer: &Peer,
        kind: ArtifactKind,
        timeout: Duration,
    ) -> Result<Option<Located>, TransportError> {
        let url = peer.url(kind.probe_path());
        let started = Instant::now();
        let response = self.probe_client.head(&url).timeout(timeout).send().await?;
        let latency = started.elapsed();

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        tracing::trace!(
            "HEAD {} -> {} in {:.1}ms",
            url,
            response.status(),
            latency.as_secs_f64() * 1000.0
        );

        Ok(location.map(|location| Located { location, latency }))
    }

    async fn open(&self, peer: &Peer, path: &str) -> Result<Transfer, TransportError> {
        let url = peer.url(path);
        let response = self.transfer_client.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(TransportError::Status(response.status().as_u16()));
        }

        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransportError::from))
            .boxed();

        Ok(Transfer {
            content_length,
            body,
        })
    }
}
