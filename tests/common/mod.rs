#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use snapshot_finder::artifact::{ArtifactKind, FULL_SNAPSHOT_PATH};
use snapshot_finder::peers::Peer;
use snapshot_finder::rpc::{ClusterNode, HeightOracle, PeerDirectory};
use snapshot_finder::transport::{Located, SnapshotTransport, Transfer};
use snapshot_finder::TransportError;

/// In-memory height oracle and node listing
#[derive(Default)]
pub struct MockCluster {
    slot: Option<u64>,
    nodes: Vec<ClusterNode>,
    slot_calls: AtomicUsize,
    node_calls: AtomicUsize,
}

impl MockCluster {
    pub fn new(slot: u64) -> Self {
        Self {
            slot: Some(slot),
            ..Default::default()
        }
    }

    /// Oracle that always fails.
    pub fn unreachable() -> Self {
        Self::default()
    }

    /// Node with a public RPC address.
    pub fn public(mut self, rpc: &str) -> Self {
        self.nodes.push(ClusterNode {
            pubkey: Some(format!("pk-{}", rpc)),
            gossip: Some(rpc.replace(":8899", ":8001")),
            rpc: Some(rpc.to_string()),
            version: Some("1.18.22".into()),
        });
        self
    }

    /// Node reachable only through its gossip host.
    pub fn private(mut self, gossip: &str) -> Self {
        self.nodes.push(ClusterNode {
            pubkey: Some(format!("pk-{}", gossip)),
            gossip: Some(gossip.to_string()),
            rpc: None,
            version: Some("1.18.22".into()),
        });
        self
    }

    pub fn node(mut self, node: ClusterNode) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn slot_calls(&self) -> usize {
        self.slot_calls.load(Ordering::SeqCst)
    }

    pub fn node_calls(&self) -> usize {
        self.node_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HeightOracle for MockCluster {
    async fn current_slot(&self) -> Result<u64> {
        self.slot_calls.fetch_add(1, Ordering::SeqCst);
        self.slot.ok_or_else(|| anyhow!("injected oracle failure"))
    }
}

#[async_trait]
impl PeerDirectory for MockCluster {
    async fn cluster_nodes(&self) -> Result<Vec<ClusterNode>> {
        self.node_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.nodes.clone())
    }
}

/// What a mock peer serves
#[derive(Clone, Default)]
pub struct Offer {
    pub incremental: Option<(String, u64)>,
    pub full: Option<(String, u64)>,
    /// Chunk size and interval of the speed-test stream; `None` refuses it
    pub speed: Option<(usize, Duration)>,
    /// Cancel this token once a snapshot transfer has started, then stall
    pub cancel_mid_transfer: Option<CancellationToken>,
}

impl Offer {
    pub fn full(location: &str, latency_ms: u64) -> Self {
        Self {
            full: Some((location.to_string(), latency_ms)),
            ..Default::default()
        }
    }

    pub fn incremental(location: &str, latency_ms: u64) -> Self {
        Self {
            incremental: Some((location.to_string(), latency_ms)),
            ..Default::default()
        }
    }

    pub fn with_full(mut self, location: &str, latency_ms: u64) -> Self {
        self.full = Some((location.to_string(), latency_ms));
        self
    }

    /// Roughly 10 MiB/s.
    pub fn fast(mut self) -> Self {
        self.speed = Some((1 << 20, Duration::from_millis(100)));
        self
    }

    pub fn cancel_mid_transfer(mut self, token: CancellationToken) -> Self {
        self.cancel_mid_transfer = Some(token);
        self
    }

    fn serves(&self, path: &str) -> bool {
        [&self.incremental, &self.full]
            .into_iter()
            .flatten()
            .any(|(location, _)| location == path)
    }
}

/// Body a mock peer returns for a snapshot file.
pub fn file_body(path: &str) -> Vec<u8> {
    format!("contents of {}", path).into_bytes()
}

/// In-memory snapshot peers recording every request
#[derive(Default)]
pub struct MockTransport {
    offers: HashMap<Peer, Offer>,
    locates: Mutex<Vec<(Peer, ArtifactKind)>>,
    opens: Mutex<Vec<(Peer, String)>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peer(mut self, address: &str, offer: Offer) -> Self {
        self.offers.insert(Peer::new(address), offer);
        self
    }

    pub fn locate_calls(&self) -> Vec<(Peer, ArtifactKind)> {
        self.locates.lock().unwrap().clone()
    }

    pub fn open_calls(&self) -> Vec<(Peer, String)> {
        self.opens.lock().unwrap().clone()
    }

    /// Opens of actual snapshot files, excluding speed tests.
    pub fn transfers(&self) -> Vec<(Peer, String)> {
        self.open_calls()
            .into_iter()
            .filter(|(_, path)| path != FULL_SNAPSHOT_PATH)
            .collect()
    }
}

#[async_trait]
impl SnapshotTransport for MockTransport {
    async fn locate(
        &self,
        peer: &Peer,
        kind: ArtifactKind,
        _timeout: Duration,
    ) -> Result<Option<Located>, TransportError> {
        self.locates.lock().unwrap().push((peer.clone(), kind));

        let offer = self.offers.get(peer).ok_or(TransportError::Timeout)?;
        let advertised = match kind {
            ArtifactKind::Full => &offer.full,
            ArtifactKind::Incremental => &offer.incremental,
        };
        Ok(advertised.as_ref().map(|(location, latency_ms)| Located {
            location: location.clone(),
            latency: Duration::from_millis(*latency_ms),
        }))
    }

    async fn open(&self, peer: &Peer, path: &str) -> Result<Transfer, TransportError> {
        self.opens.lock().unwrap().push((peer.clone(), path.to_string()));

        let offer = self
            .offers
            .get(peer)
            .ok_or_else(|| TransportError::Connect("connection refused".into()))?;

        if path == FULL_SNAPSHOT_PATH {
            let (chunk_size, interval) = offer
                .speed
                .ok_or_else(|| TransportError::Connect("connection refused".into()))?;
            let chunk = Bytes::from(vec![0u8; chunk_size]);
            let body = stream::unfold(chunk, move |chunk| async move {
                tokio::time::sleep(interval).await;
                Some((Ok::<_, TransportError>(chunk.clone()), chunk))
            })
            .boxed();
            return Ok(Transfer {
                content_length: None,
                body,
            });
        }

        if !offer.serves(path) {
            return Err(TransportError::Status(404));
        }

        let data = file_body(path);
        let content_length = Some(data.len() as u64);

        if let Some(token) = offer.cancel_mid_transfer.clone() {
            let first = Bytes::copy_from_slice(&data[..data.len() / 2]);
            let body = stream::once(async move { Ok::<_, TransportError>(first) })
                .chain(stream::once(async move {
                    token.cancel();
                    futures::future::pending::<Result<Bytes, TransportError>>().await
                }))
                .boxed();
            return Ok(Transfer {
                content_length,
                body,
            });
        }

        Ok(Transfer {
            content_length,
            body: stream::iter(vec![Ok(Bytes::from(data))]).boxed(),
        })
    }
}
