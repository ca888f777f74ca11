//! Cluster RPC primitives used by the finder.
//!
//! The finder needs exactly two things from the cluster: the current slot
//! ([`HeightOracle`]) and the list of known nodes ([`PeerDirectory`]).
//! [`JsonRpcClient`] implements both over JSON-RPC with failover across the
//! configured endpoints.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Source of the cluster's current slot
#[async_trait]
pub trait HeightOracle: Send + Sync {
    async fn current_slot(&self) -> Result<u64>;
}

/// Source of the cluster's node list
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    async fn cluster_nodes(&self) -> Result<Vec<ClusterNode>>;
}

/// A node entry as returned by `getClusterNodes`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterNode {
    #[serde(default)]
    pub pubkey: Option<String>,
    /// Gossip (discovery protocol) address, `ip:port`
    #[serde(default)]
    pub gossip: Option<String>,
    /// Public RPC address, `ip:port`; absent for private RPC nodes
    #[serde(default)]
    pub rpc: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC client rotating across endpoints on failure
pub struct JsonRpcClient {
    urls: Vec<String>,
    client: Client,
    current: AtomicUsize,
    max_retries: usize,
    retry_delay: Duration,
}

impl JsonRpcClient {
    pub fn new(urls: Vec<String>, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!urls.is_empty(), "at least one RPC url must be provided");

        Ok(Self {
            urls,
            client: Client::builder()
                .timeout(timeout)
                .build()
                .context("failed to create HTTP client")?,
            current: AtomicUsize::new(0),
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        })
    }

    pub fn with_max_retries(mut self, max_retries: usize) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Endpoint currently in use
    pub fn current_url(&self) -> &str {
        let idx = self.current.load(Ordering::Relaxed) % self.urls.len();
        &self.urls[idx]
    }

    fn rotate(&self) {
        self.current.fetch_add(1, Ordering::Relaxed);
    }

    /// Call `method`, trying each endpoint up to `max_retries` times.
    pub async fn call<T: DeserializeOwned>(&self, method: &str) -> Result<T> {
        let total_attempts = self.max_retries * self.urls.len();
        let mut last_error = None;

        for attempt in 1..=total_attempts {
            let url = self.current_url().to_string();
            match self.call_once::<T>(&url, method).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    tracing::warn!(
                        "rpc {} failed on {} (attempt {}/{}): {:#}",
                        method,
                        url,
                        attempt,
                        total_attempts,
                        e
                    );
                    last_error = Some(e);
                    self.rotate();
                    if attempt < total_attempts {
                        tokio::time::sleep(self.retry_delay).await;
                    }
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow::anyhow!("no RPC endpoints configured"))
            .context(format!("all RPC endpoints failed for {}", method)))
    }

    async fn call_once<T: DeserializeOwned>(&self, url: &str, method: &str) -> Result<T> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
        });

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", url))?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!("status {}", response.status()));
        }

        let body: RpcResponse<T> = response
            .json()
            .await
            .with_context(|| format!("invalid {} response", method))?;

        if let Some(err) = body.error {
            return Err(anyhow::anyhow!("rpc error {}: {}", err.code, err.message));
        }
        body.result
            .ok_or_else(|| anyhow::anyhow!("{} response has no result", method))
    }
}

#[async_trait]
impl HeightOracle for JsonRpcClient {
    async fn current_slot(&self) -> Result<u64> {
        self.call("getSlot").await
    }
}

#[async_trait]
impl PeerDirectory for JsonRpcClient {
    async fn cluster_nodes(&self) -> Result<Vec<ClusterNode>> {
        self.call("getClusterNodes").await
    }
}
