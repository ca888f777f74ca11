//! Peer discovery from the cluster node list.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::config::Config;
use crate::probe::{DiscardReason, DiscardTally};
use crate::rpc::{ClusterNode, PeerDirectory};

/// An RPC-serving peer, `host:port`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Peer(String);

impl Peer {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn address(&self) -> &str {
        &self.0
    }

    /// `http://<address><path>`
    pub fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("http://{}{}", self.0, path)
        } else {
            format!("http://{}/{}", self.0, path)
        }
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Version constraint on peers
#[derive(Debug, Clone, Default)]
pub struct VersionFilter {
    exact: Option<String>,
    contains: Option<String>,
}

impl VersionFilter {
    pub fn new(exact: Option<String>, contains: Option<String>) -> Self {
        Self { exact, contains }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.version.clone(), config.wildcard_version.clone())
    }

    /// Peers that do not report a version are always accepted.
    pub fn accepts(&self, version: Option<&str>) -> bool {
        let Some(version) = version else {
            return true;
        };
        if let Some(exact) = &self.exact {
            if version != exact {
                return false;
            }
        }
        if let Some(pattern) = &self.contains {
            if !version.contains(pattern.as_str()) {
                return false;
            }
        }
        true
    }
}

/// How to turn cluster nodes into peers for one attempt
#[derive(Debug, Clone)]
pub struct PeerSelection {
    pub filter: VersionFilter,
    pub include_private: bool,
    pub private_rpc_port: u16,
}

impl PeerSelection {
    /// Peer address for a node, or `None` if it is excluded.
    pub fn address_for(&self, node: &ClusterNode) -> Option<String> {
        if let Some(rpc) = node.rpc.as_deref().filter(|rpc| !rpc.is_empty()) {
            return Some(rpc.to_string());
        }
        if !self.include_private {
            return None;
        }
        let gossip = node.gossip.as_deref()?;
        let host = gossip_host(gossip)?;
        if host.contains(':') {
            Some(format!("[{}]:{}", host, self.private_rpc_port))
        } else {
            Some(format!("{}:{}", host, self.private_rpc_port))
        }
    }

    /// Filter and deduplicate nodes into peers, keeping first-seen order.
    pub fn select(&self, nodes: &[ClusterNode], tally: &DiscardTally) -> Vec<Peer> {
        let mut seen = HashSet::new();
        let mut peers = Vec::new();

        for node in nodes {
            if !self.filter.accepts(node.version.as_deref()) {
                tally.record(DiscardReason::Version);
                continue;
            }
            if let Some(address) = self.address_for(node) {
                if seen.insert(address.clone()) {
                    peers.push(Peer::new(address));
                }
            }
        }

        peers
    }
}

/// Ask the directory for nodes and select peers. Fails softly to an empty list.
pub async fn discover_peers(
    directory: &dyn PeerDirectory,
    selection: &PeerSelection,
    tally: &DiscardTally,
) -> Vec<Peer> {
    let nodes = match directory.cluster_nodes().await {
        Ok(nodes) => nodes,
        Err(e) => {
            tracing::error!("can't get RPC node list: {:#}", e);
            return Vec::new();
        }
    };

    let peers = selection.select(&nodes, tally);
    tracing::debug!(
        "{} cluster nodes -> {} peers (private rpc {})",
        nodes.len(),
        peers.len(),
        if selection.include_private { "included" } else { "excluded" }
    );
    peers
}

fn gossip_host(gossip: &str) -> Option<&str> {
    // `[v6]:port` or `v4:port`
    let host = if let Some(rest) = gossip.strip_prefix('[') {
        rest.split(']').next()?
    } else {
        gossip.rsplit_once(':').map(|(host, _)| host).unwrap_or(gossip)
    };
    (!host.is_empty()).then_some(host)
}
