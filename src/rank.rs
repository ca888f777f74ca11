//! Candidate ordering and the scan report written next to the snapshots.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::RankKey;
use crate::probe::{Candidate, DiscardCounts};

/// File name of the scan report inside the snapshot directory
pub const REPORT_FILE_NAME: &str = "snapshot_info.json";

/// Stable ascending sort by `key`; ties keep discovery order.
pub fn rank_candidates(candidates: &mut [Candidate], key: RankKey) {
    match key {
        RankKey::Latency => candidates.sort_by(|a, b| a.latency.total_cmp(&b.latency)),
        RankKey::SlotsDiff => candidates.sort_by_key(|c| c.slots_diff),
    }
}

/// Ranked scan results for one attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    /// Unix time in seconds
    pub last_update_at: f64,
    pub last_update_slot: u64,
    pub total_rpc_nodes_scanned: usize,
    pub rpc_nodes_with_potential_snapshot: usize,
    pub discarded: DiscardCounts,
    pub rpc_nodes: Vec<Candidate>,
}

impl ScanReport {
    pub fn new(
        current_slot: u64,
        scanned: usize,
        discarded: DiscardCounts,
        ranked: Vec<Candidate>,
    ) -> Self {
        let last_update_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        Self {
            last_update_at,
            last_update_slot: current_slot,
            total_rpc_nodes_scanned: scanned,
            rpc_nodes_with_potential_snapshot: ranked.len(),
            discarded,
            rpc_nodes: ranked,
        }
    }

    /// Write the report as pretty JSON to `dir/snapshot_info.json`.
    pub async fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(REPORT_FILE_NAME);
        let json = serde_json::to_vec_pretty(self).context("failed to serialize scan report")?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("failed to write scan report to {}", path.display()))?;
        Ok(path)
    }
}
