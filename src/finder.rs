//! Attempt controller.
//!
//! Each attempt runs height lookup, discovery, probing, ranking, bandwidth
//! validation and download. A failed attempt widens discovery to private RPC
//! peers (once) and sleeps before the next one.

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::bandwidth::BandwidthValidator;
use crate::config::Config;
use crate::download::Downloader;
use crate::error::FinderError;
use crate::local::{ensure_writable_blocking, local_full_slot_blocking};
use crate::peers::{discover_peers, PeerSelection, VersionFilter};
use crate::probe::{scan_peers, Candidate, DiscardCounts, DiscardTally, ProbeContext};
use crate::rank::{rank_candidates, ScanReport};
use crate::rpc::{HeightOracle, JsonRpcClient, PeerDirectory};
use crate::transport::{HttpTransport, SnapshotTransport};

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindStatus {
    Success,
    Exhausted,
    Cancelled,
}

/// Why an attempt did not finish with a download
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptFailure {
    HeightUnavailable,
    NoPeers,
    NoCandidates,
    NoFastPeer,
    DownloadFailed,
}

/// Diagnostics for one attempt
#[derive(Debug, Clone, Serialize)]
pub struct AttemptSummary {
    pub attempt: usize,
    pub private_included: bool,
    pub current_slot: Option<u64>,
    pub peers: usize,
    pub candidates: usize,
    pub discarded: DiscardCounts,
    pub report: Option<PathBuf>,
    pub failure: Option<AttemptFailure>,
    pub downloaded: Vec<PathBuf>,
}

impl AttemptSummary {
    fn new(attempt: usize, private_included: bool) -> Self {
        Self {
            attempt,
            private_included,
            current_slot: None,
            peers: 0,
            candidates: 0,
            discarded: DiscardCounts::default(),
            report: None,
            failure: None,
            downloaded: Vec::new(),
        }
    }

    fn fail(mut self, failure: AttemptFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// Result of [`SnapshotFinder::run`]
#[derive(Debug, Clone, Serialize)]
pub struct FindOutcome {
    pub status: FindStatus,
    pub attempts: usize,
    pub attempt_log: Vec<AttemptSummary>,
}

impl FindOutcome {
    pub fn is_success(&self) -> bool {
        self.status == FindStatus::Success
    }

    /// Files written by the successful attempt.
    pub fn downloaded(&self) -> &[PathBuf] {
        match self.attempt_log.last() {
            Some(summary) if self.is_success() => &summary.downloaded,
            _ => &[],
        }
    }

    pub fn last_report(&self) -> Option<&PathBuf> {
        self.attempt_log.iter().rev().find_map(|s| s.report.as_ref())
    }
}

/// Result of a single discovery pass without download
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub summary: AttemptSummary,
    /// Ranked
    pub candidates: Vec<Candidate>,
}

/// One-way switch for private RPC inclusion.
#[derive(Debug, Clone, Copy, Default)]
struct EscalationLatch {
    engaged: bool,
}

impl EscalationLatch {
    fn new(engaged: bool) -> Self {
        Self { engaged }
    }

    fn engaged(&self) -> bool {
        self.engaged
    }

    /// Returns `true` if this call flipped the latch.
    fn engage(&mut self) -> bool {
        !std::mem::replace(&mut self.engaged, true)
    }
}

struct Scan {
    candidates: Vec<Candidate>,
    local_full_slot: u64,
}

/// Finds and downloads a fresh snapshot from the cluster.
#[derive(Clone)]
pub struct SnapshotFinder {
    inner: Arc<Inner>,
}

struct Inner {
    config: Config,
    oracle: Arc<dyn HeightOracle>,
    directory: Arc<dyn PeerDirectory>,
    transport: Arc<dyn SnapshotTransport>,
}

impl SnapshotFinder {
    /// Build a finder talking JSON-RPC and HTTP to the configured cluster.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;

        let rpc = Arc::new(JsonRpcClient::new(
            config.resolved_rpc_urls(),
            config.rpc_timeout(),
        )?);
        let transport = Arc::new(HttpTransport::new(config.probe_timeout())?);

        Ok(Self::with_components(config, rpc.clone(), rpc, transport)?)
    }

    pub fn with_components(
        config: Config,
        oracle: Arc<dyn HeightOracle>,
        directory: Arc<dyn PeerDirectory>,
        transport: Arc<dyn SnapshotTransport>,
    ) -> Result<Self, FinderError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                oracle,
                directory,
                transport,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Run attempts until a download succeeds, attempts run out or `cancel`
    /// fires. Only local resource faults are returned as errors.
    pub async fn run(&self, cancel: CancellationToken) -> Result<FindOutcome, FinderError> {
        let config = &self.inner.config;
        ensure_writable_blocking(config.snapshot_dir.clone()).await?;

        let mut escalation = EscalationLatch::new(config.with_private_rpc);
        let mut attempt_log = Vec::with_capacity(config.max_attempts);

        for attempt in 1..=config.max_attempts {
            tracing::info!("attempt {}/{}", attempt, config.max_attempts);

            let summary = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::warn!("cancelled during attempt {}", attempt);
                    return Ok(FindOutcome {
                        status: FindStatus::Cancelled,
                        attempts: attempt,
                        attempt_log,
                    });
                }
                summary = self.attempt(attempt, escalation.engaged()) => summary?,
            };

            let failed = summary.failure.is_some();
            attempt_log.push(summary);

            if !failed {
                tracing::info!("snapshot download finished after {} attempt(s)", attempt);
                return Ok(FindOutcome {
                    status: FindStatus::Success,
                    attempts: attempt,
                    attempt_log,
                });
            }

            if escalation.engage() {
                tracing::info!("including private rpc nodes in subsequent attempts");
            }

            if attempt < config.max_attempts {
                tracing::info!(
                    "attempt {} failed, retrying in {}s",
                    attempt,
                    config.sleep_before_retry
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::warn!("cancelled while waiting to retry");
                        return Ok(FindOutcome {
                            status: FindStatus::Cancelled,
                            attempts: attempt,
                            attempt_log,
                        });
                    }
                    _ = tokio::time::sleep(config.retry_delay()) => {}
                }
            }
        }

        tracing::error!(
            "could not find a suitable snapshot after {} attempts",
            config.max_attempts
        );
        Ok(FindOutcome {
            status: FindStatus::Exhausted,
            attempts: config.max_attempts,
            attempt_log,
        })
    }

    /// One discovery, probe and rank pass; writes the report but never
    /// downloads.
    pub async fn scan_once(&self) -> Result<ScanOutcome, FinderError> {
        let config = &self.inner.config;
        ensure_writable_blocking(config.snapshot_dir.clone()).await?;

        let mut summary = AttemptSummary::new(1, config.with_private_rpc);
        let candidates = match self.scan(&mut summary, config.with_private_rpc).await {
            Ok(scan) => scan.candidates,
            Err(failure) => {
                summary.failure = Some(failure);
                Vec::new()
            }
        };
        Ok(ScanOutcome {
            summary,
            candidates,
        })
    }

    async fn attempt(
        &self,
        attempt: usize,
        include_private: bool,
    ) -> Result<AttemptSummary, FinderError> {
        let config = &self.inner.config;
        let transport = self.inner.transport.as_ref();
        let mut summary = AttemptSummary::new(attempt, include_private);

        let scan = match self.scan(&mut summary, include_private).await {
            Ok(scan) => scan,
            Err(failure) => return Ok(summary.fail(failure)),
        };

        let mut unsuitable = HashSet::new();
        let validator = BandwidthValidator::new(
            transport,
            config.num_of_rpc_to_check,
            config.min_speed_bytes(),
            config.measurement_duration(),
        );
        let Some(chosen) = validator.select(&scan.candidates, &mut unsuitable).await else {
            tracing::error!(
                "no snapshot peer reached {} MiB/s among the top {}",
                config.min_download_speed,
                config.num_of_rpc_to_check
            );
            return Ok(summary.fail(AttemptFailure::NoFastPeer));
        };

        let mut local_slot = scan.local_full_slot;
        let outcome = Downloader::new(transport, &config.snapshot_dir)
            .refresh_timeout(config.probe_timeout() * 2)
            .stall_timeout(config.stall_timeout())
            .max_speed(config.max_speed_bytes())
            .progress(config.progress)
            .download_candidate(chosen, &mut local_slot)
            .await?;

        summary.downloaded = outcome.files;
        if !outcome.complete {
            return Ok(summary.fail(AttemptFailure::DownloadFailed));
        }
        Ok(summary)
    }

    async fn scan(
        &self,
        summary: &mut AttemptSummary,
        include_private: bool,
    ) -> Result<Scan, AttemptFailure> {
        let config = &self.inner.config;
        let tally = DiscardTally::default();

        let current_slot = if config.slot != 0 {
            tracing::info!("using pinned slot {}", config.slot);
            config.slot
        } else {
            match self.inner.oracle.current_slot().await {
                Ok(slot) => slot,
                Err(e) => {
                    tracing::error!("can't get current slot: {:#}", e);
                    return Err(AttemptFailure::HeightUnavailable);
                }
            }
        };
        summary.current_slot = Some(current_slot);

        let selection = PeerSelection {
            filter: VersionFilter::from_config(config),
            include_private,
            private_rpc_port: config.private_rpc_port,
        };
        let peers = discover_peers(self.inner.directory.as_ref(), &selection, &tally).await;
        summary.peers = peers.len();
        if peers.is_empty() {
            summary.discarded = tally.snapshot();
            tracing::error!("no rpc peers to scan");
            return Err(AttemptFailure::NoPeers);
        }

        let local_full_slot = local_full_slot_blocking(config.snapshot_dir.clone()).await;
        let ctx = ProbeContext {
            current_slot,
            local_full_slot,
            max_snapshot_age: config.max_snapshot_age,
            max_latency_ms: config.max_latency as f64,
            probe_timeout: config.probe_timeout(),
        };

        tracing::info!(
            "current slot {}, local full snapshot slot {}, scanning {} peers",
            current_slot,
            local_full_slot,
            peers.len()
        );

        let pb = config.progress.then(|| scan_progress(peers.len() as u64));
        let mut candidates = scan_peers(
            self.inner.transport.as_ref(),
            &peers,
            ctx,
            &tally,
            config.threads_count,
            pb.as_ref(),
        )
        .await;
        if let Some(pb) = pb {
            pb.finish_and_clear();
        }

        rank_candidates(&mut candidates, config.sort_order);
        summary.candidates = candidates.len();
        summary.discarded = tally.snapshot();

        tracing::info!(
            "attempt {}: {} peers scanned, {} candidates, discarded: {}",
            summary.attempt,
            summary.peers,
            summary.candidates,
            summary.discarded
        );

        let report = ScanReport::new(
            current_slot,
            peers.len(),
            summary.discarded,
            candidates.clone(),
        );
        match report.write_to(&config.snapshot_dir).await {
            Ok(path) => {
                tracing::info!("scan report written to {}", path.display());
                summary.report = Some(path);
            }
            Err(e) => tracing::warn!("failed to write scan report: {:#}", e),
        }

        if candidates.is_empty() {
            tracing::error!("no snapshot candidates found");
            return Err(AttemptFailure::NoCandidates);
        }

        Ok(Scan {
            candidates,
            local_full_slot,
        })
    }
}

fn scan_progress(total: u64) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::default_bar()
        .template("{prefix:.bold} [{bar:30.cyan/blue}] {pos}/{len} peers ({elapsed})")
        .map(|style| style.progress_chars("█▓░"))
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix("probing");
    pb
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escalation_latch_is_one_way() {
        let mut latch = EscalationLatch::new(false);
        assert!(!latch.engaged());
        assert!(latch.engage());
        assert!(latch.engaged());
        assert!(!latch.engage());
        assert!(latch.engaged());
    }

    #[test]
    fn test_latch_already_engaged_does_not_flip() {
        let mut latch = EscalationLatch::new(true);
        assert!(!latch.engage());
    }

    #[test]
    fn test_outcome_downloads_only_on_success() {
        let mut summary = AttemptSummary::new(1, false);
        summary.downloaded.push(PathBuf::from("/tmp/snapshot-1-a.tar.zst"));
        let outcome = FindOutcome {
            status: FindStatus::Exhausted,
            attempts: 1,
            attempt_log: vec![summary.clone()],
        };
        assert!(outcome.downloaded().is_empty());

        let outcome = FindOutcome {
            status: FindStatus::Success,
            attempts: 1,
            attempt_log: vec![summary],
        };
        assert_eq!(outcome.downloaded().len(), 1);
    }
}
