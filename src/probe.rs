//! Peer probing and classification.
//!
//! Each peer is probed with cheap `HEAD` requests and classified as either a
//! [`Candidate`] (with the artifacts to fetch from it) or discarded for a
//! [`DiscardReason`]. Probing runs as a bounded worker pool; one peer's
//! failure never affects the others.
//!
//! ## Decision order
//!
//! ```text
//! HEAD incremental ──▶ uncompressed? ──▶ discard(archive_type)
//!        │                 │
//!   no redirect /      unparsable ──────────────┐
//!   error                  │                    │
//!        │            too slow? ──▶ discard(latency)
//!        │                 │                    │
//!        │            too old/new? ──▶ discard(slot_age)
//!        │                 │                    │
//!        │        base == local full? ──▶ candidate[incremental]
//!        │                 │                    │
//!        │         HEAD full ok? ──▶ candidate[incremental, full]
//!        │                 │                    │
//!        └─────────────────┴────────────────────┴──▶ HEAD full ──▶ candidate[full] / discard
//! ```

use futures::stream::{self, StreamExt};
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::artifact::{is_uncompressed, ArtifactKind, SnapshotArtifact};
use crate::error::TransportError;
use crate::peers::Peer;
use crate::transport::{Located, SnapshotTransport};

/// How far ahead of the current slot an advertised snapshot may be.
pub const FUTURE_SLOT_TOLERANCE: i64 = 100;

/// Why a peer was not considered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// Offers an uncompressed `.tar` archive
    ArchiveType,
    Latency,
    SlotAge,
    Version,
    Timeout,
    UnknownError,
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DiscardReason::ArchiveType => write!(f, "archive_type"),
            DiscardReason::Latency => write!(f, "latency"),
            DiscardReason::SlotAge => write!(f, "slot_age"),
            DiscardReason::Version => write!(f, "version"),
            DiscardReason::Timeout => write!(f, "timeout"),
            DiscardReason::UnknownError => write!(f, "unknown_error"),
        }
    }
}

/// Discard counters shared by concurrent probe workers
#[derive(Debug, Default)]
pub struct DiscardTally {
    archive_type: AtomicUsize,
    latency: AtomicUsize,
    slot_age: AtomicUsize,
    version: AtomicUsize,
    timeout: AtomicUsize,
    unknown_error: AtomicUsize,
    no_snapshot: AtomicUsize,
}

/// Point-in-time copy of a [`DiscardTally`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscardCounts {
    pub archive_type: usize,
    pub latency: usize,
    pub slot_age: usize,
    pub version: usize,
    pub timeout: usize,
    pub unknown_error: usize,
    /// Reachable peers that advertised no snapshot
    pub no_snapshot: usize,
}

impl DiscardCounts {
    pub fn total(&self) -> usize {
        self.archive_type
            + self.latency
            + self.slot_age
            + self.version
            + self.timeout
            + self.unknown_error
    }
}

impl std::fmt::Display for DiscardCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "archive_type={}, latency={}, slot={}, version={}, timeout={}, unknown_error={}, no_snapshot={}",
            self.archive_type,
            self.latency,
            self.slot_age,
            self.version,
            self.timeout,
            self.unknown_error,
            self.no_snapshot
        )
    }
}

impl DiscardTally {
    pub fn record(&self, reason: DiscardReason) {
        let counter = match reason {
            DiscardReason::ArchiveType => &self.archive_type,
            DiscardReason::Latency => &self.latency,
            DiscardReason::SlotAge => &self.slot_age,
            DiscardReason::Version => &self.version,
            DiscardReason::Timeout => &self.timeout,
            DiscardReason::UnknownError => &self.unknown_error,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_no_snapshot(&self) {
        self.no_snapshot.fetch_add(1, Ordering::Relaxed);
    }

    fn observe(&self, outcome: &ProbeOutcome) {
        match outcome {
            ProbeOutcome::Candidate(_) => {}
            ProbeOutcome::Discarded(reason) => self.record(*reason),
            ProbeOutcome::NoSnapshot => self.record_no_snapshot(),
        }
    }

    pub fn snapshot(&self) -> DiscardCounts {
        DiscardCounts {
            archive_type: self.archive_type.load(Ordering::Relaxed),
            latency: self.latency.load(Ordering::Relaxed),
            slot_age: self.slot_age.load(Ordering::Relaxed),
            version: self.version.load(Ordering::Relaxed),
            timeout: self.timeout.load(Ordering::Relaxed),
            unknown_error: self.unknown_error.load(Ordering::Relaxed),
            no_snapshot: self.no_snapshot.load(Ordering::Relaxed),
        }
    }
}

/// A peer worth checking for bandwidth
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub snapshot_address: Peer,
    /// Current slot minus the advertised snapshot slot
    pub slots_diff: i64,
    /// Probe latency in milliseconds
    pub latency: f64,
    /// Artifact references, downloaded in reverse order
    pub files_to_download: Vec<String>,
}

/// Result of probing a single peer
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Candidate(Candidate),
    Discarded(DiscardReason),
    NoSnapshot,
}

/// Inputs shared by every probe in one attempt
#[derive(Debug, Clone, Copy)]
pub struct ProbeContext {
    pub current_slot: u64,
    /// 0 when no local full snapshot exists
    pub local_full_slot: u64,
    pub max_snapshot_age: u64,
    pub max_latency_ms: f64,
    pub probe_timeout: Duration,
}

impl ProbeContext {
    pub fn slots_diff(&self, slot: u64) -> i64 {
        (self.current_slot as i128 - slot as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    fn age_acceptable(&self, slots_diff: i64) -> bool {
        let max_age = i64::try_from(self.max_snapshot_age).unwrap_or(i64::MAX);
        slots_diff >= -FUTURE_SLOT_TOLERANCE && slots_diff <= max_age
    }

    fn latency_acceptable(&self, located: &Located) -> bool {
        located.latency_ms() <= self.max_latency_ms
    }

    fn matches_local_full(&self, incremental: &SnapshotArtifact) -> bool {
        self.local_full_slot != 0 && incremental.base_slot == Some(self.local_full_slot)
    }
}

type FullProbe = Result<Option<Located>, TransportError>;

/// Probe and classify one peer.
pub async fn classify_peer(
    transport: &dyn SnapshotTransport,
    peer: &Peer,
    ctx: &ProbeContext,
) -> ProbeOutcome {
    let mut full_probe = None;

    match transport
        .locate(peer, ArtifactKind::Incremental, ctx.probe_timeout)
        .await
    {
        Ok(Some(incremental)) => {
            if let Some(outcome) =
                classify_incremental(transport, peer, ctx, &incremental, &mut full_probe).await
            {
                return outcome;
            }
        }
        Ok(None) => {}
        Err(e) => tracing::trace!("{}: incremental probe failed: {}", peer, e),
    }

    let full = match full_probe {
        Some(result) => result,
        None => {
            transport
                .locate(peer, ArtifactKind::Full, ctx.probe_timeout)
                .await
        }
    };
    classify_full(peer, ctx, full)
}

/// `None` means fall through to the standalone full snapshot check.
async fn classify_incremental(
    transport: &dyn SnapshotTransport,
    peer: &Peer,
    ctx: &ProbeContext,
    incremental: &Located,
    full_probe: &mut Option<FullProbe>,
) -> Option<ProbeOutcome> {
    if is_uncompressed(&incremental.location) {
        return Some(ProbeOutcome::Discarded(DiscardReason::ArchiveType));
    }

    let Some(artifact) = SnapshotArtifact::parse_incremental(&incremental.location) else {
        tracing::debug!(
            "{}: unexpected incremental snapshot name {}",
            peer,
            incremental.location
        );
        return None;
    };

    if !ctx.latency_acceptable(incremental) {
        return Some(ProbeOutcome::Discarded(DiscardReason::Latency));
    }

    let slots_diff = ctx.slots_diff(artifact.slot);
    if !ctx.age_acceptable(slots_diff) {
        return Some(ProbeOutcome::Discarded(DiscardReason::SlotAge));
    }

    if ctx.matches_local_full(&artifact) {
        return Some(ProbeOutcome::Candidate(Candidate {
            snapshot_address: peer.clone(),
            slots_diff,
            latency: incremental.latency_ms(),
            files_to_download: vec![incremental.location.clone()],
        }));
    }

    let full = transport
        .locate(peer, ArtifactKind::Full, ctx.probe_timeout)
        .await;
    if let Ok(Some(located)) = &full {
        if !is_uncompressed(&located.location)
            && SnapshotArtifact::parse_full(&located.location).is_some()
        {
            return Some(ProbeOutcome::Candidate(Candidate {
                snapshot_address: peer.clone(),
                slots_diff,
                latency: incremental.latency_ms(),
                files_to_download: vec![incremental.location.clone(), located.location.clone()],
            }));
        }
    }

    *full_probe = Some(full);
    None
}

fn classify_full(peer: &Peer, ctx: &ProbeContext, probe: FullProbe) -> ProbeOutcome {
    let located = match probe {
        Ok(Some(located)) => located,
        Ok(None) => return ProbeOutcome::NoSnapshot,
        Err(e) => {
            tracing::trace!("{}: full probe failed: {}", peer, e);
            return ProbeOutcome::Discarded(if e.is_timeout() {
                DiscardReason::Timeout
            } else {
                DiscardReason::UnknownError
            });
        }
    };

    if is_uncompressed(&located.location) {
        return ProbeOutcome::Discarded(DiscardReason::ArchiveType);
    }

    let Some(artifact) = SnapshotArtifact::parse_full(&located.location) else {
        tracing::debug!("{}: unexpected snapshot name {}", peer, located.location);
        return ProbeOutcome::Discarded(DiscardReason::UnknownError);
    };

    let slots_diff = ctx.slots_diff(artifact.slot);
    if !ctx.age_acceptable(slots_diff) {
        return ProbeOutcome::Discarded(DiscardReason::SlotAge);
    }
    if !ctx.latency_acceptable(&located) {
        return ProbeOutcome::Discarded(DiscardReason::Latency);
    }

    ProbeOutcome::Candidate(Candidate {
        snapshot_address: peer.clone(),
        slots_diff,
        latency: located.latency_ms(),
        files_to_download: vec![located.location],
    })
}

/// Probe `peers` with at most `concurrency` requests in flight.
///
/// Candidates come back in discovery order.
pub async fn scan_peers(
    transport: &dyn SnapshotTransport,
    peers: &[Peer],
    ctx: ProbeContext,
    tally: &DiscardTally,
    concurrency: usize,
    progress: Option<&ProgressBar>,
) -> Vec<Candidate> {
    if peers.is_empty() {
        return Vec::new();
    }

    let mut found: Vec<(usize, Candidate)> = stream::iter(peers.iter().enumerate())
        .map(|(index, peer)| async move {
            let outcome = classify_peer(transport, peer, &ctx).await;
            tally.observe(&outcome);
            if let Some(pb) = progress {
                pb.inc(1);
            }
            match outcome {
                ProbeOutcome::Candidate(candidate) => Some((index, candidate)),
                _ => None,
            }
        })
        .buffer_unordered(concurrency.max(1))
        .filter_map(|found| async move { found })
        .collect()
        .await;

    found.sort_by_key(|(index, _)| *index);
    found.into_iter().map(|(_, candidate)| candidate).collect()
}
