//! Throughput validation of ranked candidates.
//!
//! A candidate's speed is the median of roughly one-second throughput samples
//! taken while streaming its full snapshot for a fixed measurement time.
//! Candidates are checked one at a time so measurements don't compete for
//! local bandwidth.

use futures::StreamExt;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

use crate::artifact::FULL_SNAPSHOT_PATH;
use crate::peers::Peer;
use crate::probe::Candidate;
use crate::transport::SnapshotTransport;

/// Width of a single throughput sample.
pub const SAMPLE_WINDOW: Duration = Duration::from_secs(1);

/// Extra time allowed for the measurement request to connect.
const CONNECT_GRACE: Duration = Duration::from_secs(2);

/// Collects per-window throughput estimates.
#[derive(Debug)]
pub struct ThroughputSampler {
    start: Instant,
    last: Instant,
    loaded: u64,
    duration: Duration,
    samples: Vec<f64>,
}

impl ThroughputSampler {
    pub fn new(start: Instant, duration: Duration) -> Self {
        Self {
            start,
            last: start,
            loaded: 0,
            duration,
            samples: Vec::new(),
        }
    }

    /// Account for `bytes` received at `now`. Returns `false` once the
    /// measurement time is over; that chunk is not counted.
    pub fn record(&mut self, now: Instant, bytes: usize) -> bool {
        if now.duration_since(self.start) >= self.duration {
            return false;
        }

        self.loaded += bytes as u64;
        let delta = now.duration_since(self.last);
        if delta > SAMPLE_WINDOW {
            self.samples.push(self.loaded as f64 / delta.as_secs_f64());
            self.last = now;
            self.loaded = 0;
        }
        true
    }

    pub fn samples(&self) -> &[f64] {
        &self.samples
    }

    /// Median bytes per second, `None` without samples.
    pub fn median(&self) -> Option<f64> {
        median(&self.samples)
    }
}

pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Measure download speed from `peer` in bytes per second; 0.0 if nothing
/// usable was measured.
pub async fn measure_speed(
    transport: &dyn SnapshotTransport,
    peer: &Peer,
    duration: Duration,
) -> f64 {
    let transfer =
        match tokio::time::timeout(duration + CONNECT_GRACE, transport.open(peer, FULL_SNAPSHOT_PATH))
            .await
        {
            Ok(Ok(transfer)) => transfer,
            Ok(Err(e)) => {
                tracing::debug!("failed to stream from {} for speed test: {}", peer, e);
                return 0.0;
            }
            Err(_) => {
                tracing::debug!("speed test connection to {} timed out", peer);
                return 0.0;
            }
        };

    let start = Instant::now();
    let deadline = start + duration;
    let mut sampler = ThroughputSampler::new(start, duration);
    let mut body = transfer.body;

    loop {
        match tokio::time::timeout_at(deadline, body.next()).await {
            Ok(Some(Ok(chunk))) => {
                if !sampler.record(Instant::now(), chunk.len()) {
                    break;
                }
            }
            Ok(Some(Err(e))) => {
                tracing::debug!("error during speed measurement for {}: {}", peer, e);
                break;
            }
            Ok(None) | Err(_) => break,
        }
    }

    sampler.median().unwrap_or(0.0)
}

/// Sequential bandwidth check over the top of the ranking
pub struct BandwidthValidator<'a> {
    transport: &'a dyn SnapshotTransport,
    /// Candidates considered from the top of the ranking
    pub max_checks: usize,
    /// Bytes per second
    pub min_speed: f64,
    pub measurement_time: Duration,
}

impl<'a> BandwidthValidator<'a> {
    pub fn new(
        transport: &'a dyn SnapshotTransport,
        max_checks: usize,
        min_speed: f64,
        measurement_time: Duration,
    ) -> Self {
        Self {
            transport,
            max_checks,
            min_speed,
            measurement_time,
        }
    }

    /// First candidate clearing the minimum speed. Peers that fail are added
    /// to `unsuitable` and skipped from then on.
    pub async fn select<'c>(
        &self,
        ranked: &'c [Candidate],
        unsuitable: &mut HashSet<Peer>,
    ) -> Option<&'c Candidate> {
        let cap = self.max_checks.min(ranked.len());

        for (i, candidate) in ranked.iter().take(self.max_checks).enumerate() {
            let peer = &candidate.snapshot_address;
            tracing::info!(
                "{}/{} checking speed for {} (latency: {:.2}ms, slot diff: {})",
                i + 1,
                cap,
                peer,
                candidate.latency,
                candidate.slots_diff
            );

            if unsuitable.contains(peer) {
                tracing::info!("skipping {}, already marked unsuitable", peer);
                continue;
            }

            let speed = measure_speed(self.transport, peer, self.measurement_time).await;
            if speed <= 0.0 {
                tracing::warn!("speed measurement failed or result is zero for {}", peer);
                unsuitable.insert(peer.clone());
                continue;
            }

            let mib = speed / (1024.0 * 1024.0);
            if speed < self.min_speed {
                tracing::info!(
                    "too slow: {} ({:.2} MiB/s), minimum required {:.2} MiB/s",
                    peer,
                    mib,
                    self.min_speed / (1024.0 * 1024.0)
                );
                unsuitable.insert(peer.clone());
                continue;
            }

            tracing::info!("sufficient speed: {} ({:.2} MiB/s)", peer, mib);
            return Some(candidate);
        }

        None
    }
}
