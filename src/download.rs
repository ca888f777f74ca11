//! Snapshot transfer from a validated peer.
//!
//! Files are streamed into `tmp-<name>` inside the snapshot directory and
//! renamed to `<name>` once complete. A partially written temp file is removed
//! whenever a transfer ends early, including when the future is dropped.

use futures::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;

use crate::artifact::{file_name, ArtifactKind, SnapshotArtifact};
use crate::error::FinderError;
use crate::peers::Peer;
use crate::probe::Candidate;
use crate::transport::SnapshotTransport;

/// Prefix of in-progress downloads
pub const TEMP_PREFIX: &str = "tmp-";

/// Result of downloading a candidate's artifacts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Every reference was fetched or already present
    pub complete: bool,
    /// Files written by this call
    pub files: Vec<PathBuf>,
    /// References skipped because they already exist locally
    pub skipped: usize,
}

/// Removes the wrapped file on drop unless disarmed.
struct TempFileGuard {
    path: Option<PathBuf>,
    released: Arc<AtomicBool>,
}

impl TempFileGuard {
    /// Create `path` with the guard armed before the file exists.
    ///
    /// If the guard is dropped while creation is still running, the file is
    /// removed as soon as creation finishes.
    async fn create(path: PathBuf) -> io::Result<(Self, tokio::fs::File)> {
        let released = Arc::new(AtomicBool::new(false));
        let guard = Self {
            path: Some(path.clone()),
            released: released.clone(),
        };

        let file = tokio::task::spawn_blocking(move || {
            let file = std::fs::File::create(&path)?;
            if released.load(Ordering::SeqCst) {
                let _ = std::fs::remove_file(&path);
            }
            Ok::<_, io::Error>(file)
        })
        .await
        .map_err(io::Error::other)??;

        Ok((guard, tokio::fs::File::from_std(file)))
    }

    fn disarm(mut self) {
        self.path = None;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            self.released.store(true, Ordering::SeqCst);
            if std::fs::remove_file(&path).is_ok() {
                tracing::debug!("removed partial download {}", path.display());
            }
        }
    }
}

/// Downloads candidate artifacts into the snapshot directory
pub struct Downloader<'a> {
    transport: &'a dyn SnapshotTransport,
    dir: PathBuf,
    refresh_timeout: Duration,
    stall_timeout: Duration,
    /// Bytes per second
    max_speed: Option<f64>,
    progress: bool,
}

impl<'a> Downloader<'a> {
    pub fn new(transport: &'a dyn SnapshotTransport, dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            dir: dir.into(),
            refresh_timeout: Duration::from_secs(2),
            stall_timeout: Duration::from_secs(60),
            max_speed: None,
            progress: false,
        }
    }

    pub fn refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn max_speed(mut self, bytes_per_sec: Option<f64>) -> Self {
        self.max_speed = bytes_per_sec;
        self
    }

    pub fn progress(mut self, enabled: bool) -> Self {
        self.progress = enabled;
        self
    }

    /// Fetch every reference of `candidate`, last listed first.
    ///
    /// `local_full_slot` is updated after a full snapshot lands so later
    /// references in the same call see it. Transfer failures stop at the
    /// first failing reference and yield `complete == false`; only local I/O
    /// failures are returned as errors.
    pub async fn download_candidate(
        &self,
        candidate: &Candidate,
        local_full_slot: &mut u64,
    ) -> Result<DownloadOutcome, FinderError> {
        let peer = &candidate.snapshot_address;
        let mut outcome = DownloadOutcome::default();

        if candidate.files_to_download.is_empty() {
            tracing::warn!("no files listed for download from {}", peer);
            return Ok(outcome);
        }

        for reference in candidate.files_to_download.iter().rev() {
            let Some(planned) = SnapshotArtifact::parse(reference) else {
                tracing::error!("unparsable snapshot reference {} from {}", reference, peer);
                return Ok(outcome);
            };

            if planned.is_full() && planned.slot == *local_full_slot {
                tracing::info!(
                    "skipping {}, local full snapshot for slot {} exists",
                    reference,
                    local_full_slot
                );
                outcome.skipped += 1;
                continue;
            }

            let artifact = match planned.kind {
                ArtifactKind::Incremental => {
                    self.refresh_incremental(peer, planned, *local_full_slot).await
                }
                ArtifactKind::Full => planned,
            };

            let final_path = self.dir.join(&artifact.file_name);
            if tokio::fs::try_exists(&final_path).await.unwrap_or(false) {
                tracing::info!("skipping {}, already downloaded", final_path.display());
                outcome.skipped += 1;
                if artifact.is_full() {
                    *local_full_slot = artifact.slot;
                }
                continue;
            }

            tracing::info!("downloading {} to {}", peer.url(&artifact.path), self.dir.display());
            if !self.fetch(peer, &artifact.path, &final_path).await? {
                tracing::error!(
                    "failed to download {} from {}, aborting downloads for this peer",
                    artifact.path,
                    peer
                );
                return Ok(outcome);
            }
            outcome.files.push(final_path);

            if artifact.is_full() && *local_full_slot != artifact.slot {
                *local_full_slot = artifact.slot;
                tracing::info!("local full snapshot slot is now {}", artifact.slot);
            }
        }

        outcome.complete = true;
        tracing::info!("all snapshot files downloaded successfully from {}", peer);
        Ok(outcome)
    }

    /// Re-probe the incremental offering right before transfer.
    ///
    /// The fresh reference is used only when it still applies on top of the
    /// local full snapshot; otherwise the planned one is kept.
    async fn refresh_incremental(
        &self,
        peer: &Peer,
        planned: SnapshotArtifact,
        local_full_slot: u64,
    ) -> SnapshotArtifact {
        tracing::info!("refreshing incremental snapshot link for {}", peer);

        let fresh = match self
            .transport
            .locate(peer, ArtifactKind::Incremental, self.refresh_timeout)
            .await
        {
            Ok(Some(located)) => located.location,
            Ok(None) => {
                tracing::warn!("no fresh incremental link from {}, using original", peer);
                return planned;
            }
            Err(e) => {
                tracing::warn!(
                    "could not refresh incremental link from {}: {}; using original",
                    peer,
                    e
                );
                return planned;
            }
        };

        let Some(fresh_artifact) = SnapshotArtifact::parse_incremental(&fresh) else {
            tracing::warn!(
                "could not parse fresh incremental {} from {}, sticking to {}",
                fresh,
                peer,
                planned.path
            );
            return planned;
        };

        if local_full_slot > 0 && fresh_artifact.base_slot != Some(local_full_slot) {
            tracing::warn!(
                "fresh incremental {} from {} has base slot {}, expected {}; sticking to {}",
                fresh,
                peer,
                fresh_artifact.base_slot.unwrap_or_default(),
                local_full_slot,
                planned.path
            );
            return planned;
        }

        if fresh_artifact.path != planned.path {
            tracing::info!("using fresh incremental link {}", fresh_artifact.path);
        }
        fresh_artifact
    }

    /// Stream `path` into a temp file and rename it to `final_path`.
    async fn fetch(&self, peer: &Peer, path: &str, final_path: &Path) -> Result<bool, FinderError> {
        let name = file_name(path).unwrap_or(path);
        let temp_path = self.dir.join(format!("{}{}", TEMP_PREFIX, name));

        let transfer = match self.transport.open(peer, path).await {
            Ok(transfer) => transfer,
            Err(e) => {
                tracing::error!("failed to start download of {} from {}: {}", path, peer, e);
                return Ok(false);
            }
        };

        let (guard, mut file) = TempFileGuard::create(temp_path.clone())
            .await
            .map_err(|e| FinderError::resource(&temp_path, e))?;

        let pb = self.progress_bar(name, transfer.content_length);
        let started = Instant::now();
        let mut downloaded: u64 = 0;
        let mut body = transfer.body;

        loop {
            let chunk = match tokio::time::timeout(self.stall_timeout, body.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    abandon(&pb);
                    tracing::error!("error reading {} from {}: {}", path, peer, e);
                    return Ok(false);
                }
                Err(_) => {
                    abandon(&pb);
                    tracing::error!(
                        "download of {} from {} stalled for {}s",
                        path,
                        peer,
                        self.stall_timeout.as_secs()
                    );
                    return Ok(false);
                }
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| FinderError::resource(&temp_path, e))?;
            downloaded += chunk.len() as u64;
            if let Some(pb) = &pb {
                pb.set_position(downloaded);
            }

            if let Some(limit) = self.max_speed {
                let expected = Duration::from_secs_f64(downloaded as f64 / limit);
                let elapsed = started.elapsed();
                if expected > elapsed {
                    tokio::time::sleep(expected - elapsed).await;
                }
            }
        }

        if let Some(expected) = transfer.content_length {
            if downloaded != expected {
                abandon(&pb);
                tracing::error!(
                    "truncated download of {} from {}: got {} of {} bytes",
                    path,
                    peer,
                    downloaded,
                    expected
                );
                return Ok(false);
            }
        }

        file.flush()
            .await
            .map_err(|e| FinderError::resource(&temp_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| FinderError::resource(&temp_path, e))?;
        drop(file);

        tokio::fs::rename(&temp_path, final_path)
            .await
            .map_err(|e| FinderError::resource(final_path, e))?;
        guard.disarm();

        let elapsed = started.elapsed();
        let mb = downloaded as f64 / 1_000_000.0;
        if let Some(pb) = &pb {
            pb.finish_with_message(format!("done ({:.1} MB/s)", mb / elapsed.as_secs_f64()));
        }
        tracing::info!(
            "finished download of {} in {:.2}s ({:.2} MB, {:.2} MB/s)",
            final_path.display(),
            elapsed.as_secs_f64(),
            mb,
            mb / elapsed.as_secs_f64().max(f64::EPSILON)
        );

        Ok(true)
    }

    fn progress_bar(&self, name: &str, total: Option<u64>) -> Option<ProgressBar> {
        if !self.progress {
            return None;
        }
        let pb = match total {
            Some(total) => ProgressBar::new(total),
            None => ProgressBar::new_spinner(),
        };
        let style = ProgressStyle::default_bar()
            .template("{prefix:.bold} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}")
            .map(|style| style.progress_chars("█▓░"))
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        pb.set_style(style);
        pb.set_prefix(name.to_string());
        Some(pb)
    }
}

fn abandon(pb: &Option<ProgressBar>) {
    if let Some(pb) = pb {
        pb.abandon_with_message("failed");
    }
}
