//! # Snapshot Finder
//!
//! Find and download a fresh ledger snapshot from the RPC peers of a cluster.
//!
//! Peers serving snapshots over HTTP answer `HEAD /snapshot.tar.bz2` and
//! `HEAD /incremental-snapshot.tar.bz2` with a redirect naming the real
//! archive. The finder probes every peer the cluster advertises, keeps the
//! ones offering a recent enough snapshot with low latency, checks their
//! throughput one by one and downloads from the first fast one.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use snapshot_finder::{Config, SnapshotFinder};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::builder()
//!         .snapshot_dir("/mnt/ledger")
//!         .max_snapshot_age(1300)
//!         .build()?;
//!
//!     let finder = SnapshotFinder::new(config)?;
//!     let outcome = finder.run(CancellationToken::new()).await?;
//!     println!("{:?} after {} attempts", outcome.status, outcome.attempts);
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!  finder (attempts, escalation)
//!    ├─ rpc        current slot + cluster nodes
//!    ├─ peers      version filter, private rpc addresses, dedup
//!    ├─ local      newest local full snapshot
//!    ├─ probe      bounded parallel HEAD probes -> candidates
//!    ├─ rank       ordering + snapshot_info.json
//!    ├─ bandwidth  sequential throughput check
//!    └─ download   temp file, refresh incremental, atomic rename
//! ```
//!
//! - [`artifact`]: snapshot file name parsing
//! - [`transport`]: peer HTTP surface
//! - [`config`]: configuration and CLI argument handling
//! - [`error`]: error types

pub mod artifact;
pub mod bandwidth;
pub mod config;
pub mod download;
pub mod error;
pub mod finder;
pub mod local;
pub mod peers;
pub mod probe;
pub mod rank;
pub mod rpc;
pub mod transport;

// Re-exports for convenience
pub use config::Config;
pub use error::{FinderError, TransportError};
pub use finder::{FindOutcome, FindStatus, SnapshotFinder};
pub use probe::Candidate;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::artifact::{ArtifactKind, SnapshotArtifact};
    pub use crate::config::{Cluster, Config, RankKey};
    pub use crate::finder::{FindOutcome, FindStatus, SnapshotFinder};
    pub use crate::peers::Peer;
    pub use crate::rpc::{HeightOracle, PeerDirectory};
    pub use crate::transport::SnapshotTransport;
}
