//! Snapshot artifact names and the metadata embedded in them.
//!
//! Peers advertise their snapshots through a redirect whose target names the
//! real archive. The heights and content hash are encoded positionally:
//!
//! ```text
//! snapshot-<slot>-<hash>.tar.zst
//! incremental-snapshot-<base_slot>-<slot>-<hash>.tar.zst
//! ```
//!
//! These names come from untrusted peers, so parsing never panics: anything
//! that does not fit the layout is reported as unparsable (`None`).

use serde::{Deserialize, Serialize};

/// Conventional path answering with a redirect to the current full snapshot.
pub const FULL_SNAPSHOT_PATH: &str = "/snapshot.tar.bz2";
/// Conventional path answering with a redirect to the current incremental snapshot.
pub const INCREMENTAL_SNAPSHOT_PATH: &str = "/incremental-snapshot.tar.bz2";

const FULL_PREFIX: &str = "snapshot-";
const INCREMENTAL_PREFIX: &str = "incremental-snapshot-";

/// Kind of snapshot artifact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Complete state at a slot
    Full,
    /// Delta between a base full snapshot and a later slot
    Incremental,
}

impl ArtifactKind {
    /// Path on the peer that redirects to the current artifact of this kind.
    pub fn probe_path(&self) -> &'static str {
        match self {
            ArtifactKind::Full => FULL_SNAPSHOT_PATH,
            ArtifactKind::Incremental => INCREMENTAL_SNAPSHOT_PATH,
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArtifactKind::Full => write!(f, "full"),
            ArtifactKind::Incremental => write!(f, "incremental"),
        }
    }
}

/// A parsed artifact reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotArtifact {
    /// Reference exactly as advertised (usually `/snapshot-...`)
    pub path: String,
    /// Final path segment, used as the local file name
    pub file_name: String,
    pub kind: ArtifactKind,
    /// Slot the artifact describes (tip slot for incrementals)
    pub slot: u64,
    /// Full snapshot slot an incremental applies on top of
    pub base_slot: Option<u64>,
    /// Content identifier, without archive extension
    pub hash: String,
}

impl SnapshotArtifact {
    /// Parse a reference of either kind.
    pub fn parse(path: &str) -> Option<Self> {
        let file_name = file_name(path)?;
        if file_name.starts_with(INCREMENTAL_PREFIX) {
            Self::parse_incremental(path)
        } else {
            Self::parse_full(path)
        }
    }

    /// Parse a full snapshot reference (`snapshot-<slot>-<hash>...`).
    pub fn parse_full(path: &str) -> Option<Self> {
        let file_name = file_name(path)?;
        let rest = file_name.strip_prefix(FULL_PREFIX)?;
        let mut parts = rest.splitn(2, '-');
        let slot = parse_slot(parts.next()?)?;
        let hash = parse_hash(parts.next()?)?;

        Some(Self {
            path: path.to_string(),
            file_name: file_name.to_string(),
            kind: ArtifactKind::Full,
            slot,
            base_slot: None,
            hash,
        })
    }

    /// Parse an incremental reference (`incremental-snapshot-<base>-<slot>-<hash>...`).
    pub fn parse_incremental(path: &str) -> Option<Self> {
        let file_name = file_name(path)?;
        let rest = file_name.strip_prefix(INCREMENTAL_PREFIX)?;
        let mut parts = rest.splitn(3, '-');
        let base_slot = parse_slot(parts.next()?)?;
        let slot = parse_slot(parts.next()?)?;
        let hash = parse_hash(parts.next()?)?;

        Some(Self {
            path: path.to_string(),
            file_name: file_name.to_string(),
            kind: ArtifactKind::Incremental,
            slot,
            base_slot: Some(base_slot),
            hash,
        })
    }

    pub fn is_full(&self) -> bool {
        self.kind == ArtifactKind::Full
    }

    pub fn is_incremental(&self) -> bool {
        self.kind == ArtifactKind::Incremental
    }
}

/// Whether a redirect target points at an uncompressed archive.
pub fn is_uncompressed(location: &str) -> bool {
    location.ends_with(".tar")
}

/// Last path segment of a reference, ignoring any query string.
pub fn file_name(path: &str) -> Option<&str> {
    let path = path.split(['?', '#']).next().unwrap_or(path);
    path.rsplit('/').next().filter(|name| !name.is_empty())
}

fn parse_slot(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn parse_hash(s: &str) -> Option<String> {
    let hash = s.split('.').next().unwrap_or_default();
    if hash.is_empty() || !hash.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(hash.to_string())
}
