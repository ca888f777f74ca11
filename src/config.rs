//! Configuration for snapshot discovery and download.
//!
//! Every knob is a CLI flag and can also be supplied through a
//! `SNAP_FINDER_*` environment variable. Library users build a [`Config`]
//! with [`Config::builder`].
//!
//! ## Clusters
//!
//! - **mainnet** (`um`): `https://api.mainnet-beta.solana.com`
//! - **testnet** (`ut`): `https://api.testnet.solana.com`
//!
//! Passing `--rpc-url` overrides the preset endpoint.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::FinderError;

/// Cluster preset, selecting the default RPC endpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Cluster {
    #[default]
    Mainnet,
    Testnet,
}

impl Cluster {
    pub fn default_rpc_url(&self) -> &'static str {
        match self {
            Cluster::Mainnet => "https://api.mainnet-beta.solana.com",
            Cluster::Testnet => "https://api.testnet.solana.com",
        }
    }
}

impl std::str::FromStr for Cluster {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mainnet" | "mainnet-beta" | "um" => Ok(Cluster::Mainnet),
            "testnet" | "ut" => Ok(Cluster::Testnet),
            _ => Err(format!(
                "Unknown cluster: {}. Use 'mainnet' (um) or 'testnet' (ut).",
                s
            )),
        }
    }
}

impl std::fmt::Display for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cluster::Mainnet => write!(f, "mainnet"),
            Cluster::Testnet => write!(f, "testnet"),
        }
    }
}

/// Key used to order candidates before bandwidth validation (ascending).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RankKey {
    #[default]
    Latency,
    SlotsDiff,
}

impl std::str::FromStr for RankKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "latency" => Ok(RankKey::Latency),
            "slots_diff" | "slots-diff" | "age" => Ok(RankKey::SlotsDiff),
            _ => Err(format!(
                "Unknown sort order: {}. Use 'latency' or 'slots_diff'.",
                s
            )),
        }
    }
}

/// Configuration for the snapshot finder.
#[derive(Parser, Debug, Clone)]
pub struct Config {
    // === Cluster ===
    /// Cluster preset (mainnet/um or testnet/ut)
    #[arg(long, env = "SNAP_FINDER_CLUSTER", default_value = "mainnet")]
    pub cluster: Cluster,

    /// JSON-RPC endpoint(s); repeat the flag for failover. Defaults to the cluster preset.
    #[arg(long = "rpc-url", env = "SNAP_FINDER_RPC_URL", value_delimiter = ',')]
    pub rpc_urls: Vec<String>,

    /// Timeout for height and peer-list requests in seconds
    #[arg(long, env = "SNAP_FINDER_RPC_TIMEOUT_SECS", default_value = "25")]
    pub rpc_timeout_secs: u64,

    // === Storage ===
    /// Directory snapshots are downloaded into
    #[arg(long, env = "SNAP_FINDER_SNAPSHOT_DIR", default_value = ".")]
    pub snapshot_dir: PathBuf,

    // === Peer Selection ===
    /// Only use peers reporting exactly this version
    #[arg(long, env = "SNAP_FINDER_VERSION")]
    pub version: Option<String>,

    /// Only use peers whose version contains this string
    #[arg(long, env = "SNAP_FINDER_WILDCARD_VERSION")]
    pub wildcard_version: Option<String>,

    /// Include peers without a public RPC port from the first attempt
    #[arg(long, env = "SNAP_FINDER_WITH_PRIVATE_RPC", default_value = "false")]
    pub with_private_rpc: bool,

    /// RPC port assumed for peers derived from their gossip address
    #[arg(long, env = "SNAP_FINDER_PRIVATE_RPC_PORT", default_value = "8899")]
    pub private_rpc_port: u16,

    // === Probing ===
    /// Use this slot as the current height instead of asking the cluster (0 = ask)
    #[arg(long, env = "SNAP_FINDER_SLOT", default_value = "0")]
    pub slot: u64,

    /// Maximum snapshot age in slots
    #[arg(long, env = "SNAP_FINDER_MAX_SNAPSHOT_AGE", default_value = "1300")]
    pub max_snapshot_age: u64,

    /// Maximum acceptable probe latency in milliseconds
    #[arg(long, env = "SNAP_FINDER_MAX_LATENCY", default_value = "100")]
    pub max_latency: u64,

    /// Number of peers probed concurrently
    #[arg(long, env = "SNAP_FINDER_THREADS_COUNT", default_value = "1000")]
    pub threads_count: usize,

    /// Timeout for a single snapshot probe in milliseconds
    #[arg(long, env = "SNAP_FINDER_PROBE_TIMEOUT_MS", default_value = "1000")]
    pub probe_timeout_ms: u64,

    /// Candidate ordering: latency or slots_diff
    #[arg(long, env = "SNAP_FINDER_SORT_ORDER", default_value = "latency")]
    pub sort_order: RankKey,

    // === Bandwidth ===
    /// Minimum download speed in MiB/s
    #[arg(long, env = "SNAP_FINDER_MIN_DOWNLOAD_SPEED", default_value = "60")]
    pub min_download_speed: u64,

    /// Cap the transfer rate in MiB/s
    #[arg(long, env = "SNAP_FINDER_MAX_DOWNLOAD_SPEED")]
    pub max_download_speed: Option<u64>,

    /// Seconds spent sampling throughput per candidate
    #[arg(long, env = "SNAP_FINDER_MEASUREMENT_TIME", default_value = "7")]
    pub measurement_time: u64,

    /// Number of top candidates checked for bandwidth
    #[arg(long, env = "SNAP_FINDER_NUM_OF_RPC_TO_CHECK", default_value = "15")]
    pub num_of_rpc_to_check: usize,

    /// Abort a download after this many seconds without data
    #[arg(long, env = "SNAP_FINDER_STALL_TIMEOUT_SECS", default_value = "60")]
    pub stall_timeout_secs: u64,

    // === Retries ===
    /// Maximum discovery-to-download attempts
    #[arg(long, env = "SNAP_FINDER_MAX_ATTEMPTS", default_value = "5")]
    pub max_attempts: usize,

    /// Delay between attempts in seconds
    #[arg(long, env = "SNAP_FINDER_SLEEP_BEFORE_RETRY", default_value = "7")]
    pub sleep_before_retry: u64,

    // === Output ===
    /// Show progress bars
    #[arg(
        long,
        env = "SNAP_FINDER_PROGRESS",
        action = clap::ArgAction::Set,
        default_value_t = true
    )]
    pub progress: bool,
}

impl Config {
    /// Create a new Config builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// RPC endpoints to use, falling back to the cluster preset.
    pub fn resolved_rpc_urls(&self) -> Vec<String> {
        if self.rpc_urls.is_empty() {
            vec![self.cluster.default_rpc_url().to_string()]
        } else {
            self.rpc_urls.clone()
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    pub fn measurement_duration(&self) -> Duration {
        Duration::from_secs(self.measurement_time)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.sleep_before_retry)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    /// Minimum throughput in bytes per second.
    pub fn min_speed_bytes(&self) -> f64 {
        self.min_download_speed as f64 * 1024.0 * 1024.0
    }

    /// Transfer rate cap in bytes per second.
    pub fn max_speed_bytes(&self) -> Option<f64> {
        self.max_download_speed
            .filter(|mb| *mb > 0)
            .map(|mb| mb as f64 * 1024.0 * 1024.0)
    }

    /// Validate that config is consistent.
    pub fn validate(&self) -> Result<(), FinderError> {
        if self.max_attempts == 0 {
            return Err(FinderError::Config("max_attempts must be at least 1".into()));
        }
        if self.threads_count == 0 {
            return Err(FinderError::Config("threads_count must be at least 1".into()));
        }
        if self.num_of_rpc_to_check == 0 {
            return Err(FinderError::Config(
                "num_of_rpc_to_check must be at least 1".into(),
            ));
        }
        if self.probe_timeout_ms == 0 {
            return Err(FinderError::Config("probe_timeout_ms must be positive".into()));
        }
        if self.measurement_time == 0 {
            return Err(FinderError::Config("measurement_time must be positive".into()));
        }
        if self.resolved_rpc_urls().iter().any(|url| url.trim().is_empty()) {
            return Err(FinderError::Config("empty RPC url".into()));
        }
        Ok(())
    }
}

/// Builder for Config.
#[derive(Default)]
pub struct ConfigBuilder {
    cluster: Option<Cluster>,
    rpc_urls: Vec<String>,
    rpc_timeout_secs: Option<u64>,
    snapshot_dir: Option<PathBuf>,
    version: Option<String>,
    wildcard_version: Option<String>,
    with_private_rpc: Option<bool>,
    private_rpc_port: Option<u16>,
    slot: Option<u64>,
    max_snapshot_age: Option<u64>,
    max_latency: Option<u64>,
    threads_count: Option<usize>,
    probe_timeout_ms: Option<u64>,
    sort_order: Option<RankKey>,
    min_download_speed: Option<u64>,
    max_download_speed: Option<u64>,
    measurement_time: Option<u64>,
    num_of_rpc_to_check: Option<usize>,
    stall_timeout_secs: Option<u64>,
    max_attempts: Option<usize>,
    sleep_before_retry: Option<u64>,
    progress: Option<bool>,
}

impl ConfigBuilder {
    pub fn cluster(mut self, cluster: Cluster) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.rpc_urls.push(url.into());
        self
    }

    pub fn snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.snapshot_dir = Some(dir.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn wildcard_version(mut self, pattern: impl Into<String>) -> Self {
        self.wildcard_version = Some(pattern.into());
        self
    }

    pub fn with_private_rpc(mut self, enabled: bool) -> Self {
        self.with_private_rpc = Some(enabled);
        self
    }

    pub fn private_rpc_port(mut self, port: u16) -> Self {
        self.private_rpc_port = Some(port);
        self
    }

    pub fn slot(mut self, slot: u64) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn max_snapshot_age(mut self, slots: u64) -> Self {
        self.max_snapshot_age = Some(slots);
        self
    }

    pub fn max_latency(mut self, ms: u64) -> Self {
        self.max_latency = Some(ms);
        self
    }

    pub fn threads_count(mut self, threads: usize) -> Self {
        self.threads_count = Some(threads);
        self
    }

    pub fn probe_timeout_ms(mut self, ms: u64) -> Self {
        self.probe_timeout_ms = Some(ms);
        self
    }

    pub fn sort_order(mut self, key: RankKey) -> Self {
        self.sort_order = Some(key);
        self
    }

    pub fn min_download_speed(mut self, mb_per_sec: u64) -> Self {
        self.min_download_speed = Some(mb_per_sec);
        self
    }

    pub fn max_download_speed(mut self, mb_per_sec: u64) -> Self {
        self.max_download_speed = Some(mb_per_sec);
        self
    }

    pub fn measurement_time(mut self, secs: u64) -> Self {
        self.measurement_time = Some(secs);
        self
    }

    pub fn num_of_rpc_to_check(mut self, count: usize) -> Self {
        self.num_of_rpc_to_check = Some(count);
        self
    }

    pub fn stall_timeout_secs(mut self, secs: u64) -> Self {
        self.stall_timeout_secs = Some(secs);
        self
    }

    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn sleep_before_retry(mut self, secs: u64) -> Self {
        self.sleep_before_retry = Some(secs);
        self
    }

    pub fn progress(mut self, enabled: bool) -> Self {
        self.progress = Some(enabled);
        self
    }

    pub fn build(self) -> Result<Config, FinderError> {
        let config = Config {
            cluster: self.cluster.unwrap_or_default(),
            rpc_urls: self.rpc_urls,
            rpc_timeout_secs: self.rpc_timeout_secs.unwrap_or(25),
            snapshot_dir: self.snapshot_dir.unwrap_or_else(|| PathBuf::from(".")),
            version: self.version,
            wildcard_version: self.wildcard_version,
            with_private_rpc: self.with_private_rpc.unwrap_or(false),
            private_rpc_port: self.private_rpc_port.unwrap_or(8899),
            slot: self.slot.unwrap_or(0),
            max_snapshot_age: self.max_snapshot_age.unwrap_or(1300),
            max_latency: self.max_latency.unwrap_or(100),
            threads_count: self.threads_count.unwrap_or(1000),
            probe_timeout_ms: self.probe_timeout_ms.unwrap_or(1000),
            sort_order: self.sort_order.unwrap_or_default(),
            min_download_speed: self.min_download_speed.unwrap_or(60),
            max_download_speed: self.max_download_speed,
            measurement_time: self.measurement_time.unwrap_or(7),
            num_of_rpc_to_check: self.num_of_rpc_to_check.unwrap_or(15),
            stall_timeout_secs: self.stall_timeout_secs.unwrap_or(60),
            max_attempts: self.max_attempts.unwrap_or(5),
            sleep_before_retry: self.sleep_before_retry.unwrap_or(7),
            progress: self.progress.unwrap_or(false),
        };

        config.validate()?;

        Ok(config)
    }
}
