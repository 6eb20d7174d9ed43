//! Configuration types for swarmsync

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::STATE_DIR_NAME;

/// Filesystem monitoring configuration
///
/// Groups settings controlling the watcher and the staged event pipeline.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Debounce window for coalescing raw watcher events per path (default: 200ms)
    #[serde(default = "default_debounce", with = "duration_millis")]
    pub debounce: Duration,

    /// Number of pipeline worker tasks (default: number of CPUs, at least 1)
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Maximum relative path length before an event is quarantined (default: 3072)
    #[serde(default = "default_max_relpath_len")]
    pub max_relative_path_len: usize,

    /// Synthesize offline MODIFY events for known files during the startup scan
    #[serde(default)]
    pub check_offline_modifies: bool,

    /// Directories (relative to root) excluded from synchronization
    #[serde(default)]
    pub excluded_dirs: Vec<PathBuf>,
}

impl MonitorConfig {
    /// Upper bound of events dispatched into the pipeline at once
    pub fn processing_events_limit(&self) -> usize {
        self.workers * 8
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            debounce: default_debounce(),
            workers: default_workers(),
            max_relative_path_len: default_max_relpath_len(),
            check_offline_modifies: false,
            excluded_dirs: Vec::new(),
        }
    }
}

/// Download and transfer tuning
///
/// Groups settings for the swarm download scheduler and the upload side.
/// Used as a nested sub-config within [`Config`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Download rate limit in bytes per second (None = unlimited)
    #[serde(default)]
    pub download_limit_bps: Option<u64>,

    /// Upload rate limit in bytes per second (None = unlimited)
    #[serde(default)]
    pub upload_limit_bps: Option<u64>,

    /// Maximum chunk requests in flight per peer (default: 128)
    #[serde(default = "default_max_node_chunk_requests")]
    pub max_node_chunk_requests: usize,

    /// Seconds without data from a peer before it counts as timed out (default: 20)
    #[serde(default = "default_receive_timeout", with = "duration_secs")]
    pub receive_timeout: Duration,

    /// Timeouts tolerated per peer before it is dropped from a task (default: 2)
    #[serde(default = "default_timeouts_limit")]
    pub timeouts_limit: u32,

    /// Hash-mismatch retries before a task surfaces wrong_hash (default: 2)
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Seconds a peer must be silent before end-race may duplicate its ranges (default: 5)
    #[serde(default = "default_end_race_timeout", with = "duration_secs")]
    pub end_race_timeout: Duration,

    /// Delay before failed patch downloads are retried (default: 60s)
    #[serde(default = "default_retry_download_timeout", with = "duration_secs")]
    pub retry_download_timeout: Duration,

    /// Concurrent chunk requests served on the upload side (default: 10)
    #[serde(default = "default_processing_requests_limit")]
    pub processing_requests_limit: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            download_limit_bps: None,
            upload_limit_bps: None,
            max_node_chunk_requests: default_max_node_chunk_requests(),
            receive_timeout: default_receive_timeout(),
            timeouts_limit: default_timeouts_limit(),
            retry_limit: default_retry_limit(),
            end_race_timeout: default_end_race_timeout(),
            retry_download_timeout: default_retry_download_timeout(),
            processing_requests_limit: default_processing_requests_limit(),
        }
    }
}

/// Remote event log polling configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventsCheckConfig {
    /// Re-ask for missed events this long after a peer-supplied batch (default: 60s)
    #[serde(default = "default_peer_check_interval", with = "duration_secs")]
    pub after_peer_batch: Duration,

    /// Re-ask for missed events this long after a server-confirmed batch (default: 30min)
    #[serde(default = "default_server_check_interval", with = "duration_secs")]
    pub after_server_batch: Duration,
}

impl Default for EventsCheckConfig {
    fn default() -> Self {
        Self {
            after_peer_batch: default_peer_check_interval(),
            after_server_batch: default_server_check_interval(),
        }
    }
}

/// Main configuration for the sync engine
///
/// Fields are organized into logical sub-configs:
/// - [`monitor`](MonitorConfig) — watcher and pipeline tuning
/// - [`transfer`](TransferConfig) — swarm download/upload tuning
/// - [`events_check`](EventsCheckConfig) — remote log polling intervals
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Root directory of the synchronized tree
    pub root: PathBuf,

    /// This node's identity as known to peers and the signalling server
    pub node_id: String,

    /// Keep reverse patches and old copies so history can be restored
    #[serde(default)]
    pub download_backups: bool,

    /// Monitor and pipeline settings
    #[serde(flatten)]
    pub monitor: MonitorConfig,

    /// Transfer tuning
    #[serde(flatten)]
    pub transfer: TransferConfig,

    /// Remote event log polling intervals
    #[serde(flatten)]
    pub events_check: EventsCheckConfig,

    /// Root-level collaboration folder names (pinned against local moves)
    #[serde(default)]
    pub collaborated_folders: Vec<String>,
}

impl Config {
    /// Create a config for the given sync root and node identity
    pub fn new(root: impl Into<PathBuf>, node_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            node_id: node_id.into(),
            download_backups: false,
            monitor: MonitorConfig::default(),
            transfer: TransferConfig::default(),
            events_check: EventsCheckConfig::default(),
            collaborated_folders: Vec::new(),
        }
    }

    /// The hidden state directory under the sync root
    pub fn state_dir(&self) -> PathBuf {
        self.root.join(STATE_DIR_NAME)
    }

    /// Directory holding content-addressed copy blobs
    pub fn copies_dir(&self) -> PathBuf {
        self.state_dir().join("copies")
    }

    /// Directory holding materialized patch archives and the patches database
    pub fn patches_dir(&self) -> PathBuf {
        self.state_dir().join("patches")
    }

    /// Directory holding persisted block signatures per content hash
    pub fn signatures_dir(&self) -> PathBuf {
        self.state_dir().join("signatures")
    }

    /// Path of the main storage database
    pub fn storage_db_path(&self) -> PathBuf {
        self.state_dir().join("storage.db")
    }

    /// Validate the configuration, returning a descriptive error on problems
    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(Error::Config {
                message: "sync root must not be empty".to_string(),
                key: Some("root".to_string()),
            });
        }
        if self.node_id.is_empty() {
            return Err(Error::Config {
                message: "node_id must not be empty".to_string(),
                key: Some("node_id".to_string()),
            });
        }
        if self.monitor.workers == 0 {
            return Err(Error::Config {
                message: "monitor workers must be at least 1".to_string(),
                key: Some("workers".to_string()),
            });
        }
        if self.transfer.max_node_chunk_requests == 0 {
            return Err(Error::Config {
                message: "max_node_chunk_requests must be at least 1".to_string(),
                key: Some("max_node_chunk_requests".to_string()),
            });
        }
        for dir in &self.monitor.excluded_dirs {
            if dir.is_absolute() {
                return Err(Error::Config {
                    message: format!("excluded dir {} must be relative", dir.display()),
                    key: Some("excluded_dirs".to_string()),
                });
            }
        }
        Ok(())
    }
}

fn default_debounce() -> Duration {
    Duration::from_millis(200)
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_max_relpath_len() -> usize {
    3072
}

fn default_max_node_chunk_requests() -> usize {
    128
}

fn default_receive_timeout() -> Duration {
    Duration::from_secs(20)
}

fn default_timeouts_limit() -> u32 {
    2
}

fn default_retry_limit() -> u32 {
    2
}

fn default_end_race_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_retry_download_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_processing_requests_limit() -> usize {
    10
}

fn default_peer_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_server_check_interval() -> Duration {
    Duration::from_secs(30 * 60)
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
