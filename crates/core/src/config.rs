//! Per-volume and process-wide configuration. Loaded by the consuming
//! management layer (out of scope here) and handed to the engine
//! as plain structs; [`ConfigReport`] implements a structured
//! report listing problematic fields.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeRole {
    Normal,
    BackupNormal,
    BackupIncremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterCacheMode {
    ContentBased,
    LocationBased,
}

/// Which reads/writes consult/populate the process-wide cluster cache
/// (see the `cluster_cache` module in the engine crate).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterCacheBehaviour {
    pub cache_on_read: bool,
    pub cache_on_write: bool,
}

impl ClusterCacheBehaviour {
    pub const NO_CACHE: Self = Self {
        cache_on_read: false,
        cache_on_write: false,
    };

    pub const CACHE_ON_READ: Self = Self {
        cache_on_read: true,
        cache_on_write: false,
    };

    pub const CACHE_ON_WRITE: Self = Self {
        cache_on_read: false,
        cache_on_write: true,
    };

    pub const CACHE_ON_READ_AND_WRITE: Self = Self {
        cache_on_read: true,
        cache_on_write: true,
    };

    pub fn is_no_cache(&self) -> bool {
        !self.cache_on_read && !self.cache_on_write
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtlMode {
    Sync,
    Async,
}

/// DTL (Distributed Transaction Log / "FOC") connection config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailOverCacheConfig {
    pub host: String,
    pub port: u16,
    pub mode: DtlMode,
    pub request_timeout_s: u64,
    /// Bounded in-memory queue depth (Async mode only).
    pub queue_depth: usize,
    /// Depth at which the async background task flushes to the remote
    /// without waiting for an explicit `flush()`.
    pub write_trigger: usize,
    /// Busy-wait interval when backpressured.
    pub busy_loop_us: u64,
}

impl Default for FailOverCacheConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 26203,
            mode: DtlMode::Sync,
            request_timeout_s: 30,
            queue_depth: 4096,
            write_trigger: 512,
            busy_loop_us: 500,
        }
    }
}

/// Per-volume cluster-cache configuration override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterCacheConfig {
    pub behaviour: ClusterCacheBehaviour,
    pub mode: ClusterCacheMode,
    /// Cache-entry limit; `None` uses the process-wide default.
    pub limit: Option<usize>,
}

impl Default for ClusterCacheConfig {
    fn default() -> Self {
        Self {
            behaviour: ClusterCacheBehaviour::NO_CACHE,
            mode: ClusterCacheMode::LocationBased,
            limit: None,
        }
    }
}

/// Metadata-backend config: the ordered list of metadata-server replicas,
/// node 0 being the current master.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataBackendConfig {
    pub nodes: Vec<String>,
    pub cache_capacity_pages: usize,
    pub apply_relocations_to_slaves: bool,
}

impl Default for MetadataBackendConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["localhost:4922".to_string()],
            cache_capacity_pages: 4096,
            apply_relocations_to_slaves: false,
        }
    }
}

/// Per-volume configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub version: u16,
    pub id: String,
    pub namespace: String,
    pub lba_size: u32,
    pub lba_count: u64,
    pub cluster_multiplier: u32,
    pub sco_multiplier: u32,
    pub tlog_multiplier: Option<u32>,
    pub parent: Option<super::types::ParentRef>,
    pub owner_tag: String,
    pub cluster_cache: ClusterCacheConfig,
    pub metadata_backend: MetadataBackendConfig,
    pub dtl: Option<FailOverCacheConfig>,
    pub role: VolumeRole,
    pub is_template: bool,
    /// A `sync()` call is a no-op until this many have been skipped.
    pub number_of_syncs_to_ignore: u32,
    /// ...or until this long has elapsed since the last real sync,
    /// whichever comes first.
    pub maximum_time_to_ignore_syncs_s: u64,
}

impl VolumeConfig {
    pub const CURRENT_VERSION: u16 = 1;

    pub fn cluster_size(&self) -> u32 {
        self.lba_size * self.cluster_multiplier
    }

    pub fn sco_size_clusters(&self) -> u32 {
        self.sco_multiplier
    }

    pub fn cluster_count(&self) -> u64 {
        (self.lba_count * self.lba_size as u64) / self.cluster_size() as u64
    }

    pub fn effective_tlog_multiplier(&self, default_tlog_multiplier: u32) -> u32 {
        self.tlog_multiplier.unwrap_or(default_tlog_multiplier)
    }
}

/// A single problem found by [`check_config`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigProblem {
    pub field: String,
    pub message: String,
}

/// Result of validating a [`VolumeConfig`] (and, transitively, the
/// process-wide [`VolumeManagerConfig`]) before any change is applied,
/// contract.
#[derive(Debug, Clone, Default)]
pub struct ConfigReport {
    pub problems: Vec<ConfigProblem>,
}

impl ConfigReport {
    pub fn is_ok(&self) -> bool {
        self.problems.is_empty()
    }

    fn push(&mut self, field: &str, message: impl Into<String>) {
        self.problems.push(ConfigProblem {
            field: field.to_string(),
            message: message.into(),
        });
    }
}

pub fn check_config(cfg: &VolumeConfig) -> ConfigReport {
    let mut report = ConfigReport::default();

    if cfg.lba_size == 0 || !cfg.lba_size.is_power_of_two() {
        report.push("lba_size", "must be a nonzero power of two");
    }
    if cfg.cluster_multiplier == 0 {
        report.push("cluster_multiplier", "must be nonzero");
    }
    if cfg.sco_multiplier == 0 {
        report.push("sco_multiplier", "must be nonzero");
    }
    if cfg.lba_count == 0 {
        report.push("lba_count", "volume must have nonzero size");
    }
    if let Some(tm) = cfg.tlog_multiplier {
        if tm == 0 {
            report.push("tlog_multiplier", "if set, must be nonzero");
        }
    }
    if cfg.namespace.is_empty() {
        report.push("namespace", "must not be empty");
    }
    if cfg.metadata_backend.nodes.is_empty() {
        report.push("metadata_backend.nodes", "at least one node is required");
    }
    if cfg.is_template && cfg.role != VolumeRole::Normal {
        report.push("role", "templates must use the Normal role");
    }

    report
}

/// Process-wide defaults and admission-control knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeManagerConfig {
    pub default_tlog_multiplier: u32,
    pub max_non_disposable_factor: f64,
    pub open_scos_per_volume: usize,
    pub sco_cache_trigger_gap_bytes: u64,
    pub default_cluster_cache_limit: usize,
    pub dtl_request_timeout_s: u64,
    pub foc_throttle_us: u64,
    pub backend_task_retry_backoff_s: Vec<u64>,
}

impl Default for VolumeManagerConfig {
    fn default() -> Self {
        Self {
            default_tlog_multiplier: 20,
            max_non_disposable_factor: 1.5,
            open_scos_per_volume: 32,
            sco_cache_trigger_gap_bytes: 512 * 1024 * 1024,
            default_cluster_cache_limit: 65536,
            dtl_request_timeout_s: 30,
            foc_throttle_us: 4000,
            backend_task_retry_backoff_s: vec![0, 1, 2, 4, 8, 15, 30, 60, 120, 240, 300],
        }
    }
}

impl VolumeManagerConfig {
    pub fn from_toml(s: &str) -> crate::Result<Self> {
        toml::from_str(s).map_err(|e| crate::Error::InvalidConfig(vec![e.to_string()]))
    }

    pub fn max_non_disposable_bytes(&self, sco_size_bytes: u64, tlog_multiplier: u32) -> u64 {
        ((sco_size_bytes * tlog_multiplier as u64) as f64 * self.max_non_disposable_factor) as u64
    }
}
