//! Pool and octree configuration.
//!
//! Both configs are plain serde structs with defaults so they can be loaded
//! from a JSON file, built in code, or partially overridden from the CLI.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, IoContext};
use crate::core::types::Result;

/// Default upper bound for a single bucket (64 MiB).
pub const DEFAULT_MAX_BUCKET_SIZE: u64 = 64 << 20;
/// Default RAM budget of the cached disk pool (512 MiB).
pub const DEFAULT_MAX_RAM: u64 = 512 << 20;
/// Default bucket file prefix.
pub const DEFAULT_FILE_PREFIX: &str = "brickbuffer";

// ---------------------------------------------------------------------------
// Strategy enums
// ---------------------------------------------------------------------------

/// What `delete_brick` does with the freed address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AllocationStrategy {
    /// Addresses only ever grow; deleted space is never reused.
    #[default]
    IgnoreDeletedBricks,
    /// Deleted addresses are reused (most recently deleted first).
    UseDeletedBricks,
}

/// Physical I/O used for whole-bucket reads and writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IoStrategy {
    /// Buffered reader/writer streams.
    #[default]
    Buffered,
    /// Unbuffered file handle, one read/write call per bucket.
    Direct,
}

/// Whether the pool directory starts empty or already holds bucket files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OpenMode {
    #[default]
    Fresh,
    Existing,
}

// ---------------------------------------------------------------------------
// Pool config
// ---------------------------------------------------------------------------

/// Configuration shared by all brick pool managers.
///
/// The RAM pool only looks at `max_bucket_size_bytes`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound for one bucket; rounded down to a multiple of the brick size.
    pub max_bucket_size_bytes: u64,
    /// RAM budget for resident buckets (cached disk pool only).
    pub max_ram_bytes: u64,
    /// Directory holding the bucket files.
    pub pool_path: PathBuf,
    /// Bucket file name prefix.
    pub file_prefix: String,
    pub allocation_strategy: AllocationStrategy,
    pub io_strategy: IoStrategy,
    pub open_mode: OpenMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_bucket_size_bytes: DEFAULT_MAX_BUCKET_SIZE,
            max_ram_bytes: DEFAULT_MAX_RAM,
            pool_path: PathBuf::from("brickpool"),
            file_prefix: DEFAULT_FILE_PREFIX.to_string(),
            allocation_strategy: AllocationStrategy::default(),
            io_strategy: IoStrategy::default(),
            open_mode: OpenMode::default(),
        }
    }
}

impl PoolConfig {
    /// Config for a disk pool rooted at `path`, everything else default.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            pool_path: path.into(),
            ..Default::default()
        }
    }

    /// Load from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }
}

// ---------------------------------------------------------------------------
// Octree config
// ---------------------------------------------------------------------------

/// Octree construction parameters.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OctreeConfig {
    /// Edge length of a brick in voxels. Must be a power of two.
    pub brick_dim: u32,
    /// Normalized homogeneity threshold in [0, 1]. Negative disables
    /// pruning of homogeneous regions.
    pub homogeneity_threshold: f32,
}

impl Default for OctreeConfig {
    fn default() -> Self {
        Self {
            brick_dim: 32,
            homogeneity_threshold: 0.0,
        }
    }
}

impl OctreeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        load_json(path)
    }

    /// Whether homogeneous regions are collapsed into brickless nodes.
    pub fn optimize(&self) -> bool {
        self.homogeneity_threshold >= 0.0
    }

    /// Threshold in voxel value units.
    pub fn threshold_u16(&self) -> u16 {
        (self.homogeneity_threshold.clamp(0.0, 1.0) * 65535.0).round() as u16
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).with_path(path)?;
    serde_json::from_str(&text).map_err(Error::from)
}
