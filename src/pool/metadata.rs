//! Persistent pool metadata
//!
//! A pool's configuration and allocation state, serialized as JSON so that a
//! disk-backed pool can be reopened by a later process.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::config::{AllocationStrategy, IoStrategy, OpenMode, PoolConfig};
use crate::core::error::{Error, IoContext};
use crate::core::types::Result;
use crate::pool::cached::DiskCachedPool;
use crate::pool::disk::DiskPool;
use crate::pool::manager::BrickPoolManager;

/// Which pool implementation produced the metadata
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PoolKind {
    Ram,
    Disk,
    DiskCached,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetadata {
    pub kind: PoolKind,
    pub brick_memory_size_bytes: u64,
    pub max_single_buffer_size_bytes: u64,
    pub single_buffer_size_bytes: u64,
    /// Bucket file names relative to `brick_pool_path`, in bucket order
    #[serde(default)]
    pub buffer_files: Vec<String>,
    pub brick_pool_exists: bool,
    pub brick_pool_path: PathBuf,
    pub buffer_file_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ram_used: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_virtual_memory_address: Option<u64>,
    #[serde(default)]
    pub allocation_strategy: AllocationStrategy,
    #[serde(default)]
    pub io_strategy: IoStrategy,
}

impl PoolMetadata {
    /// Metadata of a pool that has not been initialized yet
    pub(crate) fn from_config(kind: PoolKind, config: &PoolConfig) -> Self {
        Self {
            kind,
            brick_memory_size_bytes: 0,
            max_single_buffer_size_bytes: config.max_bucket_size_bytes,
            single_buffer_size_bytes: 0,
            buffer_files: Vec::new(),
            brick_pool_exists: false,
            brick_pool_path: config.pool_path.clone(),
            buffer_file_prefix: config.file_prefix.clone(),
            max_ram_used: None,
            next_virtual_memory_address: None,
            allocation_strategy: config.allocation_strategy,
            io_strategy: config.io_strategy,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(Error::from)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(Error::from)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?).with_path(path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_path(path)?;
        Self::from_json(&text)
    }

    /// Check that the described pool can be reopened with `max_ram` bytes of cache.
    pub fn validate(&self, max_ram: u64) -> Result<()> {
        if self.kind == PoolKind::Ram {
            return Err(Error::Config("a RAM brick pool is not persistent and cannot be restored".into()));
        }
        if !self.brick_pool_path.is_dir() {
            return Err(Error::io(
                &self.brick_pool_path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "brick pool directory does not exist"),
            ));
        }
        if self.buffer_files.is_empty() {
            return Err(Error::Config("no buffer files listed in brick pool metadata".into()));
        }
        for name in &self.buffer_files {
            let path = self.brick_pool_path.join(name);
            if !path.is_file() {
                return Err(Error::io(
                    path,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "buffer file missing"),
                ));
            }
        }
        if self.single_buffer_size_bytes == 0 || self.brick_memory_size_bytes == 0 {
            return Err(Error::Config("brick or buffer size missing from metadata".into()));
        }
        if self.kind == PoolKind::DiskCached && max_ram / self.single_buffer_size_bytes < 2 {
            return Err(Error::Config(format!(
                "RAM memory limit ({} bytes) is smaller than two times the size of a buffer ({} bytes)",
                max_ram, self.single_buffer_size_bytes
            )));
        }
        Ok(())
    }

    /// Config that reopens the existing pool
    pub fn pool_config(&self, max_ram: u64) -> PoolConfig {
        PoolConfig {
            max_bucket_size_bytes: self.max_single_buffer_size_bytes,
            max_ram_bytes: max_ram,
            pool_path: self.brick_pool_path.clone(),
            file_prefix: self.buffer_file_prefix.clone(),
            allocation_strategy: self.allocation_strategy,
            io_strategy: self.io_strategy,
            open_mode: OpenMode::Existing,
        }
    }

    /// Reopen and initialize the described pool.
    ///
    /// `max_ram` overrides the recorded RAM limit of a cached pool.
    pub fn restore(&self, max_ram: Option<u64>) -> Result<Box<dyn BrickPoolManager>> {
        let max_ram = max_ram.or(self.max_ram_used).unwrap_or(crate::core::config::DEFAULT_MAX_RAM);
        self.validate(max_ram)?;
        let config = self.pool_config(max_ram);
        let next = self.next_virtual_memory_address;

        let pool: Box<dyn BrickPoolManager> = match self.kind {
            PoolKind::Disk => {
                let mut pool = DiskPool::new(config);
                pool.initialize(self.brick_memory_size_bytes)?;
                if let Some(next) = next {
                    pool.resume_from(next)?;
                }
                Box::new(pool)
            }
            PoolKind::DiskCached => {
                let mut pool = DiskCachedPool::new(config);
                pool.initialize(self.brick_memory_size_bytes)?;
                if let Some(next) = next {
                    pool.resume_from(next)?;
                }
                Box::new(pool)
            }
            PoolKind::Ram => {
                return Err(Error::Config("a RAM brick pool cannot be restored".into()));
            }
        };

        if pool.bucket_size() != self.single_buffer_size_bytes {
            return Err(Error::Config(format!(
                "reopened buffer size {} differs from recorded {}",
                pool.bucket_size(),
                self.single_buffer_size_bytes
            )));
        }
        let adopted = pool.metadata().buffer_files;
        if adopted != self.buffer_files {
            return Err(Error::Config(format!(
                "found {} buffer files, metadata lists {}",
                adopted.len(),
                self.buffer_files.len()
            )));
        }

        log::info!("Restored brick pool: {}", pool.description());
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PoolMetadata {
        PoolMetadata {
            kind: PoolKind::DiskCached,
            brick_memory_size_bytes: 64,
            max_single_buffer_size_bytes: 300,
            single_buffer_size_bytes: 256,
            buffer_files: vec!["brickbuffer_0000000000".into()],
            brick_pool_exists: true,
            brick_pool_path: PathBuf::from("/tmp/pool"),
            buffer_file_prefix: "brickbuffer".into(),
            max_ram_used: Some(512),
            next_virtual_memory_address: Some(128),
            allocation_strategy: AllocationStrategy::UseDeletedBricks,
            io_strategy: IoStrategy::Direct,
        }
    }

    #[test]
    fn test_json_keys() {
        let json = sample().to_json().unwrap();
        for key in [
            "maxSingleBufferSizeBytes",
            "singleBufferSizeBytes",
            "bufferFiles",
            "brickPoolExists",
            "brickPoolPath",
            "bufferFilePrefix",
            "maxRamUsed",
            "nextVirtualMemoryAddress",
        ] {
            assert!(json.contains(key), "missing {}", key);
        }
        assert_eq!(PoolMetadata::from_json(&json).unwrap(), sample());
    }

    #[test]
    fn test_optional_fields_omitted() {
        let meta = PoolMetadata {
            max_ram_used: None,
            next_virtual_memory_address: None,
            ..sample()
        };
        let json = meta.to_json().unwrap();
        assert!(!json.contains("maxRamUsed"));
        assert_eq!(PoolMetadata::from_json(&json).unwrap(), meta);
    }

    #[test]
    fn test_validate_rejects() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("brickbuffer_0000000000"), [0u8; 256]).unwrap();
        let meta = PoolMetadata {
            brick_pool_path: dir.path().to_path_buf(),
            ..sample()
        };
        assert!(meta.validate(512).is_ok());

        // Less than two buffers of RAM
        assert!(matches!(meta.validate(511), Err(Error::Config(_))));

        // RAM pools are not persistent
        let ram = PoolMetadata { kind: PoolKind::Ram, ..meta.clone() };
        assert!(matches!(ram.validate(512), Err(Error::Config(_))));

        let empty = PoolMetadata { buffer_files: Vec::new(), ..meta.clone() };
        assert!(matches!(empty.validate(512), Err(Error::Config(_))));

        let missing = PoolMetadata {
            buffer_files: vec!["brickbuffer_0000000000".into(), "brickbuffer_0000000001".into()],
            ..meta.clone()
        };
        assert!(matches!(missing.validate(512), Err(Error::Io { .. })));

        let no_dir = PoolMetadata { brick_pool_path: dir.path().join("gone"), ..meta };
        assert!(matches!(no_dir.validate(512), Err(Error::Io { .. })));
    }
}
