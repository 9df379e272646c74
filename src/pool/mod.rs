//! Brick pools: virtual brick memory backed by RAM or disk
//!
//! Three implementations of [`BrickPoolManager`]:
//! - [`RamPool`] keeps every bucket in memory
//! - [`DiskPool`] keeps every bucket in a file and caches nothing
//! - [`DiskCachedPool`] keeps bucket files behind a bounded LRU cache

pub mod manager;
pub mod checkout;
pub mod bucket;
pub mod disk_io;
pub mod ram;
pub mod disk;
pub mod cached;
pub mod metadata;

pub use manager::{BrickMut, BrickPoolManager, BrickRef, PoolState, PoolStats};
pub use cached::DiskCachedPool;
pub use disk::{DiskPool, DiskStore};
pub use disk_io::{BucketIo, BufferedIo, DirectIo};
pub use metadata::{PoolKind, PoolMetadata};
pub use ram::RamPool;
pub use crate::core::config::{AllocationStrategy, IoStrategy, OpenMode, PoolConfig};

/// Build an uninitialized pool of the given kind
pub fn create_pool(kind: PoolKind, config: PoolConfig) -> Box<dyn BrickPoolManager> {
    match kind {
        PoolKind::Ram => Box::new(RamPool::from_config(&config)),
        PoolKind::Disk => Box::new(DiskPool::new(config)),
        PoolKind::DiskCached => Box::new(DiskCachedPool::new(config)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_behaves_the_same() {
        let dir = tempfile::tempdir().unwrap();
        for kind in [PoolKind::Ram, PoolKind::Disk, PoolKind::DiskCached] {
            let config = PoolConfig {
                max_bucket_size_bytes: 256,
                max_ram_bytes: 512,
                ..PoolConfig::at(dir.path().join(format!("{:?}", kind)))
            };
            let mut pool = create_pool(kind, config);
            pool.initialize(64).unwrap();

            let addresses: Vec<_> = (0..10).map(|_| pool.allocate_brick().unwrap()).collect();
            for (i, &address) in addresses.iter().enumerate() {
                let mut brick = pool.get_writable_brick(address).unwrap().unwrap();
                brick.voxels_mut().fill(i as u16 * 1000);
            }
            for (i, &address) in addresses.iter().enumerate().rev() {
                let brick = pool.get_brick(address).unwrap().unwrap();
                assert!(brick.voxels().iter().all(|&v| v == i as u16 * 1000), "{:?}", kind);
            }
            assert_eq!(pool.memory_allocated(), 3 * 256);
            assert_eq!(pool.metadata().kind, kind);
            pool.deinitialize().unwrap();
        }
    }
}
