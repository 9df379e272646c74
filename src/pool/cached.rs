//! Disk pool with a bounded RAM cache
//!
//! A fixed number of resident slots (`max_ram_bytes / bucket_size`, at least
//! two) hold buckets loaded from the [`DiskStore`]. Slots are recycled in
//! least-recently-used order, skipping any slot whose bucket has a brick
//! checked out. Dirty slots are written back before reuse, on `flush` and on
//! `deinitialize`.
//!
//! All state sits behind one mutex, and disk I/O happens while holding it.
//! Nothing ever waits for a pinned slot: if every slot is pinned the request
//! fails with [`Error::ResourceExhausted`].

use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::core::config::{AllocationStrategy, PoolConfig};
use crate::core::error::Error;
use crate::core::types::{AccessMode, Result, VirtualAddress, NO_BRICK};
use crate::pool::bucket::BucketBuffer;
use crate::pool::checkout::CheckoutTable;
use crate::pool::disk::DiskStore;
use crate::pool::manager::{
    bucket_size_for, format_bytes, locate, BrickMut, BrickPoolManager, BrickRef, PoolState, PoolStats,
};
use crate::pool::metadata::{PoolKind, PoolMetadata};

/// One RAM slot that can hold a bucket
#[derive(Debug, Default)]
struct ResidentSlot {
    memory: Option<BucketBuffer>,
    /// Bucket currently held, `None` if the slot is empty
    bucket: Option<usize>,
    /// Modified since it was loaded
    writable: bool,
    /// At least one brick inside is checked out
    in_use: bool,
    last_used: u64,
}

impl ResidentSlot {
    fn is_occupied(&self) -> bool {
        self.bucket.is_some()
    }
}

struct CacheState {
    brick_size: u64,
    bucket_size: u64,
    strategy: AllocationStrategy,
    store: DiskStore,
    slots: Vec<ResidentSlot>,
    next_address: VirtualAddress,
    /// Deleted addresses, reused last-in first-out
    free_list: Vec<VirtualAddress>,
    checkouts: CheckoutTable,
    clock: u64,
    stats: PoolStats,
}

fn slot_count(max_ram: u64, bucket_size: u64) -> Result<usize> {
    let count = max_ram / bucket_size;
    if count < 2 {
        return Err(Error::Config(format!(
            "RAM memory limit ({} bytes) is smaller than two times the size of a buffer ({} bytes)",
            max_ram, bucket_size
        )));
    }
    Ok(count as usize)
}

impl CacheState {
    fn slot_of(&self, bucket: usize) -> Option<usize> {
        self.slots.iter().position(|s| s.bucket == Some(bucket))
    }

    /// Advance the LRU clock, rebasing all timestamps when it is about to wrap.
    fn tick(&mut self) -> u64 {
        if self.clock == u64::MAX {
            self.rebase_timestamps();
        }
        self.clock += 1;
        self.clock
    }

    /// Replace occupied timestamps by their rank (1..=n), keeping LRU order.
    fn rebase_timestamps(&mut self) {
        let mut order: Vec<usize> = (0..self.slots.len()).filter(|&i| self.slots[i].is_occupied()).collect();
        order.sort_by_key(|&i| self.slots[i].last_used);
        for (rank, &i) in order.iter().enumerate() {
            self.slots[i].last_used = rank as u64 + 1;
        }
        self.clock = order.len() as u64;
        log::debug!("Rebased LRU timestamps of {} slots", order.len());
    }

    fn touch(&mut self, slot: usize) {
        let now = self.tick();
        self.slots[slot].last_used = now;
    }

    /// Least recently used slot that holds no checked-out brick. Empty slots first.
    fn find_victim(&self) -> Result<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.in_use)
            .min_by_key(|(_, s)| (s.is_occupied(), s.last_used))
            .map(|(i, _)| i)
            .ok_or(Error::ResourceExhausted { slots: self.slots.len() })
    }

    /// Empty a slot, writing it back first if dirty. Keeps its memory for reuse.
    fn evict(&mut self, slot: usize) -> Result<()> {
        let victim = &self.slots[slot];
        debug_assert!(!victim.in_use, "evicting pinned slot {}", slot);
        let Some(bucket) = victim.bucket else {
            return Ok(());
        };
        debug_assert_eq!(self.checkouts.pins(bucket), 0);

        if victim.writable {
            if let Some(memory) = &victim.memory {
                // SAFETY: the slot is unpinned, no guard points into it
                self.store.save_buffer_to_disk(bucket, unsafe { memory.as_bytes() })?;
            }
            self.stats.write_backs += 1;
        }
        let victim = &mut self.slots[slot];
        victim.bucket = None;
        victim.writable = false;
        self.stats.evictions += 1;
        log::debug!("Evicted buffer {} from slot {}", bucket, slot);
        Ok(())
    }

    fn take_memory(&mut self, slot: usize) -> Result<BucketBuffer> {
        match self.slots[slot].memory.take() {
            Some(memory) => Ok(memory),
            None => BucketBuffer::zeroed(self.bucket_size as usize),
        }
    }

    /// Make `bucket` resident and return its slot.
    fn load_brick_buffer_into_ram(&mut self, bucket: usize) -> Result<usize> {
        debug_assert!(bucket < self.store.num_buffers(), "buffer {} was never created", bucket);

        if let Some(slot) = self.slot_of(bucket) {
            self.touch(slot);
            return Ok(slot);
        }

        let slot = self.find_victim()?;
        self.evict(slot)?;

        let mut memory = self.take_memory(slot)?;
        // SAFETY: the memory was taken out of an unpinned slot
        self.store.load_disk_buffer(bucket, unsafe { memory.as_bytes_mut() })?;

        let target = &mut self.slots[slot];
        target.memory = Some(memory);
        target.bucket = Some(bucket);
        target.writable = false;
        target.in_use = false;
        self.touch(slot);
        self.stats.bucket_loads += 1;
        log::trace!("Loaded buffer {} into slot {}", bucket, slot);
        Ok(slot)
    }

    /// Append a zero-filled bucket and place it in a slot.
    fn append_bucket(&mut self) -> Result<()> {
        let slot = self.find_victim()?;
        self.evict(slot)?;
        let mut memory = self.take_memory(slot)?;
        let index = match self.store.allocate_next_disk_buffer() {
            Ok(index) => index,
            Err(e) => {
                self.slots[slot].memory = Some(memory);
                return Err(e);
            }
        };
        // SAFETY: the memory was taken out of an unpinned slot
        unsafe { memory.as_bytes_mut().fill(0) };

        let target = &mut self.slots[slot];
        target.memory = Some(memory);
        target.bucket = Some(index);
        target.writable = false;
        self.touch(slot);
        self.stats.buckets_created += 1;
        log::debug!("Created buffer {} in slot {}", index, slot);
        Ok(())
    }

    fn allocate(&mut self) -> Result<VirtualAddress> {
        if self.strategy == AllocationStrategy::UseDeletedBricks {
            if let Some(address) = self.free_list.pop() {
                self.stats.bricks_allocated += 1;
                return Ok(address);
            }
        }

        let address = self.next_address;
        let bucket = (address / self.bucket_size) as usize;
        while bucket >= self.store.num_buffers() {
            self.append_bucket()?;
        }
        self.next_address += self.brick_size;
        self.stats.bricks_allocated += 1;
        Ok(address)
    }

    fn delete(&mut self, address: VirtualAddress) -> Result<()> {
        locate(address, self.brick_size, self.bucket_size)?;
        if address >= self.next_address {
            return Err(Error::InvalidAddress(address));
        }
        if self.checkouts.is_checked_out(address) {
            return Err(Error::BrickInUse(address));
        }
        if self.strategy == AllocationStrategy::UseDeletedBricks && !self.free_list.contains(&address) {
            self.free_list.push(address);
        }
        self.stats.bricks_deleted += 1;
        Ok(())
    }

    fn checkout(&mut self, address: VirtualAddress, mode: AccessMode) -> Result<NonNull<u8>> {
        let (bucket, offset) = locate(address, self.brick_size, self.bucket_size)?;
        if bucket >= self.store.num_buffers() {
            return Err(Error::InvalidAddress(address));
        }
        self.checkouts.check(address, mode)?;

        let slot = self.load_brick_buffer_into_ram(bucket)?;
        self.checkouts.acquire(address, bucket, mode)?;

        let target = &mut self.slots[slot];
        target.in_use = true;
        if mode == AccessMode::Write {
            target.writable = true;
        }
        let memory = target.memory.as_ref().ok_or(Error::InvalidAddress(address))?;
        Ok(memory.brick_ptr(offset))
    }

    fn release(&mut self, address: VirtualAddress, mode: AccessMode) -> Result<()> {
        let bucket = (address / self.bucket_size) as usize;
        let Some(released) = self.checkouts.release(address, bucket, mode) else {
            log::warn!("Release of brick {} which is not checked out as {:?}", address, mode);
            return Err(Error::InvalidAddress(address));
        };
        if released.bucket_pins == 0 {
            if let Some(slot) = self.slot_of(bucket) {
                self.slots[slot].in_use = false;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let mut written = 0;
        for slot in &mut self.slots {
            let (Some(bucket), Some(memory)) = (slot.bucket, &slot.memory) else {
                continue;
            };
            if slot.writable {
                // SAFETY: flush runs with exclusive access to the pool
                self.store.save_buffer_to_disk(bucket, unsafe { memory.as_bytes() })?;
                slot.writable = false;
                written += 1;
            }
        }
        self.stats.write_backs += written;
        if written > 0 {
            log::debug!("Flushed {} dirty buffers", written);
        }
        Ok(())
    }
}

/// Disk-backed brick pool with a bounded cache of resident buckets
pub struct DiskCachedPool {
    config: PoolConfig,
    state: PoolState,
    inner: Option<Mutex<CacheState>>,
}

impl DiskCachedPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            state: PoolState::Uninitialized,
            inner: None,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn inner(&self) -> Result<&Mutex<CacheState>> {
        self.inner.as_ref().ok_or(Error::NotInitialized)
    }

    /// Number of resident slots
    pub fn num_slots(&self) -> usize {
        self.inner.as_ref().map_or(0, |i| i.lock().slots.len())
    }

    /// Number of slots currently holding a bucket
    pub fn num_buffers_in_ram(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |i| i.lock().slots.iter().filter(|s| s.is_occupied()).count())
    }

    /// Number of bucket files on disk
    pub fn num_buffers(&self) -> usize {
        self.inner.as_ref().map_or(0, |i| i.lock().store.num_buffers())
    }

    /// Change the RAM budget. Flushes and empties the cache.
    pub fn set_ram_limit(&mut self, max_ram_bytes: u64) -> Result<()> {
        if let Some(inner) = self.inner.as_mut() {
            let inner = inner.get_mut();
            let count = slot_count(max_ram_bytes, inner.bucket_size)?;
            if !inner.checkouts.is_empty() {
                return Err(Error::Config(format!(
                    "cannot change the RAM limit while {} bricks are checked out",
                    inner.checkouts.len()
                )));
            }
            inner.flush()?;
            inner.slots.clear();
            inner.slots.resize_with(count, ResidentSlot::default);
            log::info!("Brick pool RAM limit set to {} ({} slots)", format_bytes(max_ram_bytes), count);
        }
        self.config.max_ram_bytes = max_ram_bytes;
        Ok(())
    }

    /// Continue allocating at `next_address` after reopening an existing pool.
    pub fn resume_from(&mut self, next_address: VirtualAddress) -> Result<()> {
        let inner = self.inner.as_mut().ok_or(Error::NotInitialized)?.get_mut();
        let capacity = inner.store.num_buffers() as u64 * inner.bucket_size;
        if next_address % inner.brick_size != 0 || next_address > capacity {
            return Err(Error::Config(format!(
                "next virtual address {} does not fit {} bytes of buffer files",
                next_address, capacity
            )));
        }
        inner.next_address = next_address;
        Ok(())
    }
}

impl BrickPoolManager for DiskCachedPool {
    fn initialize(&mut self, brick_memory_size: u64) -> Result<()> {
        if self.state == PoolState::Initialized {
            return Err(Error::AlreadyInitialized);
        }
        let bucket_size = bucket_size_for(self.config.max_bucket_size_bytes, brick_memory_size)?;
        let count = slot_count(self.config.max_ram_bytes, bucket_size)?;
        let store = DiskStore::open(&self.config, bucket_size)?;
        let next_address = store.num_buffers() as u64 * bucket_size;

        log::info!(
            "Initialized cached disk pool at {}: brick {}, buffer {}, {} RAM slots",
            store.dir().display(),
            format_bytes(brick_memory_size),
            format_bytes(bucket_size),
            count
        );

        let mut slots = Vec::with_capacity(count);
        slots.resize_with(count, ResidentSlot::default);
        self.inner = Some(Mutex::new(CacheState {
            brick_size: brick_memory_size,
            bucket_size,
            strategy: self.config.allocation_strategy,
            store,
            slots,
            next_address,
            free_list: Vec::new(),
            checkouts: CheckoutTable::new(),
            clock: 0,
            stats: PoolStats::default(),
        }));
        self.state = PoolState::Initialized;
        Ok(())
    }

    fn deinitialize(&mut self) -> Result<()> {
        if self.state != PoolState::Initialized {
            return Err(Error::NotInitialized);
        }
        if let Some(inner) = self.inner.as_mut() {
            let inner = inner.get_mut();
            if !inner.checkouts.is_empty() {
                log::warn!("Deinitializing cached pool with {} bricks still checked out", inner.checkouts.len());
            }
            inner.flush()?;
        }
        self.inner = None;
        self.state = PoolState::Deinitialized;
        log::info!("Deinitialized cached disk pool at {}", self.config.pool_path.display());
        Ok(())
    }

    fn state(&self) -> PoolState {
        self.state
    }

    fn brick_memory_size(&self) -> u64 {
        self.inner.as_ref().map_or(0, |i| i.lock().brick_size)
    }

    fn bucket_size(&self) -> u64 {
        self.inner.as_ref().map_or(0, |i| i.lock().bucket_size)
    }

    fn allocate_brick(&self) -> Result<VirtualAddress> {
        self.inner()?.lock().allocate()
    }

    fn delete_brick(&self, address: VirtualAddress) -> Result<()> {
        self.inner()?.lock().delete(address)
    }

    fn get_brick(&self, address: VirtualAddress) -> Result<Option<BrickRef<'_>>> {
        if address == NO_BRICK {
            return Ok(None);
        }
        let mut inner = self.inner()?.lock();
        let ptr = inner.checkout(address, AccessMode::Read)?;
        let len = inner.brick_size as usize;
        // SAFETY: the slot stays pinned until this guard releases it
        Ok(Some(unsafe { BrickRef::new(self, address, ptr, len) }))
    }

    fn get_writable_brick(&self, address: VirtualAddress) -> Result<Option<BrickMut<'_>>> {
        if address == NO_BRICK {
            return Ok(None);
        }
        let mut inner = self.inner()?.lock();
        let ptr = inner.checkout(address, AccessMode::Write)?;
        let len = inner.brick_size as usize;
        // SAFETY: pinned slot, and the checkout table makes the writer exclusive
        Ok(Some(unsafe { BrickMut::new(self, address, ptr, len) }))
    }

    fn set_brick_unused(&self, address: VirtualAddress, mode: AccessMode) -> Result<()> {
        self.inner()?.lock().release(address, mode)
    }

    fn is_brick_in_ram(&self, address: VirtualAddress) -> bool {
        if address == NO_BRICK {
            return false;
        }
        let Some(inner) = self.inner.as_ref() else {
            return false;
        };
        let inner = inner.lock();
        inner.slot_of((address / inner.bucket_size) as usize).is_some()
    }

    fn memory_allocated(&self) -> u64 {
        self.inner.as_ref().map_or(0, |i| {
            let inner = i.lock();
            inner.store.num_buffers() as u64 * inner.bucket_size
        })
    }

    fn memory_used(&self) -> u64 {
        self.inner.as_ref().map_or(0, |i| {
            let inner = i.lock();
            inner.slots.iter().filter(|s| s.memory.is_some()).count() as u64 * inner.bucket_size
        })
    }

    fn metadata(&self) -> PoolMetadata {
        let mut meta = PoolMetadata::from_config(PoolKind::DiskCached, &self.config);
        meta.max_ram_used = Some(self.config.max_ram_bytes);
        if let Some(inner) = &self.inner {
            let inner = inner.lock();
            meta.brick_memory_size_bytes = inner.brick_size;
            meta.single_buffer_size_bytes = inner.bucket_size;
            meta.buffer_files = inner.store.file_names();
            meta.brick_pool_exists = inner.store.num_buffers() > 0;
            meta.brick_pool_path = std::fs::canonicalize(inner.store.dir())
                .unwrap_or_else(|_| inner.store.dir().to_path_buf());
            meta.next_virtual_memory_address = Some(inner.next_address);
        }
        meta
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.as_mut().ok_or(Error::NotInitialized)?.get_mut().flush()
    }

    fn stats(&self) -> PoolStats {
        self.inner.as_ref().map_or_else(PoolStats::default, |i| i.lock().stats)
    }

    fn description(&self) -> String {
        match &self.inner {
            Some(inner) => {
                let inner = inner.lock();
                format!(
                    "Cached disk pool: {} buffers of {} in {}, {} of {} slots resident ({:?} I/O)",
                    inner.store.num_buffers(),
                    format_bytes(inner.bucket_size),
                    inner.store.dir().display(),
                    inner.slots.iter().filter(|s| s.is_occupied()).count(),
                    inner.slots.len(),
                    inner.store.io_strategy()
                )
            }
            None => format!("Cached disk pool ({:?}): {}", self.state, self.config.pool_path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::OpenMode;
    use std::path::Path;

    /// 64-byte bricks, 256-byte buckets, two RAM slots
    fn small_pool(dir: &Path, strategy: AllocationStrategy) -> DiskCachedPool {
        let config = PoolConfig {
            max_bucket_size_bytes: 256,
            max_ram_bytes: 512,
            allocation_strategy: strategy,
            ..PoolConfig::at(dir.join("pool"))
        };
        let mut pool = DiskCachedPool::new(config);
        pool.initialize(64).unwrap();
        pool
    }

    fn bucket_file(dir: &Path, index: usize) -> Vec<u8> {
        std::fs::read(dir.join(format!("pool/brickbuffer_{:010}", index))).unwrap()
    }

    #[test]
    fn test_requires_two_slots() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            max_bucket_size_bytes: 256,
            max_ram_bytes: 511,
            ..PoolConfig::at(dir.path())
        };
        let mut pool = DiskCachedPool::new(config);
        assert!(matches!(pool.initialize(64), Err(Error::Config(_))));
        assert_eq!(pool.state(), PoolState::Uninitialized);
    }

    #[test]
    fn test_end_to_end_ten_bricks() {
        let dir = tempfile::tempdir().unwrap();
        let pool = small_pool(dir.path(), AllocationStrategy::IgnoreDeletedBricks);

        let addresses: Vec<_> = (0..10).map(|_| pool.allocate_brick().unwrap()).collect();
        assert_eq!(pool.num_buffers(), 3);

        for (i, &address) in addresses.iter().enumerate() {
            let mut brick = pool.get_writable_brick(address).unwrap().unwrap();
            brick[0] = 100 + i as u8;
        }
        for (i, &address) in addresses.iter().enumerate().rev() {
            let brick = pool.get_brick(address).unwrap().unwrap();
            assert_eq!(brick[0], 100 + i as u8);
        }

        let stats = pool.stats();
        assert!(stats.evictions > 0);
        assert!(stats.bucket_loads > 0);
        assert!(pool.num_buffers_in_ram() <= 2);
    }

    #[test]
    fn test_round_trip_after_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let pool = small_pool(dir.path(), AllocationStrategy::IgnoreDeletedBricks);
        let first = pool.allocate_brick().unwrap();
        {
            let mut brick = pool.get_writable_brick(first).unwrap().unwrap();
            for (i, byte) in brick.iter_mut().enumerate() {
                *byte = i as u8 ^ 0x5A;
            }
        }

        // Churn through two more buckets so bucket 0 leaves RAM
        for _ in 0..8 {
            let address = pool.allocate_brick().unwrap();
            pool.get_writable_brick(address).unwrap().unwrap()[1] = 1;
        }
        assert!(!pool.is_brick_in_ram(first));

        let brick = pool.get_brick(first).unwrap().unwrap();
        let expected: Vec<u8> = (0..64).map(|i| i as u8 ^ 0x5A).collect();
        assert_eq!(&brick[..], &expected[..]);
    }

    #[test]
    fn test_pinned_buckets_exhaust_cache() {
        let dir = tempfile::tempdir().unwrap();
        let pool = small_pool(dir.path(), AllocationStrategy::IgnoreDeletedBricks);
        for _ in 0..12 {
            pool.allocate_brick().unwrap();
        }

        // One brick from each of buckets 0 and 1 pins both slots
        let a = pool.get_brick(0).unwrap().unwrap();
        let b = pool.get_brick(256).unwrap().unwrap();
        assert_eq!(pool.num_buffers_in_ram(), 2);

        let err = pool.get_brick(512).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted { slots: 2 }));
        assert!(matches!(pool.allocate_brick(), Err(Error::ResourceExhausted { .. })));

        // Other bricks inside pinned buckets are still reachable
        let a2 = pool.get_brick(64).unwrap().unwrap();
        drop(a2);

        drop(b);
        assert!(pool.get_brick(512).is_ok());
        assert!(pool.is_brick_in_ram(0));
        assert!(!pool.is_brick_in_ram(256));
        drop(a);
    }

    #[test]
    fn test_no_eviction_while_in_use() {
        let dir = tempfile::tempdir().unwrap();
        let pool = small_pool(dir.path(), AllocationStrategy::IgnoreDeletedBricks);
        for _ in 0..12 {
            pool.allocate_brick().unwrap();
        }

        let pinned = pool.get_brick(0).unwrap().unwrap();
        let ptr = pinned.as_ptr();
        // Alternate between the two other buckets; only the free slot churns
        for round in 0..6 {
            let address = if round % 2 == 0 { 256 } else { 512 };
            let _brick = pool.get_brick(address).unwrap().unwrap();
            assert!(pool.is_brick_in_ram(0));
        }
        assert_eq!(pinned.as_ptr(), ptr);
        assert!(pool.stats().evictions >= 5);
    }

    #[test]
    fn test_dirty_write_back_only_when_written() {
        let dir = tempfile::tempdir().unwrap();
        let pool = small_pool(dir.path(), AllocationStrategy::IgnoreDeletedBricks);
        for _ in 0..12 {
            pool.allocate_brick().unwrap();
        }

        // Written through a writable guard; reaches disk once evicted
        pool.get_writable_brick(0).unwrap().unwrap().fill(0x11);
        pool.get_brick(256).unwrap();
        pool.get_brick(512).unwrap();
        assert!(!pool.is_brick_in_ram(0));
        assert!(bucket_file(dir.path(), 0)[..64].iter().all(|&b| b == 0x11));
        let write_backs = pool.stats().write_backs;

        // Read-only access never writes back
        pool.get_brick(0).unwrap();
        pool.get_brick(256).unwrap();
        pool.get_brick(512).unwrap();
        assert_eq!(pool.stats().write_backs, write_backs);
    }

    #[test]
    fn test_ignore_deleted_addresses_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let pool = small_pool(dir.path(), AllocationStrategy::IgnoreDeletedBricks);

        let mut addresses = Vec::new();
        for i in 0..6 {
            let address = pool.allocate_brick().unwrap();
            if i % 2 == 0 {
                pool.delete_brick(address).unwrap();
            }
            addresses.push(address);
        }
        let expected: Vec<u64> = (0..6).map(|i| i * 64).collect();
        assert_eq!(addresses, expected);
    }

    #[test]
    fn test_use_deleted_reuses_lifo() {
        let dir = tempfile::tempdir().unwrap();
        let pool = small_pool(dir.path(), AllocationStrategy::UseDeletedBricks);
        let a = pool.allocate_brick().unwrap();
        let b = pool.allocate_brick().unwrap();
        let c = pool.allocate_brick().unwrap();

        pool.delete_brick(a).unwrap();
        assert_eq!(pool.allocate_brick().unwrap(), a);

        pool.delete_brick(a).unwrap();
        pool.delete_brick(c).unwrap();
        assert_eq!(pool.allocate_brick().unwrap(), c);
        assert_eq!(pool.allocate_brick().unwrap(), a);
        // Free list empty again: cursor continues
        assert_eq!(pool.allocate_brick().unwrap(), 3 * 64);
        assert_eq!(b, 64);
    }

    #[test]
    fn test_delete_checked_out_brick() {
        let dir = tempfile::tempdir().unwrap();
        let pool = small_pool(dir.path(), AllocationStrategy::UseDeletedBricks);
        let a = pool.allocate_brick().unwrap();
        let guard = pool.get_brick(a).unwrap().unwrap();
        assert!(matches!(pool.delete_brick(a), Err(Error::BrickInUse(_))));
        drop(guard);
        pool.delete_brick(a).unwrap();
        assert!(matches!(pool.delete_brick(4096), Err(Error::InvalidAddress(4096))));
    }

    #[test]
    fn test_timestamp_overflow_rebase() {
        let dir = tempfile::tempdir().unwrap();
        let pool = small_pool(dir.path(), AllocationStrategy::IgnoreDeletedBricks);
        for _ in 0..12 {
            pool.allocate_brick().unwrap();
        }
        pool.get_brick(0).unwrap();
        pool.get_brick(256).unwrap();

        {
            let mut inner = pool.inner().unwrap().lock();
            let a = inner.slot_of(0).unwrap();
            let b = inner.slot_of(1).unwrap();
            inner.slots[a].last_used = u64::MAX - 2;
            inner.slots[b].last_used = u64::MAX - 1;
            inner.clock = u64::MAX;
        }

        // Touching bucket 1 wraps the clock; bucket 0 must stay the older one
        pool.get_brick(256).unwrap();
        {
            let inner = pool.inner().unwrap().lock();
            assert!(inner.clock < 16);
            let a = inner.slot_of(0).unwrap();
            let b = inner.slot_of(1).unwrap();
            assert!(inner.slots[a].last_used < inner.slots[b].last_used);
        }

        pool.get_brick(512).unwrap();
        assert!(!pool.is_brick_in_ram(0));
        assert!(pool.is_brick_in_ram(256));
        assert!(pool.is_brick_in_ram(512));
    }

    #[test]
    fn test_rebase_with_zero_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let pool = small_pool(dir.path(), AllocationStrategy::IgnoreDeletedBricks);
        for _ in 0..8 {
            pool.allocate_brick().unwrap();
        }
        pool.get_brick(0).unwrap();
        pool.get_brick(256).unwrap();

        {
            let mut inner = pool.inner().unwrap().lock();
            let a = inner.slot_of(0).unwrap();
            let b = inner.slot_of(1).unwrap();
            inner.slots[a].last_used = 0;
            inner.slots[b].last_used = u64::MAX - 1;
            inner.clock = u64::MAX;
        }

        pool.get_brick(256).unwrap();
        let inner = pool.inner().unwrap().lock();
        assert_eq!(inner.clock, 3);
        let a = inner.slot_of(0).unwrap();
        let b = inner.slot_of(1).unwrap();
        assert_eq!((inner.slots[a].last_used, inner.slots[b].last_used), (1, 3));
    }

    #[test]
    fn test_residency_query_waits_for_lock() {
        let dir = tempfile::tempdir().unwrap();
        let pool = small_pool(dir.path(), AllocationStrategy::IgnoreDeletedBricks);
        pool.allocate_brick().unwrap();

        std::thread::scope(|s| {
            let guard = pool.inner().unwrap().lock();
            let query = s.spawn(|| pool.is_brick_in_ram(0));
            std::thread::sleep(std::time::Duration::from_millis(50));
            drop(guard);
            assert!(query.join().unwrap());
        });
    }

    #[test]
    fn test_deinitialize_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = small_pool(dir.path(), AllocationStrategy::IgnoreDeletedBricks);
        let address = pool.allocate_brick().unwrap();
        pool.get_writable_brick(address).unwrap().unwrap().fill(0x42);

        // Still only in RAM
        assert!(bucket_file(dir.path(), 0).iter().all(|&b| b == 0));
        pool.deinitialize().unwrap();
        assert!(bucket_file(dir.path(), 0)[..64].iter().all(|&b| b == 0x42));
        assert!(matches!(pool.get_brick(address), Err(Error::NotInitialized)));
    }

    #[test]
    fn test_set_ram_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = small_pool(dir.path(), AllocationStrategy::IgnoreDeletedBricks);
        for _ in 0..12 {
            pool.allocate_brick().unwrap();
        }
        pool.get_writable_brick(0).unwrap().unwrap().fill(9);

        assert!(matches!(pool.set_ram_limit(300), Err(Error::Config(_))));
        pool.set_ram_limit(1024).unwrap();
        assert_eq!(pool.num_slots(), 4);
        assert_eq!(pool.num_buffers_in_ram(), 0);
        assert!(bucket_file(dir.path(), 0)[..64].iter().all(|&b| b == 9));

        // Three pinned buckets now fit
        let _a = pool.get_brick(0).unwrap().unwrap();
        let _b = pool.get_brick(256).unwrap().unwrap();
        let _c = pool.get_brick(512).unwrap().unwrap();
        assert_eq!(pool.num_buffers_in_ram(), 3);
    }

    #[test]
    fn test_restore_from_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = small_pool(dir.path(), AllocationStrategy::IgnoreDeletedBricks);
        for i in 0..6u8 {
            let address = pool.allocate_brick().unwrap();
            pool.get_writable_brick(address).unwrap().unwrap().fill(i + 1);
        }
        pool.flush().unwrap();
        let meta = pool.metadata();
        assert_eq!(meta.buffer_files.len(), 2);
        assert_eq!(meta.next_virtual_memory_address, Some(6 * 64));
        pool.deinitialize().unwrap();

        let restored = meta.restore(None).unwrap();
        assert_eq!(restored.bucket_size(), 256);
        for i in 0..6u64 {
            let brick = restored.get_brick(i * 64).unwrap().unwrap();
            assert!(brick.iter().all(|&b| b == i as u8 + 1));
        }
        // Allocation resumes after the last brick, inside bucket 1
        assert_eq!(restored.allocate_brick().unwrap(), 6 * 64);
    }

    #[test]
    fn test_existing_mode_adopts_files() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut pool = small_pool(dir.path(), AllocationStrategy::IgnoreDeletedBricks);
            for _ in 0..5 {
                pool.allocate_brick().unwrap();
            }
            pool.get_writable_brick(256).unwrap().unwrap().fill(3);
            pool.deinitialize().unwrap();
        }

        let config = PoolConfig {
            max_bucket_size_bytes: 256,
            max_ram_bytes: 512,
            open_mode: OpenMode::Existing,
            ..PoolConfig::at(dir.path().join("pool"))
        };
        let mut pool = DiskCachedPool::new(config);
        pool.initialize(64).unwrap();
        assert_eq!(pool.num_buffers(), 2);
        assert!(pool.get_brick(256).unwrap().unwrap().iter().all(|&b| b == 3));
        // Without metadata the cursor starts after the last adopted buffer
        assert_eq!(pool.allocate_brick().unwrap(), 512);
    }

    #[test]
    fn test_concurrent_readers_and_writers() {
        let dir = tempfile::tempdir().unwrap();
        let config = PoolConfig {
            max_bucket_size_bytes: 256,
            max_ram_bytes: 1024,
            ..PoolConfig::at(dir.path().join("pool"))
        };
        let mut pool = DiskCachedPool::new(config);
        pool.initialize(64).unwrap();
        let addresses: Vec<_> = (0..16).map(|_| pool.allocate_brick().unwrap()).collect();

        // Each thread owns four bricks and writes its id into them
        std::thread::scope(|scope| {
            for (t, chunk) in addresses.chunks(4).enumerate() {
                let pool = &pool;
                scope.spawn(move || {
                    for _ in 0..20 {
                        for &address in chunk {
                            loop {
                                match pool.get_writable_brick(address) {
                                    Ok(Some(mut brick)) => {
                                        brick.fill(t as u8 + 1);
                                        break;
                                    }
                                    Err(Error::ResourceExhausted { .. }) => std::thread::yield_now(),
                                    other => panic!("unexpected {:?}", other.map(|b| b.is_some())),
                                }
                            }
                        }
                    }
                });
            }
        });

        for (t, chunk) in addresses.chunks(4).enumerate() {
            for &address in chunk {
                let brick = pool.get_brick(address).unwrap().unwrap();
                assert!(brick.iter().all(|&b| b == t as u8 + 1));
            }
        }
    }
}
