//! RAM pool: every bucket lives in process memory
//!
//! Buckets are appended as the allocation cursor crosses into a bucket that
//! does not exist yet. Deleted bricks are not reclaimed.

use parking_lot::Mutex;

use crate::core::config::PoolConfig;
use crate::core::error::Error;
use crate::core::types::{AccessMode, Result, VirtualAddress, NO_BRICK};
use crate::pool::bucket::BucketBuffer;
use crate::pool::checkout::CheckoutTable;
use crate::pool::manager::{
    bucket_size_for, format_bytes, locate, BrickMut, BrickPoolManager, BrickRef, PoolState, PoolStats,
};
use crate::pool::metadata::{PoolKind, PoolMetadata};

struct RamState {
    brick_size: u64,
    bucket_size: u64,
    buckets: Vec<BucketBuffer>,
    next_address: VirtualAddress,
    checkouts: CheckoutTable,
    stats: PoolStats,
}

impl RamState {
    fn allocate(&mut self) -> Result<VirtualAddress> {
        let address = self.next_address;
        let bucket = (address / self.bucket_size) as usize;
        while bucket >= self.buckets.len() {
            self.buckets.push(BucketBuffer::zeroed(self.bucket_size as usize)?);
            self.stats.buckets_created += 1;
            log::debug!("RAM pool grew to {} buffers", self.buckets.len());
        }
        self.next_address += self.brick_size;
        self.stats.bricks_allocated += 1;
        Ok(address)
    }

    fn checkout(&mut self, address: VirtualAddress, mode: AccessMode) -> Result<std::ptr::NonNull<u8>> {
        let (bucket, offset) = locate(address, self.brick_size, self.bucket_size)?;
        if bucket >= self.buckets.len() {
            return Err(Error::InvalidAddress(address));
        }
        self.checkouts.acquire(address, bucket, mode)?;
        Ok(self.buckets[bucket].brick_ptr(offset))
    }
}

/// Brick pool held entirely in RAM
pub struct RamPool {
    max_bucket_size: u64,
    state: PoolState,
    inner: Option<Mutex<RamState>>,
}

impl RamPool {
    pub fn new(max_bucket_size: u64) -> Self {
        Self {
            max_bucket_size,
            state: PoolState::Uninitialized,
            inner: None,
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self::new(config.max_bucket_size_bytes)
    }

    /// Number of buckets allocated so far
    pub fn num_buffers(&self) -> usize {
        self.inner.as_ref().map_or(0, |i| i.lock().buckets.len())
    }

    fn inner(&self) -> Result<&Mutex<RamState>> {
        self.inner.as_ref().ok_or(Error::NotInitialized)
    }
}

impl BrickPoolManager for RamPool {
    fn initialize(&mut self, brick_memory_size: u64) -> Result<()> {
        if self.state == PoolState::Initialized {
            return Err(Error::AlreadyInitialized);
        }
        let bucket_size = bucket_size_for(self.max_bucket_size, brick_memory_size)?;
        self.inner = Some(Mutex::new(RamState {
            brick_size: brick_memory_size,
            bucket_size,
            buckets: Vec::new(),
            next_address: 0,
            checkouts: CheckoutTable::new(),
            stats: PoolStats::default(),
        }));
        self.state = PoolState::Initialized;
        log::info!(
            "Initialized RAM pool: brick {}, buffer {}",
            format_bytes(brick_memory_size),
            format_bytes(bucket_size)
        );
        Ok(())
    }

    fn deinitialize(&mut self) -> Result<()> {
        if self.state != PoolState::Initialized {
            return Err(Error::NotInitialized);
        }
        self.inner = None;
        self.state = PoolState::Deinitialized;
        log::info!("Deinitialized RAM pool");
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
        let mut inner = self.inner()?.lock();
        locate(address, inner.brick_size, inner.bucket_size)?;
        if inner.checkouts.is_checked_out(address) {
            return Err(Error::BrickInUse(address));
        }
        // Space stays allocated; addresses are never handed out twice
        inner.stats.bricks_deleted += 1;
        Ok(())
    }

    fn get_brick(&self, address: VirtualAddress) -> Result<Option<BrickRef<'_>>> {
        if address == NO_BRICK {
            return Ok(None);
        }
        let mut inner = self.inner()?.lock();
        let ptr = inner.checkout(address, AccessMode::Read)?;
        let len = inner.brick_size as usize;
        // SAFETY: buckets are only freed by deinitialize, which needs &mut self
        Ok(Some(unsafe { BrickRef::new(self, address, ptr, len) }))
    }

    fn get_writable_brick(&self, address: VirtualAddress) -> Result<Option<BrickMut<'_>>> {
        if address == NO_BRICK {
            return Ok(None);
        }
        let mut inner = self.inner()?.lock();
        let ptr = inner.checkout(address, AccessMode::Write)?;
        let len = inner.brick_size as usize;
        // SAFETY: as above, and the checkout table makes the writer exclusive
        Ok(Some(unsafe { BrickMut::new(self, address, ptr, len) }))
    }

    fn set_brick_unused(&self, address: VirtualAddress, mode: AccessMode) -> Result<()> {
        let mut inner = self.inner()?.lock();
        let bucket = (address / inner.bucket_size) as usize;
        match inner.checkouts.release(address, bucket, mode) {
            Some(_) => Ok(()),
            None => {
                log::warn!("Release of brick {} which is not checked out as {:?}", address, mode);
                Err(Error::InvalidAddress(address))
            }
        }
    }

    fn is_brick_in_ram(&self, _address: VirtualAddress) -> bool {
        true
    }

    fn memory_allocated(&self) -> u64 {
        self.inner.as_ref().map_or(0, |i| {
            let inner = i.lock();
            inner.buckets.len() as u64 * inner.bucket_size
        })
    }

    fn memory_used(&self) -> u64 {
        self.memory_allocated()
    }

    fn metadata(&self) -> PoolMetadata {
        let config = PoolConfig {
            max_bucket_size_bytes: self.max_bucket_size,
            pool_path: Default::default(),
            file_prefix: String::new(),
            ..Default::default()
        };
        let mut meta = PoolMetadata::from_config(PoolKind::Ram, &config);
        if let Some(inner) = &self.inner {
            let inner = inner.lock();
            meta.brick_memory_size_bytes = inner.brick_size;
            meta.single_buffer_size_bytes = inner.bucket_size;
            meta.next_virtual_memory_address = Some(inner.next_address);
        }
        meta
    }

    fn flush(&mut self) -> Result<()> {
        self.inner()?;
        Ok(())
    }

    fn stats(&self) -> PoolStats {
        self.inner.as_ref().map_or_else(PoolStats::default, |i| i.lock().stats)
    }

    fn description(&self) -> String {
        match &self.inner {
            Some(inner) => {
                let inner = inner.lock();
                format!(
                    "RAM pool: {} buffers of {} ({} allocated)",
                    inner.buckets.len(),
                    format_bytes(inner.bucket_size),
                    format_bytes(inner.buckets.len() as u64 * inner.bucket_size)
                )
            }
            None => format!("RAM pool ({:?})", self.state),
        }
    }
}
