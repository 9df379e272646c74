//! Brick pool manager contract and brick guards
//!
//! Every pool maps a virtual brick address to bytes inside some bucket.
//! `get_brick`/`get_writable_brick` hand out guards that keep the owning
//! bucket pinned until they are dropped.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use serde::Serialize;

use crate::core::error::Error;
use crate::core::types::{AccessMode, Result, VirtualAddress};
use crate::pool::metadata::PoolMetadata;

/// Lifecycle of a pool instance
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PoolState {
    #[default]
    Uninitialized,
    Initialized,
    Deinitialized,
}

/// Instrumentation counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub bricks_allocated: u64,
    pub bricks_deleted: u64,
    /// Buckets appended to the pool (RAM or disk)
    pub buckets_created: u64,
    /// Buckets read from disk
    pub bucket_loads: u64,
    /// Resident buckets dropped to make room for another
    pub evictions: u64,
    /// Buckets written back to disk
    pub write_backs: u64,
}

/// Virtual memory interface shared by all brick pools.
///
/// Data operations take `&self` and may be called from several threads.
/// Operations that touch every bucket at once take `&mut self`, which also
/// guarantees that no brick guard is alive while they run.
pub trait BrickPoolManager: Send + Sync {
    /// Fix the brick size for the lifetime of this initialization.
    fn initialize(&mut self, brick_memory_size: u64) -> Result<()>;

    /// Flush (if disk-backed) and release all memory.
    fn deinitialize(&mut self) -> Result<()>;

    fn state(&self) -> PoolState;

    /// Size of one brick in bytes (0 before initialization)
    fn brick_memory_size(&self) -> u64;

    /// Size of one bucket in bytes (0 before initialization)
    fn bucket_size(&self) -> u64;

    /// Reserve space for one brick.
    fn allocate_brick(&self) -> Result<VirtualAddress>;

    /// Mark a brick as reclaimable. What happens to the space depends on the pool.
    fn delete_brick(&self, address: VirtualAddress) -> Result<()>;

    /// Read-only access to a brick. `NO_BRICK` yields `None`.
    fn get_brick(&self, address: VirtualAddress) -> Result<Option<BrickRef<'_>>>;

    /// Exclusive writable access to a brick. `NO_BRICK` yields `None`.
    fn get_writable_brick(&self, address: VirtualAddress) -> Result<Option<BrickMut<'_>>>;

    /// Release one checkout of `address`. Called by the guards on drop.
    fn set_brick_unused(&self, address: VirtualAddress, mode: AccessMode) -> Result<()>;

    /// Whether accessing `address` would not touch the disk. Never loads anything.
    fn is_brick_in_ram(&self, address: VirtualAddress) -> bool;

    /// Bytes of bucket storage allocated (RAM or disk)
    fn memory_allocated(&self) -> u64;

    /// Bytes currently held in RAM by the pool
    fn memory_used(&self) -> u64;

    /// Everything needed to reopen this pool later
    fn metadata(&self) -> PoolMetadata;

    /// Write every dirty bucket to its backing store.
    fn flush(&mut self) -> Result<()>;

    fn stats(&self) -> PoolStats;

    /// One-line human readable summary
    fn description(&self) -> String;
}

/// Bucket size for a given brick size: `max_bucket` rounded down to whole bricks.
pub(crate) fn bucket_size_for(max_bucket: u64, brick_memory_size: u64) -> Result<u64> {
    if brick_memory_size == 0 {
        return Err(Error::InvalidArgument("brick memory size must be non-zero".into()));
    }
    let size = max_bucket / brick_memory_size * brick_memory_size;
    if size == 0 {
        return Err(Error::Config(format!(
            "maximum buffer size ({} bytes) is smaller than one brick ({} bytes)",
            max_bucket, brick_memory_size
        )));
    }
    Ok(size)
}

/// Split an address into (bucket index, offset in bucket).
pub(crate) fn locate(
    address: VirtualAddress,
    brick_memory_size: u64,
    bucket_size: u64,
) -> Result<(usize, usize)> {
    if address % brick_memory_size != 0 {
        return Err(Error::InvalidAddress(address));
    }
    Ok(((address / bucket_size) as usize, (address % bucket_size) as usize))
}

/// Human readable byte count
pub(crate) fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ---------------------------------------------------------------------------
// Guards
// ---------------------------------------------------------------------------

/// Read-only view of a checked-out brick. Releases the brick on drop.
pub struct BrickRef<'a> {
    pool: &'a dyn BrickPoolManager,
    address: VirtualAddress,
    ptr: NonNull<u8>,
    len: usize,
}

impl<'a> BrickRef<'a> {
    /// # Safety
    /// `ptr..ptr+len` must stay valid and free of writers until `pool`
    /// receives the matching `set_brick_unused(address, Read)`.
    pub(crate) unsafe fn new(
        pool: &'a dyn BrickPoolManager,
        address: VirtualAddress,
        ptr: NonNull<u8>,
        len: usize,
    ) -> Self {
        Self { pool, address, ptr, len }
    }

    pub fn address(&self) -> VirtualAddress {
        self.address
    }

    /// Brick contents as 16-bit voxel values
    pub fn voxels(&self) -> &[u16] {
        bytemuck::cast_slice(&self[..])
    }

    /// Release now and report failures instead of logging them.
    pub fn release(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        this.pool.set_brick_unused(this.address, AccessMode::Read)
    }
}

impl Deref for BrickRef<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: guaranteed by the constructor contract
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for BrickRef<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.pool.set_brick_unused(self.address, AccessMode::Read) {
            log::error!("Failed to release brick {}: {}", self.address, e);
        }
    }
}

impl std::fmt::Debug for BrickRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrickRef")
            .field("address", &self.address)
            .field("len", &self.len)
            .finish()
    }
}

/// Exclusive writable view of a checked-out brick. Releases the brick on drop.
pub struct BrickMut<'a> {
    pool: &'a dyn BrickPoolManager,
    address: VirtualAddress,
    ptr: NonNull<u8>,
    len: usize,
}

impl<'a> BrickMut<'a> {
    /// # Safety
    /// `ptr..ptr+len` must stay valid and unaliased until `pool` receives
    /// the matching `set_brick_unused(address, Write)`.
    pub(crate) unsafe fn new(
        pool: &'a dyn BrickPoolManager,
        address: VirtualAddress,
        ptr: NonNull<u8>,
        len: usize,
    ) -> Self {
        Self { pool, address, ptr, len }
    }

    pub fn address(&self) -> VirtualAddress {
        self.address
    }

    pub fn voxels(&self) -> &[u16] {
        bytemuck::cast_slice(&self[..])
    }

    pub fn voxels_mut(&mut self) -> &mut [u16] {
        bytemuck::cast_slice_mut(&mut self[..])
    }

    /// Release now. For the uncached disk pool this is where the brick is
    /// written back, so the error is worth checking.
    pub fn release(self) -> Result<()> {
        let this = ManuallyDrop::new(self);
        this.pool.set_brick_unused(this.address, AccessMode::Write)
    }
}

impl Deref for BrickMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: guaranteed by the constructor contract
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for BrickMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: guaranteed by the constructor contract
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for BrickMut<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.pool.set_brick_unused(self.address, AccessMode::Write) {
            log::error!("Failed to release writable brick {}: {}", self.address, e);
        }
    }
}

impl std::fmt::Debug for BrickMut<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrickMut")
            .field("address", &self.address)
            .field("len", &self.len)
            .finish()
    }
}
