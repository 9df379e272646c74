//! Disk pool: buckets stored as files
//!
//! [`DiskStore`] owns the ordered list of bucket files and does the
//! whole-bucket reads and writes. [`DiskPool`] is a pool manager on top of it
//! with no bucket cache at all: every checkout reads the bucket from disk and
//! every writable release writes it back.

use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::core::config::{IoStrategy, OpenMode, PoolConfig};
use crate::core::error::{Error, IoContext};
use crate::core::types::{AccessMode, Result, VirtualAddress, NO_BRICK};
use crate::pool::bucket::BucketBuffer;
use crate::pool::checkout::CheckoutTable;
use crate::pool::disk_io::{io_for, BucketIo};
use crate::pool::manager::{
    bucket_size_for, format_bytes, locate, BrickMut, BrickPoolManager, BrickRef, PoolState, PoolStats,
};
use crate::pool::metadata::{PoolKind, PoolMetadata};

// ---------------------------------------------------------------------------
// DiskStore
// ---------------------------------------------------------------------------

/// Ordered bucket files in one directory
pub struct DiskStore {
    dir: PathBuf,
    prefix: String,
    bucket_size: u64,
    files: Vec<PathBuf>,
    io: Box<dyn BucketIo>,
}

impl DiskStore {
    /// Open a store according to `config.open_mode`.
    ///
    /// Fresh stores create the directory if needed and start empty. Existing
    /// stores adopt every `<prefix>_*` file, sorted by name; each file must be
    /// exactly one bucket long.
    pub fn open(config: &PoolConfig, bucket_size: u64) -> Result<Self> {
        let dir = config.pool_path.clone();
        let mut store = Self {
            dir,
            prefix: config.file_prefix.clone(),
            bucket_size,
            files: Vec::new(),
            io: io_for(config.io_strategy),
        };

        match config.open_mode {
            OpenMode::Fresh => {
                fs::create_dir_all(&store.dir).with_path(&store.dir)?;
            }
            OpenMode::Existing => {
                if !store.dir.is_dir() {
                    return Err(Error::io(
                        &store.dir,
                        std::io::Error::new(std::io::ErrorKind::NotFound, "brick pool directory does not exist"),
                    ));
                }
                store.files = store.scan()?;
                log::info!(
                    "Adopted {} existing buffer files from {}",
                    store.files.len(),
                    store.dir.display()
                );
            }
        }

        Ok(store)
    }

    fn scan(&self) -> Result<Vec<PathBuf>> {
        let pattern = format!("{}_", self.prefix);
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir).with_path(&self.dir)? {
            let entry = entry.with_path(&self.dir)?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(&pattern) {
                files.push(entry.path());
            }
        }
        files.sort();

        for file in &files {
            let len = fs::metadata(file).with_path(file)?.len();
            if len != self.bucket_size {
                return Err(Error::Config(format!(
                    "buffer file {} has {} bytes, expected {}",
                    file.display(),
                    len,
                    self.bucket_size
                )));
            }
        }
        Ok(files)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn bucket_size(&self) -> u64 {
        self.bucket_size
    }

    pub fn io_strategy(&self) -> IoStrategy {
        self.io.strategy()
    }

    /// Number of bucket files
    pub fn num_buffers(&self) -> usize {
        self.files.len()
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    /// File names relative to the pool directory, in bucket order
    pub fn file_names(&self) -> Vec<String> {
        self.files
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect()
    }

    fn bucket_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}_{:010}", self.prefix, index))
    }

    /// Create the next zero-filled bucket file and return its index.
    pub fn allocate_next_disk_buffer(&mut self) -> Result<usize> {
        let index = self.files.len();
        let path = self.bucket_path(index);
        let file = File::create(&path).with_path(&path)?;
        file.set_len(self.bucket_size).with_path(&path)?;
        log::trace!("Created buffer file {}", path.display());
        self.files.push(path);
        Ok(index)
    }

    /// Write a whole bucket.
    pub fn save_buffer_to_disk(&self, index: usize, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len() as u64, self.bucket_size);
        let path = self.file(index)?;
        self.io.write_bucket(path, data).with_path(path)?;
        log::trace!("Saved buffer {} to {}", index, path.display());
        Ok(())
    }

    /// Read a whole bucket into `buf`.
    pub fn load_disk_buffer(&self, index: usize, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len() as u64, self.bucket_size);
        let path = self.file(index)?;
        self.io.read_bucket(path, buf).with_path(path)?;
        log::trace!("Loaded buffer {} from {}", index, path.display());
        Ok(())
    }

    fn file(&self, index: usize) -> Result<&PathBuf> {
        self.files.get(index).ok_or_else(|| {
            Error::InvalidArgument(format!("buffer {} does not exist ({} on disk)", index, self.files.len()))
        })
    }
}

// ---------------------------------------------------------------------------
// DiskPool
// ---------------------------------------------------------------------------

struct DiskState {
    brick_size: u64,
    store: DiskStore,
    next_address: VirtualAddress,
    checkouts: CheckoutTable,
    /// Private copies of checked-out bricks
    copies: HashMap<VirtualAddress, BucketBuffer>,
    stats: PoolStats,
}

impl DiskState {
    fn bucket_size(&self) -> u64 {
        self.store.bucket_size()
    }

    fn allocate(&mut self) -> Result<VirtualAddress> {
        let address = self.next_address;
        let bucket = (address / self.bucket_size()) as usize;
        while bucket >= self.store.num_buffers() {
            self.store.allocate_next_disk_buffer()?;
            self.stats.buckets_created += 1;
        }
        self.next_address += self.brick_size;
        self.stats.bricks_allocated += 1;
        Ok(address)
    }

    fn read_bucket(&mut self, bucket: usize) -> Result<BucketBuffer> {
        let mut memory = BucketBuffer::zeroed(self.bucket_size() as usize)?;
        // SAFETY: freshly allocated, nothing points into it
        self.store.load_disk_buffer(bucket, unsafe { memory.as_bytes_mut() })?;
        self.stats.bucket_loads += 1;
        Ok(memory)
    }

    fn checkout(&mut self, address: VirtualAddress, mode: AccessMode) -> Result<std::ptr::NonNull<u8>> {
        let (bucket, offset) = locate(address, self.brick_size, self.bucket_size())?;
        if bucket >= self.store.num_buffers() {
            return Err(Error::InvalidAddress(address));
        }
        self.checkouts.check(address, mode)?;

        if !self.copies.contains_key(&address) {
            let memory = self.read_bucket(bucket)?;
            let mut copy = BucketBuffer::zeroed(self.brick_size as usize)?;
            let end = offset + self.brick_size as usize;
            // SAFETY: both buffers are private to this call
            unsafe { copy.as_bytes_mut().copy_from_slice(&memory.as_bytes()[offset..end]) };
            self.copies.insert(address, copy);
        }

        self.checkouts.acquire(address, bucket, mode)?;
        // Present: inserted above if it was missing
        let copy = self.copies.get(&address).ok_or(Error::InvalidAddress(address))?;
        Ok(copy.brick_ptr(0))
    }

    fn release(&mut self, address: VirtualAddress, mode: AccessMode) -> Result<()> {
        let (bucket, offset) = locate(address, self.brick_size, self.bucket_size())?;
        let Some(released) = self.checkouts.release(address, bucket, mode) else {
            log::warn!("Release of brick {} which is not checked out as {:?}", address, mode);
            return Err(Error::InvalidAddress(address));
        };

        // The guard is gone either way, so the copy goes too even if the write fails
        let written = match mode {
            AccessMode::Write => self.write_back(address, bucket, offset),
            AccessMode::Read => Ok(()),
        };
        if released.brick_free {
            self.copies.remove(&address);
        }
        if let Err(e) = &written {
            log::error!("Write-back of brick {} to buffer {} failed: {}", address, bucket, e);
        }
        written
    }

    /// Patch a brick copy into its bucket file.
    fn write_back(&mut self, address: VirtualAddress, bucket: usize, offset: usize) -> Result<()> {
        let mut memory = self.read_bucket(bucket)?;
        let copy = self.copies.get(&address).ok_or(Error::InvalidAddress(address))?;
        let end = offset + self.brick_size as usize;
        // SAFETY: the writer was exclusive and has just been released
        unsafe { memory.as_bytes_mut()[offset..end].copy_from_slice(copy.as_bytes()) };
        self.store.save_buffer_to_disk(bucket, unsafe { memory.as_bytes() })?;
        self.stats.write_backs += 1;
        Ok(())
    }
}

/// Disk-backed pool without a RAM cache
pub struct DiskPool {
    config: PoolConfig,
    state: PoolState,
    inner: Option<Mutex<DiskState>>,
}

impl DiskPool {
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

    /// Continue allocating at `next_address` after reopening an existing pool.
    pub fn resume_from(&mut self, next_address: VirtualAddress) -> Result<()> {
        let inner = self.inner.as_mut().ok_or(Error::NotInitialized)?.get_mut();
        let capacity = inner.store.num_buffers() as u64 * inner.bucket_size();
        if next_address % inner.brick_size != 0 || next_address > capacity {
            return Err(Error::Config(format!(
                "next virtual address {} does not fit {} bytes of buffer files",
                next_address, capacity
            )));
        }
        inner.next_address = next_address;
        Ok(())
    }

    fn inner(&self) -> Result<&Mutex<DiskState>> {
        self.inner.as_ref().ok_or(Error::NotInitialized)
    }
}

impl BrickPoolManager for DiskPool {
    fn initialize(&mut self, brick_memory_size: u64) -> Result<()> {
        if self.state == PoolState::Initialized {
            return Err(Error::AlreadyInitialized);
        }
        let bucket_size = bucket_size_for(self.config.max_bucket_size_bytes, brick_memory_size)?;
        let store = DiskStore::open(&self.config, bucket_size)?;
        let next_address = store.num_buffers() as u64 * bucket_size;

        log::info!(
            "Initialized disk pool at {}: brick {}, buffer {}",
            store.dir().display(),
            format_bytes(brick_memory_size),
            format_bytes(bucket_size)
        );

        self.inner = Some(Mutex::new(DiskState {
            brick_size: brick_memory_size,
            store,
            next_address,
            checkouts: CheckoutTable::new(),
            copies: HashMap::new(),
            stats: PoolStats::default(),
        }));
        self.state = PoolState::Initialized;
        Ok(())
    }

    fn deinitialize(&mut self) -> Result<()> {
        if self.state != PoolState::Initialized {
            return Err(Error::NotInitialized);
        }
        if let Some(inner) = self.inner.take() {
            let inner = inner.into_inner();
            if !inner.checkouts.is_empty() {
                log::warn!("Deinitializing disk pool with {} bricks still checked out", inner.checkouts.len());
            }
        }
        self.state = PoolState::Deinitialized;
        log::info!("Deinitialized disk pool at {}", self.config.pool_path.display());
        Ok(())
    }

    fn state(&self) -> PoolState {
        self.state
    }

    fn brick_memory_size(&self) -> u64 {
        self.inner.as_ref().map_or(0, |i| i.lock().brick_size)
    }

    fn bucket_size(&self) -> u64 {
        self.inner.as_ref().map_or(0, |i| i.lock().bucket_size())
    }

    fn allocate_brick(&self) -> Result<VirtualAddress> {
        self.inner()?.lock().allocate()
    }

    fn delete_brick(&self, address: VirtualAddress) -> Result<()> {
        let mut inner = self.inner()?.lock();
        locate(address, inner.brick_size, inner.bucket_size())?;
        if inner.checkouts.is_checked_out(address) {
            return Err(Error::BrickInUse(address));
        }
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
        // SAFETY: the copy lives in `copies` until its last checkout is released
        Ok(Some(unsafe { BrickRef::new(self, address, ptr, len) }))
    }

    fn get_writable_brick(&self, address: VirtualAddress) -> Result<Option<BrickMut<'_>>> {
        if address == NO_BRICK {
            return Ok(None);
        }
        let mut inner = self.inner()?.lock();
        let ptr = inner.checkout(address, AccessMode::Write)?;
        let len = inner.brick_size as usize;
        // SAFETY: exclusive checkout of a private copy
        Ok(Some(unsafe { BrickMut::new(self, address, ptr, len) }))
    }

    fn set_brick_unused(&self, address: VirtualAddress, mode: AccessMode) -> Result<()> {
        self.inner()?.lock().release(address, mode)
    }

    fn is_brick_in_ram(&self, address: VirtualAddress) -> bool {
        self.inner
            .as_ref()
            .is_some_and(|i| i.lock().copies.contains_key(&address))
    }

    fn memory_allocated(&self) -> u64 {
        self.inner
            .as_ref()
            .map_or(0, |i| {
                let inner = i.lock();
                inner.store.num_buffers() as u64 * inner.bucket_size()
            })
    }

    fn memory_used(&self) -> u64 {
        self.inner
            .as_ref()
            .map_or(0, |i| {
                let inner = i.lock();
                inner.copies.len() as u64 * inner.brick_size
            })
    }

    fn metadata(&self) -> PoolMetadata {
        let mut meta = PoolMetadata::from_config(PoolKind::Disk, &self.config);
        if let Some(inner) = &self.inner {
            let inner = inner.lock();
            meta.brick_memory_size_bytes = inner.brick_size;
            meta.single_buffer_size_bytes = inner.bucket_size();
            meta.buffer_files = inner.store.file_names();
            meta.brick_pool_exists = inner.store.num_buffers() > 0;
            meta.brick_pool_path = fs::canonicalize(inner.store.dir())
                .unwrap_or_else(|_| inner.store.dir().to_path_buf());
            meta.next_virtual_memory_address = Some(inner.next_address);
        }
        meta
    }

    fn flush(&mut self) -> Result<()> {
        // Writable releases already went to disk
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
                    "Disk pool: {} buffers of {} in {} ({:?} I/O)",
                    inner.store.num_buffers(),
                    format_bytes(inner.bucket_size()),
                    inner.store.dir().display(),
                    inner.store.io_strategy()
                )
            }
            None => format!("Disk pool ({:?}): {}", self.state, self.config.pool_path.display()),
        }
    }
}
