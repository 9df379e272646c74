//! Bucket memory
//!
//! A bucket is one contiguous, bucket-sized heap allocation. Brick guards
//! point into it through raw pointers, so the allocation is owned through a
//! raw pointer as well: moving the `BucketBuffer` (e.g. inside a `Vec` that
//! grows) never invalidates outstanding brick pointers.

use std::ptr::NonNull;

use crate::core::error::Error;
use crate::core::types::Result;

/// Owned, 8-byte aligned, zero-initialized bucket memory
pub struct BucketBuffer {
    ptr: NonNull<u64>,
    words: usize,
    len: usize,
}

// SAFETY: BucketBuffer uniquely owns its allocation. Access to the bytes is
// coordinated by the owning pool's lock and checkout table.
unsafe impl Send for BucketBuffer {}
unsafe impl Sync for BucketBuffer {}

impl BucketBuffer {
    /// Allocate `len` zeroed bytes, reporting allocation failure as an error.
    pub fn zeroed(len: usize) -> Result<Self> {
        let words = len.div_ceil(8);
        let mut storage: Vec<u64> = Vec::new();
        storage.try_reserve_exact(words).map_err(|e| {
            Error::OutOfMemory(format!("failed to allocate a {} byte buffer: {}", len, e))
        })?;
        storage.resize(words, 0);

        let raw = Box::into_raw(storage.into_boxed_slice());
        // Box never hands out a null pointer
        let ptr = NonNull::new(raw.cast::<u64>()).unwrap_or(NonNull::dangling());
        Ok(Self { ptr, words, len })
    }

    /// Size in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to the byte at `offset`. Does not create a reference.
    pub fn brick_ptr(&self, offset: usize) -> NonNull<u8> {
        debug_assert!(offset < self.len, "offset {} outside bucket of {} bytes", offset, self.len);
        // SAFETY: offset is within the allocation
        unsafe { self.ptr.cast::<u8>().add(offset) }
    }

    /// View the whole bucket.
    ///
    /// # Safety
    /// No writable brick guard may point into this bucket while the slice lives.
    pub unsafe fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }

    /// Mutable view of the whole bucket.
    ///
    /// # Safety
    /// No brick guard of any kind may point into this bucket while the slice lives.
    pub unsafe fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<u8>(), self.len) }
    }
}

impl Drop for BucketBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/words came from Box::<[u64]>::into_raw in `zeroed`
        unsafe {
            let slice = std::ptr::slice_from_raw_parts_mut(self.ptr.as_ptr(), self.words);
            drop(Box::from_raw(slice));
        }
    }
}

impl std::fmt::Debug for BucketBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BucketBuffer").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeroed_and_aligned() {
        let buffer = BucketBuffer::zeroed(100).unwrap();
        assert_eq!(buffer.len(), 100);
        assert_eq!(buffer.brick_ptr(0).as_ptr() as usize % 8, 0);
        assert!(unsafe { buffer.as_bytes() }.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_pointer_survives_move() {
        let mut buffers = Vec::new();
        let mut first = BucketBuffer::zeroed(64).unwrap();
        unsafe { first.as_bytes_mut()[10] = 42 };
        let ptr = first.brick_ptr(10);
        buffers.push(first);

        // Force the Vec to reallocate
        for _ in 0..32 {
            buffers.push(BucketBuffer::zeroed(64).unwrap());
        }
        assert_eq!(unsafe { *ptr.as_ptr() }, 42);
    }

    #[test]
    fn test_huge_allocation_fails_cleanly() {
        let result = BucketBuffer::zeroed(usize::MAX - 16);
        assert!(matches!(result, Err(Error::OutOfMemory(_))));
    }
}
