//! Brick checkout bookkeeping
//!
//! Tracks which virtual addresses are currently handed out through
//! `get_brick`/`get_writable_brick` and how many checkouts pin each bucket.
//! A bucket with a non-zero pin count must never be evicted.

use std::collections::HashMap;

use crate::core::error::Error;
use crate::core::types::{AccessMode, Result, VirtualAddress};

/// Outstanding checkouts of a single brick
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Checkout {
    /// Number of read-only guards alive
    pub readers: u32,
    /// Whether a writable guard is alive (exclusive)
    pub writer: bool,
}

impl Checkout {
    fn is_free(&self) -> bool {
        self.readers == 0 && !self.writer
    }
}

/// Result of releasing one checkout
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Released {
    /// Pins left on the owning bucket
    pub bucket_pins: u32,
    /// Whether the brick itself has no checkouts left
    pub brick_free: bool,
}

/// Checkout table shared by every pool flavor
#[derive(Debug, Default)]
pub struct CheckoutTable {
    bricks: HashMap<VirtualAddress, Checkout>,
    bucket_pins: HashMap<usize, u32>,
}

impl CheckoutTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail if `address` cannot be checked out with `mode` right now.
    pub fn check(&self, address: VirtualAddress, mode: AccessMode) -> Result<()> {
        let Some(current) = self.bricks.get(&address) else {
            return Ok(());
        };
        if current.writer {
            return Err(Error::BrickBeingWritten(address));
        }
        if mode == AccessMode::Write && current.readers > 0 {
            return Err(Error::BrickInUse(address));
        }
        Ok(())
    }

    /// Record a checkout. Returns true if this is the first checkout of the brick.
    pub fn acquire(&mut self, address: VirtualAddress, bucket: usize, mode: AccessMode) -> Result<bool> {
        self.check(address, mode)?;

        let entry = self.bricks.entry(address).or_default();
        let first = entry.is_free();
        match mode {
            AccessMode::Read => entry.readers += 1,
            AccessMode::Write => entry.writer = true,
        }
        *self.bucket_pins.entry(bucket).or_insert(0) += 1;
        Ok(first)
    }

    /// Drop a checkout. Returns `None` if no matching checkout exists.
    pub fn release(&mut self, address: VirtualAddress, bucket: usize, mode: AccessMode) -> Option<Released> {
        let entry = self.bricks.get_mut(&address)?;
        match mode {
            AccessMode::Read if entry.readers > 0 => entry.readers -= 1,
            AccessMode::Write if entry.writer => entry.writer = false,
            _ => return None,
        }
        let brick_free = entry.is_free();
        if brick_free {
            self.bricks.remove(&address);
        }

        let pins = self.bucket_pins.get_mut(&bucket)?;
        *pins -= 1;
        let bucket_pins = *pins;
        if bucket_pins == 0 {
            self.bucket_pins.remove(&bucket);
        }

        Some(Released { bucket_pins, brick_free })
    }

    pub fn is_checked_out(&self, address: VirtualAddress) -> bool {
        self.bricks.contains_key(&address)
    }

    /// Number of checkouts pinning `bucket`
    pub fn pins(&self, bucket: usize) -> u32 {
        self.bucket_pins.get(&bucket).copied().unwrap_or(0)
    }

    /// Number of distinct bricks checked out
    pub fn len(&self) -> usize {
        self.bricks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bricks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readers_share_writer_excludes() {
        let mut table = CheckoutTable::new();

        assert!(table.acquire(0, 0, AccessMode::Read).unwrap());
        assert!(!table.acquire(0, 0, AccessMode::Read).unwrap());
        assert_eq!(table.pins(0), 2);

        // Writer is refused while readers are out
        assert!(matches!(table.acquire(0, 0, AccessMode::Write), Err(Error::BrickInUse(0))));

        table.release(0, 0, AccessMode::Read).unwrap();
        let released = table.release(0, 0, AccessMode::Read).unwrap();
        assert_eq!(released, Released { bucket_pins: 0, brick_free: true });
        assert!(table.is_empty());

        // Exclusive writer blocks both kinds
        table.acquire(0, 0, AccessMode::Write).unwrap();
        assert!(matches!(table.check(0, AccessMode::Read), Err(Error::BrickBeingWritten(0))));
        assert!(matches!(table.check(0, AccessMode::Write), Err(Error::BrickBeingWritten(0))));
    }

    #[test]
    fn test_bucket_pins_span_bricks() {
        let mut table = CheckoutTable::new();
        table.acquire(0, 0, AccessMode::Read).unwrap();
        table.acquire(64, 0, AccessMode::Write).unwrap();
        table.acquire(256, 1, AccessMode::Read).unwrap();

        assert_eq!(table.pins(0), 2);
        assert_eq!(table.pins(1), 1);
        assert_eq!(table.len(), 3);

        let released = table.release(64, 0, AccessMode::Write).unwrap();
        assert_eq!(released.bucket_pins, 1);
        assert!(table.is_checked_out(0));
        assert!(!table.is_checked_out(64));
    }

    #[test]
    fn test_release_without_checkout() {
        let mut table = CheckoutTable::new();
        assert!(table.release(0, 0, AccessMode::Read).is_none());

        table.acquire(0, 0, AccessMode::Read).unwrap();
        // Mode must match the checkout
        assert!(table.release(0, 0, AccessMode::Write).is_none());
        assert_eq!(table.pins(0), 1);
    }
}
