//! Brickpool - out-of-core octree brick pool
//!
//! A virtual brick address space backed by RAM buckets, bucket files on disk,
//! or bucket files behind a bounded LRU cache of resident buckets, plus a
//! sparse multi-resolution volume octree that stores its bricks in the pool.

pub mod core;
pub mod pool;
pub mod octree;

pub use crate::core::{AccessMode, Error, Result, VirtualAddress, NO_BRICK};
pub use crate::pool::{BrickMut, BrickPoolManager, BrickRef};
