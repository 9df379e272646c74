//! Core type aliases shared by the pool and the octree

pub use glam::{UVec3, Vec3};

/// Standard Result type for the crate
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;

/// Byte offset into the (unbounded) virtual brick address space
pub type VirtualAddress = u64;

/// Sentinel address meaning "this node has no brick"
pub const NO_BRICK: VirtualAddress = u64::MAX;

/// How a brick was checked out, passed back on release
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}
