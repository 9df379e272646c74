//! Octree dimensions derived from the volume and brick size

use glam::UVec3;
use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;

/// Maximum number of channels a node can describe
pub const MAX_CHANNELS: usize = 4;

/// Bytes per voxel per channel
pub const BYTES_PER_VOXEL: u64 = 2;

/// Size parameters shared by the builder, traversal and serialization.
///
/// Levels count from 0 (full resolution) up to `num_levels - 1` (the root,
/// whose single brick covers the whole octree).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OctreeGeometry {
    pub brick_dim: u32,
    pub volume_dim: UVec3,
    /// Cubic, power-of-two edge length covering the volume
    pub octree_dim: u32,
    pub num_levels: u32,
    pub num_channels: u32,
}

impl OctreeGeometry {
    pub fn new(brick_dim: u32, volume_dim: UVec3, num_channels: u32) -> Result<Self> {
        if num_channels == 0 || num_channels as usize > MAX_CHANNELS {
            return Err(Error::InvalidArgument(format!(
                "channel count must be between 1 and {}, got {}",
                MAX_CHANNELS, num_channels
            )));
        }
        if brick_dim < 2 || !brick_dim.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "brick dimension {} is not a power of two of at least 2",
                brick_dim
            )));
        }
        if volume_dim.min_element() <= 1 {
            return Err(Error::InvalidArgument(format!(
                "volume dimensions must be greater than one, got {}",
                volume_dim
            )));
        }

        let octree_dim = volume_dim.max_element().next_power_of_two();
        if brick_dim > octree_dim {
            return Err(Error::InvalidArgument(format!(
                "brick dimension {} exceeds octree dimension {}",
                brick_dim, octree_dim
            )));
        }
        let num_levels = (octree_dim / brick_dim).trailing_zeros() + 1;

        Ok(Self {
            brick_dim,
            volume_dim,
            octree_dim,
            num_levels,
            num_channels,
        })
    }

    pub fn channels(&self) -> usize {
        self.num_channels as usize
    }

    /// Voxels per brick
    pub fn brick_num_voxels(&self) -> usize {
        (self.brick_dim as usize).pow(3)
    }

    /// `u16` values per brick (voxels times channels)
    pub fn brick_num_values(&self) -> usize {
        self.brick_num_voxels() * self.channels()
    }

    /// Bytes per brick
    pub fn brick_memory_size(&self) -> u64 {
        self.brick_num_voxels() as u64 * BYTES_PER_VOXEL * self.num_channels as u64
    }

    /// Edge length, in full-resolution voxels, of a node at `level`
    pub fn node_extent(&self, level: u32) -> u32 {
        self.brick_dim << level
    }

    /// Volume dimensions at a mip level (partial voxels round up)
    pub fn level_volume_dim(&self, level: u32) -> UVec3 {
        let scale = 1u32 << level;
        (self.volume_dim + UVec3::splat(scale - 1)) / scale
    }

    pub fn root_level(&self) -> u32 {
        self.num_levels - 1
    }

    /// Index of a voxel inside a brick, in voxels (multiply by channels for values)
    pub fn brick_linear_index(&self, pos: UVec3) -> usize {
        let b = self.brick_dim as usize;
        pos.x as usize + pos.y as usize * b + pos.z as usize * b * b
    }

    /// Number of voxels of the region `[llf, llf + extent)` that lie inside the volume
    pub fn voxels_in_volume(&self, llf: UVec3, extent: u32) -> u64 {
        let urb = (llf + UVec3::splat(extent)).min(self.volume_dim);
        if urb.cmple(llf).any() {
            return 0;
        }
        let size = (urb - llf).as_u64vec3();
        size.x * size.y * size.z
    }
}

/// Child octant offset in ZYX order: index = x + 2y + 4z
pub fn child_offset(index: usize) -> UVec3 {
    UVec3::new((index & 1) as u32, ((index >> 1) & 1) as u32, ((index >> 2) & 1) as u32)
}
