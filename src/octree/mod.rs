//! Sparse volume octree stored in a brick pool
//!
//! Every node carries per-channel avg/min/max statistics and, unless its
//! region is homogeneous, a brick of `brick_dim³` voxels in the pool. Parent
//! bricks are half-sampled from their children, so each level is a mip level
//! of the volume.

pub mod geometry;
pub mod node;
pub mod volume;
mod builder;
pub mod tree;
pub mod serialize;

pub use geometry::{child_offset, OctreeGeometry, MAX_CHANNELS};
pub use node::{NodeArena, NodeId, OctreeNode};
pub use serialize::OctreeManifest;
pub use tree::{NodeLookup, SliceAlignment, VolumeOctree};
pub use volume::VolumeRam;
