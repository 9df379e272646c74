//! Volume octree: node arena plus the brick pool holding its bricks

use std::time::{Duration, Instant};

use glam::{UVec3, Vec3};
use serde::{Deserialize, Serialize};

use crate::core::config::OctreeConfig;
use crate::core::error::Error;
use crate::core::types::Result;
use crate::octree::builder::OctreeBuilder;
use crate::octree::geometry::{child_offset, OctreeGeometry};
use crate::octree::node::{NodeArena, NodeId, OctreeNode};
use crate::octree::volume::VolumeRam;
use crate::pool::{BrickPoolManager, BrickRef, PoolState};

/// Orientation of a slice extracted with [`VolumeOctree::create_slice`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SliceAlignment {
    /// Constant z
    XyPlane,
    /// Constant y
    XzPlane,
    /// Constant x
    YzPlane,
}

/// Result of [`VolumeOctree::get_node`]
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NodeLookup {
    pub node: NodeId,
    /// Level the descent stopped at (may be above the requested one at a leaf)
    pub level: u32,
    /// Node bounds in full-resolution voxels, URB exclusive
    pub voxel_llf: UVec3,
    pub voxel_urb: UVec3,
    /// Node bounds relative to the volume dimensions
    pub normalized_llf: Vec3,
    pub normalized_urb: Vec3,
}

/// Sparse multi-resolution octree over a brick pool
pub struct VolumeOctree {
    geometry: OctreeGeometry,
    arena: NodeArena,
    root: NodeId,
    pool: Box<dyn BrickPoolManager>,
}

impl VolumeOctree {
    /// Build an octree from a dense volume.
    ///
    /// An uninitialized pool is initialized with the octree's brick size; an
    /// initialized pool must already use that brick size.
    pub fn build(volume: &VolumeRam, config: &OctreeConfig, mut pool: Box<dyn BrickPoolManager>) -> Result<Self> {
        let geometry = OctreeGeometry::new(config.brick_dim, volume.dim(), volume.num_channels() as u32)?;
        if pool.state() != PoolState::Initialized {
            pool.initialize(geometry.brick_memory_size())?;
        }

        let start = Instant::now();
        let (arena, root) = OctreeBuilder::new(volume, geometry, config, pool.as_ref())?.build()?;
        let octree = Self { geometry, arena, root, pool };
        log::info!(
            "Built octree for {} volume in {:.2?}: {} nodes, {} bricks",
            volume.dim(),
            start.elapsed(),
            octree.num_nodes(),
            octree.num_bricks()
        );
        Ok(octree)
    }

    pub(crate) fn from_parts(
        geometry: OctreeGeometry,
        arena: NodeArena,
        root: NodeId,
        pool: Box<dyn BrickPoolManager>,
    ) -> Self {
        Self { geometry, arena, root, pool }
    }

    pub fn geometry(&self) -> &OctreeGeometry {
        &self.geometry
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &OctreeNode {
        self.arena.get(id)
    }

    pub(crate) fn arena(&self) -> &NodeArena {
        &self.arena
    }

    pub fn pool(&self) -> &dyn BrickPoolManager {
        self.pool.as_ref()
    }

    pub fn pool_mut(&mut self) -> &mut dyn BrickPoolManager {
        self.pool.as_mut()
    }

    /// Give the pool back, dropping the nodes
    pub fn into_pool(self) -> Box<dyn BrickPoolManager> {
        self.pool
    }

    // --- Statistics ---

    /// Nodes reachable from the root
    pub fn num_nodes(&self) -> usize {
        self.fold(0, |n, _, _| n + 1)
    }

    /// Nodes holding a brick
    pub fn num_bricks(&self) -> usize {
        self.fold(0, |n, node, _| n + node.has_brick() as usize)
    }

    /// Number of levels actually present below and including the root
    pub fn actual_depth(&self) -> u32 {
        self.fold(0, |d, _, depth| d.max(depth + 1))
    }

    pub fn memory_allocated(&self) -> u64 {
        self.pool.memory_allocated()
    }

    pub fn memory_used(&self) -> u64 {
        self.pool.memory_used()
    }

    /// Depth-first fold over reachable nodes, with node depth (root = 0)
    fn fold<T>(&self, init: T, mut f: impl FnMut(T, &OctreeNode, u32) -> T) -> T {
        let mut acc = init;
        let mut stack = vec![(self.root, 0u32)];
        while let Some((id, depth)) = stack.pop() {
            let node = self.arena.get(id);
            acc = f(acc, node, depth);
            if let Some(children) = node.children {
                stack.extend(children.iter().map(|&c| (c, depth + 1)));
            }
        }
        acc
    }

    pub fn description(&self) -> String {
        let g = &self.geometry;
        format!(
            "Volume octree\n  volume: {}, {} channel(s)\n  octree dim: {}, brick dim: {}, levels: {} (depth {})\n  nodes: {}, bricks: {}\n  pool: {}",
            g.volume_dim,
            g.num_channels,
            g.octree_dim,
            g.brick_dim,
            g.num_levels,
            self.actual_depth(),
            self.num_nodes(),
            self.num_bricks(),
            self.pool.description()
        )
    }

    // --- Traversal ---

    fn check_level(&self, level: u32) -> Result<()> {
        if level >= self.geometry.num_levels {
            return Err(Error::InvalidArgument(format!(
                "level {} out of range, octree has {} levels",
                level, self.geometry.num_levels
            )));
        }
        Ok(())
    }

    /// Descend towards `voxel` until `level` or a leaf. Returns node, level and LLF.
    fn descend(&self, voxel: UVec3, level: u32) -> (NodeId, u32, UVec3) {
        let mut id = self.root;
        let mut current = self.geometry.root_level();
        let mut llf = UVec3::ZERO;
        while current > level {
            let Some(children) = self.arena.get(id).children else {
                break;
            };
            let half = self.geometry.node_extent(current) / 2;
            let octant = (voxel - llf) / half;
            let index = (octant.x + 2 * octant.y + 4 * octant.z) as usize;
            llf += child_offset(index) * half;
            id = children[index];
            current -= 1;
        }
        (id, current, llf)
    }

    /// Node containing `point` (normalized volume coordinates) at `level`,
    /// or the leaf above it.
    pub fn get_node(&self, point: Vec3, level: u32) -> Result<NodeLookup> {
        self.check_level(level)?;
        if !point.is_finite() || point.cmplt(Vec3::ZERO).any() || point.cmpgt(Vec3::ONE).any() {
            return Err(Error::InvalidArgument(format!("point {} outside [0, 1]", point)));
        }

        let dim = self.geometry.volume_dim;
        let max_voxel = dim - UVec3::ONE;
        let voxel = (point * dim.as_vec3()).floor().as_uvec3().min(max_voxel);

        let (node, node_level, llf) = self.descend(voxel, level);
        let urb = llf + UVec3::splat(self.geometry.node_extent(node_level));
        Ok(NodeLookup {
            node,
            level: node_level,
            voxel_llf: llf,
            voxel_urb: urb,
            normalized_llf: llf.as_vec3() / dim.as_vec3(),
            normalized_urb: urb.as_vec3() / dim.as_vec3(),
        })
    }

    /// Brick of a node, `None` for homogeneous nodes
    pub fn node_brick(&self, id: NodeId) -> Result<Option<BrickRef<'_>>> {
        self.pool.get_brick(self.arena.get(id).brick_address)
    }

    /// Value of one voxel (full-resolution coordinates) as seen at `level`
    pub fn get_voxel(&self, pos: UVec3, channel: usize, level: u32) -> Result<u16> {
        self.check_level(level)?;
        if pos.cmpge(self.geometry.volume_dim).any() || channel >= self.geometry.channels() {
            return Err(Error::InvalidArgument(format!("voxel {} channel {} out of range", pos, channel)));
        }

        let (id, node_level, llf) = self.descend(pos, level);
        let node = self.arena.get(id);
        match self.pool.get_brick(node.brick_address)? {
            Some(brick) => {
                let extent = self.geometry.node_extent(node_level);
                let local = (pos - llf) * self.geometry.brick_dim / extent;
                let index = self.geometry.brick_linear_index(local) * self.geometry.channels() + channel;
                Ok(brick.voxels()[index])
            }
            None => Ok(node.avg[channel]),
        }
    }

    // --- Volume extraction ---

    /// Reconstruct the whole volume at a mip level
    pub fn create_volume(&self, level: u32) -> Result<VolumeRam> {
        let (volume, _) = self.create_volume_with_limit(level, None)?;
        Ok(volume)
    }

    /// Reconstruct the volume, giving up on disk loads once `time_limit` expires.
    ///
    /// After the deadline, bricks that are not resident are replaced by their
    /// node's average. The flag reports whether every brick was used.
    pub fn create_volume_with_limit(&self, level: u32, time_limit: Option<Duration>) -> Result<(VolumeRam, bool)> {
        self.check_level(level)?;
        let dim = self.geometry.level_volume_dim(level);
        self.compose(UVec3::ZERO, dim, level, time_limit.map(|t| Instant::now() + t))
    }

    /// One slice of the volume at a mip level.
    ///
    /// `index` is in level coordinates along the slice normal. The result is
    /// a volume with extent 1 along that axis.
    pub fn create_slice(&self, alignment: SliceAlignment, index: u32, level: u32) -> Result<VolumeRam> {
        self.check_level(level)?;
        let dim = self.geometry.level_volume_dim(level);
        let (llf, size) = match alignment {
            SliceAlignment::XyPlane => (UVec3::new(0, 0, index), UVec3::new(dim.x, dim.y, 1)),
            SliceAlignment::XzPlane => (UVec3::new(0, index, 0), UVec3::new(dim.x, 1, dim.z)),
            SliceAlignment::YzPlane => (UVec3::new(index, 0, 0), UVec3::new(1, dim.y, dim.z)),
        };
        if (llf + size).cmpgt(dim).any() {
            return Err(Error::InvalidArgument(format!(
                "slice {} of {:?} outside volume {} at level {}",
                index, alignment, dim, level
            )));
        }
        let (slice, _) = self.compose(llf, size, level, None)?;
        Ok(slice)
    }

    /// Fill the window `[window_llf, window_llf + window_dim)` (level coordinates).
    fn compose(
        &self,
        window_llf: UVec3,
        window_dim: UVec3,
        level: u32,
        deadline: Option<Instant>,
    ) -> Result<(VolumeRam, bool)> {
        let channels = self.geometry.channels();
        let mut out = VolumeRam::zeroed(window_dim, channels)?;
        let window_urb = window_llf + window_dim;
        let mut complete = true;

        let mut stack = vec![(self.root, self.geometry.root_level(), UVec3::ZERO)];
        while let Some((id, node_level, llf)) = stack.pop() {
            let node = self.arena.get(id);
            let extent = self.geometry.node_extent(node_level);

            // Node bounds in level coordinates
            let node_llf = llf >> level;
            let node_dim = extent >> level;
            let lo = node_llf.max(window_llf);
            let hi = (node_llf + UVec3::splat(node_dim)).min(window_urb);
            if hi.cmple(lo).any() || !node.in_volume {
                continue;
            }

            if node_level > level {
                if let Some(children) = node.children {
                    let half = extent / 2;
                    for (i, &child) in children.iter().enumerate() {
                        stack.push((child, node_level - 1, llf + child_offset(i) * half));
                    }
                    continue;
                }
            }

            let skip_brick = node.has_brick()
                && deadline.is_some_and(|d| Instant::now() >= d)
                && !self.pool.is_brick_in_ram(node.brick_address);
            let brick = if skip_brick {
                complete = false;
                None
            } else {
                self.pool.get_brick(node.brick_address)?
            };

            let b = self.geometry.brick_dim;
            for z in lo.z..hi.z {
                for y in lo.y..hi.y {
                    for x in lo.x..hi.x {
                        let p = UVec3::new(x, y, z);
                        let target = p - window_llf;
                        match &brick {
                            Some(brick) => {
                                let local = (p - node_llf) * b / node_dim;
                                let start = self.geometry.brick_linear_index(local) * channels;
                                let voxels = &brick.voxels()[start..start + channels];
                                for (c, &v) in voxels.iter().enumerate() {
                                    out.set_voxel(target, c, v);
                                }
                            }
                            None => {
                                for c in 0..channels {
                                    out.set_voxel(target, c, node.avg[c]);
                                }
                            }
                        }
                    }
                }
            }
        }

        if !complete {
            log::debug!("Volume at level {} composed from partial brick data", level);
        }
        Ok((out, complete))
    }
}

impl std::fmt::Debug for VolumeOctree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeOctree")
            .field("geometry", &self.geometry)
            .field("nodes", &self.arena.len())
            .field("pool", &self.pool.description())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PoolConfig;
    use crate::pool::{DiskCachedPool, RamPool};

    fn gradient(dim: UVec3, channels: usize) -> VolumeRam {
        VolumeRam::from_fn(dim, channels, |p, c| (p.x * 7 + p.y * 131 + p.z * 1031) as u16 + c as u16 * 5000)
            .unwrap()
    }

    fn config(brick_dim: u32, threshold: f32) -> OctreeConfig {
        OctreeConfig { brick_dim, homogeneity_threshold: threshold }
    }

    fn ram_octree(volume: &VolumeRam, config: &OctreeConfig) -> VolumeOctree {
        VolumeOctree::build(volume, config, Box::new(RamPool::new(1 << 20))).unwrap()
    }

    #[test]
    fn test_full_resolution_matches_source() {
        let volume = gradient(UVec3::new(20, 13, 9), 2);
        let octree = ram_octree(&volume, &config(4, 0.0));
        assert_eq!(octree.geometry().num_levels, 4);

        let level0 = octree.create_volume(0).unwrap();
        assert_eq!(level0, volume);

        for pos in [UVec3::ZERO, UVec3::new(19, 12, 8), UVec3::new(5, 7, 3)] {
            for c in 0..2 {
                assert_eq!(octree.get_voxel(pos, c, 0).unwrap(), volume.voxel(pos, c));
            }
        }
    }

    #[test]
    fn test_homogeneous_volume_prunes_to_root() {
        let volume = VolumeRam::from_fn(UVec3::splat(16), 1, |_, _| 777).unwrap();
        let octree = ram_octree(&volume, &config(4, 0.0));

        assert_eq!(octree.num_nodes(), 1);
        assert_eq!(octree.num_bricks(), 0);
        let root = octree.node(octree.root());
        assert_eq!((root.avg[0], root.min[0], root.max[0]), (777, 777, 777));
        assert!(octree.node_brick(octree.root()).unwrap().is_none());

        // Everything is reconstructed from the average
        assert_eq!(octree.create_volume(0).unwrap(), volume);
        assert_eq!(octree.get_voxel(UVec3::new(3, 9, 15), 0, 0).unwrap(), 777);
    }

    #[test]
    fn test_partial_homogeneity() {
        // Only the low-x half varies
        let volume = VolumeRam::from_fn(UVec3::splat(8), 1, |p, _| if p.x < 4 { (p.y * 10) as u16 } else { 50 }).unwrap();
        let octree = ram_octree(&volume, &config(4, 0.0));

        let root = octree.node(octree.root());
        let children = root.children.unwrap();
        assert!(octree.node(children[0]).has_brick());
        assert!(!octree.node(children[1]).has_brick());
        assert_eq!(octree.node(children[1]).avg[0], 50);
        assert_eq!(octree.create_volume(0).unwrap(), volume);
    }

    #[test]
    fn test_threshold_and_disabled_optimization() {
        let volume = VolumeRam::from_fn(UVec3::splat(8), 1, |p, _| 1000 + (p.x % 2) as u16).unwrap();

        // A difference of 1 is below 0.01 * 65535
        let loose = ram_octree(&volume, &config(4, 0.01));
        assert_eq!(loose.num_bricks(), 0);

        // Negative threshold keeps every brick
        let full = ram_octree(&volume, &config(4, -1.0));
        assert_eq!(full.num_nodes(), 9);
        assert_eq!(full.num_bricks(), 9);
        assert_eq!(full.actual_depth(), 2);
    }

    #[test]
    fn test_get_node_descends() {
        let volume = gradient(UVec3::splat(16), 1);
        let octree = ram_octree(&volume, &config(4, 0.0));
        assert_eq!(octree.geometry().num_levels, 3);

        let root = octree.get_node(Vec3::splat(0.5), 2).unwrap();
        assert_eq!(root.node, octree.root());
        assert_eq!(root.voxel_urb, UVec3::splat(16));

        let leaf = octree.get_node(Vec3::new(0.9, 0.1, 0.6), 0).unwrap();
        assert_eq!(leaf.level, 0);
        assert_eq!(leaf.voxel_llf, UVec3::new(12, 0, 8));
        assert_eq!(leaf.voxel_urb, UVec3::new(16, 4, 12));
        assert_eq!(leaf.normalized_llf, Vec3::new(0.75, 0.0, 0.5));

        // Point 1.0 clamps into the last voxel
        let corner = octree.get_node(Vec3::ONE, 0).unwrap();
        assert_eq!(corner.voxel_llf, UVec3::splat(12));

        assert!(octree.get_node(Vec3::splat(0.5), 3).is_err());
        assert!(octree.get_node(Vec3::new(1.5, 0.0, 0.0), 0).is_err());
    }

    #[test]
    fn test_coarser_levels() {
        let volume = VolumeRam::from_fn(UVec3::splat(8), 1, |p, _| if p.z < 4 { 0 } else { 8000 }).unwrap();
        let octree = ram_octree(&volume, &config(2, -1.0));
        assert_eq!(octree.geometry().num_levels, 3);

        let level1 = octree.create_volume(1).unwrap();
        assert_eq!(level1.dim(), UVec3::splat(4));
        assert_eq!(level1.voxel(UVec3::new(1, 2, 1), 0), 0);
        assert_eq!(level1.voxel(UVec3::new(1, 2, 2), 0), 8000);

        let level2 = octree.create_volume(2).unwrap();
        assert_eq!(level2.dim(), UVec3::splat(2));
        assert_eq!(octree.get_voxel(UVec3::new(7, 7, 7), 0, 2).unwrap(), 8000);
    }

    #[test]
    fn test_create_slice() {
        let volume = gradient(UVec3::new(12, 10, 6), 1);
        let octree = ram_octree(&volume, &config(4, 0.0));

        let xy = octree.create_slice(SliceAlignment::XyPlane, 3, 0).unwrap();
        assert_eq!(xy.dim(), UVec3::new(12, 10, 1));
        assert_eq!(xy.voxel(UVec3::new(5, 4, 0), 0), volume.voxel(UVec3::new(5, 4, 3), 0));

        let yz = octree.create_slice(SliceAlignment::YzPlane, 11, 0).unwrap();
        assert_eq!(yz.dim(), UVec3::new(1, 10, 6));
        assert_eq!(yz.voxel(UVec3::new(0, 9, 5), 0), volume.voxel(UVec3::new(11, 9, 5), 0));

        let xz = octree.create_slice(SliceAlignment::XzPlane, 0, 0).unwrap();
        assert_eq!(xz.voxel(UVec3::new(7, 0, 2), 0), volume.voxel(UVec3::new(7, 0, 2), 0));

        assert!(octree.create_slice(SliceAlignment::XyPlane, 6, 0).is_err());
    }

    #[test]
    fn test_octree_on_small_cached_pool() {
        let dir = tempfile::tempdir().unwrap();
        let volume = gradient(UVec3::splat(16), 1);
        // 4^3 u16 bricks are 128 bytes; two bricks per buffer, two buffers of RAM
        let pool_config = PoolConfig {
            max_bucket_size_bytes: 256,
            max_ram_bytes: 512,
            ..PoolConfig::at(dir.path().join("pool"))
        };
        let octree = VolumeOctree::build(&volume, &config(4, 0.0), Box::new(DiskCachedPool::new(pool_config))).unwrap();

        assert!(octree.pool().stats().evictions > 0);
        assert_eq!(octree.create_volume(0).unwrap(), volume);
    }

    #[test]
    fn test_time_limit_skips_cold_bricks() {
        let dir = tempfile::tempdir().unwrap();
        let volume = gradient(UVec3::splat(16), 1);
        let pool_config = PoolConfig {
            max_bucket_size_bytes: 256,
            max_ram_bytes: 512,
            ..PoolConfig::at(dir.path().join("pool"))
        };
        let octree = VolumeOctree::build(&volume, &config(4, 0.0), Box::new(DiskCachedPool::new(pool_config))).unwrap();

        // Deadline already passed: only resident bricks are used
        let (partial, complete) = octree.create_volume_with_limit(0, Some(Duration::ZERO)).unwrap();
        assert!(!complete);
        assert_eq!(partial.dim(), volume.dim());

        let (full, complete) = octree.create_volume_with_limit(0, Some(Duration::from_secs(3600))).unwrap();
        assert!(complete);
        assert_eq!(full, volume);
    }
}
