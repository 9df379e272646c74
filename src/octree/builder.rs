//! Bottom-up octree construction into a brick pool
//!
//! Leaves are cut directly from the volume. Each parent brick is the
//! 2x half-sampled image of its eight children, read back from the pool. With
//! optimization enabled, homogeneous regions keep no brick and lose their
//! subtree, and regions fully outside the volume become empty nodes.

use glam::UVec3;

use crate::core::config::OctreeConfig;
use crate::core::error::Error;
use crate::core::types::{Result, VirtualAddress, NO_BRICK};
use crate::octree::geometry::{child_offset, OctreeGeometry, MAX_CHANNELS};
use crate::octree::node::{NodeArena, NodeId, OctreeNode};
use crate::octree::volume::VolumeRam;
use crate::pool::BrickPoolManager;

/// Running min/max/mean over voxel values
struct RegionStats {
    channels: usize,
    sum: [u64; MAX_CHANNELS],
    min: [u16; MAX_CHANNELS],
    max: [u16; MAX_CHANNELS],
    count: u64,
}

impl RegionStats {
    fn new(channels: usize) -> Self {
        Self {
            channels,
            sum: [0; MAX_CHANNELS],
            min: [u16::MAX; MAX_CHANNELS],
            max: [0; MAX_CHANNELS],
            count: 0,
        }
    }

    fn add_voxel(&mut self, values: &[u16]) {
        for (c, &v) in values.iter().enumerate() {
            self.sum[c] += v as u64;
            self.min[c] = self.min[c].min(v);
            self.max[c] = self.max[c].max(v);
        }
        self.count += 1;
    }

    /// Fold in a child node standing for `weight` in-volume voxels
    fn add_node(&mut self, node: &OctreeNode, weight: u64) {
        for c in 0..self.channels {
            self.sum[c] += node.avg[c] as u64 * weight;
            self.min[c] = self.min[c].min(node.min[c]);
            self.max[c] = self.max[c].max(node.max[c]);
        }
        self.count += weight;
    }

    fn finish(&self) -> ([u16; MAX_CHANNELS], [u16; MAX_CHANNELS], [u16; MAX_CHANNELS]) {
        if self.count == 0 {
            return ([0; MAX_CHANNELS], [0; MAX_CHANNELS], [0; MAX_CHANNELS]);
        }
        let mut avg = [0; MAX_CHANNELS];
        for c in 0..self.channels {
            avg[c] = ((self.sum[c] + self.count / 2) / self.count) as u16;
        }
        (avg, self.min, self.max)
    }
}

pub(crate) struct OctreeBuilder<'a> {
    volume: &'a VolumeRam,
    geometry: OctreeGeometry,
    pool: &'a dyn BrickPoolManager,
    arena: NodeArena,
    optimize: bool,
    threshold: u16,
}

impl<'a> OctreeBuilder<'a> {
    pub fn new(
        volume: &'a VolumeRam,
        geometry: OctreeGeometry,
        config: &OctreeConfig,
        pool: &'a dyn BrickPoolManager,
    ) -> Result<Self> {
        if pool.brick_memory_size() != geometry.brick_memory_size() {
            return Err(Error::Config(format!(
                "pool brick size {} does not match octree brick size {}",
                pool.brick_memory_size(),
                geometry.brick_memory_size()
            )));
        }
        Ok(Self {
            volume,
            geometry,
            pool,
            arena: NodeArena::new(geometry.channels())?,
            optimize: config.optimize(),
            threshold: config.threshold_u16(),
        })
    }

    pub fn build(mut self) -> Result<(NodeArena, NodeId)> {
        let root = self.build_region(UVec3::ZERO, self.geometry.root_level())?;
        log::debug!("Built octree with {} nodes", self.arena.len());
        Ok((self.arena, root))
    }

    fn build_region(&mut self, llf: UVec3, level: u32) -> Result<NodeId> {
        let extent = self.geometry.node_extent(level);
        if self.optimize && self.geometry.voxels_in_volume(llf, extent) == 0 {
            return Ok(self.arena.create_empty_node());
        }
        if level == 0 {
            return self.build_leaf(llf);
        }

        let mark = self.arena.len();
        let half = extent / 2;
        let mut children = [NodeId(0); 8];
        for (i, child) in children.iter_mut().enumerate() {
            *child = self.build_region(llf + child_offset(i) * half, level - 1)?;
        }
        self.build_parent(llf, level, children, mark)
    }

    fn build_leaf(&mut self, llf: UVec3) -> Result<NodeId> {
        let geometry = self.geometry;
        let channels = geometry.channels();
        let b = geometry.brick_dim;

        let mut brick = vec![0u16; geometry.brick_num_values()];
        let mut stats = RegionStats::new(channels);
        for z in 0..b {
            for y in 0..b {
                for x in 0..b {
                    let local = UVec3::new(x, y, z);
                    let pos = llf + local;
                    if !self.volume.contains(pos) {
                        continue;
                    }
                    let start = geometry.brick_linear_index(local) * channels;
                    let values = &mut brick[start..start + channels];
                    for (c, value) in values.iter_mut().enumerate() {
                        *value = self.volume.voxel(pos, c);
                    }
                    stats.add_voxel(values);
                }
            }
        }

        let in_volume = stats.count > 0;
        let (avg, min, max) = stats.finish();
        let address = if self.optimize && self.is_homogeneous(&min, &max) {
            NO_BRICK
        } else {
            self.store_brick(&brick)?
        };
        self.arena
            .create_node(&avg[..channels], &min[..channels], &max[..channels], address, in_volume, None)
    }

    fn build_parent(&mut self, llf: UVec3, level: u32, children: [NodeId; 8], mark: usize) -> Result<NodeId> {
        let channels = self.geometry.channels();
        let half = self.geometry.node_extent(level) / 2;

        let mut stats = RegionStats::new(channels);
        for (i, &child) in children.iter().enumerate() {
            let node = self.arena.get(child);
            if node.in_volume {
                let weight = self.geometry.voxels_in_volume(llf + child_offset(i) * half, half);
                stats.add_node(node, weight);
            }
        }
        let in_volume = stats.count > 0;
        let (avg, min, max) = stats.finish();

        if self.optimize && self.is_homogeneous(&min, &max) {
            // The whole subtree collapses into this node
            self.release_bricks_from(mark)?;
            self.arena.truncate(mark);
            return self.arena.create_node(
                &avg[..channels],
                &min[..channels],
                &max[..channels],
                NO_BRICK,
                in_volume,
                None,
            );
        }

        let brick = self.half_sample(&children)?;
        let address = self.store_brick(&brick)?;
        self.arena.create_node(
            &avg[..channels],
            &min[..channels],
            &max[..channels],
            address,
            in_volume,
            Some(children),
        )
    }

    fn is_homogeneous(&self, min: &[u16; MAX_CHANNELS], max: &[u16; MAX_CHANNELS]) -> bool {
        (0..self.geometry.channels()).all(|c| max[c] - min[c] <= self.threshold)
    }

    /// Parent brick: each voxel is the mean of a 2x2x2 block of one child brick.
    /// Children without a brick contribute their average value.
    fn half_sample(&self, children: &[NodeId; 8]) -> Result<Vec<u16>> {
        let geometry = self.geometry;
        let channels = geometry.channels();
        let half = geometry.brick_dim / 2;
        let mut out = vec![0u16; geometry.brick_num_values()];

        for (i, &child) in children.iter().enumerate() {
            let node = self.arena.get(child);
            let octant = child_offset(i) * half;
            let source = self.pool.get_brick(node.brick_address)?;

            for z in 0..half {
                for y in 0..half {
                    for x in 0..half {
                        let local = UVec3::new(x, y, z);
                        let dst = geometry.brick_linear_index(octant + local) * channels;
                        for c in 0..channels {
                            out[dst + c] = match &source {
                                Some(brick) => {
                                    let voxels = brick.voxels();
                                    let sum: u32 = (0..8)
                                        .map(|k| {
                                            let src = geometry.brick_linear_index(local * 2 + child_offset(k));
                                            voxels[src * channels + c] as u32
                                        })
                                        .sum();
                                    ((sum + 4) / 8) as u16
                                }
                                None => node.avg[c],
                            };
                        }
                    }
                }
            }
        }
        Ok(out)
    }

    fn store_brick(&self, values: &[u16]) -> Result<VirtualAddress> {
        let address = self.pool.allocate_brick()?;
        let mut brick = self
            .pool
            .get_writable_brick(address)?
            .ok_or(Error::InvalidAddress(address))?;
        brick.voxels_mut().copy_from_slice(values);
        brick.release()?;
        Ok(address)
    }

    fn release_bricks_from(&self, mark: usize) -> Result<()> {
        for node in &self.arena.nodes()[mark..] {
            if node.has_brick() {
                self.pool.delete_brick(node.brick_address)?;
            }
        }
        Ok(())
    }
}
