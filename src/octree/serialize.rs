//! Octree persistence: flat node buffer plus a JSON manifest
//!
//! `nodebuffer.raw` holds one fixed-size record per node, native endian:
//!
//! ```text
//! brick address   u64
//! in volume       u8
//! avg, min, max   u16 x channels each
//! first child     u64 (u64::MAX for leaves)
//! ```
//!
//! The root is record 0. The eight children of a node are adjacent and always
//! come after their parent.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, IoContext};
use crate::core::types::Result;
use crate::octree::geometry::{OctreeGeometry, MAX_CHANNELS};
use crate::octree::node::{NodeArena, NodeId, OctreeNode};
use crate::octree::tree::VolumeOctree;
use crate::pool::{PoolKind, PoolMetadata};

pub const NODE_BUFFER_FILE: &str = "nodebuffer.raw";
pub const MANIFEST_FILE: &str = "octree.json";

const NO_CHILDREN: u64 = u64::MAX;

/// Bytes per serialized node
pub fn node_record_size(num_channels: usize) -> usize {
    8 + 1 + num_channels * 6 + 8
}

/// Contents of `octree.json`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OctreeManifest {
    pub geometry: OctreeGeometry,
    pub node_count: u64,
    pub node_buffer_size: u64,
    pub brick_pool: PoolMetadata,
}

/// Serialize the nodes reachable from the root.
pub fn encode_nodes(octree: &VolumeOctree) -> Vec<u8> {
    let arena = octree.arena();
    let channels = arena.num_channels();

    // Assign record slots: children get eight fresh slots when their parent is visited
    let mut order = vec![octree.root()];
    let mut first_child = vec![NO_CHILDREN];
    let mut stack = vec![0usize];
    while let Some(slot) = stack.pop() {
        if let Some(children) = arena.get(order[slot]).children {
            let base = order.len();
            first_child[slot] = base as u64;
            order.extend(children);
            first_child.resize(order.len(), NO_CHILDREN);
            stack.extend((base..base + 8).rev());
        }
    }

    let mut bytes = Vec::with_capacity(order.len() * node_record_size(channels));
    for (id, child) in order.iter().zip(&first_child) {
        let node = arena.get(*id);
        bytes.extend_from_slice(&node.brick_address.to_ne_bytes());
        bytes.push(node.in_volume as u8);
        for values in [&node.avg, &node.min, &node.max] {
            for v in &values[..channels] {
                bytes.extend_from_slice(&v.to_ne_bytes());
            }
        }
        bytes.extend_from_slice(&child.to_ne_bytes());
    }
    bytes
}

/// Parse a node buffer. The root is returned as `NodeId(0)`.
pub fn decode_nodes(bytes: &[u8], num_channels: usize) -> Result<NodeArena> {
    if num_channels == 0 || num_channels > MAX_CHANNELS {
        return Err(Error::InvalidArgument(format!("unsupported channel count {}", num_channels)));
    }
    let record = node_record_size(num_channels);
    if bytes.is_empty() || bytes.len() % record != 0 {
        return Err(Error::Octree(format!(
            "node buffer of {} bytes is not a multiple of the {} byte record",
            bytes.len(),
            record
        )));
    }
    let count = bytes.len() / record;

    let mut nodes = Vec::with_capacity(count);
    for (index, chunk) in bytes.chunks_exact(record).enumerate() {
        let mut reader = Reader { bytes: chunk, pos: 0 };
        let brick_address = reader.u64();
        let in_volume = match reader.u8() {
            0 => false,
            1 => true,
            flag => return Err(Error::Octree(format!("node {} has in-volume flag {}", index, flag))),
        };
        let mut node = OctreeNode {
            avg: [0; MAX_CHANNELS],
            min: [0; MAX_CHANNELS],
            max: [0; MAX_CHANNELS],
            brick_address,
            in_volume,
            children: None,
        };
        for values in [&mut node.avg, &mut node.min, &mut node.max] {
            for v in &mut values[..num_channels] {
                *v = reader.u16();
            }
        }

        let first_child = reader.u64();
        if first_child != NO_CHILDREN {
            if first_child <= index as u64 || first_child.saturating_add(8) > count as u64 {
                return Err(Error::Octree(format!(
                    "node {} has invalid child offset {} ({} nodes)",
                    index, first_child, count
                )));
            }
            let base = first_child as u32;
            node.children = Some(std::array::from_fn(|k| NodeId(base + k as u32)));
        }
        nodes.push(node);
    }

    check_reachability(&nodes)?;
    NodeArena::from_nodes(nodes, num_channels)
}

/// Every node must be reachable from the root exactly once
fn check_reachability(nodes: &[OctreeNode]) -> Result<()> {
    let mut seen = vec![false; nodes.len()];
    seen[0] = true;
    let mut stack = vec![0usize];
    while let Some(index) = stack.pop() {
        if let Some(children) = nodes[index].children {
            for child in children {
                let i = child.index();
                if seen[i] {
                    return Err(Error::Octree(format!("node {} is referenced more than once", i)));
                }
                seen[i] = true;
                stack.push(i);
            }
        }
    }
    if let Some(orphan) = seen.iter().position(|s| !s) {
        return Err(Error::Octree(format!("node {} is not reachable from the root", orphan)));
    }
    Ok(())
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        out.copy_from_slice(&self.bytes[self.pos..self.pos + N]);
        self.pos += N;
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_ne_bytes(self.take())
    }

    fn u64(&mut self) -> u64 {
        u64::from_ne_bytes(self.take())
    }
}

impl VolumeOctree {
    /// Flush the pool and write the node buffer and manifest into `dir`.
    ///
    /// The bricks stay where the pool keeps them; only their metadata is
    /// recorded, so the pool must be disk backed.
    pub fn save(&mut self, dir: &Path) -> Result<OctreeManifest> {
        self.pool_mut().flush()?;
        let brick_pool = self.pool().metadata();
        if brick_pool.kind == PoolKind::Ram {
            return Err(Error::Config("an octree in a RAM brick pool cannot be saved".into()));
        }

        std::fs::create_dir_all(dir).with_path(dir)?;
        let bytes = encode_nodes(self);
        let record = node_record_size(self.geometry().channels());
        let manifest = OctreeManifest {
            geometry: *self.geometry(),
            node_count: (bytes.len() / record) as u64,
            node_buffer_size: bytes.len() as u64,
            brick_pool,
        };

        let buffer_path = dir.join(NODE_BUFFER_FILE);
        std::fs::write(&buffer_path, &bytes).with_path(&buffer_path)?;
        let manifest_path = dir.join(MANIFEST_FILE);
        std::fs::write(&manifest_path, serde_json::to_string_pretty(&manifest)?).with_path(&manifest_path)?;

        log::info!("Saved octree with {} nodes to {}", manifest.node_count, dir.display());
        Ok(manifest)
    }

    /// Reopen an octree written by [`VolumeOctree::save`].
    ///
    /// `max_ram` overrides the cache size recorded for a cached pool.
    pub fn open(dir: &Path, max_ram: Option<u64>) -> Result<Self> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&manifest_path).with_path(&manifest_path)?;
        let manifest: OctreeManifest = serde_json::from_str(&text)?;

        let g = manifest.geometry;
        let geometry = OctreeGeometry::new(g.brick_dim, g.volume_dim, g.num_channels)?;
        if geometry != g {
            return Err(Error::Octree(format!("inconsistent geometry in {}", manifest_path.display())));
        }
        if manifest.brick_pool.brick_memory_size_bytes != geometry.brick_memory_size() {
            return Err(Error::Octree(format!(
                "brick pool brick size {} does not match octree brick size {}",
                manifest.brick_pool.brick_memory_size_bytes,
                geometry.brick_memory_size()
            )));
        }

        let buffer_path = dir.join(NODE_BUFFER_FILE);
        let bytes = std::fs::read(&buffer_path).with_path(&buffer_path)?;
        if bytes.len() as u64 != manifest.node_buffer_size {
            return Err(Error::Octree(format!(
                "node buffer is {} bytes, manifest says {}",
                bytes.len(),
                manifest.node_buffer_size
            )));
        }
        let arena = decode_nodes(&bytes, geometry.channels())?;
        if arena.len() as u64 != manifest.node_count {
            return Err(Error::Octree(format!(
                "node buffer holds {} nodes, manifest says {}",
                arena.len(),
                manifest.node_count
            )));
        }
        let brick_size = geometry.brick_memory_size();
        if let Some(bad) = arena.nodes().iter().find(|n| n.has_brick() && n.brick_address % brick_size != 0) {
            return Err(Error::InvalidAddress(bad.brick_address));
        }

        let pool = manifest.brick_pool.restore(max_ram)?;
        log::info!("Opened octree with {} nodes from {}", arena.len(), dir.display());
        Ok(VolumeOctree::from_parts(geometry, arena, NodeId(0), pool))
    }
}
