//! Octree nodes and the arena that owns them

use crate::core::error::Error;
use crate::core::types::{Result, VirtualAddress, NO_BRICK};
use crate::octree::geometry::MAX_CHANNELS;

/// Index of a node in its [`NodeArena`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Cubic region of the volume at one resolution level.
///
/// Either all eight children exist or none do. A node without a brick is
/// homogeneous and is represented by its average values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OctreeNode {
    pub avg: [u16; MAX_CHANNELS],
    pub min: [u16; MAX_CHANNELS],
    pub max: [u16; MAX_CHANNELS],
    pub brick_address: VirtualAddress,
    /// False if the region lies entirely outside the volume
    pub in_volume: bool,
    /// Children in ZYX order
    pub children: Option<[NodeId; 8]>,
}

impl OctreeNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    pub fn has_brick(&self) -> bool {
        self.brick_address != NO_BRICK
    }
}

/// Flat storage for all nodes of one tree
#[derive(Clone, Debug)]
pub struct NodeArena {
    nodes: Vec<OctreeNode>,
    num_channels: usize,
}

impl NodeArena {
    pub fn new(num_channels: usize) -> Result<Self> {
        check_channels(num_channels)?;
        Ok(Self {
            nodes: Vec::new(),
            num_channels,
        })
    }

    /// Adopt deserialized nodes, validating values and child links.
    pub fn from_nodes(nodes: Vec<OctreeNode>, num_channels: usize) -> Result<Self> {
        check_channels(num_channels)?;
        for (index, node) in nodes.iter().enumerate() {
            let n = num_channels;
            check_values(&node.avg[..n], &node.min[..n], &node.max[..n], num_channels)
                .map_err(|e| Error::Octree(format!("node {}: {}", index, e)))?;
            if let Some(children) = node.children {
                if children.iter().any(|c| c.index() >= nodes.len()) {
                    return Err(Error::Octree(format!("node {} links to a missing child", index)));
                }
            }
        }
        Ok(Self { nodes, num_channels })
    }

    /// Create a node after checking the channel count and `min <= avg <= max`.
    ///
    /// # Arguments
    /// * `avg`, `min`, `max` - one value per channel
    /// * `brick_address` - brick in the pool, or `NO_BRICK`
    /// * `children` - all eight children, which must already exist
    pub fn create_node(
        &mut self,
        avg: &[u16],
        min: &[u16],
        max: &[u16],
        brick_address: VirtualAddress,
        in_volume: bool,
        children: Option<[NodeId; 8]>,
    ) -> Result<NodeId> {
        check_values(avg, min, max, self.num_channels)?;
        if let Some(children) = &children {
            if let Some(missing) = children.iter().find(|c| c.index() >= self.nodes.len()) {
                return Err(Error::Octree(format!("child node {} does not exist", missing.0)));
            }
        }

        let mut node = OctreeNode {
            avg: [0; MAX_CHANNELS],
            min: [0; MAX_CHANNELS],
            max: [0; MAX_CHANNELS],
            brick_address,
            in_volume,
            children,
        };
        node.avg[..avg.len()].copy_from_slice(avg);
        node.min[..min.len()].copy_from_slice(min);
        node.max[..max.len()].copy_from_slice(max);
        Ok(self.push(node))
    }

    /// Node for a region that lies completely outside the volume
    pub fn create_empty_node(&mut self) -> NodeId {
        self.push(OctreeNode {
            avg: [0; MAX_CHANNELS],
            min: [0; MAX_CHANNELS],
            max: [0; MAX_CHANNELS],
            brick_address: NO_BRICK,
            in_volume: false,
            children: None,
        })
    }

    fn push(&mut self, node: OctreeNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    pub fn get(&self, id: NodeId) -> &OctreeNode {
        &self.nodes[id.index()]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn nodes(&self) -> &[OctreeNode] {
        &self.nodes
    }

    /// Drop every node created after `mark` (a previous `len()`).
    pub fn truncate(&mut self, mark: usize) {
        self.nodes.truncate(mark);
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

fn check_channels(num_channels: usize) -> Result<()> {
    if num_channels == 0 || num_channels > MAX_CHANNELS {
        return Err(Error::InvalidArgument(format!(
            "channel count must be between 1 and {}, got {}",
            MAX_CHANNELS, num_channels
        )));
    }
    Ok(())
}

fn check_values(avg: &[u16], min: &[u16], max: &[u16], num_channels: usize) -> Result<()> {
    if avg.len() != num_channels || min.len() != num_channels || max.len() != num_channels {
        return Err(Error::InvalidArgument(format!(
            "expected {} values per statistic, got {}/{}/{}",
            num_channels,
            avg.len(),
            min.len(),
            max.len()
        )));
    }
    for c in 0..num_channels {
        if !(min[c] <= avg[c] && avg[c] <= max[c]) {
            return Err(Error::InvalidArgument(format!(
                "channel {}: min {} <= avg {} <= max {} violated",
                c, min[c], avg[c], max[c]
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_node_validates() {
        let mut arena = NodeArena::new(2).unwrap();

        let leaf = arena.create_node(&[5, 6], &[1, 6], &[9, 6], 0, true, None).unwrap();
        assert_eq!(arena.get(leaf).avg[..2], [5, 6]);
        assert!(arena.get(leaf).is_leaf());

        // avg outside [min, max]
        assert!(arena.create_node(&[10, 6], &[1, 6], &[9, 6], 0, true, None).is_err());
        // wrong channel count
        assert!(arena.create_node(&[5], &[1], &[9], 0, true, None).is_err());
        // children must exist
        assert!(arena.create_node(&[5, 6], &[1, 6], &[9, 6], NO_BRICK, true, Some([NodeId(7); 8])).is_err());
        assert_eq!(arena.len(), 1);

        assert!(NodeArena::new(0).is_err());
        assert!(NodeArena::new(5).is_err());
    }

    #[test]
    fn test_parent_links_children() {
        let mut arena = NodeArena::new(1).unwrap();
        let children: Vec<_> = (0..8).map(|_| arena.create_empty_node()).collect();
        let children: [NodeId; 8] = children.try_into().unwrap();
        let parent = arena.create_node(&[0], &[0], &[0], NO_BRICK, true, Some(children)).unwrap();

        assert_eq!(parent, NodeId(8));
        assert_eq!(arena.get(parent).children.unwrap()[3], NodeId(3));
        assert!(!arena.get(NodeId(3)).in_volume);
        assert!(!arena.get(NodeId(3)).has_brick());

        arena.truncate(4);
        assert_eq!(arena.len(), 4);
    }

    #[test]
    fn test_from_nodes_rejects_bad_links() {
        let mut arena = NodeArena::new(1).unwrap();
        arena.create_empty_node();
        let mut nodes = arena.nodes().to_vec();
        nodes[0].children = Some([NodeId(1); 8]);
        assert!(NodeArena::from_nodes(nodes.clone(), 1).is_err());

        nodes[0].children = None;
        nodes[0].min[0] = 3;
        assert!(NodeArena::from_nodes(nodes, 1).is_err());
    }

    #[test]
    fn test_from_nodes_fewer_channels_than_max() {
        let mut arena = NodeArena::new(1).unwrap();
        arena.create_node(&[5], &[1], &[9], NO_BRICK, true, None).unwrap();
        let adopted = NodeArena::from_nodes(arena.nodes().to_vec(), 1).unwrap();
        assert_eq!(adopted.get(NodeId(0)).avg[0], 5);

        let mut arena = NodeArena::new(3).unwrap();
        arena.create_node(&[5, 6, 7], &[1, 6, 0], &[9, 6, 7], 0, true, None).unwrap();
        assert_eq!(NodeArena::from_nodes(arena.nodes().to_vec(), 3).unwrap().len(), 1);
    }
}
