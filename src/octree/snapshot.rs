use crate::octree::aabb::Aabb;
use crate::octree::node::{LoadState, OctreeNode};
use crate::octree::FlatOctree;
use std::collections::VecDeque;

/// Copy of one node, detached from the octree. Links are positions in the snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OctreeNodeSnapshot {
    pub index: usize,
    pub name: String,
    pub level: u32,
    pub bounding_box: Aabb,
    pub spacing: f64,
    pub num_points: u32,
    pub child_mask: u8,
    pub state: LoadState,
    pub parent: Option<usize>,
    pub children: [Option<usize>; 8],
}

impl From<&OctreeNode> for OctreeNodeSnapshot {
    fn from(node: &OctreeNode) -> Self {
        Self {
            index: 0,
            name: node.name.clone(),
            level: node.level,
            bounding_box: node.bounding_box,
            spacing: node.spacing,
            num_points: node.num_points,
            child_mask: node.child_mask,
            state: node.state,
            parent: None,
            children: [None; 8],
        }
    }
}

/// Materialized hierarchy in breadth-first order, root first.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OctreeSnapshot {
    pub nodes: Vec<OctreeNodeSnapshot>,
}

impl OctreeSnapshot {
    pub fn from_octree(octree: &FlatOctree<OctreeNode>) -> Self {
        let mut nodes: Vec<OctreeNodeSnapshot> = Vec::with_capacity(octree.len());
        let Some(root) = octree.root() else {
            return Self { nodes };
        };

        let mut queue = VecDeque::from([(None, root)]);
        while let Some((parent, node)) = queue.pop_front() {
            let current = nodes.len();
            let mut snapshot = OctreeNodeSnapshot::from(node);
            snapshot.index = current;
            snapshot.parent = parent;
            nodes.push(snapshot);

            if let Some(parent) = parent {
                nodes[parent].children[node.index as usize] = Some(current);
            }

            for (_, child_id) in node.child_ids() {
                if let Some(child) = octree.node(child_id) {
                    queue.push_back((Some(current), child));
                }
            }
        }

        Self { nodes }
    }

    pub fn root(&self) -> Option<&OctreeNodeSnapshot> {
        self.nodes.first()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&OctreeNodeSnapshot> {
        self.nodes.iter().find(|node| node.name == name)
    }

    /// Depth-first walk below `start`, children in octant order.
    pub fn iter_from(&self, start: usize) -> SnapshotIter<'_> {
        let stack = if start < self.nodes.len() { vec![start] } else { Vec::new() };
        SnapshotIter { snapshot: self, stack }
    }

    pub fn iter(&self) -> SnapshotIter<'_> {
        self.iter_from(0)
    }
}

pub struct SnapshotIter<'a> {
    snapshot: &'a OctreeSnapshot,
    stack: Vec<usize>,
}

impl<'a> Iterator for SnapshotIter<'a> {
    type Item = &'a OctreeNodeSnapshot;

    fn next(&mut self) -> Option<Self::Item> {
        let node = &self.snapshot.nodes[self.stack.pop()?];
        for child in node.children.iter().rev().flatten() {
            self.stack.push(*child);
        }
        Some(node)
    }
}
