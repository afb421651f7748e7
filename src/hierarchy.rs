use crate::octree::aabb::{create_child_aabb, Aabb};
use crate::octree::node::{child_name, OctreeNode};
use crate::octree::{FlatOctree, NodeId};
use binrw::{binrw, BinReaderExt};
use std::collections::VecDeque;
use std::io::Cursor;
use thiserror::Error;
use tracing::{debug, trace};

pub const BYTES_PER_RECORD: usize = 5;

/// One `.hrc` record: which children exist and how many points the node holds.
#[binrw]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little)]
pub struct HierarchyRecord {
    pub child_mask: u8,
    pub num_points: u32,
}

#[derive(Error, Debug)]
pub enum HierarchyError {
    #[error("Hierarchy chunk is empty")]
    Empty,

    #[error("Hierarchy chunk of {0} bytes is not a whole number of records")]
    TruncatedRecord(usize),

    #[error("Invalid binary data: {0}")]
    InvalidBinaryData(#[from] binrw::error::Error),

    #[error("Hierarchy root {0} does not exist")]
    MissingRoot(String),
}

/// A node described by a hierarchy chunk, not yet attached to an octree.
#[derive(Debug, Clone, PartialEq)]
pub struct HierarchyNode {
    pub name: String,
    pub index: u8,
    pub level: u32,
    pub bounding_box: Aabb,
    pub spacing: f64,
    pub num_points: u32,
    pub child_mask: u8,
}

impl HierarchyNode {
    /// Describes the node a chunk is rooted at. Counts are filled in from the chunk.
    pub fn root_of(node: &OctreeNode) -> Self {
        Self {
            name: node.name.clone(),
            index: node.index,
            level: node.level,
            bounding_box: node.bounding_box,
            spacing: node.spacing,
            num_points: node.num_points,
            child_mask: node.child_mask,
        }
    }
}

/// Decodes a breadth-first hierarchy chunk rooted at `root`.
///
/// The first record always describes `root` itself. Reading stops at the end of
/// the buffer or at nodes `step_size` levels below `root`, whose children live in
/// their own chunk. The returned list starts with the updated root.
pub fn decode_hierarchy_chunk(
    buf: &[u8],
    root: &HierarchyNode,
    step_size: u32,
) -> Result<Vec<HierarchyNode>, HierarchyError> {
    if buf.is_empty() {
        return Err(HierarchyError::Empty);
    }
    if buf.len() % BYTES_PER_RECORD != 0 {
        return Err(HierarchyError::TruncatedRecord(buf.len()));
    }

    let num_records = buf.len() / BYTES_PER_RECORD;
    let mut cursor = Cursor::new(buf);
    let first: HierarchyRecord = cursor.read_le()?;

    let mut nodes = Vec::with_capacity(num_records);
    nodes.push(HierarchyNode {
        num_points: first.num_points,
        child_mask: first.child_mask,
        ..root.clone()
    });

    let mut queue = VecDeque::from([0usize]);
    let mut read = 1;

    'outer: while let Some(current) = queue.pop_front() {
        let parent = nodes[current].clone();
        if parent.level - root.level >= step_size.max(1) {
            continue;
        }

        for child_index in 0..8 {
            if parent.child_mask & (1 << child_index) == 0 {
                continue;
            }
            if read == num_records {
                break 'outer;
            }

            let record: HierarchyRecord = cursor.read_le()?;
            read += 1;

            nodes.push(HierarchyNode {
                name: child_name(&parent.name, child_index),
                index: child_index as u8,
                level: parent.level + 1,
                bounding_box: create_child_aabb(&parent.bounding_box, child_index),
                spacing: parent.spacing / 2.0,
                num_points: record.num_points,
                child_mask: record.child_mask,
            });
            queue.push_back(nodes.len() - 1);
        }
    }

    if read < num_records {
        trace!(
            root = %root.name,
            unread = num_records - read,
            "hierarchy chunk has records past its step"
        );
    }

    Ok(nodes)
}

/// Materializes decoded nodes below `root_id`. Nodes that already exist keep
/// their identity and load state and only get their counts refreshed.
/// Returns the ids of the newly inserted nodes.
pub fn attach_hierarchy(
    octree: &mut FlatOctree<OctreeNode>,
    root_id: NodeId,
    nodes: &[HierarchyNode],
) -> Result<Vec<NodeId>, HierarchyError> {
    let Some((first, rest)) = nodes.split_first() else {
        return Ok(Vec::new());
    };

    let root = octree
        .node_mut(root_id)
        .ok_or_else(|| HierarchyError::MissingRoot(first.name.clone()))?;
    root.num_points = first.num_points;
    root.child_mask = first.child_mask;
    root.hierarchy_loaded = true;

    let mut ids = std::collections::HashMap::with_capacity(nodes.len());
    ids.insert(first.name.as_str(), root_id);

    octree.reserve(rest.len());
    let mut inserted = Vec::new();

    for decoded in rest {
        let parent_name = &decoded.name[..decoded.name.len() - 1];
        let Some(&parent_id) = ids.get(parent_name) else {
            continue;
        };
        let index = decoded.index as usize;

        let existing = octree.node(parent_id).and_then(|parent| parent.children[index]);
        let id = match existing {
            Some(id) => {
                if let Some(node) = octree.node_mut(id) {
                    node.num_points = decoded.num_points;
                    node.child_mask = decoded.child_mask;
                }
                id
            }
            None => {
                let id = octree.insert(OctreeNode {
                    name: decoded.name.clone(),
                    index: decoded.index,
                    level: decoded.level,
                    bounding_box: decoded.bounding_box,
                    spacing: decoded.spacing,
                    num_points: decoded.num_points,
                    child_mask: decoded.child_mask,
                    parent: Some(parent_id),
                    ..Default::default()
                });
                if let Some(node) = octree.node_mut(id) {
                    node.id = Some(id);
                }
                if let Some(parent) = octree.node_mut(parent_id) {
                    parent.children[index] = Some(id);
                }
                inserted.push(id);
                id
            }
        };
        ids.insert(decoded.name.as_str(), id);
    }

    debug!(
        root = %first.name,
        decoded = nodes.len(),
        inserted = inserted.len(),
        "attached hierarchy chunk"
    );

    Ok(inserted)
}

/// Encodes nodes, given in breadth-first order, as a hierarchy chunk.
pub fn encode_hierarchy_chunk(records: &[HierarchyRecord]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * BYTES_PER_RECORD);
    for record in records {
        out.push(record.child_mask);
        out.extend_from_slice(&record.num_points.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::DVec3;

    fn root() -> HierarchyNode {
        HierarchyNode {
            name: "r".to_string(),
            index: 0,
            level: 0,
            bounding_box: Aabb::new(DVec3::ZERO, DVec3::splat(16.0)),
            spacing: 1.0,
            num_points: 0,
            child_mask: 0,
        }
    }

    fn record(child_mask: u8, num_points: u32) -> HierarchyRecord {
        HierarchyRecord {
            child_mask,
            num_points,
        }
    }

    #[test]
    fn test_decode_chunk_breadth_first() {
        // r has children 0 and 5, r0 has child 3, r5 none, r03 none
        let buf = encode_hierarchy_chunk(&[
            record(0b0010_0001, 100),
            record(0b0000_1000, 50),
            record(0, 40),
            record(0, 10),
        ]);
        let nodes = decode_hierarchy_chunk(&buf, &root(), 5).unwrap();

        let names: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["r", "r0", "r5", "r03"]);
        assert_eq!(nodes[0].num_points, 100);
        assert_eq!(nodes[2].index, 5);
        assert_eq!(nodes[3].level, 2);
        assert_eq!(nodes[3].spacing, 0.25);
        assert_eq!(
            nodes[2].bounding_box,
            create_child_aabb(&root().bounding_box, 5)
        );
    }

    #[test]
    fn test_decode_sparse_root() {
        // r has children 0, 3 and 7, r3 has child 2
        let buf = encode_hierarchy_chunk(&[
            record(0b1000_1001, 1000),
            record(0, 300),
            record(0b0000_0100, 200),
            record(0, 100),
            record(0, 20),
        ]);
        let nodes = decode_hierarchy_chunk(&buf, &root(), 5).unwrap();

        let names: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["r", "r0", "r3", "r7", "r32"]);
        let counts: Vec<_> = nodes.iter().map(|n| n.num_points).collect();
        assert_eq!(counts, vec![1000, 300, 200, 100, 20]);
        assert_eq!(nodes[4].child_mask, 0);
        assert_eq!(
            nodes[4].bounding_box,
            create_child_aabb(&create_child_aabb(&root().bounding_box, 3), 2)
        );
    }

    #[test]
    fn test_decode_stops_at_buffer_end() {
        // root announces 3 children but only 2 records follow
        let buf = encode_hierarchy_chunk(&[record(0b0000_0111, 9), record(1, 4), record(0, 5)]);
        let nodes = decode_hierarchy_chunk(&buf, &root(), 5).unwrap();
        assert_eq!(nodes.len(), 3);
    }

    #[test]
    fn test_decode_stops_at_step() {
        // step 1: grandchildren records are ignored
        let buf = encode_hierarchy_chunk(&[record(1, 9), record(1, 4), record(0, 5)]);
        let nodes = decode_hierarchy_chunk(&buf, &root(), 1).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[1].child_mask, 1);
    }

    #[test]
    fn test_decode_rejects_partial_record() {
        let mut buf = encode_hierarchy_chunk(&[record(0, 9)]);
        buf.push(0);
        assert!(matches!(
            decode_hierarchy_chunk(&buf, &root(), 5),
            Err(HierarchyError::TruncatedRecord(6))
        ));
        assert!(matches!(
            decode_hierarchy_chunk(&[], &root(), 5),
            Err(HierarchyError::Empty)
        ));
    }

    #[test]
    fn test_attach_links_parents_and_children() {
        let mut octree = FlatOctree::with_root(OctreeNode {
            name: "r".to_string(),
            bounding_box: root().bounding_box,
            spacing: 1.0,
            ..Default::default()
        });
        let root_id = octree.root_id();

        let buf = encode_hierarchy_chunk(&[record(0b0010_0001, 100), record(0b1000, 50), record(0, 40), record(0, 10)]);
        let nodes = decode_hierarchy_chunk(&buf, &root(), 5).unwrap();
        let inserted = attach_hierarchy(&mut octree, root_id, &nodes).unwrap();
        assert_eq!(inserted.len(), 3);
        assert_eq!(octree.len(), 4);

        let root_node = octree.root().unwrap();
        assert!(root_node.hierarchy_loaded);
        assert_eq!(root_node.num_points, 100);
        let r0 = root_node.children[0].unwrap();
        let r03 = octree.node(r0).unwrap().children[3].unwrap();
        let r03 = octree.node(r03).unwrap();
        assert_eq!(r03.name, "r03");
        assert_eq!(r03.parent, Some(r0));
        assert_eq!(r03.id, root_node.children[0].and_then(|id| octree.node(id)).and_then(|n| n.children[3]));

        // attaching the same chunk again does not duplicate nodes
        let again = attach_hierarchy(&mut octree, root_id, &nodes).unwrap();
        assert!(again.is_empty());
        assert_eq!(octree.len(), 4);
    }
}
