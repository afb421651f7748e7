//! Per-octree lookup texture describing the visible part of the hierarchy.
//!
//! Nodes are sorted breadth first (`r, r0, r3, r07, r30, ...`) and get four
//! bytes each: the mask of their visible children, the distance to their first
//! visible child as a big-endian `u16`, and their level. Renderers walk it to
//! find the deepest visible node covering a point.

use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct VisibilityTexture {
    pub data: Vec<u8>,
    /// Row of each node in `data`.
    pub offsets: HashMap<String, usize>,
}

impl VisibilityTexture {
    pub fn len(&self) -> usize {
        self.data.len() / 4
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Builds the texture from the names of the visible nodes of one octree.
/// Every node's parent must be in the set, except the root's.
pub fn visibility_texture_data<S: AsRef<str>>(names: &[S]) -> VisibilityTexture {
    let mut nodes: Vec<&str> = names.iter().map(AsRef::as_ref).collect();
    nodes.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));

    let mut data = vec![0u8; nodes.len() * 4];
    let mut offsets = HashMap::with_capacity(nodes.len());
    let mut first_child = vec![usize::MAX; nodes.len()];

    for (i, name) in nodes.iter().enumerate() {
        offsets.insert(name.to_string(), i);
        data[i * 4 + 3] = name.len().saturating_sub(1) as u8;

        let Some(index) = name.chars().last().and_then(|c| c.to_digit(10)) else {
            continue;
        };
        let Some(&parent) = offsets.get(&name[..name.len() - 1]) else {
            continue;
        };

        first_child[parent] = first_child[parent].min(i - parent);
        let offset = first_child[parent].min(u16::MAX as usize) as u16;
        data[parent * 4] |= 1 << index;
        data[parent * 4 + 1..parent * 4 + 3].copy_from_slice(&offset.to_be_bytes());
    }

    VisibilityTexture { data, offsets }
}
