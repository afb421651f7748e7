use crate::octree::aabb::Aabb;
use crate::octree::NodeId;
use crate::scheduler::LoadErrorKind;

/// Residency of a node's point payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoadState {
    #[default]
    Unloaded,
    Loading,
    Loaded,
    /// Permanently rejected for the rest of the session.
    Failed,
}

#[derive(Clone, Debug, Default)]
pub struct OctreeNode {
    pub id: Option<NodeId>,
    /// `r` followed by one octant digit per level below the root.
    pub name: String,
    /// Octant of this node inside its parent, 0 for the root.
    pub index: u8,
    pub level: u32,
    pub bounding_box: Aabb,
    pub spacing: f64,
    pub num_points: u32,
    /// Children announced by the hierarchy, whether or not they are materialized yet.
    pub child_mask: u8,
    pub children: [Option<NodeId>; 8],
    pub parent: Option<NodeId>,
    /// Set once the hierarchy chunk rooted at this node has been attached.
    pub hierarchy_loaded: bool,
    pub state: LoadState,
    pub load_error: Option<LoadErrorKind>,
    pub failed_attempts: u32,
}

impl OctreeNode {
    pub fn has_children(&self) -> bool {
        self.child_mask != 0
    }

    pub fn is_loaded(&self) -> bool {
        self.state == LoadState::Loaded
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    pub fn child_ids(&self) -> impl Iterator<Item = (usize, NodeId)> + '_ {
        self.children
            .iter()
            .enumerate()
            .filter_map(|(index, child)| child.map(|id| (index, id)))
    }

    /// Digits of the name below the root, e.g. `"0123"` for `r0123`.
    pub fn digits(&self) -> &str {
        self.name.get(1..).unwrap_or_default()
    }
}

/// Level of a node given its name: the number of octant digits.
pub fn level_of(name: &str) -> u32 {
    name.len().saturating_sub(1) as u32
}

/// Name of the child in octant `index`.
pub fn child_name(parent: &str, index: usize) -> String {
    format!("{}{}", parent, index)
}

/// Name of the parent, `None` for the root.
pub fn parent_name(name: &str) -> Option<&str> {
    if name.len() <= 1 {
        None
    } else {
        Some(&name[..name.len() - 1])
    }
}
