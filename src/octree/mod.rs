pub mod aabb;
pub mod address;
pub mod node;
pub mod point_attributes;
pub mod snapshot;

use slab::Slab;

#[derive(Clone, Debug, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) usize);

/// Identifies one octree registered in a streaming session.
#[derive(Clone, Debug, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OctreeId(pub u32);

/// Globally unique node handle: the octree it belongs to and its slot in that octree.
#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey {
    pub octree: OctreeId,
    pub node: NodeId,
}

impl NodeKey {
    pub fn new(octree: OctreeId, node: NodeId) -> Self {
        Self { octree, node }
    }
}

#[derive(Clone, Debug)]
pub struct FlatOctree<T> {
    storage: Slab<T>,
    root_id: NodeId,
}

impl<T> FlatOctree<T> {
    pub fn with_root(root: T) -> Self {
        let mut storage = Slab::new();
        let root_id = NodeId(storage.insert(root));

        Self { storage, root_id }
    }

    pub fn root(&self) -> Option<&T> {
        self.storage.get(self.root_id.0)
    }

    pub fn root_id(&self) -> NodeId {
        self.root_id
    }

    pub fn node(&self, node_id: NodeId) -> Option<&T> {
        self.storage.get(node_id.0)
    }

    pub fn node_mut(&mut self, node_id: NodeId) -> Option<&mut T> {
        self.storage.get_mut(node_id.0)
    }

    pub(crate) fn reserve(&mut self, additional: usize) {
        self.storage.reserve(additional);
    }

    pub(crate) fn insert(&mut self, node: T) -> NodeId {
        NodeId(self.storage.insert(node))
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &T)> {
        self.storage.iter().map(|(id, node)| (NodeId(id), node))
    }
}

impl<T: Default> FlatOctree<T> {
    pub fn new() -> Self {
        Self::with_root(T::default())
    }
}

impl<T: Default> Default for FlatOctree<T> {
    fn default() -> Self {
        Self::new()
    }
}
