use crate::codec::PointFormat;
use crate::hierarchy::{attach_hierarchy, decode_hierarchy_chunk, HierarchyError, HierarchyNode};
use crate::metadata::{Metadata, ReadMetadataError};
use crate::octree::aabb::Aabb;
use crate::octree::address::NodeAddressing;
use crate::octree::node::OctreeNode;
use crate::octree::snapshot::OctreeSnapshot;
use crate::octree::{FlatOctree, NodeId, NodeKey, OctreeId};
use crate::resource::{join_url, ResourceClient, ResourceError};
use crate::scheduler::{HierarchyJob, LoadRequest, LoadedPayload, NodeLoadJob, ParentPayload};
use glam::DVec3;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum OpenError {
    #[error("Error loading metadata: {0}")]
    Metadata(#[from] ReadMetadataError),

    #[error("Error loading root hierarchy: {0}")]
    Hierarchy(#[from] HierarchyError),

    #[error("Error loading resource: {0}")]
    Resource(#[from] ResourceError),
}

/// One Potree 1.x cloud: its `cloud.js` and the part of the hierarchy known so far.
///
/// Node boxes are kept in octree-local coordinates, whose origin is the min
/// corner of the cloud's bounding box. [`offset`](Self::offset) maps them back
/// to world space.
#[derive(Clone, Debug)]
pub struct PointCloudOctree {
    url: String,
    metadata: Metadata,
    addressing: NodeAddressing,
    format: Arc<PointFormat>,
    tree: FlatOctree<OctreeNode>,
    offset: DVec3,
}

impl PointCloudOctree {
    /// Fetches `cloud.js` from `url` and the hierarchy chunk of the root.
    /// Node files are looked up relative to the directory of `url`.
    pub async fn open<C: ResourceClient>(url: &str, client: &C) -> Result<Self, OpenError> {
        let metadata: Metadata = client.get_json(url, None).await?;
        let mut this = Self::from_metadata(url, metadata)?;

        let root = this.root_hierarchy_node();
        let hierarchy_url = this.hierarchy_url(&root.name);
        let bytes = client.get(&hierarchy_url, None).await?;
        let nodes = decode_hierarchy_chunk(&bytes, &root, this.metadata.hierarchy_step_size)?;
        this.apply_hierarchy(this.tree.root_id(), &nodes)?;

        debug!(
            url,
            version = %this.metadata.version,
            nodes = this.tree.len(),
            "opened point cloud"
        );

        Ok(this)
    }

    /// Builds a cloud holding only its root node, hierarchy not loaded.
    pub fn from_metadata(url: &str, metadata: Metadata) -> Result<Self, ReadMetadataError> {
        let format = Arc::new(metadata.point_format()?);
        let mut tree = FlatOctree::with_root(metadata.create_root_node());
        let root_id = tree.root_id();
        if let Some(root) = tree.node_mut(root_id) {
            root.id = Some(root_id);
        }

        Ok(Self {
            url: url.to_string(),
            addressing: metadata.addressing(),
            offset: metadata.offset(),
            format,
            tree,
            metadata,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn format(&self) -> &Arc<PointFormat> {
        &self.format
    }

    pub fn octree(&self) -> &FlatOctree<OctreeNode> {
        &self.tree
    }

    pub fn octree_mut(&mut self) -> &mut FlatOctree<OctreeNode> {
        &mut self.tree
    }

    /// World position of the local origin.
    pub fn offset(&self) -> DVec3 {
        self.offset
    }

    pub fn world_bounding_box(&self, node: &OctreeNode) -> Aabb {
        Aabb::new(node.bounding_box.min + self.offset, node.bounding_box.max + self.offset)
    }

    /// Linear lookup, meant for tools and tests rather than the frame loop.
    pub fn node_by_name(&self, name: &str) -> Option<(NodeId, &OctreeNode)> {
        self.tree.iter().find(|(_, node)| node.name == name)
    }

    pub fn points_url(&self, name: &str) -> String {
        join_url(&self.url, &self.addressing.points_url(name))
    }

    pub fn hierarchy_url(&self, name: &str) -> String {
        join_url(&self.url, &self.addressing.hierarchy_url(name))
    }

    fn root_hierarchy_node(&self) -> HierarchyNode {
        match self.tree.root() {
            Some(root) => HierarchyNode::root_of(root),
            None => HierarchyNode::root_of(&self.metadata.create_root_node()),
        }
    }

    /// Whether loading `node` also has to fetch the hierarchy chunk rooted at it.
    pub fn needs_hierarchy(&self, node: &OctreeNode) -> bool {
        node.level % self.metadata.hierarchy_step_size.max(1) == 0
            && node.has_children()
            && !node.hierarchy_loaded
    }

    /// Describes the load of one node.
    pub fn load_job(&self, node: &OctreeNode, inherit: bool) -> NodeLoadJob {
        let hierarchy = self.needs_hierarchy(node).then(|| HierarchyJob {
            url: self.hierarchy_url(&node.name),
            root: HierarchyNode::root_of(node),
            step_size: self.metadata.hierarchy_step_size,
        });

        NodeLoadJob {
            name: node.name.clone(),
            level: node.level,
            index: node.index,
            points_url: self.points_url(&node.name),
            bounding_box: self.world_bounding_box(node),
            format: self.format.clone(),
            hierarchy,
            inherit,
        }
    }

    /// Builds the load request of a node. A parent that is not resident gets its
    /// request chained in front, since nodes load top-down whether or not
    /// children inherit their parent's points.
    pub fn load_request(
        &self,
        octree: OctreeId,
        node_id: NodeId,
        resident: &dyn Fn(NodeKey) -> Option<Arc<LoadedPayload>>,
        inherit: bool,
    ) -> Option<LoadRequest> {
        let node = self.tree.node(node_id)?;
        let parent = match node.parent {
            Some(parent_id) => match resident(NodeKey::new(octree, parent_id)) {
                Some(payload) => ParentPayload::Resident(payload),
                None => match self.load_request(octree, parent_id, resident, inherit) {
                    Some(request) => ParentPayload::Pending(Box::new(request)),
                    None => ParentPayload::None,
                },
            },
            None => ParentPayload::None,
        };

        Some(LoadRequest {
            key: NodeKey::new(octree, node_id),
            job: self.load_job(node, inherit),
            parent,
        })
    }

    /// Attaches a decoded hierarchy chunk below `node_id`. Returns the new nodes.
    pub fn apply_hierarchy(
        &mut self,
        node_id: NodeId,
        nodes: &[HierarchyNode],
    ) -> Result<Vec<NodeId>, HierarchyError> {
        attach_hierarchy(&mut self.tree, node_id, nodes)
    }

    /// Detached copy of the hierarchy known so far.
    pub fn hierarchy_snapshot(&self) -> OctreeSnapshot {
        OctreeSnapshot::from_octree(&self.tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::{encode_hierarchy_chunk, HierarchyRecord};
    use crate::resource::memory::MemoryClient;
    use futures::executor::block_on;

    const CLOUD_JS: &str = r#"{
        "version": "1.7",
        "octreeDir": "data",
        "boundingBox": {"lx": 100.0, "ly": 200.0, "lz": 0.0, "ux": 116.0, "uy": 216.0, "uz": 16.0},
        "pointAttributes": ["POSITION_CARTESIAN", "COLOR_PACKED"],
        "spacing": 2.0,
        "scale": 0.001,
        "hierarchyStepSize": 1
    }"#;

    fn record(child_mask: u8, num_points: u32) -> HierarchyRecord {
        HierarchyRecord {
            child_mask,
            num_points,
        }
    }

    fn client() -> MemoryClient {
        let client = MemoryClient::new();
        client.insert("mem://clouds/a/cloud.js", CLOUD_JS.as_bytes().to_vec());
        client.insert(
            "mem://clouds/a/data/r/r.hrc",
            encode_hierarchy_chunk(&[record(0b1000_0010, 500), record(0b0001, 80), record(0, 70)]),
        );
        client
    }

    #[test]
    fn test_open_reads_root_hierarchy() {
        let client = client();
        let cloud = block_on(PointCloudOctree::open("mem://clouds/a/cloud.js", &client)).unwrap();

        assert_eq!(cloud.octree().len(), 3);
        assert_eq!(cloud.offset(), DVec3::new(100.0, 200.0, 0.0));
        let root = cloud.octree().root().unwrap();
        assert!(root.hierarchy_loaded);
        assert_eq!(root.num_points, 500);

        let (_, r7) = cloud.node_by_name("r7").unwrap();
        assert_eq!(r7.bounding_box, Aabb::new(DVec3::splat(8.0), DVec3::splat(16.0)));
        assert_eq!(
            cloud.world_bounding_box(r7),
            Aabb::new(DVec3::new(108.0, 208.0, 8.0), DVec3::new(116.0, 216.0, 16.0))
        );
        assert_eq!(client.fetch_count("mem://clouds/a/data/r/r.hrc"), 1);
    }

    #[test]
    fn test_open_missing_hierarchy_fails() {
        let client = client();
        client.remove("mem://clouds/a/data/r/r.hrc");
        let result = block_on(PointCloudOctree::open("mem://clouds/a/cloud.js", &client));
        assert!(matches!(result, Err(OpenError::Resource(ResourceError::NotFound(_)))));
    }

    #[test]
    fn test_open_rejects_invalid_cloud_js() {
        let client = client();
        client.insert("mem://clouds/a/cloud.js", b"{\"version\": ".to_vec());
        let result = block_on(PointCloudOctree::open("mem://clouds/a/cloud.js", &client));
        assert!(matches!(result, Err(OpenError::Resource(ResourceError::Json(_)))));
        assert_eq!(client.fetch_count("mem://clouds/a/data/r/r.hrc"), 0);
    }

    #[test]
    fn test_load_job_fetches_hierarchy_on_step_boundaries() {
        let cloud = block_on(PointCloudOctree::open("mem://clouds/a/cloud.js", &client())).unwrap();
        let (_, r1) = cloud.node_by_name("r1").unwrap();
        let job = cloud.load_job(r1, true);

        assert_eq!(job.points_url, "mem://clouds/a/data/r/1/r1.bin");
        assert_eq!(job.index, 1);
        let hierarchy = job.hierarchy.unwrap();
        assert_eq!(hierarchy.url, "mem://clouds/a/data/r/1/r1.hrc");
        assert_eq!(hierarchy.root.name, "r1");

        // r7 has no children, nothing to fetch
        let (_, r7) = cloud.node_by_name("r7").unwrap();
        assert!(cloud.load_job(r7, true).hierarchy.is_none());
        // the root's chunk came with open
        assert!(cloud.load_job(cloud.octree().root().unwrap(), true).hierarchy.is_none());
    }

    #[test]
    fn test_load_request_chains_missing_parents() {
        let cloud = block_on(PointCloudOctree::open("mem://clouds/a/cloud.js", &client())).unwrap();
        let (r1_id, _) = cloud.node_by_name("r1").unwrap();
        let octree = OctreeId(3);

        let request = cloud.load_request(octree, r1_id, &|_| None, true).unwrap();
        assert_eq!(request.key, NodeKey::new(octree, r1_id));
        let ParentPayload::Pending(parent) = request.parent else {
            panic!("expected the root to be chained");
        };
        assert_eq!(parent.job.name, "r");
        assert!(matches!(parent.parent, ParentPayload::None));

        // without inheritance the parent still loads first
        let without = cloud.load_request(octree, r1_id, &|_| None, false).unwrap();
        assert!(!without.job.inherit);
        let ParentPayload::Pending(parent) = without.parent else {
            panic!("expected the root to be chained");
        };
        assert_eq!(parent.job.name, "r");
        assert!(!parent.job.inherit);
    }
}
