pub use crate::config::StreamingConfig;
pub use crate::octree::node::{LoadState, OctreeNode};
pub use crate::octree::snapshot::{OctreeNodeSnapshot, OctreeSnapshot};
pub use crate::octree::{NodeId, NodeKey, OctreeId};
pub use crate::point::{world_points, PointData};
pub use crate::point_cloud::PointCloudOctree;
pub use crate::resource::ResourceClient;
pub use crate::scheduler::{LoadedPayload, TaskSpawner};
pub use crate::session::{NullSink, RenderSink, StreamingSession};
pub use crate::visibility::{ClipMethod, ClipSettings, ClipTask, ClipVolume, Projection, ViewState};

// Error types
pub use crate::codec::CodecError;
pub use crate::hierarchy::HierarchyError;
pub use crate::metadata::ReadMetadataError;
pub use crate::point_cloud::OpenError;
pub use crate::resource::ResourceError;
pub use crate::scheduler::{LoadError, LoadErrorKind};
