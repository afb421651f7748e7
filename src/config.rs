use serde::Deserialize;

/// Runtime knobs of a [`StreamingSession`](crate::session::StreamingSession).
#[derive(Deserialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct StreamingConfig {
    /// Most points shown in one frame, over all octrees.
    pub point_budget: u64,
    /// Node loads running at the same time.
    pub max_nodes_loading: usize,
    /// Children whose bounding sphere projects smaller than this many pixels are not visited.
    pub min_node_pixel_size: f64,
    pub max_level: Option<u32>,
    /// Nodes popped from the traversal queue per frame.
    pub max_nodes_per_frame: Option<usize>,
    /// Points kept resident in the node cache.
    pub cache_point_limit: u64,
    pub inherit_parent_points: bool,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            point_budget: 1_000_000,
            max_nodes_loading: 4,
            min_node_pixel_size: 150.0,
            max_level: None,
            max_nodes_per_frame: None,
            cache_point_limit: 10_000_000,
            inherit_parent_points: true,
        }
    }
}

impl StreamingConfig {
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
