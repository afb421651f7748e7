//! The per-frame driver.
//!
//! A session owns the octrees, the node cache and the load scheduler. Each
//! call to [`StreamingSession::update`] installs the loads that finished since
//! the previous frame, runs the visibility traversal, touches what it shows,
//! requests what it misses and finally evicts down to the cache budget. Only
//! the frame loop mutates node state; load tasks merely hand results back.

use crate::cache::NodeCache;
use crate::codec::PointBuffer;
use crate::config::StreamingConfig;
use crate::octree::node::LoadState;
use crate::octree::{NodeKey, OctreeId};
use crate::point_cloud::{OpenError, PointCloudOctree};
use crate::resource::ResourceClient;
use crate::scheduler::{
    CompletedLoad, LoadError, LoadErrorKind, LoadHandle, LoadResult, LoadScheduler, LoadedPayload,
    ParentPayload, TaskSpawner,
};
use crate::visibility::texture::{visibility_texture_data, VisibilityTexture};
use crate::visibility::{
    update_visibility, ClipSettings, OctreeView, ViewState, VisibilityResult, VisibilitySettings,
};
use futures::future::{self, FutureExt};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Receives decoded nodes, e.g. to upload them to the GPU.
pub trait RenderSink {
    type Handle;

    fn upload(&mut self, key: NodeKey, buffer: &PointBuffer) -> Self::Handle;

    /// Called once the node leaves the cache.
    fn dispose(&mut self, key: NodeKey, handle: Self::Handle);
}

/// Sink for sessions that only read payloads back from the cache.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl RenderSink for NullSink {
    type Handle = ();

    fn upload(&mut self, _key: NodeKey, _buffer: &PointBuffer) {}

    fn dispose(&mut self, _key: NodeKey, _handle: ()) {}
}

pub struct ResidentNode<H> {
    pub payload: Arc<LoadedPayload>,
    pub handle: H,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionStats {
    pub octrees: usize,
    pub resident_nodes: usize,
    pub resident_points: u64,
    pub loads_in_flight: usize,
    pub visible_nodes: usize,
    pub visible_points: u64,
}

pub struct StreamingSession<C, S: RenderSink> {
    config: StreamingConfig,
    octrees: BTreeMap<OctreeId, PointCloudOctree>,
    next_id: u32,
    cache: NodeCache<NodeKey, ResidentNode<S::Handle>>,
    scheduler: LoadScheduler<C>,
    sink: S,
    last: VisibilityResult,
}

impl<C: ResourceClient + 'static, S: RenderSink> StreamingSession<C, S> {
    pub fn new(client: C, config: StreamingConfig, spawner: Arc<dyn TaskSpawner>, sink: S) -> Self {
        Self {
            cache: NodeCache::new(config.cache_point_limit),
            scheduler: LoadScheduler::new(client, config.max_nodes_loading, spawner),
            config,
            octrees: BTreeMap::new(),
            next_id: 0,
            sink,
            last: VisibilityResult::default(),
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &LoadScheduler<C> {
        &self.scheduler
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    pub fn add_octree(&mut self, cloud: PointCloudOctree) -> OctreeId {
        let id = OctreeId(self.next_id);
        self.next_id += 1;
        debug!(octree = id.0, url = cloud.url(), "added octree");
        self.octrees.insert(id, cloud);
        id
    }

    /// Opens the cloud at `url` with the session's client and starts tracking it.
    pub async fn open_octree(&mut self, url: &str) -> Result<OctreeId, OpenError> {
        let cloud = PointCloudOctree::open(url, self.scheduler.client()).await?;
        Ok(self.add_octree(cloud))
    }

    /// Stops tracking an octree: pending loads are cancelled and resident nodes released.
    pub fn remove_octree(&mut self, id: OctreeId) -> Option<PointCloudOctree> {
        let cloud = self.octrees.remove(&id)?;
        self.scheduler.cancel_unwanted(|key| key.octree != id);

        let keys: Vec<NodeKey> = self
            .cache
            .keys_by_age()
            .into_iter()
            .filter(|key| key.octree == id)
            .collect();
        for key in keys {
            if let Some(resident) = self.cache.remove(&key) {
                self.sink.dispose(key, resident.handle);
            }
        }

        debug!(octree = id.0, "removed octree");
        Some(cloud)
    }

    pub fn octree(&self, id: OctreeId) -> Option<&PointCloudOctree> {
        self.octrees.get(&id)
    }

    pub fn octrees(&self) -> impl Iterator<Item = (OctreeId, &PointCloudOctree)> {
        self.octrees.iter().map(|(id, cloud)| (*id, cloud))
    }

    pub fn payload(&self, key: &NodeKey) -> Option<&Arc<LoadedPayload>> {
        self.cache.get(key).map(|resident| &resident.payload)
    }

    pub fn resident(&self, key: &NodeKey) -> Option<&ResidentNode<S::Handle>> {
        self.cache.get(key)
    }

    /// Resident nodes selected by the last update, highest priority first.
    pub fn visible_nodes(&self) -> impl Iterator<Item = (NodeKey, &ResidentNode<S::Handle>)> {
        self.last
            .visible
            .iter()
            .filter_map(|key| self.cache.get(key).map(|resident| (*key, resident)))
    }

    pub fn last_result(&self) -> &VisibilityResult {
        &self.last
    }

    pub fn visibility_texture(&self, id: OctreeId) -> Option<VisibilityTexture> {
        let tree = self.octrees.get(&id)?.octree();
        let names: Vec<&str> = self
            .last
            .visible
            .iter()
            .filter(|key| key.octree == id)
            .filter_map(|key| tree.node(key.node).map(|node| node.name.as_str()))
            .collect();
        Some(visibility_texture_data(&names))
    }

    pub fn in_flight_count(&self) -> usize {
        self.scheduler.in_flight_count()
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            octrees: self.octrees.len(),
            resident_nodes: self.cache.len(),
            resident_points: self.cache.total_cost(),
            loads_in_flight: self.scheduler.in_flight_count(),
            visible_nodes: self.last.visible.len(),
            visible_points: self.last.num_visible_points,
        }
    }

    /// Runs one frame.
    pub fn update(&mut self, view: &ViewState, clip: &ClipSettings) -> &VisibilityResult {
        self.apply_completed();
        self.cache.begin_pass();

        let mut settings = VisibilitySettings::from(&self.config);
        settings.max_loads = self
            .config
            .max_nodes_loading
            .saturating_sub(self.scheduler.in_flight_count());

        let result = {
            let views: Vec<OctreeView<'_>> = self
                .octrees
                .iter()
                .map(|(id, cloud)| OctreeView {
                    id: *id,
                    tree: cloud.octree(),
                    offset: cloud.offset(),
                })
                .collect();
            update_visibility(&views, view, clip, &settings)
        };

        for key in &result.visible {
            self.cache.touch(key);
        }
        for key in &result.to_load {
            self.request_load(*key);
        }

        let wanted: HashSet<NodeKey> = result
            .to_load
            .iter()
            .chain(&result.loading)
            .copied()
            .collect();
        self.scheduler.cancel_unwanted(|key| wanted.contains(key));

        let evicted = self.cache.free_memory();
        self.release(evicted);

        self.last = result;
        &self.last
    }

    /// Installs every finished load, shallow nodes first. Returns how many were taken.
    pub fn apply_completed(&mut self) -> usize {
        let completed = self.scheduler.drain_completed();
        let count = completed.len();
        for load in completed {
            self.install(load);
        }
        count
    }

    fn install(&mut self, load: CompletedLoad) {
        let CompletedLoad { key, result, .. } = load;
        let Some(cloud) = self.octrees.get_mut(&key.octree) else {
            return;
        };

        match result {
            Ok(payload) => {
                if self.cache.contains(&key) {
                    return;
                }
                if let Some(hierarchy) = &payload.hierarchy {
                    if let Err(error) = cloud.apply_hierarchy(key.node, hierarchy) {
                        warn!(octree = key.octree.0, %error, "could not attach hierarchy");
                    }
                }
                let Some(node) = cloud.octree_mut().node_mut(key.node) else {
                    return;
                };
                node.state = LoadState::Loaded;
                node.load_error = None;
                let is_root = node.is_root();
                trace!(node = %node.name, points = payload.buffer.num_points(), "installed node");

                let handle = self.sink.upload(key, &payload.buffer);
                let cost = payload.cost();
                let evicted = self.cache.insert(key, cost, ResidentNode { payload, handle });
                if is_root {
                    self.cache.pin(&key);
                }
                self.release(evicted);
            }
            Err(error) => {
                let Some(node) = cloud.octree_mut().node_mut(key.node) else {
                    return;
                };
                node.load_error = Some(error.kind);
                if error.is_retryable() {
                    node.state = LoadState::Unloaded;
                    if error.kind != LoadErrorKind::Cancelled {
                        node.failed_attempts += 1;
                    }
                    debug!(node = %node.name, kind = ?error.kind, "load will be retried");
                } else {
                    node.state = LoadState::Failed;
                    warn!(node = %node.name, kind = ?error.kind, "node rejected: {}", error.message);
                }
            }
        }
    }

    fn release(&mut self, evicted: Vec<(NodeKey, ResidentNode<S::Handle>)>) {
        for (key, resident) in evicted {
            if let Some(node) = self
                .octrees
                .get_mut(&key.octree)
                .and_then(|cloud| cloud.octree_mut().node_mut(key.node))
            {
                node.state = LoadState::Unloaded;
            }
            self.sink.dispose(key, resident.handle);
        }
    }

    fn request_load(&mut self, key: NodeKey) -> Option<LoadHandle> {
        let cloud = self.octrees.get(&key.octree)?;
        let cache = &self.cache;
        let resident = |key: NodeKey| cache.get(&key).map(|resident| resident.payload.clone());
        let request = cloud.load_request(
            key.octree,
            key.node,
            &resident,
            self.config.inherit_parent_points,
        )?;

        let mut chain = vec![request.key];
        let mut parent = &request.parent;
        while let ParentPayload::Pending(pending) = parent {
            chain.push(pending.key);
            parent = &pending.parent;
        }

        let handle = self.scheduler.ensure_loaded(request);

        if let Some(cloud) = self.octrees.get_mut(&key.octree) {
            for key in chain {
                if let Some(node) = cloud.octree_mut().node_mut(key.node) {
                    if node.state == LoadState::Unloaded {
                        node.state = LoadState::Loading;
                    }
                }
            }
        }

        Some(handle)
    }

    /// Handle on the node's payload, starting its load (and its parents') if needed.
    /// Returns `None` for unknown nodes.
    pub fn ensure_loaded(&mut self, key: NodeKey) -> Option<LoadHandle> {
        // finished loads of the node or its ancestors are installed first
        self.apply_completed();

        let node = self.octrees.get(&key.octree)?.octree().node(key.node)?;
        match node.state {
            LoadState::Failed => {
                let error = LoadError::new(
                    node.load_error.unwrap_or(LoadErrorKind::Malformed),
                    format!("{} was rejected", node.name),
                );
                return Some(future::ready::<LoadResult>(Err(error)).boxed().shared());
            }
            LoadState::Loaded => {
                if let Some(resident) = self.cache.get(&key) {
                    let payload = resident.payload.clone();
                    return Some(future::ready::<LoadResult>(Ok(payload)).boxed().shared());
                }
            }
            _ => {}
        }

        self.request_load(key)
    }
}
