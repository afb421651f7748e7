//! Concurrency-limited loading of node payloads.
//!
//! Every node has at most one load in flight. Asking for a node that is
//! already loading hands out the same shared handle. A load first awaits its
//! parent's payload, then takes one of the scheduler's permits, fetches the
//! node's hierarchy chunk if it owns one, and streams the point file through
//! the matching decoder. Finished loads are queued until the frame loop
//! drains them.

use crate::codec::partition::{assemble_node_points, inherited_points};
use crate::codec::{decoder_for, CodecError, DecodeTarget, PointBuffer, PointFormat};
use crate::hierarchy::{decode_hierarchy_chunk, HierarchyError, HierarchyNode};
use crate::octree::aabb::Aabb;
use crate::octree::NodeKey;
use crate::resource::{ResourceClient, ResourceError};
use futures::executor::ThreadPool;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, span, trace, warn, Instrument, Level};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LoadErrorKind {
    /// The fetch failed.
    Io,
    /// Header or hierarchy could not be parsed.
    Malformed,
    /// The compressed stream is corrupt.
    DecoderFault,
    /// The stream ended early.
    Truncated,
    /// Skipped before it started, or its parent failed.
    Cancelled,
}

impl LoadErrorKind {
    /// Retryable failures send the node back to unloaded, the others reject it for good.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            LoadErrorKind::Io | LoadErrorKind::Truncated | LoadErrorKind::Cancelled
        )
    }
}

/// Failure of one node load, shared by everyone awaiting it.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{kind:?}: {message}")]
pub struct LoadError {
    pub kind: LoadErrorKind,
    pub message: String,
}

impl LoadError {
    pub fn new(kind: LoadErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<ResourceError> for LoadError {
    fn from(error: ResourceError) -> Self {
        let kind = match error {
            ResourceError::Json(_) => LoadErrorKind::Malformed,
            _ => LoadErrorKind::Io,
        };
        LoadError::new(kind, error.to_string())
    }
}

impl From<CodecError> for LoadError {
    fn from(error: CodecError) -> Self {
        let kind = match error {
            CodecError::Truncated { .. } => LoadErrorKind::Truncated,
            CodecError::DecoderFault(_) => LoadErrorKind::DecoderFault,
            CodecError::MalformedHeader(_)
            | CodecError::Unsupported(_)
            | CodecError::SchemaMismatch(_) => LoadErrorKind::Malformed,
        };
        LoadError::new(kind, error.to_string())
    }
}

impl From<HierarchyError> for LoadError {
    fn from(error: HierarchyError) -> Self {
        LoadError::new(LoadErrorKind::Malformed, error.to_string())
    }
}

/// Hierarchy chunk fetched together with a node's points.
#[derive(Debug, Clone)]
pub struct HierarchyJob {
    pub url: String,
    pub root: HierarchyNode,
    pub step_size: u32,
}

/// Everything a load task needs to know about its node.
#[derive(Debug, Clone)]
pub struct NodeLoadJob {
    pub name: String,
    pub level: u32,
    /// Octant inside the parent.
    pub index: u8,
    pub points_url: String,
    /// The node's box in the frame of the stored positions.
    pub bounding_box: Aabb,
    pub format: Arc<PointFormat>,
    pub hierarchy: Option<HierarchyJob>,
    /// Append the parent's points of this octant to the node's own.
    pub inherit: bool,
}

#[derive(Debug)]
pub enum ParentPayload {
    /// The root, or a node whose parent's points are not needed.
    None,
    Resident(Arc<LoadedPayload>),
    /// The parent must be loaded first.
    Pending(Box<LoadRequest>),
}

#[derive(Debug)]
pub struct LoadRequest {
    pub key: NodeKey,
    pub job: NodeLoadJob,
    pub parent: ParentPayload,
}

/// Decoded points of a node, plus the hierarchy chunk it was responsible for.
#[derive(Debug)]
pub struct LoadedPayload {
    pub buffer: PointBuffer,
    pub hierarchy: Option<Vec<HierarchyNode>>,
}

impl LoadedPayload {
    /// Cache cost, in points.
    pub fn cost(&self) -> u64 {
        self.buffer.num_points() as u64
    }
}

pub type LoadResult = Result<Arc<LoadedPayload>, LoadError>;

/// De-duplicated handle on a load. Every clone resolves to the same result.
pub type LoadHandle = Shared<BoxFuture<'static, LoadResult>>;

#[derive(Debug)]
pub struct CompletedLoad {
    pub key: NodeKey,
    pub level: u32,
    pub result: LoadResult,
}

/// Runs load tasks on the embedding application's executor.
pub trait TaskSpawner: Send + Sync {
    fn spawn_task(&self, task: BoxFuture<'static, ()>);
}

impl TaskSpawner for ThreadPool {
    fn spawn_task(&self, task: BoxFuture<'static, ()>) {
        self.spawn_ok(task);
    }
}

#[cfg(feature = "rt")]
impl TaskSpawner for tokio::runtime::Handle {
    fn spawn_task(&self, task: BoxFuture<'static, ()>) {
        drop(self.spawn(task));
    }
}

struct InFlight {
    handle: LoadHandle,
    cancelled: Arc<AtomicBool>,
    started: Arc<AtomicBool>,
}

struct Inner<C> {
    client: C,
    permits: Semaphore,
    max_concurrent: usize,
    in_flight: Mutex<HashMap<NodeKey, InFlight>>,
    completed: Mutex<Vec<CompletedLoad>>,
    spawner: Arc<dyn TaskSpawner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct LoadScheduler<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for LoadScheduler<C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<C: ResourceClient + 'static> LoadScheduler<C> {
    pub fn new(client: C, max_concurrent: usize, spawner: Arc<dyn TaskSpawner>) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            inner: Arc::new(Inner {
                client,
                permits: Semaphore::new(max_concurrent),
                max_concurrent,
                in_flight: Mutex::new(HashMap::new()),
                completed: Mutex::new(Vec::new()),
                spawner,
            }),
        }
    }

    pub fn client(&self) -> &C {
        &self.inner.client
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.max_concurrent
    }

    /// Starts loading the node unless it is already loading, and returns the
    /// handle of its load. A pending parent is loaded first.
    pub fn ensure_loaded(&self, request: LoadRequest) -> LoadHandle {
        Inner::ensure_loaded(&self.inner, request)
    }

    pub fn is_loading(&self, key: &NodeKey) -> bool {
        lock(&self.inner.in_flight).contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    /// Loads currently holding a permit.
    pub fn active_count(&self) -> usize {
        self.inner.max_concurrent - self.inner.permits.available_permits()
    }

    /// Keeps the load from starting. Returns `false` if there is no such load
    /// or it already started, in which case it runs to completion.
    pub fn cancel(&self, key: &NodeKey) -> bool {
        let in_flight = lock(&self.inner.in_flight);
        match in_flight.get(key) {
            Some(load) if !load.started.load(Ordering::Acquire) => {
                load.cancelled.store(true, Ordering::Release);
                true
            }
            _ => false,
        }
    }

    /// Cancels every load that has not started and is not wanted anymore.
    pub fn cancel_unwanted(&self, wanted: impl Fn(&NodeKey) -> bool) -> usize {
        let in_flight = lock(&self.inner.in_flight);
        let mut cancelled = 0;
        for (key, load) in in_flight.iter() {
            if wanted(key) || load.started.load(Ordering::Acquire) {
                continue;
            }
            if !load.cancelled.swap(true, Ordering::AcqRel) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            trace!(cancelled, "cancelled unwanted loads");
        }
        cancelled
    }

    /// Takes the finished loads, shallow nodes first.
    pub fn drain_completed(&self) -> Vec<CompletedLoad> {
        let mut completed = std::mem::take(&mut *lock(&self.inner.completed));
        completed.sort_by_key(|load| load.level);
        completed
    }
}

impl<C: ResourceClient + 'static> Inner<C> {
    fn ensure_loaded(this: &Arc<Self>, request: LoadRequest) -> LoadHandle {
        let mut in_flight = lock(&this.in_flight);
        if let Some(existing) = in_flight.get(&request.key) {
            existing.cancelled.store(false, Ordering::Release);
            return existing.handle.clone();
        }
        // finished but not drained yet
        if let Some(done) = lock(&this.completed)
            .iter()
            .find(|load| load.key == request.key && load.result.is_ok())
        {
            return future::ready(done.result.clone()).boxed().shared();
        }

        let key = request.key;
        let level = request.job.level;
        let cancelled = Arc::new(AtomicBool::new(false));
        let started = Arc::new(AtomicBool::new(false));

        let load_span = span!(
            Level::DEBUG,
            "load_node",
            node = %request.job.name,
            octree = key.octree.0
        );
        let handle = Self::run(this.clone(), request, cancelled.clone(), started.clone())
            .instrument(load_span)
            .boxed()
            .shared();

        in_flight.insert(
            key,
            InFlight {
                handle: handle.clone(),
                cancelled,
                started,
            },
        );
        drop(in_flight);

        let inner = this.clone();
        let driver = handle.clone();
        this.spawner.spawn_task(
            async move {
                let result = driver.await;
                let mut in_flight = lock(&inner.in_flight);
                in_flight.remove(&key);
                lock(&inner.completed).push(CompletedLoad { key, level, result });
            }
            .boxed(),
        );

        handle
    }

    async fn run(
        this: Arc<Self>,
        request: LoadRequest,
        cancelled: Arc<AtomicBool>,
        started: Arc<AtomicBool>,
    ) -> LoadResult {
        let LoadRequest { job, parent, .. } = request;

        let parent = match parent {
            ParentPayload::None => None,
            ParentPayload::Resident(payload) => Some(payload),
            ParentPayload::Pending(parent) => {
                let parent_name = parent.job.name.clone();
                match Self::ensure_loaded(&this, *parent).await {
                    Ok(payload) => Some(payload),
                    Err(error) => {
                        return Err(LoadError::new(
                            LoadErrorKind::Cancelled,
                            format!("parent {} failed to load: {}", parent_name, error),
                        ));
                    }
                }
            }
        };

        let _permit = this
            .permits
            .acquire()
            .await
            .map_err(|_| LoadError::new(LoadErrorKind::Cancelled, "scheduler closed"))?;

        if cancelled.load(Ordering::Acquire) {
            trace!("load cancelled before it started");
            return Err(LoadError::new(
                LoadErrorKind::Cancelled,
                format!("load of {} was cancelled", job.name),
            ));
        }
        started.store(true, Ordering::Release);

        match fetch_and_decode(&this.client, &job, parent.as_deref()).await {
            Ok(payload) => Ok(Arc::new(payload)),
            Err(error) => {
                warn!(kind = ?error.kind, "{}", error.message);
                Err(error)
            }
        }
    }
}

async fn fetch_and_decode<C: ResourceClient>(
    client: &C,
    job: &NodeLoadJob,
    parent: Option<&LoadedPayload>,
) -> Result<LoadedPayload, LoadError> {
    let hierarchy = match &job.hierarchy {
        Some(hierarchy) => {
            let bytes = client.get(&hierarchy.url, None).await?;
            Some(decode_hierarchy_chunk(&bytes, &hierarchy.root, hierarchy.step_size)?)
        }
        None => None,
    };

    let mut decoder = decoder_for(
        &job.format,
        DecodeTarget {
            bounding_box: job.bounding_box,
        },
    );
    let mut pieces = client.get_stream(&job.points_url, None).await?;
    let mut received = 0;
    while let Some(piece) = pieces.next().await {
        let piece = piece?;
        received += piece.len();
        decoder.push(&piece)?;
    }
    let own = decoder.finish()?;
    let own_points = own.num_points();

    let inherited = match parent {
        Some(parent) if job.inherit => inherited_points(&parent.buffer, job.index as usize),
        _ => None,
    };
    let buffer = assemble_node_points(own, inherited.as_ref())?;

    debug!(
        bytes = received,
        points = own_points,
        inherited = buffer.num_points() - own_points,
        "loaded node"
    );

    Ok(LoadedPayload { buffer, hierarchy })
}
