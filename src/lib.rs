//! Out-of-core streaming of Potree 1.x point clouds.
//!
//! A [`StreamingSession`](session::StreamingSession) tracks any number of
//! octrees. Every frame it picks the nodes worth showing under a point budget,
//! loads missing ones in the background through a [`ResourceClient`](resource::ResourceClient)
//! and keeps the decoded payloads in an LRU cache.

pub mod cache;
pub mod codec;
pub mod config;
pub mod hierarchy;
pub mod metadata;
pub mod octree;
pub mod point;
pub mod point_cloud;
pub mod prelude;
pub mod resource;
pub mod scheduler;
pub mod session;
pub mod visibility;
