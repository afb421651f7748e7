#[cfg(feature = "ehttp")]
pub mod ehttp;

#[cfg(feature = "fs")]
pub mod file;

pub mod memory;

#[cfg(feature = "reqwest")]
pub mod reqwest;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Body of a response, delivered piece by piece as it arrives.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, ResourceError>>;

#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn get(
        &self,
        url: &str,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, ResourceError>;

    async fn get_range(
        &self,
        url: &str,
        offset: u64,
        length: usize,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, ResourceError> {
        // Compute the Range header
        let end = offset
            .checked_add(length as u64)
            .and_then(|v| v.checked_sub(1))
            .ok_or_else(|| ResourceError::Other("Range overflow".into()))?;
        let range_value = format!("bytes={}-{}", offset, end);

        // Merge headers
        let mut all_headers = headers.unwrap_or_default();
        all_headers.insert("Range".to_string(), range_value);

        // Call get() with Range header
        self.get(url, Some(all_headers)).await
    }

    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        url: &str,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<T, ResourceError> {
        let bytes = self.get(url, headers).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Streams the body. Clients that cannot stream return it as a single piece.
    async fn get_stream(
        &self,
        url: &str,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<ByteStream, ResourceError> {
        let bytes = self.get(url, headers).await?;
        Ok(stream::once(async move { Ok(bytes) }).boxed())
    }
}

#[async_trait]
impl<C: ResourceClient> ResourceClient for Arc<C> {
    async fn get(
        &self,
        url: &str,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, ResourceError> {
        (**self).get(url, headers).await
    }

    async fn get_range(
        &self,
        url: &str,
        offset: u64,
        length: usize,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, ResourceError> {
        (**self).get_range(url, offset, length, headers).await
    }

    async fn get_json<T: DeserializeOwned + Send>(
        &self,
        url: &str,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<T, ResourceError> {
        (**self).get_json(url, headers).await
    }

    async fn get_stream(
        &self,
        url: &str,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<ByteStream, ResourceError> {
        (**self).get_stream(url, headers).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unexpected HTTP status code: {0}")]
    Status(u16),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("File error: {0}")]
    File(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),

    #[error("Unsupported scheme: {0}")]
    Unsupported(String),
}

/// Resolves `path` against the directory of `base`, e.g. the location of `cloud.js`.
pub fn join_url(base: &str, path: &str) -> String {
    match base.rfind('/') {
        Some(slash) => format!("{}/{}", &base[..slash], path),
        None => path.to_string(),
    }
}
