//! In-memory resources, for tests and for clouds assembled at runtime.

use super::{ByteStream, ResourceClient, ResourceError};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Default, Debug)]
struct MemoryStore {
    files: HashMap<String, Arc<Vec<u8>>>,
    fetches: Vec<String>,
}

/// Serves byte buffers keyed by url and records every request.
#[derive(Clone, Debug)]
pub struct MemoryClient {
    store: Arc<Mutex<MemoryStore>>,
    piece_size: usize,
}

impl Default for MemoryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryClient {
    pub fn new() -> Self {
        Self {
            store: Arc::default(),
            piece_size: usize::MAX,
        }
    }

    /// Streams bodies in pieces of at most `piece_size` bytes.
    pub fn with_piece_size(mut self, piece_size: usize) -> Self {
        self.piece_size = piece_size.max(1);
        self
    }

    pub fn insert(&self, url: impl Into<String>, bytes: Vec<u8>) {
        self.lock().files.insert(url.into(), Arc::new(bytes));
    }

    pub fn remove(&self, url: &str) {
        self.lock().files.remove(url);
    }

    /// Every requested url, in request order.
    pub fn fetch_log(&self) -> Vec<String> {
        self.lock().fetches.clone()
    }

    pub fn fetch_count(&self, url: &str) -> usize {
        self.lock().fetches.iter().filter(|f| *f == url).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fetch(&self, url: &str) -> Result<Arc<Vec<u8>>, ResourceError> {
        let mut store = self.lock();
        store.fetches.push(url.to_string());
        store
            .files
            .get(url)
            .cloned()
            .ok_or_else(|| ResourceError::NotFound(url.to_string()))
    }
}

#[async_trait]
impl ResourceClient for MemoryClient {
    async fn get(
        &self,
        url: &str,
        _headers: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, ResourceError> {
        Ok(self.fetch(url)?.as_ref().clone())
    }

    async fn get_range(
        &self,
        url: &str,
        offset: u64,
        length: usize,
        _headers: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, ResourceError> {
        let bytes = self.fetch(url)?;
        let start = offset as usize;
        bytes
            .get(start..start.saturating_add(length))
            .map(<[u8]>::to_vec)
            .ok_or_else(|| ResourceError::Other(format!("range {}+{} out of bounds for {}", offset, length, url)))
    }

    async fn get_stream(
        &self,
        url: &str,
        _headers: Option<BTreeMap<String, String>>,
    ) -> Result<ByteStream, ResourceError> {
        let bytes = self.fetch(url)?;
        let pieces: Vec<Result<Vec<u8>, ResourceError>> =
            bytes.chunks(self.piece_size).map(|piece| Ok(piece.to_vec())).collect();
        Ok(stream::iter(pieces).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::block_on;
    use futures::TryStreamExt;

    #[test]
    fn test_pieces_and_log() {
        let client = MemoryClient::new().with_piece_size(4);
        client.insert("mem://a", (0..10).collect());

        let pieces: Vec<Vec<u8>> =
            block_on(async { client.get_stream("mem://a", None).await.unwrap().try_collect().await.unwrap() });
        assert_eq!(pieces, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]);

        assert_eq!(block_on(client.get_range("mem://a", 2, 3, None)).unwrap(), vec![2, 3, 4]);
        assert!(matches!(block_on(client.get("mem://b", None)), Err(ResourceError::NotFound(_))));

        assert_eq!(client.fetch_count("mem://a"), 2);
        assert_eq!(client.fetch_log(), vec!["mem://a", "mem://a", "mem://b"]);
    }
}
