use super::{ByteStream, ResourceClient, ResourceError};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::io::{ErrorKind, SeekFrom};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Size of the pieces `get_stream` reads files in.
pub const PIECE_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug, Default)]
pub struct FileClient;

fn file_path(url: &str) -> Result<&str, ResourceError> {
    url.strip_prefix("file://").ok_or_else(|| {
        ResourceError::Unsupported("This client supports only file:// urls.".to_string())
    })
}

fn map_io(url: &str, error: std::io::Error) -> ResourceError {
    if error.kind() == ErrorKind::NotFound {
        ResourceError::NotFound(url.to_string())
    } else {
        ResourceError::File(error)
    }
}

#[async_trait]
impl ResourceClient for FileClient {
    async fn get(
        &self,
        url: &str,
        _headers: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, ResourceError> {
        let path = file_path(url)?;
        tokio::fs::read(path).await.map_err(|e| map_io(url, e))
    }

    async fn get_range(
        &self,
        url: &str,
        offset: u64,
        length: usize,
        _headers: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, ResourceError> {
        let path = file_path(url)?;
        let mut file = tokio::fs::File::open(path).await.map_err(|e| map_io(url, e))?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut bytes = vec![0; length];
        file.read_exact(&mut bytes).await?;
        Ok(bytes)
    }

    async fn get_stream(
        &self,
        url: &str,
        _headers: Option<BTreeMap<String, String>>,
    ) -> Result<ByteStream, ResourceError> {
        let path = file_path(url)?;
        let file = tokio::fs::File::open(path).await.map_err(|e| map_io(url, e))?;

        let pieces = stream::try_unfold(file, |mut file| async move {
            let mut piece = vec![0; PIECE_SIZE];
            let read = file.read(&mut piece).await?;
            if read == 0 {
                return Ok::<_, ResourceError>(None);
            }
            piece.truncate(read);
            Ok(Some((piece, file)))
        });
        Ok(pieces.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    #[tokio::test]
    async fn test_read_file_in_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r0.bin");
        let bytes: Vec<u8> = (0..PIECE_SIZE * 2 + 17).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &bytes).unwrap();
        let url = format!("file://{}", path.display());

        let pieces: Vec<Vec<u8>> = FileClient.get_stream(&url, None).await.unwrap().try_collect().await.unwrap();
        assert!(pieces.len() >= 3);
        assert_eq!(pieces.concat(), bytes);

        let range = FileClient.get_range(&url, 10, 5, None).await.unwrap();
        assert_eq!(range, &bytes[10..15]);
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("file://{}", dir.path().join("nope.hrc").display());
        assert!(matches!(FileClient.get(&url, None).await, Err(ResourceError::NotFound(_))));
        assert!(matches!(
            FileClient.get("https://example.com/cloud.js", None).await,
            Err(ResourceError::Unsupported(_))
        ));
    }
}
