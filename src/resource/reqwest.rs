use super::{ByteStream, ResourceClient, ResourceError};
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use std::collections::BTreeMap;

#[derive(Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn send(
        &self,
        url: &str,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<reqwest::Response, ResourceError> {
        let mut req = self.client.get(url);
        if let Some(hdrs) = headers {
            for (k, v) in hdrs {
                req = req.header(k, v);
            }
        }
        let resp = req.send().await.map_err(|e| ResourceError::Network(e.to_string()))?;
        match resp.status().as_u16() {
            200..=299 => Ok(resp),
            404 => Err(ResourceError::NotFound(url.to_string())),
            status => Err(ResourceError::Status(status)),
        }
    }
}

#[async_trait]
impl ResourceClient for ReqwestClient {
    async fn get(
        &self,
        url: &str,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, ResourceError> {
        let resp = self.send(url, headers).await?;
        Ok(resp.bytes().await.map_err(|e| ResourceError::Network(e.to_string()))?.to_vec())
    }

    async fn get_stream(
        &self,
        url: &str,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<ByteStream, ResourceError> {
        let resp = self.send(url, headers).await?;
        Ok(resp
            .bytes_stream()
            .map_ok(|piece| piece.to_vec())
            .map_err(|e| ResourceError::Network(e.to_string()))
            .boxed())
    }
}
