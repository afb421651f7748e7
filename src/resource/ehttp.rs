use super::{ResourceClient, ResourceError};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Fetches over `ehttp`, which also works in the browser. Bodies arrive in one piece.
#[derive(Clone, Copy, Debug, Default)]
pub struct EhttpClient;

fn build_request(url: &str, headers: Option<BTreeMap<String, String>>) -> ehttp::Request {
    let mut request = ehttp::Request::get(url);
    for (name, value) in headers.unwrap_or_default() {
        request.headers.insert(name, value);
    }
    request
}

#[async_trait]
impl ResourceClient for EhttpClient {
    async fn get(
        &self,
        url: &str,
        headers: Option<BTreeMap<String, String>>,
    ) -> Result<Vec<u8>, ResourceError> {
        let (tx, rx) = futures::channel::oneshot::channel();
        ehttp::fetch(build_request(url, headers), move |response| {
            let _ = tx.send(response);
        });

        let response = rx
            .await
            .map_err(|_| ResourceError::Network("request dropped".to_string()))?
            .map_err(ResourceError::Network)?;

        match response.status {
            404 => Err(ResourceError::NotFound(url.to_string())),
            _ if response.ok => Ok(response.bytes),
            status => Err(ResourceError::Status(status)),
        }
    }
}
