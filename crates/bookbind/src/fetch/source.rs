use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use tracing::trace;
use url::Url;

use crate::config::HttpConfig;
use crate::error::{AssemblyError, Result};
use crate::playlist::ByteRange;

/// Transport used for playlists and segments.
///
/// Implementations map a non-success status to [`AssemblyError::HttpStatus`] so callers
/// can classify failures with [`AssemblyError::is_retryable`].
#[async_trait]
pub trait RemoteSource: Send + Sync {
    async fn fetch(&self, url: &Url, range: Option<ByteRange>) -> Result<Bytes>;

    async fn fetch_text(&self, url: &Url) -> Result<String> {
        let body = self.fetch(url, None).await?;
        String::from_utf8(body.to_vec())
            .map_err(|e| AssemblyError::malformed(0, format!("playlist is not UTF-8: {e}")))
    }
}

/// [`RemoteSource`] backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
    params: Vec<(String, String)>,
}

impl HttpSource {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        Ok(Self {
            client: config.build_client()?,
            params: config.params.clone(),
        })
    }

    pub fn with_client(client: Client, params: Vec<(String, String)>) -> Self {
        Self { client, params }
    }
}

#[async_trait]
impl RemoteSource for HttpSource {
    async fn fetch(&self, url: &Url, range: Option<ByteRange>) -> Result<Bytes> {
        let mut request = self.client.get(url.clone());
        if !self.params.is_empty() {
            request = request.query(&self.params);
        }
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range.header_value());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(AssemblyError::http_status(status, url.as_str()));
        }

        let body = response.bytes().await?;
        trace!(url = %url, bytes = body.len(), status = %status, "Fetched resource");
        Ok(body)
    }
}
