//! HTTP client for a remote blob store
//!
//! Talks to a Bee-style raw bytes API:
//!
//! ```text
//! POST {base}/bytes         body: raw bytes   -> {"reference": "<hex hash>"}
//! GET  {base}/bytes/{hash}                    -> raw bytes | 404
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use serde::Deserialize;

use super::{ContentHash, ContentStore};
use crate::error::FeedError;

#[derive(Deserialize)]
struct UploadResponse {
    reference: String,
}

pub struct HttpContentStore {
    base_url: String,
    client: reqwest::Client,
}

impl HttpContentStore {
    pub fn new(base_url: &str) -> Result<Self, FeedError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| FeedError::transport(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(base_url, client))
    }

    pub fn with_client(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    async fn error_from(response: reqwest::Response) -> FeedError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        FeedError::Transport {
            status: Some(status.as_u16()),
            message: if body.is_empty() {
                status.to_string()
            } else {
                body
            },
        }
    }
}

#[async_trait]
impl ContentStore for HttpContentStore {
    async fn upload(&self, data: &[u8]) -> Result<ContentHash, FeedError> {
        let response = self
            .client
            .post(format!("{}/bytes", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(Bytes::copy_from_slice(data))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response).await);
        }

        let body: UploadResponse = response.json().await.map_err(|e| FeedError::Transport {
            status: None,
            message: format!("malformed upload response: {}", e),
        })?;
        let hash: ContentHash = body.reference.parse().map_err(|e| FeedError::Transport {
            status: None,
            message: format!("malformed upload reference: {}", e),
        })?;

        // The store must address content the same way we do
        let expected = ContentHash::of(data);
        if hash != expected {
            return Err(FeedError::Transport {
                status: None,
                message: format!("store returned reference {} for content {}", hash, expected),
            });
        }
        Ok(hash)
    }

    async fn download(&self, hash: &ContentHash) -> Result<Vec<u8>, FeedError> {
        let response = self
            .client
            .get(format!("{}/bytes/{}", self.base_url, hash))
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(FeedError::NotFound(format!("blob {}", hash))),
            status if status.is_success() => {
                let bytes: Bytes = response.bytes().await?;
                log::debug!("downloaded {} bytes for {}", bytes.len(), hash);
                Ok(bytes.to_vec())
            }
            _ => Err(Self::error_from(response).await),
        }
    }
}
