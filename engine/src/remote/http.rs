//! HTTP backend speaking the REST contract in [`wire`](super::wire).

use super::wire::{ErrorBody, HEALTH_PATH, RESOURCES_SEGMENT};
use super::{RemoteBackend, RemoteError};
use crate::{Error, SyncConfig};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, Url};
use serde_json::Value;
use std::time::Duration;

/// A [`RemoteBackend`] over HTTP.
///
/// Connection failures, timeouts, 408, 429 and 5xx are transient; any other
/// non-success status is a rejection.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    base: Url,
}

impl HttpBackend {
    /// Create a backend rooted at `base_url` with a per-request `timeout`.
    pub fn new(base_url: &str, timeout: Duration) -> crate::Result<Self> {
        let base = Url::parse(base_url)
            .map_err(|e| Error::Config(format!("invalid backend url '{base_url}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "backend url '{base_url}' cannot carry paths"
            )));
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {e}")))?;

        Ok(Self { client, base })
    }

    /// Create a backend from `backend_url` and `request_timeout_ms`.
    pub fn from_config(config: &SyncConfig) -> crate::Result<Self> {
        let url = config
            .backend_url
            .as_deref()
            .ok_or_else(|| Error::Config("backend url is not configured".into()))?;
        Self::new(url, config.request_timeout())
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = request.send().await.map_err(classify)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorBody>(&text)
            .map(|body| body.error)
            .unwrap_or(text);
        Err(RemoteError::from_status(status.as_u16(), message))
    }
}

fn classify(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Timeout
    } else {
        RemoteError::Network(err.to_string())
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn fetch_all(&self, resource: &str) -> Result<Vec<Value>, RemoteError> {
        let url = self.endpoint(&[RESOURCES_SEGMENT, resource]);
        let response = self.send(self.client.get(url)).await?;
        response.json().await.map_err(classify)
    }

    async fn insert(&self, resource: &str, payload: &Value) -> Result<(), RemoteError> {
        let url = self.endpoint(&[RESOURCES_SEGMENT, resource]);
        self.send(self.client.post(url).json(payload)).await?;
        Ok(())
    }

    async fn update(&self, resource: &str, key: &str, payload: &Value) -> Result<(), RemoteError> {
        let url = self.endpoint(&[RESOURCES_SEGMENT, resource, key]);
        self.send(self.client.put(url).json(payload)).await?;
        Ok(())
    }

    async fn delete(&self, resource: &str, key: &str) -> Result<(), RemoteError> {
        let url = self.endpoint(&[RESOURCES_SEGMENT, resource, key]);
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn probe(&self) -> Result<(), RemoteError> {
        let url = self.endpoint(&[HEALTH_PATH.trim_start_matches('/')]);
        self.send(self.client.get(url)).await?;
        Ok(())
    }
}
