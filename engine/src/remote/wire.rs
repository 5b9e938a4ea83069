//! REST contract shared by [`HttpBackend`](super::HttpBackend) and the
//! reference server.
//!
//! ```text
//! GET    /health                      -> 200 HealthResponse
//! GET    /resources/{resource}        -> 200 [record, ...]
//! POST   /resources/{resource}        -> 201 record        (upsert by key)
//! PUT    /resources/{resource}/{key}  -> 200 merged record | 404
//! DELETE /resources/{resource}/{key}  -> 204               (also when absent)
//! ```

use serde::{Deserialize, Serialize};

/// Path segment under which resources are served.
pub const RESOURCES_SEGMENT: &str = "resources";

/// Path of the health endpoint.
pub const HEALTH_PATH: &str = "/health";

/// Longest accepted resource name.
pub const MAX_RESOURCE_NAME_LEN: usize = 64;

/// Resource names are `[A-Za-z0-9_-]{1,64}`.
pub fn is_valid_resource_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_RESOURCE_NAME_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Error response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Health check response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
