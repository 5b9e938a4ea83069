//! Configuration for the sync core.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Default ceiling for the durable store, the usual browser local-storage quota.
pub const DEFAULT_STORAGE_LIMIT_BYTES: usize = 5 * 1024 * 1024;

/// Default number of backend rejections before a mutation is dead-lettered.
pub const DEFAULT_MAX_REJECTIONS: u32 = 5;

/// Default per-request timeout for the HTTP backend.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Sync core configuration.
///
/// Deserializable from a config file, or loaded from `DEPOT_*` environment
/// variables with [`SyncConfig::from_env`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Prefix for every key the store writes
    pub namespace: String,
    /// Assumed capacity of the storage medium
    pub storage_limit_bytes: usize,
    /// Field that identifies a record inside its resource
    pub key_field: String,
    /// Rejections tolerated before a mutation is moved to dead letters
    pub max_rejections: u32,
    /// Interval for probing the backend, if probing is wanted
    pub probe_interval_ms: Option<u64>,
    /// Timeout applied to each remote request
    pub request_timeout_ms: u64,
    /// Refresh touched collections after a drain applied something
    pub refresh_after_drain: bool,
    /// Base URL of the REST backend
    pub backend_url: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: "depot".to_string(),
            storage_limit_bytes: DEFAULT_STORAGE_LIMIT_BYTES,
            key_field: "id".to_string(),
            max_rejections: DEFAULT_MAX_REJECTIONS,
            probe_interval_ms: None,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            refresh_after_drain: true,
            backend_url: None,
        }
    }
}

impl SyncConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(namespace) = lookup("DEPOT_NAMESPACE") {
            config.namespace = namespace;
        }
        if let Some(limit) = lookup("DEPOT_STORAGE_LIMIT_BYTES") {
            config.storage_limit_bytes = parse_var("DEPOT_STORAGE_LIMIT_BYTES", &limit)?;
        }
        if let Some(field) = lookup("DEPOT_KEY_FIELD") {
            config.key_field = field;
        }
        if let Some(max) = lookup("DEPOT_MAX_REJECTIONS") {
            config.max_rejections = parse_var("DEPOT_MAX_REJECTIONS", &max)?;
        }
        if let Some(interval) = lookup("DEPOT_PROBE_INTERVAL_MS") {
            config.probe_interval_ms = Some(parse_var("DEPOT_PROBE_INTERVAL_MS", &interval)?);
        }
        if let Some(timeout) = lookup("DEPOT_REQUEST_TIMEOUT_MS") {
            config.request_timeout_ms = parse_var("DEPOT_REQUEST_TIMEOUT_MS", &timeout)?;
        }
        if let Some(refresh) = lookup("DEPOT_REFRESH_AFTER_DRAIN") {
            config.refresh_after_drain = parse_var("DEPOT_REFRESH_AFTER_DRAIN", &refresh)?;
        }
        config.backend_url = lookup("DEPOT_BACKEND_URL");

        config.validate()?;
        Ok(config)
    }

    /// Check invariants the rest of the engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.namespace.contains(':') {
            return Err(Error::Config(format!(
                "namespace must be non-empty and must not contain ':' (got '{}')",
                self.namespace
            )));
        }
        if self.storage_limit_bytes == 0 {
            return Err(Error::Config("storage limit must be positive".into()));
        }
        if self.key_field.is_empty() {
            return Err(Error::Config("key field must not be empty".into()));
        }
        if self.max_rejections == 0 {
            return Err(Error::Config("max rejections must be at least 1".into()));
        }
        if self.probe_interval_ms == Some(0) {
            return Err(Error::Config("probe interval must be positive".into()));
        }
        Ok(())
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_storage_limit(mut self, bytes: usize) -> Self {
        self.storage_limit_bytes = bytes;
        self
    }

    pub fn with_key_field(mut self, field: impl Into<String>) -> Self {
        self.key_field = field.into();
        self
    }

    pub fn with_max_rejections(mut self, max: u32) -> Self {
        self.max_rejections = max;
        self
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval_ms = Some(interval.as_millis() as u64);
        self
    }

    pub fn with_refresh_after_drain(mut self, refresh: bool) -> Self {
        self.refresh_after_drain = refresh;
        self
    }

    pub fn with_backend_url(mut self, url: impl Into<String>) -> Self {
        self.backend_url = Some(url.into());
        self
    }

    /// Per-request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Probe interval as a [`Duration`], if probing is configured.
    pub fn probe_interval(&self) -> Option<Duration> {
        self.probe_interval_ms.map(Duration::from_millis)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {name}: '{raw}'")))
}
