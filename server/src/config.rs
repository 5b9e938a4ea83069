//! Configuration management for the server.

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL; records are kept in memory without one
    pub database_url: Option<String>,
    /// Field that identifies a record inside its resource
    pub key_field: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_url: None,
            key_field: "id".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let host = lookup("HOST").unwrap_or(defaults.host);

        let port = match lookup("PORT") {
            Some(port) => port.parse().map_err(|_| ConfigError::InvalidPort)?,
            None => defaults.port,
        };

        let database_url = lookup("DATABASE_URL").filter(|url| !url.is_empty());

        let key_field = lookup("DEPOT_KEY_FIELD").unwrap_or(defaults.key_field);
        if key_field.is_empty() {
            return Err(ConfigError::EmptyKeyField);
        }

        Ok(Self {
            host,
            port,
            database_url,
            key_field,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("DEPOT_KEY_FIELD must not be empty")]
    EmptyKeyField,
}
