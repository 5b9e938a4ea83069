//! Typed key space of the durable store.

use crate::ResourceName;
use std::fmt;

/// Every key the engine writes, as a tagged union instead of loose strings.
///
/// Keys render as `<namespace>:<suffix>`. The queue, dead letters and
/// session keys are protected: eviction never removes them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
    /// The serialized pending mutation queue
    PendingQueue,
    /// Mutations parked after repeated rejections
    DeadLetters,
    /// The active session, owned by the host application
    Session,
    /// Cached collection for a remote resource
    Collection(ResourceName),
    /// Any other value the host application wants persisted
    Custom(String),
}

const QUEUE: &str = "queue";
const DEAD_LETTERS: &str = "dead_letters";
const SESSION: &str = "session";
const COLLECTION_PREFIX: &str = "collection:";
const CUSTOM_PREFIX: &str = "custom:";

impl StoreKey {
    pub fn collection(resource: impl Into<ResourceName>) -> Self {
        StoreKey::Collection(resource.into())
    }

    pub fn custom(name: impl Into<String>) -> Self {
        StoreKey::Custom(name.into())
    }

    /// Whether eviction must leave this key alone.
    pub fn is_protected(&self) -> bool {
        matches!(
            self,
            StoreKey::PendingQueue | StoreKey::DeadLetters | StoreKey::Session
        )
    }

    /// Render the medium key under `namespace`.
    pub fn render(&self, namespace: &str) -> String {
        format!("{namespace}:{self}")
    }

    /// Parse a medium key back, if it belongs to `namespace`.
    pub fn parse(namespace: &str, raw: &str) -> Option<Self> {
        let suffix = raw.strip_prefix(namespace)?.strip_prefix(':')?;
        match suffix {
            QUEUE => Some(StoreKey::PendingQueue),
            DEAD_LETTERS => Some(StoreKey::DeadLetters),
            SESSION => Some(StoreKey::Session),
            _ => {
                if let Some(resource) = suffix.strip_prefix(COLLECTION_PREFIX) {
                    Some(StoreKey::Collection(resource.to_string()))
                } else {
                    suffix
                        .strip_prefix(CUSTOM_PREFIX)
                        .map(|name| StoreKey::Custom(name.to_string()))
                }
            }
        }
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreKey::PendingQueue => f.write_str(QUEUE),
            StoreKey::DeadLetters => f.write_str(DEAD_LETTERS),
            StoreKey::Session => f.write_str(SESSION),
            StoreKey::Collection(resource) => write!(f, "{COLLECTION_PREFIX}{resource}"),
            StoreKey::Custom(name) => write!(f, "{CUSTOM_PREFIX}{name}"),
        }
    }
}
