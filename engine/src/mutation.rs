//! Mutation types for expressing changes bound for the backend.
//!
//! Writes made while the backend cannot be reached are recorded as
//! mutations and replayed later, in the order they were made.

use crate::{MutationId, RecordKey, ResourceName, Timestamp};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// What a mutation does to its record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MutationKind::Create => f.write_str("create"),
            MutationKind::Update => f.write_str("update"),
            MutationKind::Delete => f.write_str("delete"),
        }
    }
}

/// A mutation before it has been given an id and a place in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMutation {
    pub kind: MutationKind,
    /// Target remote collection
    pub resource: ResourceName,
    /// Key of the targeted record, when known
    pub key: Option<RecordKey>,
    /// Record data for create/update; the key for delete
    pub payload: Value,
}

impl NewMutation {
    /// A create carrying the full record.
    pub fn create(resource: impl Into<ResourceName>, payload: Value) -> Self {
        Self {
            kind: MutationKind::Create,
            resource: resource.into(),
            key: None,
            payload,
        }
    }

    /// An update of the record under `key` with (partial) `payload`.
    pub fn update(resource: impl Into<ResourceName>, key: impl Into<RecordKey>, payload: Value) -> Self {
        Self {
            kind: MutationKind::Update,
            resource: resource.into(),
            key: Some(key.into()),
            payload,
        }
    }

    /// A delete of the record under `key`.
    pub fn delete(resource: impl Into<ResourceName>, key: impl Into<RecordKey>) -> Self {
        let key = key.into();
        Self {
            kind: MutationKind::Delete,
            resource: resource.into(),
            payload: Value::String(key.clone()),
            key: Some(key),
        }
    }

    /// Attach the record key.
    pub fn with_key(mut self, key: impl Into<RecordKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Reject mutations the backend could never apply.
    pub fn validate(&self) -> Result<()> {
        if self.resource.is_empty() {
            return Err(Error::InvalidMutation("resource name is empty".into()));
        }
        match self.kind {
            MutationKind::Create => {
                if !self.payload.is_object() {
                    return Err(Error::InvalidMutation(
                        "create payload must be an object".into(),
                    ));
                }
            }
            MutationKind::Update => {
                if self.key.is_none() {
                    return Err(Error::InvalidMutation("update requires a record key".into()));
                }
                if !self.payload.is_object() {
                    return Err(Error::InvalidMutation(
                        "update payload must be an object".into(),
                    ));
                }
            }
            MutationKind::Delete => {
                if self.key.is_none() {
                    return Err(Error::InvalidMutation("delete requires a record key".into()));
                }
            }
        }
        Ok(())
    }
}

/// A durably recorded mutation not yet confirmed by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    /// Assigned at enqueue time, stable for the mutation's lifetime
    pub id: MutationId,
    pub kind: MutationKind,
    pub resource: ResourceName,
    #[serde(default)]
    pub key: Option<RecordKey>,
    pub payload: Value,
    /// Monotonic wall-clock stamp; the replay order
    pub enqueued_at: Timestamp,
    /// Times the backend rejected this mutation
    #[serde(default)]
    pub attempts: u32,
    /// Most recent rejection reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl PendingMutation {
    /// Give a new mutation its identity and queue position.
    pub fn from_new(new: NewMutation, id: impl Into<MutationId>, enqueued_at: Timestamp) -> Self {
        Self {
            id: id.into(),
            kind: new.kind,
            resource: new.resource,
            key: new.key,
            payload: new.payload,
            enqueued_at,
            attempts: 0,
            last_error: None,
        }
    }

    /// The `(resource, key)` pair this mutation targets, when the key is known.
    pub fn target(&self) -> Option<(&str, &str)> {
        self.key
            .as_deref()
            .map(|key| (self.resource.as_str(), key))
    }

    /// Whether this mutation and `other` touch the same record.
    pub fn same_record(&self, other: &PendingMutation) -> bool {
        match (self.target(), other.target()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

/// A mutation parked outside the live queue after repeated rejections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub mutation: PendingMutation,
    /// Final rejection reason
    pub reason: String,
    /// When the mutation was parked
    pub parked_at: Timestamp,
}
