//! Stored resource representation.
//!
//! Resources are schemaless JSON documents; the store wraps them in an
//! envelope carrying the version and update metadata it maintains itself.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// A resource as held by the in-memory store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResource {
    pub id: String,
    pub resource_type: String,
    pub version_id: String,
    /// The resource document, including `resourceType`, `id` and `meta`.
    pub resource: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
    /// Soft-delete marker; deleted resources stay addressable for 410s.
    pub deleted: bool,
}

impl StoredResource {
    pub fn new(
        id: impl Into<String>,
        resource_type: impl Into<String>,
        version_id: impl Into<String>,
        resource: Value,
    ) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            version_id: version_id.into(),
            resource,
            last_updated: OffsetDateTime::now_utc(),
            deleted: false,
        }
    }
}

/// Extract the `resourceType` field from a resource document.
pub fn resource_type(resource: &Value) -> Option<&str> {
    resource.get("resourceType").and_then(|v| v.as_str())
}

/// Extract the `id` field from a resource document.
pub fn resource_id(resource: &Value) -> Option<&str> {
    resource.get("id").and_then(|v| v.as_str())
}
