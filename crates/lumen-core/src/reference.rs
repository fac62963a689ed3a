//! Local resource references in the `"{Type}/{id}"` form.
//!
//! The subscription engine never holds strong ownership of store records;
//! event logs and notification bundles carry these references instead.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A relative reference to a resource within one tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ResourceRef {
    pub resource_type: String,
    pub id: String,
}

impl ResourceRef {
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.resource_type, self.id)
    }
}

impl From<ResourceRef> for String {
    fn from(r: ResourceRef) -> Self {
        r.to_string()
    }
}

impl TryFrom<String> for ResourceRef {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self> {
        parse_reference(&s)
    }
}

/// Parse a `"Type/id"` reference. Absolute URLs and fragment references are
/// out of scope for the in-process engine and are rejected.
pub fn parse_reference(reference: &str) -> Result<ResourceRef> {
    let mut parts = reference.splitn(2, '/');
    let resource_type = parts.next().unwrap_or_default();
    let id = parts.next().unwrap_or_default();

    if resource_type.is_empty() || id.is_empty() || id.contains('/') {
        return Err(CoreError::InvalidReference(reference.to_string()));
    }

    Ok(ResourceRef::new(resource_type, id))
}
