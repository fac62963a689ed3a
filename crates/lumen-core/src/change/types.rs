use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

/// Kind of resource mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One normalized store mutation: `(kind, resourceType, previous, current)`.
///
/// `previous` is present for update/delete; `current` for create/update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceChange {
    pub kind: ChangeKind,
    pub resource_type: String,
    pub resource_id: String,
    /// Resource body before the mutation (update/delete).
    pub previous: Option<Value>,
    /// Resource body after the mutation (create/update).
    pub current: Option<Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl ResourceChange {
    pub fn created(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        current: Value,
    ) -> Self {
        Self {
            kind: ChangeKind::Create,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            previous: None,
            current: Some(current),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn updated(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        previous: Value,
        current: Value,
    ) -> Self {
        Self {
            kind: ChangeKind::Update,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            previous: Some(previous),
            current: Some(current),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn deleted(
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        previous: Value,
    ) -> Self {
        Self {
            kind: ChangeKind::Delete,
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            previous: Some(previous),
            current: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    /// The resource body a subscription filter should be evaluated against:
    /// `current` for create/update, `previous` for delete.
    pub fn candidate(&self) -> Option<&Value> {
        match self.kind {
            ChangeKind::Create | ChangeKind::Update => self.current.as_ref(),
            ChangeKind::Delete => self.previous.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_kind_display() {
        assert_eq!(ChangeKind::Create.to_string(), "create");
        assert_eq!(ChangeKind::Update.to_string(), "update");
        assert_eq!(ChangeKind::Delete.to_string(), "delete");
    }

    #[test]
    fn test_created_change() {
        let change = ResourceChange::created("Patient", "p1", json!({"id": "p1"}));
        assert_eq!(change.kind, ChangeKind::Create);
        assert!(change.previous.is_none());
        assert!(change.current.is_some());
        assert_eq!(change.candidate().unwrap()["id"], "p1");
    }

    #[test]
    fn test_updated_change() {
        let change = ResourceChange::updated(
            "Encounter",
            "e1",
            json!({"status": "planned"}),
            json!({"status": "completed"}),
        );
        assert_eq!(change.kind, ChangeKind::Update);
        assert_eq!(change.previous.as_ref().unwrap()["status"], "planned");
        assert_eq!(change.candidate().unwrap()["status"], "completed");
    }

    #[test]
    fn test_deleted_change_candidate_is_previous() {
        let change = ResourceChange::deleted("Patient", "p1", json!({"id": "p1"}));
        assert_eq!(change.kind, ChangeKind::Delete);
        assert!(change.current.is_none());
        assert_eq!(change.candidate().unwrap()["id"], "p1");
    }

    #[test]
    fn test_serialization_roundtrip() {
        let change = ResourceChange::created("Patient", "p1", json!({"id": "p1"}));
        let json = serde_json::to_string(&change).unwrap();
        let parsed: ResourceChange = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.resource_type, "Patient");
        assert_eq!(parsed.kind, ChangeKind::Create);
    }
}
