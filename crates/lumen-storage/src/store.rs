use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

use lumen_core::{
    ChangePublisher, CoreError, ResourceChange, Result, StoredResource, now_utc, resource_id,
    resource_type,
};

type StorageKey = String; // Format: "ResourceType/id"

fn make_storage_key(resource_type: &str, id: &str) -> StorageKey {
    format!("{resource_type}/{id}")
}

/// In-memory resource store.
///
/// Concurrent access goes through a sharded map; versions come from a
/// process-local counter. Deletes are soft so that later reads can answer
/// 410 Gone and full-resource bundling can mark tombstones.
pub struct InMemoryStore {
    data: DashMap<StorageKey, StoredResource>,
    version_counter: AtomicU64,
    publisher: ChangePublisher,
}

impl InMemoryStore {
    pub fn new(publisher: ChangePublisher) -> Self {
        Self {
            data: DashMap::new(),
            version_counter: AtomicU64::new(1),
            publisher,
        }
    }

    fn next_version(&self) -> String {
        self.version_counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
    }

    /// Create a resource. Assigns an id when the document carries none;
    /// conflicts on an existing live id. The change is on the feed before
    /// this returns.
    pub async fn create(&self, mut resource: Value) -> Result<StoredResource> {
        let rtype = resource_type(&resource)
            .ok_or_else(|| CoreError::invalid_resource("missing resourceType"))?
            .to_string();

        let id = match resource_id(&resource) {
            Some(id) => id.to_string(),
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                resource["id"] = Value::String(id.clone());
                id
            }
        };

        let key = make_storage_key(&rtype, &id);
        let version = self.next_version();
        stamp_meta(&mut resource, &version);

        let stored = StoredResource::new(&id, &rtype, &version, resource.clone());

        {
            use dashmap::mapref::entry::Entry;
            match self.data.entry(key) {
                Entry::Occupied(mut occupied) if occupied.get().deleted => {
                    occupied.insert(stored.clone());
                }
                Entry::Occupied(_) => {
                    return Err(CoreError::resource_conflict(rtype, id));
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(stored.clone());
                }
            }
        }

        tracing::debug!(resource_type = %rtype, id = %id, version = %version, "Resource created");

        self.publisher
            .publish(ResourceChange::created(rtype, id, resource))
            .await?;

        Ok(stored)
    }

    /// Read a live resource. Deleted resources surface as `ResourceDeleted`.
    pub fn read(&self, rtype: &str, id: &str) -> Result<Option<StoredResource>> {
        let key = make_storage_key(rtype, id);
        match self.data.get(&key) {
            Some(entry) if entry.deleted => Err(CoreError::resource_deleted(rtype, id)),
            Some(entry) => Ok(Some(entry.clone())),
            None => Ok(None),
        }
    }

    /// Update an existing resource. The change carries both the previous
    /// and the new body and is on the feed before this returns.
    pub async fn update(&self, rtype: &str, id: &str, mut resource: Value) -> Result<StoredResource> {
        let doc_type = resource_type(&resource)
            .ok_or_else(|| CoreError::invalid_resource("missing resourceType"))?;
        if doc_type != rtype {
            return Err(CoreError::invalid_resource(format!(
                "resourceType mismatch: body says {doc_type}, path says {rtype}"
            )));
        }
        resource["id"] = Value::String(id.to_string());

        let key = make_storage_key(rtype, id);
        let version = self.next_version();
        stamp_meta(&mut resource, &version);

        let previous = {
            let mut entry = self
                .data
                .get_mut(&key)
                .ok_or_else(|| CoreError::resource_not_found(rtype, id))?;
            if entry.deleted {
                return Err(CoreError::resource_deleted(rtype, id));
            }
            let previous = entry.resource.clone();
            entry.resource = resource.clone();
            entry.version_id = version.clone();
            entry.last_updated = now_utc();
            previous
        };

        tracing::debug!(resource_type = %rtype, id = %id, version = %version, "Resource updated");

        self.publisher
            .publish(ResourceChange::updated(rtype, id, previous, resource.clone()))
            .await?;

        self.read(rtype, id)?
            .ok_or_else(|| CoreError::resource_not_found(rtype, id))
    }

    /// Soft-delete a resource. The change carries the previous body.
    pub async fn delete(&self, rtype: &str, id: &str) -> Result<()> {
        let key = make_storage_key(rtype, id);

        let previous = {
            let mut entry = self
                .data
                .get_mut(&key)
                .ok_or_else(|| CoreError::resource_not_found(rtype, id))?;
            if entry.deleted {
                return Err(CoreError::resource_deleted(rtype, id));
            }
            entry.deleted = true;
            entry.last_updated = now_utc();
            entry.resource.clone()
        };

        tracing::debug!(resource_type = %rtype, id = %id, "Resource deleted");

        self.publisher
            .publish(ResourceChange::deleted(rtype, id, previous))
            .await?;

        Ok(())
    }

    /// Resolve a `"Type/id"` reference to a live resource body, if any.
    /// Used for notification-shape includes and full-resource bundling.
    pub fn resolve(&self, reference: &str) -> Option<Value> {
        let entry = self.data.get(reference)?;
        if entry.deleted {
            None
        } else {
            Some(entry.resource.clone())
        }
    }

    /// Whether a reference points at a resource that existed and was deleted.
    pub fn is_deleted(&self, reference: &str) -> bool {
        self.data.get(reference).map(|e| e.deleted).unwrap_or(false)
    }

    /// All live resources of one type, unordered.
    pub fn list(&self, rtype: &str) -> Vec<StoredResource> {
        let prefix = format!("{rtype}/");
        self.data
            .iter()
            .filter(|entry| entry.key().starts_with(&prefix) && !entry.deleted)
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.data.iter().filter(|e| !e.deleted).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn stamp_meta(resource: &mut Value, version: &str) {
    let meta = resource
        .as_object_mut()
        .map(|obj| obj.entry("meta").or_insert_with(|| Value::Object(Default::default())));
    if let Some(meta) = meta
        && let Some(meta) = meta.as_object_mut()
    {
        meta.insert("versionId".into(), Value::String(version.to_string()));
        meta.insert(
            "lastUpdated".into(),
            Value::String(lumen_core::format_rfc3339(now_utc())),
        );
    }
}
