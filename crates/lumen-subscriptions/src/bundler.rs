//! Notification bundle assembly and serialization.
//!
//! Every notification is a `subscription-notification` Bundle whose first
//! entry is a `SubscriptionStatus` resource; event entries follow in
//! ascending event-number order. Resource bodies appear only at the
//! `full-resource` content level and are resolved from the store at
//! bundling time.

use std::sync::Arc;

use serde_json::{Value, json};

use lumen_core::{format_rfc3339, now_utc};
use lumen_storage::InMemoryStore;

use crate::error::{SubscriptionError, SubscriptionResult};
use crate::types::{ContentLevel, EventSlot, NotificationType, StatusSnapshot, SubscriptionEvent};

/// Builds notification payloads for one tenant engine.
#[derive(Clone)]
pub struct NotificationBundler {
    store: Arc<InMemoryStore>,
}

impl NotificationBundler {
    pub fn new(store: Arc<InMemoryStore>) -> Self {
        Self { store }
    }

    /// Assemble a notification bundle.
    pub fn bundle(
        &self,
        subscription: &StatusSnapshot,
        kind: NotificationType,
        slots: &[EventSlot],
        content: ContentLevel,
    ) -> Value {
        let timestamp = format_rfc3339(now_utc());

        let mut slots: Vec<&EventSlot> = slots.iter().collect();
        slots.sort_by_key(|s| s.event_number());

        let notification_events: Vec<Value> = slots
            .iter()
            .map(|slot| match slot {
                EventSlot::Present(event) => notification_event(event, content),
                EventSlot::Expired(n) => json!({
                    "eventNumber": n.to_string(),
                    "expired": true,
                }),
            })
            .collect();

        let status = json!({
            "resourceType": "SubscriptionStatus",
            "status": subscription.status.as_str(),
            "type": kind.as_str(),
            "eventsSinceSubscriptionStart": subscription.events_since_start.to_string(),
            "notificationEvent": notification_events,
            "subscription": {
                "reference": format!("Subscription/{}", subscription.id)
            },
            "topic": subscription.topic_url,
        });

        let mut entries = vec![json!({
            "fullUrl": format!("urn:uuid:{}", uuid::Uuid::new_v4()),
            "resource": status,
            "request": {
                "method": "GET",
                "url": format!("Subscription/{}/$status", subscription.id)
            },
            "response": {
                "status": "200"
            }
        })];

        if content == ContentLevel::FullResource {
            entries.extend(self.resource_entries(&slots));
        }

        json!({
            "resourceType": "Bundle",
            "type": "subscription-notification",
            "timestamp": timestamp,
            "entry": entries,
        })
    }

    /// Resource body entries, in first-reference order, deduplicated.
    /// Deleted resources become reference-only entries with a 410 response.
    fn resource_entries(&self, slots: &[&EventSlot]) -> Vec<Value> {
        let mut seen = Vec::new();
        let mut entries = Vec::new();

        for slot in slots {
            let EventSlot::Present(event) = slot else {
                continue;
            };

            let references = std::iter::once(&event.focus).chain(event.additional_context.iter());
            for reference in references {
                if seen.contains(reference) {
                    continue;
                }
                seen.push(reference.clone());

                if let Some(body) = self.store.resolve(reference) {
                    entries.push(json!({
                        "fullUrl": reference,
                        "resource": body,
                        "request": {"method": "GET", "url": reference},
                        "response": {"status": "200"}
                    }));
                } else if self.store.is_deleted(reference) {
                    entries.push(json!({
                        "fullUrl": reference,
                        "request": {"method": "GET", "url": reference},
                        "response": {"status": "410"}
                    }));
                } else if reference == &event.focus
                    && let Some(snapshot) = &event.focus_snapshot
                {
                    // The store no longer knows the resource; fall back to
                    // the generation-time snapshot.
                    entries.push(json!({
                        "fullUrl": reference,
                        "resource": snapshot,
                        "request": {"method": "GET", "url": reference},
                        "response": {"status": "200"}
                    }));
                } else {
                    tracing::debug!(
                        reference = %reference,
                        "Referenced resource unavailable at bundling time, omitted"
                    );
                }
            }
        }

        entries
    }

    /// Serialize a bundle in the subscription's configured content type.
    pub fn serialize(&self, bundle: &Value, content_type: &str) -> SubscriptionResult<Vec<u8>> {
        let base = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match base.as_str() {
            "application/fhir+json" | "application/json" => {
                serde_json::to_vec(bundle).map_err(|e| {
                    SubscriptionError::internal(format!("bundle serialization failed: {e}"))
                })
            }
            "text/plain" => serde_json::to_vec_pretty(bundle).map_err(|e| {
                SubscriptionError::internal(format!("bundle serialization failed: {e}"))
            }),
            other => Err(SubscriptionError::validation(format!(
                "unsupported content type '{other}'"
            ))),
        }
    }
}

fn notification_event(event: &SubscriptionEvent, content: ContentLevel) -> Value {
    let mut entry = json!({
        "eventNumber": event.event_number.to_string(),
        "timestamp": format_rfc3339(event.timestamp),
    });

    if content != ContentLevel::Empty {
        entry["focus"] = json!({"reference": event.focus});
        if !event.additional_context.is_empty() {
            entry["additionalContext"] = json!(
                event
                    .additional_context
                    .iter()
                    .map(|r| json!({"reference": r}))
                    .collect::<Vec<_>>()
            );
        }
    }

    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SubscriptionStatus, TriggerInteraction};
    use lumen_core::ChangeFeed;
    use serde_json::json;

    // The ingress half keeps the feed open for store mutations.
    fn bundler_with_store() -> (NotificationBundler, Arc<InMemoryStore>, lumen_core::ChangeIngress) {
        let (publisher, ingress) = ChangeFeed::bounded(64);
        let store = Arc::new(InMemoryStore::new(publisher));
        (NotificationBundler::new(store.clone()), store, ingress)
    }

    fn snapshot(events: u64) -> StatusSnapshot {
        StatusSnapshot {
            id: "s1".into(),
            topic_url: "http://example.org/topics/t".into(),
            status: SubscriptionStatus::Active,
            events_since_start: events,
            error_count: 0,
            last_communication: now_utc(),
            last_error: None,
            content_level: ContentLevel::IdOnly,
        }
    }

    fn event(n: u64, focus: &str) -> EventSlot {
        EventSlot::Present(SubscriptionEvent {
            event_number: n,
            timestamp: now_utc(),
            focus: focus.into(),
            additional_context: vec![],
            focus_snapshot: None,
            interaction: TriggerInteraction::Update,
        })
    }

    #[test]
    fn test_bundle_shape_and_status_entry() {
        let (bundler, _store, _ingress) = bundler_with_store();
        let bundle = bundler.bundle(
            &snapshot(2),
            NotificationType::EventNotification,
            &[event(1, "Patient/p1"), event(2, "Patient/p2")],
            ContentLevel::IdOnly,
        );

        assert_eq!(bundle["resourceType"], "Bundle");
        assert_eq!(bundle["type"], "subscription-notification");

        let status = &bundle["entry"][0]["resource"];
        assert_eq!(status["resourceType"], "SubscriptionStatus");
        assert_eq!(status["type"], "event-notification");
        assert_eq!(status["eventsSinceSubscriptionStart"], "2");
        assert_eq!(status["subscription"]["reference"], "Subscription/s1");
        assert_eq!(status["topic"], "http://example.org/topics/t");
    }

    #[test]
    fn test_events_ascend_by_number() {
        let (bundler, _store, _ingress) = bundler_with_store();
        // Deliberately out of order.
        let bundle = bundler.bundle(
            &snapshot(3),
            NotificationType::EventNotification,
            &[event(3, "Patient/p3"), event(1, "Patient/p1"), event(2, "Patient/p2")],
            ContentLevel::IdOnly,
        );

        let events = bundle["entry"][0]["resource"]["notificationEvent"]
            .as_array()
            .unwrap();
        let numbers: Vec<&str> = events
            .iter()
            .map(|e| e["eventNumber"].as_str().unwrap())
            .collect();
        assert_eq!(numbers, vec!["1", "2", "3"]);
    }

    #[test]
    fn test_empty_level_has_numbers_but_no_references() {
        let (bundler, _store, _ingress) = bundler_with_store();
        let bundle = bundler.bundle(
            &snapshot(1),
            NotificationType::EventNotification,
            &[event(1, "Patient/p1")],
            ContentLevel::Empty,
        );

        let events = bundle["entry"][0]["resource"]["notificationEvent"]
            .as_array()
            .unwrap();
        assert_eq!(events[0]["eventNumber"], "1");
        assert!(events[0]["timestamp"].is_string());
        assert!(events[0].get("focus").is_none());
        assert_eq!(bundle["entry"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_id_only_has_references_but_no_bodies() {
        let (bundler, _store, _ingress) = bundler_with_store();
        let bundle = bundler.bundle(
            &snapshot(1),
            NotificationType::EventNotification,
            &[event(1, "Patient/p1")],
            ContentLevel::IdOnly,
        );

        let events = bundle["entry"][0]["resource"]["notificationEvent"]
            .as_array()
            .unwrap();
        assert_eq!(events[0]["focus"]["reference"], "Patient/p1");
        // No resource body entries beyond the status.
        assert_eq!(bundle["entry"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_full_resource_resolves_bodies_from_store() {
        let (bundler, store, _ingress) = bundler_with_store();
        store
            .create(json!({"resourceType": "Patient", "id": "p1", "name": "Ada"}))
            .await
            .unwrap();

        let bundle = bundler.bundle(
            &snapshot(1),
            NotificationType::EventNotification,
            &[event(1, "Patient/p1")],
            ContentLevel::FullResource,
        );

        let entries = bundle["entry"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1]["fullUrl"], "Patient/p1");
        assert_eq!(entries[1]["resource"]["name"], "Ada");
        assert_eq!(entries[1]["response"]["status"], "200");
    }

    #[tokio::test]
    async fn test_full_resource_marks_deleted_resources() {
        let (bundler, store, _ingress) = bundler_with_store();
        store
            .create(json!({"resourceType": "Patient", "id": "p1"}))
            .await
            .unwrap();
        store.delete("Patient", "p1").await.unwrap();

        let bundle = bundler.bundle(
            &snapshot(1),
            NotificationType::EventNotification,
            &[event(1, "Patient/p1")],
            ContentLevel::FullResource,
        );

        let entries = bundle["entry"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1]["fullUrl"], "Patient/p1");
        assert!(entries[1].get("resource").is_none());
        assert_eq!(entries[1]["response"]["status"], "410");
    }

    #[tokio::test]
    async fn test_full_resource_includes_context_in_first_reference_order() {
        let (bundler, store, _ingress) = bundler_with_store();
        store
            .create(json!({"resourceType": "Encounter", "id": "e1"}))
            .await
            .unwrap();
        store
            .create(json!({"resourceType": "Patient", "id": "p1"}))
            .await
            .unwrap();

        let first = SubscriptionEvent {
            event_number: 1,
            timestamp: now_utc(),
            focus: "Encounter/e1".into(),
            additional_context: vec!["Patient/p1".into()],
            focus_snapshot: None,
            interaction: TriggerInteraction::Update,
        };
        // Same references again; must not duplicate.
        let second = SubscriptionEvent {
            event_number: 2,
            ..first.clone()
        };

        let bundle = bundler.bundle(
            &snapshot(2),
            NotificationType::EventNotification,
            &[EventSlot::Present(first), EventSlot::Present(second)],
            ContentLevel::FullResource,
        );

        let entries = bundle["entry"].as_array().unwrap();
        let full_urls: Vec<&str> = entries[1..]
            .iter()
            .map(|e| e["fullUrl"].as_str().unwrap())
            .collect();
        assert_eq!(full_urls, vec!["Encounter/e1", "Patient/p1"]);
    }

    #[test]
    fn test_heartbeat_bundle_is_status_only() {
        let (bundler, _store, _ingress) = bundler_with_store();
        let bundle = bundler.bundle(
            &snapshot(7),
            NotificationType::Heartbeat,
            &[],
            ContentLevel::IdOnly,
        );

        let status = &bundle["entry"][0]["resource"];
        assert_eq!(status["type"], "heartbeat");
        assert_eq!(status["notificationEvent"].as_array().unwrap().len(), 0);
        assert_eq!(bundle["entry"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_expired_slot_marker() {
        let (bundler, _store, _ingress) = bundler_with_store();
        let bundle = bundler.bundle(
            &snapshot(5),
            NotificationType::QueryEvent,
            &[EventSlot::Expired(1), event(5, "Patient/p5")],
            ContentLevel::IdOnly,
        );

        let events = bundle["entry"][0]["resource"]["notificationEvent"]
            .as_array()
            .unwrap();
        assert_eq!(events[0]["eventNumber"], "1");
        assert_eq!(events[0]["expired"], true);
        assert_eq!(events[1]["eventNumber"], "5");
        assert!(events[1].get("expired").is_none());
    }

    #[test]
    fn test_serialize_content_types() {
        let (bundler, _store, _ingress) = bundler_with_store();
        let bundle = json!({"resourceType": "Bundle"});

        assert!(bundler.serialize(&bundle, "application/fhir+json").is_ok());
        assert!(bundler.serialize(&bundle, "application/json").is_ok());
        assert!(
            bundler
                .serialize(&bundle, "text/plain;attach=application/fhir+json")
                .is_ok()
        );
        assert!(matches!(
            bundler.serialize(&bundle, "application/xml"),
            Err(SubscriptionError::Validation(_))
        ));
    }
}
