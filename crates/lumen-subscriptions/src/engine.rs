//! Per-tenant engine wiring and the process-wide tenant registry.
//!
//! Each tenant owns an isolated engine: its store, change feed, topic and
//! subscription registries, generator and dispatcher pools, and heartbeat
//! scheduler. Teardown stops the scheduler, drains the dispatcher against a
//! deadline, then discards all logs.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use lumen_core::ChangeFeed;
use lumen_storage::InMemoryStore;

use crate::bundler::NotificationBundler;
use crate::dispatcher::{Dispatcher, WebSocketRegistry, is_sandboxed_endpoint};
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::filter;
use crate::generator::EventGenerator;
use crate::registry::SubscriptionRegistry;
use crate::scheduler::HeartbeatScheduler;
use crate::settings::EngineSettings;
use crate::topic::loader::{render_subscription, subscription_from_resource, topic_from_document};
use crate::topic::{CompiledTopic, TopicRegistry};
use crate::types::{
    ContentLevel, NotificationType, NotifyRequest, StatusSnapshot, SubscriptionDef,
    SubscriptionStatus,
};
use crate::valueset::ValueSetService;

/// Per-tenant identity and content negotiation.
#[derive(Debug, Clone)]
pub struct TenantInfo {
    pub id: String,
    pub base_url: Option<String>,
    pub recognized_content_types: Vec<String>,
}

impl TenantInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: None,
            recognized_content_types: vec![
                "application/fhir+json".to_string(),
                "application/json".to_string(),
            ],
        }
    }
}

pub struct SubscriptionEngine {
    tenant: TenantInfo,
    store: Arc<InMemoryStore>,
    topics: Arc<TopicRegistry>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Dispatcher,
    bundler: NotificationBundler,
    settings: EngineSettings,
    shutdown: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl SubscriptionEngine {
    /// Wire and start an engine for one tenant.
    pub async fn start(
        tenant: TenantInfo,
        settings: EngineSettings,
        value_sets: Arc<dyn ValueSetService>,
    ) -> Arc<Self> {
        let (publisher, ingress) = ChangeFeed::bounded(settings.ingress_queue_capacity);
        let store = Arc::new(InMemoryStore::new(publisher));
        let topics = Arc::new(TopicRegistry::new(value_sets));
        let registry = Arc::new(SubscriptionRegistry::new(settings.event_log_retention));
        let bundler = NotificationBundler::new(store.clone());
        let dispatcher = Dispatcher::new(registry.clone(), bundler.clone(), settings.clone());

        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut tasks = dispatcher.start(shutdown_rx.clone()).await;

        let generator = EventGenerator::new(
            topics.clone(),
            registry.clone(),
            dispatcher.clone(),
            store.clone(),
        );
        tasks.extend(generator.spawn(ingress, settings.generator_workers, shutdown_rx.clone()));

        let scheduler =
            HeartbeatScheduler::new(registry.clone(), dispatcher.clone(), settings.clone());
        tasks.push(scheduler.spawn(shutdown_rx));

        tracing::info!(tenant = %tenant.id, "Subscription engine started");

        Arc::new(Self {
            tenant,
            store,
            topics,
            registry,
            dispatcher,
            bundler,
            settings,
            shutdown,
            tasks: tokio::sync::Mutex::new(tasks),
        })
    }

    pub fn tenant(&self) -> &TenantInfo {
        &self.tenant
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }

    pub fn websockets(&self) -> Arc<WebSocketRegistry> {
        self.dispatcher.websocket_registry()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.topic_count()
    }

    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    /// Load a topic from an authored document (either wire variant).
    /// Re-loading a URL replaces the compiled topic.
    pub fn load_topic(&self, document: &Value) -> SubscriptionResult<Arc<CompiledTopic>> {
        let def = topic_from_document(document)?;
        self.topics.register(def)
    }

    /// Validate and register a subscription resource. Returns the stored
    /// representation; a sandboxed endpoint verifies synchronously and the
    /// representation reports `active`, otherwise a handshake notification
    /// is dispatched and the state is `requested`.
    pub async fn create_subscription(&self, resource: &Value) -> SubscriptionResult<Value> {
        let def = subscription_from_resource(resource)?;
        self.validate_subscription(&def)?;

        let sandboxed = def
            .channel
            .endpoint
            .as_deref()
            .map(is_sandboxed_endpoint)
            .unwrap_or(false);

        let id = self.registry.create(def)?;

        if sandboxed {
            // Synchronous channel verification.
            self.registry
                .record_delivery_success(&id, NotificationType::Handshake)?;
        } else {
            self.dispatcher.notify(NotifyRequest::handshake(&id));
        }

        self.subscription_resource(&id)
    }

    /// Replace a subscription's definition, preserving log and counters.
    pub fn update_subscription(&self, id: &str, resource: &Value) -> SubscriptionResult<Value> {
        if !self.registry.contains(id) {
            return Err(SubscriptionError::SubscriptionNotFound(id.to_string()));
        }
        let def = subscription_from_resource(resource)?;
        self.validate_subscription(&def)?;
        self.registry.update(id, def)?;
        self.subscription_resource(id)
    }

    /// Turn the subscription off, cancel in-flight deliveries, remove it.
    pub fn delete_subscription(&self, id: &str) -> SubscriptionResult<()> {
        if !self.registry.contains(id) {
            return Err(SubscriptionError::SubscriptionNotFound(id.to_string()));
        }
        let _ = self.registry.set_status(id, SubscriptionStatus::Off);
        self.dispatcher.cancel_subscription(id);
        self.registry.remove(id);
        tracing::info!(id = %id, "Subscription deleted");
        Ok(())
    }

    pub fn status(&self, id: &str) -> SubscriptionResult<StatusSnapshot> {
        self.registry.status(id)
    }

    /// The subscription's stored resource representation.
    pub fn subscription_resource(&self, id: &str) -> SubscriptionResult<Value> {
        let def = self.registry.definition(id)?;
        let snapshot = self.registry.status(id)?;
        Ok(render_subscription(&def, id, snapshot.status))
    }

    /// `$status` bundle for one subscription.
    pub fn status_bundle(&self, id: &str) -> SubscriptionResult<Value> {
        let snapshot = self.registry.status(id)?;
        Ok(self.bundler.bundle(
            &snapshot,
            NotificationType::QueryStatus,
            &[],
            ContentLevel::Empty,
        ))
    }

    /// `$events` bundle synthesized from the log. `content` overrides the
    /// subscription's own content level.
    pub fn events_bundle(
        &self,
        id: &str,
        since: Option<u64>,
        until: Option<u64>,
        content: Option<ContentLevel>,
    ) -> SubscriptionResult<Value> {
        let snapshot = self.registry.status(id)?;
        let slots = self.registry.events_in_range(id, since, until)?;
        let content = content.unwrap_or(snapshot.content_level);
        Ok(self
            .bundler
            .bundle(&snapshot, NotificationType::QueryEvent, &slots, content))
    }

    fn validate_subscription(&self, def: &SubscriptionDef) -> SubscriptionResult<()> {
        // Topic must resolve.
        let Some(topic) = self.topics.get(&def.topic_url) else {
            return Err(SubscriptionError::rejected(format!(
                "unknown topic '{}'",
                def.topic_url
            )));
        };

        // Filters must be declared by the topic.
        filter::validate_filters(def, &topic.def)?;

        // Channel code must be known.
        if !self.dispatcher.known_channel(&def.channel.code) {
            return Err(SubscriptionError::rejected(format!(
                "unknown channel code '{}'",
                def.channel.code
            )));
        }

        // Channel-specific endpoint requirements.
        match def.channel.code.as_str() {
            "rest-hook" | "chat-message" => {
                let Some(endpoint) = def.channel.endpoint.as_deref() else {
                    return Err(SubscriptionError::rejected(format!(
                        "{} channel requires an endpoint",
                        def.channel.code
                    )));
                };
                let parsed = url::Url::parse(endpoint).map_err(|e| {
                    SubscriptionError::rejected(format!("invalid endpoint '{endpoint}': {e}"))
                })?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(SubscriptionError::rejected(format!(
                        "endpoint scheme '{}' is not http or https",
                        parsed.scheme()
                    )));
                }
            }
            "email" => {
                if !def
                    .channel
                    .endpoint
                    .as_deref()
                    .map(|e| e.starts_with("mailto:"))
                    .unwrap_or(false)
                {
                    return Err(SubscriptionError::rejected(
                        "email channel requires a mailto: endpoint",
                    ));
                }
            }
            _ => {}
        }

        // Content type must be recognized by the tenant.
        let base_type = def
            .channel
            .content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim();
        if !self
            .tenant
            .recognized_content_types
            .iter()
            .any(|t| t == base_type)
        {
            return Err(SubscriptionError::rejected(format!(
                "content type '{}' is not recognized by tenant '{}'",
                def.channel.content_type, self.tenant.id
            )));
        }

        Ok(())
    }

    /// Stop the heartbeat scheduler, drain workers against the deadline,
    /// then discard all subscription state.
    pub async fn shutdown(&self, deadline: Duration) {
        tracing::info!(tenant = %self.tenant.id, "Subscription engine shutting down");
        let _ = self.shutdown.send(true);

        let mut tasks = self.tasks.lock().await;
        let drain = async {
            for task in tasks.drain(..) {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(deadline, drain).await.is_err() {
            tracing::warn!(tenant = %self.tenant.id, "Engine drain deadline exceeded");
        }

        self.registry.clear();
    }
}

/// Process-wide map of tenant id → engine.
pub struct TenantRegistry {
    engines: DashMap<String, Arc<SubscriptionEngine>>,
    settings: EngineSettings,
    value_sets: Arc<dyn ValueSetService>,
}

impl TenantRegistry {
    pub fn new(settings: EngineSettings, value_sets: Arc<dyn ValueSetService>) -> Self {
        Self {
            engines: DashMap::new(),
            settings,
            value_sets,
        }
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<SubscriptionEngine>> {
        self.engines.get(tenant_id).map(|e| e.value().clone())
    }

    pub async fn get_or_create(&self, tenant: TenantInfo) -> Arc<SubscriptionEngine> {
        if let Some(engine) = self.get(&tenant.id) {
            return engine;
        }
        let engine = SubscriptionEngine::start(
            tenant.clone(),
            self.settings.clone(),
            self.value_sets.clone(),
        )
        .await;
        // Another task may have raced the creation; first insert wins.
        self.engines
            .entry(tenant.id.clone())
            .or_insert(engine)
            .clone()
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        self.engines.iter().map(|e| e.key().clone()).collect()
    }

    /// Tear a tenant down: drain its engine, then drop all of its state.
    pub async fn teardown(&self, tenant_id: &str, deadline: Duration) -> bool {
        let Some((_, engine)) = self.engines.remove(tenant_id) else {
            return false;
        };
        engine.shutdown(deadline).await;
        tracing::info!(tenant = %tenant_id, "Tenant torn down");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::valueset::UnavailableValueSetService;
    use serde_json::json;

    async fn engine() -> Arc<SubscriptionEngine> {
        SubscriptionEngine::start(
            TenantInfo::new("test"),
            EngineSettings::default(),
            Arc::new(UnavailableValueSetService),
        )
        .await
    }

    fn encounter_topic_doc() -> Value {
        json!({
            "resourceType": "SubscriptionTopic",
            "url": "http://example.org/FHIR/SubscriptionTopic/encounter-complete",
            "resourceTrigger": [{
                "resource": "Encounter",
                "supportedInteraction": ["create", "update"],
                "queryCriteria": {
                    "previous": "status:not=completed",
                    "current": "status=completed",
                    "resultForCreate": "test-passes",
                    "resultForDelete": "test-fails",
                    "requireBoth": true
                }
            }],
            "canFilterBy": [{
                "filterParameter": "subject.reference",
                "resource": "Encounter"
            }]
        })
    }

    fn sandbox_subscription() -> Value {
        json!({
            "resourceType": "Subscription",
            "topic": "http://example.org/FHIR/SubscriptionTopic/encounter-complete",
            "channelType": {"code": "rest-hook"},
            "endpoint": "http://example.org/endpoints/test",
            "content": "id-only"
        })
    }

    async fn wait_for_events(
        engine: &SubscriptionEngine,
        id: &str,
        expected: u64,
    ) -> StatusSnapshot {
        for _ in 0..200 {
            let snapshot = engine.status(id).unwrap();
            if snapshot.events_since_start >= expected {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subscription {id} never reached {expected} events");
    }

    #[tokio::test]
    async fn test_sandbox_subscription_verifies_synchronously() {
        let engine = engine().await;
        engine.load_topic(&encounter_topic_doc()).unwrap();

        let stored = engine
            .create_subscription(&sandbox_subscription())
            .await
            .unwrap();
        assert_eq!(stored["status"], "active");
        assert!(stored["id"].is_string());
        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_store_mutation_flows_to_events_bundle() {
        let engine = engine().await;
        engine.load_topic(&encounter_topic_doc()).unwrap();
        let stored = engine
            .create_subscription(&sandbox_subscription())
            .await
            .unwrap();
        let id = stored["id"].as_str().unwrap().to_string();

        engine
            .store()
            .create(json!({"resourceType": "Encounter", "id": "e1", "status": "planned"}))
            .await
            .unwrap();
        engine
            .store()
            .update(
                "Encounter",
                "e1",
                json!({"resourceType": "Encounter", "id": "e1", "status": "completed"}),
            )
            .await
            .unwrap();

        let snapshot = wait_for_events(&engine, &id, 1).await;
        assert_eq!(snapshot.events_since_start, 1);

        let bundle = engine.events_bundle(&id, None, None, None).unwrap();
        let events = bundle["entry"][0]["resource"]["notificationEvent"]
            .as_array()
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["focus"]["reference"], "Encounter/e1");
        assert_eq!(bundle["entry"][0]["resource"]["type"], "query-event");

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_status_bundle_shape() {
        let engine = engine().await;
        engine.load_topic(&encounter_topic_doc()).unwrap();
        let stored = engine
            .create_subscription(&sandbox_subscription())
            .await
            .unwrap();
        let id = stored["id"].as_str().unwrap();

        let bundle = engine.status_bundle(id).unwrap();
        let status = &bundle["entry"][0]["resource"];
        assert_eq!(status["resourceType"], "SubscriptionStatus");
        assert_eq!(status["type"], "query-status");
        assert_eq!(status["status"], "active");
        assert_eq!(
            status["subscription"]["reference"],
            format!("Subscription/{id}")
        );

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_registration_rejections() {
        let engine = engine().await;
        engine.load_topic(&encounter_topic_doc()).unwrap();

        // Unknown topic.
        let mut unknown_topic = sandbox_subscription();
        unknown_topic["topic"] = json!("http://example.org/FHIR/SubscriptionTopic/nope");
        assert!(matches!(
            engine.create_subscription(&unknown_topic).await,
            Err(SubscriptionError::RegistrationRejected(_))
        ));

        // Undeclared filter.
        let mut bad_filter = sandbox_subscription();
        bad_filter["filterBy"] = json!([{
            "resourceType": "Encounter",
            "filterParameter": "status",
            "value": "completed"
        }]);
        assert!(matches!(
            engine.create_subscription(&bad_filter).await,
            Err(SubscriptionError::RegistrationRejected(_))
        ));

        // Unknown channel code.
        let mut bad_channel = sandbox_subscription();
        bad_channel["channelType"] = json!({"code": "carrier-pigeon"});
        assert!(matches!(
            engine.create_subscription(&bad_channel).await,
            Err(SubscriptionError::RegistrationRejected(_))
        ));

        // Non-http endpoint for rest-hook.
        let mut bad_endpoint = sandbox_subscription();
        bad_endpoint["endpoint"] = json!("ftp://example.com/hook");
        assert!(matches!(
            engine.create_subscription(&bad_endpoint).await,
            Err(SubscriptionError::RegistrationRejected(_))
        ));

        // Unrecognized content type.
        let mut bad_content = sandbox_subscription();
        bad_content["contentType"] = json!("application/xml");
        assert!(matches!(
            engine.create_subscription(&bad_content).await,
            Err(SubscriptionError::RegistrationRejected(_))
        ));

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_update_preserves_counters() {
        let engine = engine().await;
        engine.load_topic(&encounter_topic_doc()).unwrap();
        let stored = engine
            .create_subscription(&sandbox_subscription())
            .await
            .unwrap();
        let id = stored["id"].as_str().unwrap().to_string();

        engine
            .store()
            .create(json!({"resourceType": "Encounter", "id": "e1", "status": "completed"}))
            .await
            .unwrap();
        wait_for_events(&engine, &id, 1).await;

        let mut updated = sandbox_subscription();
        updated["content"] = json!("empty");
        engine.update_subscription(&id, &updated).unwrap();

        let snapshot = engine.status(&id).unwrap();
        assert_eq!(snapshot.events_since_start, 1);
        assert_eq!(snapshot.content_level, ContentLevel::Empty);

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_delete_subscription() {
        let engine = engine().await;
        engine.load_topic(&encounter_topic_doc()).unwrap();
        let stored = engine
            .create_subscription(&sandbox_subscription())
            .await
            .unwrap();
        let id = stored["id"].as_str().unwrap().to_string();

        engine.delete_subscription(&id).unwrap();
        assert!(engine.status(&id).is_err());
        assert!(matches!(
            engine.delete_subscription(&id),
            Err(SubscriptionError::SubscriptionNotFound(_))
        ));

        engine.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_tenant_registry_isolation_and_teardown() {
        let tenants = TenantRegistry::new(
            EngineSettings::default(),
            Arc::new(UnavailableValueSetService),
        );

        let a = tenants.get_or_create(TenantInfo::new("a")).await;
        let b = tenants.get_or_create(TenantInfo::new("b")).await;

        a.load_topic(&encounter_topic_doc()).unwrap();
        assert_eq!(a.topic_count(), 1);
        assert_eq!(b.topic_count(), 0);

        assert!(tenants.teardown("a", Duration::from_secs(1)).await);
        assert!(tenants.get("a").is_none());
        assert!(tenants.get("b").is_some());
        assert!(!tenants.teardown("a", Duration::from_secs(1)).await);

        tenants.teardown("b", Duration::from_secs(1)).await;
    }

}
