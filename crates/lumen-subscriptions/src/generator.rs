//! Event generator: joins the change feed with topics, subscriptions, and
//! filters, appends numbered events, and hands NotifyRequests to the
//! dispatcher.
//!
//! The default pool size is one worker, which preserves per-subscription
//! append order end-to-end; larger pools keep numbering contiguous but may
//! interleave appends from concurrent changes.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use lumen_core::{ChangeIngress, ResourceChange};
use lumen_storage::InMemoryStore;

use crate::dispatcher::Dispatcher;
use crate::fieldpath;
use crate::filter;
use crate::registry::SubscriptionRegistry;
use crate::topic::{CompiledTopic, TopicRegistry};
use crate::types::{ContentLevel, NotifyRequest, TriggerInteraction};

pub struct EventGenerator {
    topics: Arc<TopicRegistry>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Dispatcher,
    store: Arc<InMemoryStore>,
}

impl EventGenerator {
    pub fn new(
        topics: Arc<TopicRegistry>,
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Dispatcher,
        store: Arc<InMemoryStore>,
    ) -> Self {
        Self {
            topics,
            registry,
            dispatcher,
            store,
        }
    }

    /// Start the generator pool consuming the ingress feed.
    pub fn spawn(
        self,
        ingress: ChangeIngress,
        workers: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let generator = Arc::new(self);
        let ingress = Arc::new(tokio::sync::Mutex::new(ingress));

        (0..workers.max(1))
            .map(|worker_id| {
                let generator = generator.clone();
                let ingress = ingress.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tracing::debug!(worker_id, "Event generator worker started");
                    loop {
                        let change = {
                            let mut ingress = ingress.lock().await;
                            tokio::select! {
                                biased;
                                changed = shutdown.changed() => {
                                    if changed.is_err() || *shutdown.borrow() {
                                        break;
                                    }
                                    continue;
                                }
                                change = ingress.recv() => change,
                            }
                        };
                        let Some(change) = change else {
                            break;
                        };
                        generator.process_change(&change);
                    }
                    tracing::debug!(worker_id, "Event generator worker stopped");
                })
            })
            .collect()
    }

    /// Evaluate one change against every topic and subscription.
    pub fn process_change(&self, change: &ResourceChange) {
        let interaction = TriggerInteraction::from(change.kind);

        let topics = self
            .topics
            .lookup_for_change(&change.resource_type, interaction);
        if topics.is_empty() {
            return;
        }

        for topic in topics {
            let result = self.topics.evaluate(&topic, change);
            if !result.matched {
                continue;
            }
            tracing::debug!(
                topic = topic.url(),
                resource = %format!("{}/{}", change.resource_type, change.resource_id),
                interaction = interaction.as_str(),
                reason = ?result.reason,
                "Change matched topic"
            );

            for subscription_id in self.registry.subscriptions_for_topic(topic.url()) {
                self.emit_for_subscription(&subscription_id, &topic, change, interaction);
            }
        }
    }

    fn emit_for_subscription(
        &self,
        subscription_id: &str,
        topic: &CompiledTopic,
        change: &ResourceChange,
        interaction: TriggerInteraction,
    ) {
        let Ok(def) = self.registry.definition(subscription_id) else {
            return;
        };

        let Some(candidate) = change.candidate() else {
            return;
        };

        if !filter::matches_filters(&def.filters, &change.resource_type, candidate) {
            tracing::trace!(
                id = %subscription_id,
                "Change did not pass subscription filters"
            );
            return;
        }

        let focus = format!("{}/{}", change.resource_type, change.resource_id);
        let additional_context =
            self.resolve_context(topic, &change.resource_type, candidate);

        let snapshot = (def.channel.content_level == ContentLevel::FullResource)
            .then(|| candidate.clone());

        match self.registry.append_event(
            subscription_id,
            focus,
            additional_context,
            snapshot,
            interaction,
        ) {
            Ok(event_number) => {
                tracing::debug!(
                    id = %subscription_id,
                    event_number,
                    "Subscription event appended"
                );
                self.dispatcher
                    .notify(NotifyRequest::event(subscription_id, vec![event_number]));
            }
            Err(e) => {
                tracing::warn!(id = %subscription_id, error = %e, "Failed to append event");
            }
        }
    }

    /// Resolve notification-shape include hints against the store.
    /// Best-effort: unresolvable references are logged and still carried;
    /// fields that are not references are skipped.
    fn resolve_context(
        &self,
        topic: &CompiledTopic,
        resource_type: &str,
        candidate: &serde_json::Value,
    ) -> Vec<String> {
        let mut references = Vec::new();

        for shape in &topic.def.notification_shape {
            if shape.resource != resource_type {
                continue;
            }
            for include in &shape.include {
                for value in fieldpath::string_values(candidate, include) {
                    if lumen_core::parse_reference(&value).is_err() {
                        tracing::debug!(
                            include = %include,
                            value = %value,
                            "Include hint did not yield a reference, skipped"
                        );
                        continue;
                    }
                    if self.store.resolve(&value).is_none() {
                        tracing::debug!(
                            reference = %value,
                            "Include reference not resolvable in store"
                        );
                    }
                    if !references.contains(&value) {
                        references.push(value);
                    }
                }
            }
        }

        references
    }
}
