//! Heartbeat and timeout control loop.
//!
//! One tick scans the registry: due heartbeats are enqueued (exactly one
//! per elapsed period), idle subscriptions are retired at end of life, and
//! `requested` subscriptions that never verified their channel time out.

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;

use lumen_core::now_utc;

use crate::dispatcher::Dispatcher;
use crate::registry::{SchedulerView, SubscriptionRegistry};
use crate::settings::EngineSettings;
use crate::types::{NotifyRequest, SubscriptionStatus};

pub struct HeartbeatScheduler {
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Dispatcher,
    settings: EngineSettings,
}

impl HeartbeatScheduler {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        dispatcher: Dispatcher,
        settings: EngineSettings,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            settings,
        }
    }

    /// Run the tick loop until shutdown.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.settings.scheduler_tick());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!("Heartbeat scheduler started");

            loop {
                tokio::select! {
                    biased;
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        self.tick();
                    }
                }
            }

            tracing::info!("Heartbeat scheduler stopped");
        })
    }

    /// One scan over all subscriptions.
    pub fn tick(&self) {
        let now = now_utc();

        for view in self.registry.scheduler_views() {
            if let Some(action) = classify(&view, now, &self.settings) {
                self.apply(action);
            }
        }
    }

    fn apply(&self, action: TickAction) {
        match action {
            TickAction::Heartbeat(id) => {
                tracing::debug!(id = %id, "Heartbeat due");
                if self.registry.mark_heartbeat_enqueued(&id).is_ok() {
                    self.dispatcher.notify(NotifyRequest::heartbeat(&id));
                }
            }
            TickAction::EndOfLife(id) => {
                tracing::info!(id = %id, "Subscription idle past end of life, turning off");
                let _ = self.registry.set_status(&id, SubscriptionStatus::Off);
                self.dispatcher.cancel_subscription(&id);
            }
            TickAction::HandshakeTimeout(id) => {
                tracing::info!(
                    id = %id,
                    reason = "handshake-timeout",
                    "Subscription never verified, turning off"
                );
                let _ = self.registry.set_status(&id, SubscriptionStatus::Off);
                self.dispatcher.cancel_subscription(&id);
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum TickAction {
    Heartbeat(String),
    EndOfLife(String),
    HandshakeTimeout(String),
}

fn classify(view: &SchedulerView, now: OffsetDateTime, settings: &EngineSettings) -> Option<TickAction> {
    let idle = now - view.last_communication;

    // End of life outranks everything else.
    if view.status != SubscriptionStatus::Off && idle >= settings.end_of_life() {
        return Some(TickAction::EndOfLife(view.id.clone()));
    }

    if view.status == SubscriptionStatus::Requested
        && now - view.created_at >= settings.handshake_timeout()
    {
        return Some(TickAction::HandshakeTimeout(view.id.clone()));
    }

    if view.status == SubscriptionStatus::Active
        && let Some(heartbeat_seconds) = view.heartbeat_seconds
    {
        let period = Duration::from_secs(u64::from(heartbeat_seconds.max(1)));
        // One heartbeat per elapsed period, even while a previous one is
        // still in delivery.
        let since = view
            .last_heartbeat_enqueued
            .map(|enqueued| enqueued.max(view.last_communication))
            .unwrap_or(view.last_communication);
        if now - since >= period {
            return Some(TickAction::Heartbeat(view.id.clone()));
        }
    }

    None
}
