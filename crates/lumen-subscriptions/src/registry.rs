//! Subscription registry: definitions, lifecycle state, counters, and the
//! per-subscription event log.
//!
//! Records live behind per-subscription mutexes inside a sharded map, so
//! event-number allocation is atomic per subscription while operations on
//! distinct subscriptions proceed in parallel.

use std::collections::BTreeMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use time::OffsetDateTime;

use lumen_core::now_utc;

use crate::error::{SubscriptionError, SubscriptionResult};
use crate::types::{
    ContentLevel, EventSlot, NotificationType, StatusSnapshot, SubscriptionDef, SubscriptionEvent,
    SubscriptionStatus, TriggerInteraction,
};

/// One subscription's full runtime state.
#[derive(Debug)]
pub struct SubscriptionRecord {
    pub id: String,
    pub def: SubscriptionDef,
    pub status: SubscriptionStatus,
    /// Total events ever numbered; the allocator. Never decreases.
    pub event_count: u64,
    pub error_count: u32,
    pub last_communication: OffsetDateTime,
    pub created_at: OffsetDateTime,
    /// Enqueue time of the most recent heartbeat, deduplicating scheduler ticks
    pub last_heartbeat_enqueued: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    log: BTreeMap<u64, SubscriptionEvent>,
}

impl SubscriptionRecord {
    fn new(id: String, def: SubscriptionDef) -> Self {
        let now = now_utc();
        Self {
            id,
            def,
            status: SubscriptionStatus::Requested,
            event_count: 0,
            error_count: 0,
            last_communication: now,
            created_at: now,
            last_heartbeat_enqueued: None,
            last_error: None,
            log: BTreeMap::new(),
        }
    }

    fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            id: self.id.clone(),
            topic_url: self.def.topic_url.clone(),
            status: self.status,
            events_since_start: self.event_count,
            error_count: self.error_count,
            last_communication: self.last_communication,
            last_error: self.last_error.clone(),
            content_level: self.def.channel.content_level,
        }
    }
}

/// View the scheduler works from; taken under the record lock, acted on
/// outside it.
#[derive(Debug, Clone)]
pub struct SchedulerView {
    pub id: String,
    pub status: SubscriptionStatus,
    pub heartbeat_seconds: Option<u32>,
    pub last_communication: OffsetDateTime,
    pub last_heartbeat_enqueued: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

/// Registry of subscriptions for one tenant engine.
pub struct SubscriptionRegistry {
    subs: DashMap<String, Arc<Mutex<SubscriptionRecord>>>,
    retention: usize,
}

impl SubscriptionRegistry {
    pub fn new(retention: usize) -> Self {
        Self {
            subs: DashMap::new(),
            retention: retention.max(1),
        }
    }

    /// Insert a validated definition in state `requested`, assigning an id
    /// when the definition carries none. Returns the assigned id.
    pub fn create(&self, mut def: SubscriptionDef) -> SubscriptionResult<String> {
        let id = def
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        def.id = Some(id.clone());

        use dashmap::mapref::entry::Entry;
        match self.subs.entry(id.clone()) {
            Entry::Occupied(_) => Err(SubscriptionError::rejected(format!(
                "subscription '{id}' already exists"
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(Mutex::new(SubscriptionRecord::new(
                    id.clone(),
                    def,
                ))));
                tracing::info!(id = %id, "Subscription created");
                Ok(id)
            }
        }
    }

    /// Replace a subscription's definition, preserving its event log,
    /// counters, and state.
    pub fn update(&self, id: &str, mut def: SubscriptionDef) -> SubscriptionResult<()> {
        let record = self.record(id)?;
        def.id = Some(id.to_string());
        let mut record = record.lock();
        record.def = def;
        tracing::info!(id = %id, "Subscription definition replaced");
        Ok(())
    }

    /// Remove a subscription entirely. The caller is responsible for the
    /// off-transition and delivery cancellation that precede removal.
    pub fn remove(&self, id: &str) -> bool {
        self.subs.remove(id).is_some()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.subs.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn clear(&self) {
        self.subs.clear();
    }

    fn record(&self, id: &str) -> SubscriptionResult<Arc<Mutex<SubscriptionRecord>>> {
        self.subs
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| SubscriptionError::SubscriptionNotFound(id.to_string()))
    }

    pub fn definition(&self, id: &str) -> SubscriptionResult<SubscriptionDef> {
        Ok(self.record(id)?.lock().def.clone())
    }

    pub fn status(&self, id: &str) -> SubscriptionResult<StatusSnapshot> {
        Ok(self.record(id)?.lock().snapshot())
    }

    /// Force a state. Used for `off` on delete/end-of-life/handshake-timeout
    /// and for `internal`-error quarantine.
    pub fn set_status(&self, id: &str, status: SubscriptionStatus) -> SubscriptionResult<()> {
        let record = self.record(id)?;
        let mut record = record.lock();
        if record.status != status {
            tracing::info!(
                id = %id,
                from = record.status.as_str(),
                to = status.as_str(),
                "Subscription state transition"
            );
            record.status = status;
        }
        Ok(())
    }

    /// Ids of event-generating subscriptions for a topic, with their current
    /// state. Subscriptions in `off` never appear.
    pub fn subscriptions_for_topic(&self, topic_url: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .subs
            .iter()
            .filter(|entry| {
                let record = entry.value().lock();
                record.def.topic_url == topic_url && record.status.generates_events()
            })
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Allocate the next event number and append the event, atomically for
    /// this subscription. A `requested` subscription becomes `active` on its
    /// first event. Oldest entries beyond the retention cap are discarded;
    /// their numbers stay reserved.
    pub fn append_event(
        &self,
        id: &str,
        focus: String,
        additional_context: Vec<String>,
        focus_snapshot: Option<Value>,
        interaction: TriggerInteraction,
    ) -> SubscriptionResult<u64> {
        let record = self.record(id)?;
        let mut record = record.lock();

        if record.status == SubscriptionStatus::Off {
            return Err(SubscriptionError::internal(format!(
                "append to subscription '{id}' in state off"
            )));
        }

        record.event_count += 1;
        let event_number = record.event_count;

        let snapshot = if record.def.channel.content_level == ContentLevel::FullResource {
            focus_snapshot
        } else {
            None
        };

        record.log.insert(
            event_number,
            SubscriptionEvent {
                event_number,
                timestamp: now_utc(),
                focus,
                additional_context,
                focus_snapshot: snapshot,
                interaction,
            },
        );

        while record.log.len() > self.retention {
            record.log.pop_first();
        }

        if record.status == SubscriptionStatus::Requested {
            record.status = SubscriptionStatus::Active;
            tracing::info!(id = %id, "Subscription activated by first event");
        }

        Ok(event_number)
    }

    /// Fetch specific event numbers as log slots. Numbers that were pruned
    /// report as expired; numbers never allocated are an internal error.
    pub fn events_by_numbers(
        &self,
        id: &str,
        numbers: &[u64],
    ) -> SubscriptionResult<Vec<EventSlot>> {
        let record = self.record(id)?;
        let record = record.lock();

        numbers
            .iter()
            .map(|n| {
                if *n == 0 || *n > record.event_count {
                    return Err(SubscriptionError::internal(format!(
                        "event {n} was never allocated for subscription '{id}'"
                    )));
                }
                Ok(match record.log.get(n) {
                    Some(event) => EventSlot::Present(event.clone()),
                    None => EventSlot::Expired(*n),
                })
            })
            .collect()
    }

    /// Slots for the `$events` range query: numbers strictly greater than
    /// `since` and at most `until` (both optional), in ascending order.
    pub fn events_in_range(
        &self,
        id: &str,
        since: Option<u64>,
        until: Option<u64>,
    ) -> SubscriptionResult<Vec<EventSlot>> {
        let record = self.record(id)?;
        let record = record.lock();

        let first = since.map(|n| n + 1).unwrap_or(1);
        let last = until.unwrap_or(record.event_count).min(record.event_count);

        Ok((first..=last)
            .map(|n| match record.log.get(&n) {
                Some(event) => EventSlot::Present(event.clone()),
                None => EventSlot::Expired(n),
            })
            .collect())
    }

    /// Account a successful delivery: reset the error counter, stamp the
    /// communication time, and perform the applicable state transitions
    /// (`error → active`; handshake verifies `requested → active`).
    pub fn record_delivery_success(
        &self,
        id: &str,
        kind: NotificationType,
    ) -> SubscriptionResult<()> {
        let record = self.record(id)?;
        let mut record = record.lock();

        record.error_count = 0;
        record.last_error = None;
        record.last_communication = now_utc();

        match record.status {
            SubscriptionStatus::Error => {
                record.status = SubscriptionStatus::Active;
                tracing::info!(id = %id, "Subscription recovered to active");
            }
            SubscriptionStatus::Requested if kind == NotificationType::Handshake => {
                record.status = SubscriptionStatus::Active;
                tracing::info!(id = %id, "Subscription channel verified, now active");
            }
            _ => {}
        }

        Ok(())
    }

    /// Account an exhausted or fatal delivery: one error increment per
    /// NotifyRequest. Returns the resulting state.
    pub fn record_delivery_failure(
        &self,
        id: &str,
        error: &str,
        error_limit: u32,
    ) -> SubscriptionResult<SubscriptionStatus> {
        let record = self.record(id)?;
        let mut record = record.lock();

        record.error_count = record.error_count.saturating_add(1);
        record.last_error = Some(error.to_string());

        if record.error_count >= error_limit {
            record.status = SubscriptionStatus::Off;
            tracing::warn!(
                id = %id,
                error_count = record.error_count,
                "Subscription exceeded error limit, turned off"
            );
        } else if record.status != SubscriptionStatus::Off {
            record.status = SubscriptionStatus::Error;
        }

        Ok(record.status)
    }

    /// Stamp communication time without a delivery, for sandboxed endpoints.
    pub fn touch_communication(&self, id: &str) -> SubscriptionResult<()> {
        let record = self.record(id)?;
        record.lock().last_communication = now_utc();
        Ok(())
    }

    pub fn mark_heartbeat_enqueued(&self, id: &str) -> SubscriptionResult<()> {
        let record = self.record(id)?;
        record.lock().last_heartbeat_enqueued = Some(now_utc());
        Ok(())
    }

    /// Shift a subscription's clocks into the past. Scheduler tests use
    /// this in place of waiting out real intervals.
    #[cfg(test)]
    pub(crate) fn backdate(&self, id: &str, by: time::Duration) {
        if let Some(entry) = self.subs.get(id) {
            let mut record = entry.lock();
            record.last_communication -= by;
            record.created_at -= by;
            if let Some(enqueued) = record.last_heartbeat_enqueued.as_mut() {
                *enqueued -= by;
            }
        }
    }

    /// Per-subscription views for one scheduler tick.
    pub fn scheduler_views(&self) -> Vec<SchedulerView> {
        self.subs
            .iter()
            .map(|entry| {
                let record = entry.value().lock();
                SchedulerView {
                    id: record.id.clone(),
                    status: record.status,
                    heartbeat_seconds: record.def.channel.heartbeat_seconds,
                    last_communication: record.last_communication,
                    last_heartbeat_enqueued: record.last_heartbeat_enqueued,
                    created_at: record.created_at,
                }
            })
            .collect()
    }
}
