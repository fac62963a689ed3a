//! WebSocket push channel.
//!
//! Connected sockets register with the [`WebSocketRegistry`]; delivery is a
//! broadcast of the serialized payload to every connection of the
//! subscription. With no connected client the delivery is retryable, so a
//! briefly-disconnected consumer picks events up on the next attempt.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use super::DeliveryChannel;
use crate::types::{ChannelConfig, DeliveryOutcome};

/// Handle for sending payloads to one connected client.
#[derive(Clone)]
pub struct WebSocketHandle {
    sender: mpsc::Sender<Vec<u8>>,
}

impl WebSocketHandle {
    pub async fn send(&self, payload: Vec<u8>) -> Result<(), mpsc::error::SendError<Vec<u8>>> {
        self.sender.send(payload).await
    }

    fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Registry of live WebSocket connections per subscription.
#[derive(Default)]
pub struct WebSocketRegistry {
    connections: RwLock<HashMap<String, Vec<WebSocketHandle>>>,
}

impl WebSocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; returns the receiving half for the socket
    /// task to forward from.
    pub fn register(&self, subscription_id: &str, buffer: usize) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        self.connections
            .write()
            .entry(subscription_id.to_string())
            .or_default()
            .push(WebSocketHandle { sender: tx });
        tracing::debug!(subscription_id, "WebSocket connection registered");
        rx
    }

    /// Drop closed handles; removes the subscription entry when none remain.
    pub fn prune(&self, subscription_id: &str) {
        let mut connections = self.connections.write();
        if let Some(handles) = connections.get_mut(subscription_id) {
            handles.retain(|h| !h.is_closed());
            if handles.is_empty() {
                connections.remove(subscription_id);
            }
        }
    }

    pub fn connection_count(&self, subscription_id: &str) -> usize {
        self.connections
            .read()
            .get(subscription_id)
            .map(|handles| handles.iter().filter(|h| !h.is_closed()).count())
            .unwrap_or(0)
    }

    fn handles(&self, subscription_id: &str) -> Vec<WebSocketHandle> {
        self.connections
            .read()
            .get(subscription_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Send a payload to every live connection; returns how many received it.
    pub async fn broadcast(&self, subscription_id: &str, payload: &[u8]) -> usize {
        let handles = self.handles(subscription_id);
        let mut delivered = 0;
        for handle in handles {
            if handle.send(payload.to_vec()).await.is_ok() {
                delivered += 1;
            }
        }
        if delivered == 0 {
            self.prune(subscription_id);
        }
        delivered
    }
}

pub struct WebSocketChannel {
    registry: Arc<WebSocketRegistry>,
}

impl WebSocketChannel {
    pub fn new(registry: Arc<WebSocketRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl DeliveryChannel for WebSocketChannel {
    fn code(&self) -> &'static str {
        "websocket"
    }

    async fn deliver(
        &self,
        subscription_id: &str,
        _channel: &ChannelConfig,
        payload: &[u8],
        _content_type: &str,
    ) -> DeliveryOutcome {
        let delivered = self.registry.broadcast(subscription_id, payload).await;
        if delivered > 0 {
            tracing::debug!(subscription_id, clients = delivered, "WebSocket push delivered");
            DeliveryOutcome::ok()
        } else {
            DeliveryOutcome::Retryable("no connected websocket clients".into())
        }
    }
}
