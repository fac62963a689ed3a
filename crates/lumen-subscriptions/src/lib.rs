//! Topic-based subscription and notification engine.
//!
//! The engine observes resource mutations in the in-memory store and, for
//! every registered subscription whose topic and filters match, produces
//! ordered event records and delivers notifications over pluggable
//! channels with retries, heartbeats, and lifecycle management.
//!
//! ## Architecture
//!
//! ```text
//! Store write (create/update/delete)
//!        ↓ (synchronous enqueue, bounded)
//! ChangeFeed → EventGenerator
//!        ↓
//! TopicRegistry (compiled query predicates + path expressions)
//!        ↓
//! SubscriptionRegistry (filters, per-subscription event log)
//!        ↓
//! Dispatcher (worker pool, coalescing, retry/backoff, cancellation)
//!        ↓
//! Channels (rest-hook, email, chat-message, websocket)
//! ```
//!
//! In parallel, the `HeartbeatScheduler` scans the registry to emit
//! heartbeats and retire idle or unverified subscriptions. Each tenant
//! owns one isolated engine; the `TenantRegistry` maps tenant ids to
//! engines and tears them down with a drain deadline.

pub mod bundler;
pub mod dispatcher;
pub mod engine;
pub mod error;
mod fieldpath;
pub mod filter;
pub mod generator;
pub mod path;
pub mod query;
pub mod registry;
pub mod scheduler;
pub mod settings;
pub mod topic;
pub mod types;
pub mod valueset;

pub use bundler::NotificationBundler;
pub use dispatcher::{DeliveryChannel, Dispatcher, WebSocketRegistry};
pub use engine::{SubscriptionEngine, TenantInfo, TenantRegistry};
pub use error::{SubscriptionError, SubscriptionResult};
pub use generator::EventGenerator;
pub use query::QueryPredicate;
pub use registry::SubscriptionRegistry;
pub use scheduler::HeartbeatScheduler;
pub use settings::{EngineSettings, SmtpSettings};
pub use topic::loader::{
    is_topic_document, render_subscription, subscription_from_resource, topic_from_document,
};
pub use topic::{CompiledTopic, TopicRegistry};
pub use types::*;
pub use valueset::{StaticValueSetService, UnavailableValueSetService, ValueSetService};
