//! Core types for topic-based subscriptions.
//!
//! These are the parsed, validated forms used for runtime matching and
//! delivery; the wire shapes they are loaded from live in [`crate::loader`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use time::OffsetDateTime;

use lumen_core::ChangeKind;

// =============================================================================
// TOPIC TYPES
// =============================================================================

/// A subscription topic definition: which record changes are "interesting".
#[derive(Debug, Clone)]
pub struct TopicDef {
    /// Canonical URL identifying the topic
    pub url: String,

    /// Human-readable title
    pub title: Option<String>,

    /// Resource triggers; disjunctive within the topic
    pub triggers: Vec<TriggerDef>,

    /// Filter parameters subscribers may use, per resource type
    pub can_filter_by: Vec<FilterDefinition>,

    /// Dependent-resource include hints for notification payloads
    pub notification_shape: Vec<NotificationShape>,
}

impl TopicDef {
    /// Filter parameter names allowed for a resource type (including
    /// definitions without a resource scope, which apply to any type).
    pub fn allowed_filter_params(&self, resource_type: &str) -> Vec<&str> {
        self.can_filter_by
            .iter()
            .filter(|f| {
                f.resource
                    .as_deref()
                    .map(|r| r == resource_type || r == "*")
                    .unwrap_or(true)
            })
            .map(|f| f.filter_parameter.as_str())
            .collect()
    }
}

/// One resource trigger: interaction set plus optional predicates.
#[derive(Debug, Clone)]
pub struct TriggerDef {
    /// Resource type this trigger observes (e.g. "Encounter")
    pub resource_type: String,

    /// Interactions that can fire this trigger
    pub interactions: Vec<TriggerInteraction>,

    /// Query-style criteria over previous/current versions
    pub query_criteria: Option<QueryCriteria>,

    /// Path-expression criterion (see [`crate::path`])
    pub path_criteria: Option<String>,

    pub description: Option<String>,
}

/// Query-style criteria for a resource trigger.
#[derive(Debug, Clone, Default)]
pub struct QueryCriteria {
    /// Query string evaluated against the previous version
    pub previous: Option<String>,

    /// Query string evaluated against the current version
    pub current: Option<String>,

    /// Whether a create (no previous version) passes the previous test
    pub result_for_create: QueryResultBehavior,

    /// Whether a delete (no current version) passes the current test
    pub result_for_delete: QueryResultBehavior,

    /// Whether both previous and current tests must pass; with `false`,
    /// either suffices. Also reconciles query vs. path criteria.
    pub require_both: bool,
}

/// Behavior of a query test for the interaction that removes one side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryResultBehavior {
    #[default]
    Passes,
    Fails,
}

/// Types of resource interactions that can trigger a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerInteraction {
    Create,
    Update,
    Delete,
}

impl TriggerInteraction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl From<&str> for TriggerInteraction {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "create" => Self::Create,
            "delete" => Self::Delete,
            _ => Self::Update,
        }
    }
}

impl From<ChangeKind> for TriggerInteraction {
    fn from(kind: ChangeKind) -> Self {
        match kind {
            ChangeKind::Create => Self::Create,
            ChangeKind::Update => Self::Update,
            ChangeKind::Delete => Self::Delete,
        }
    }
}

/// Filter definition: what filter parameters subscribers can apply.
#[derive(Debug, Clone)]
pub struct FilterDefinition {
    /// Parameter name
    pub filter_parameter: String,

    /// Resource type the parameter applies to; `None` means any
    pub resource: Option<String>,

    pub description: Option<String>,
}

/// Notification shape: dependent resources to include in notifications.
#[derive(Debug, Clone)]
pub struct NotificationShape {
    /// Resource type this shape applies to
    pub resource: String,

    /// Reference-valued fields of the focus resource to resolve and include
    pub include: Vec<String>,
}

/// Why a topic matched (or did not match) a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchReason {
    Query,
    Path,
    Both,
    None,
}

/// Result of evaluating a topic against a change.
#[derive(Debug, Clone, Copy)]
pub struct TopicMatch {
    pub matched: bool,
    pub reason: MatchReason,
}

impl TopicMatch {
    pub fn no_match() -> Self {
        Self {
            matched: false,
            reason: MatchReason::None,
        }
    }
}

// =============================================================================
// SUBSCRIPTION TYPES
// =============================================================================

/// A subscriber's standing request for notifications about a topic.
#[derive(Debug, Clone)]
pub struct SubscriptionDef {
    /// Assigned on create when absent
    pub id: Option<String>,

    /// Canonical URL of the referenced topic
    pub topic_url: String,

    /// Filters keyed by resource type; `"*"` applies to any type.
    /// Clauses of the same name are disjunctive, distinct names conjunctive.
    pub filters: HashMap<String, Vec<FilterClause>>,

    /// Channel configuration
    pub channel: ChannelConfig,
}

/// One subscriber filter clause.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterClause {
    pub name: String,
    pub comparator: FilterComparator,
    pub modifier: Option<FilterModifier>,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterComparator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl FilterComparator {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(Self::Eq),
            "ne" => Some(Self::Ne),
            "gt" => Some(Self::Gt),
            "ge" => Some(Self::Ge),
            "lt" => Some(Self::Lt),
            "le" => Some(Self::Le),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterModifier {
    /// Substring match instead of case-sensitive equality
    Contains,
    /// Field absence test; value "true"/"false"
    Missing,
}

impl FilterModifier {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "contains" => Some(Self::Contains),
            "missing" => Some(Self::Missing),
            _ => None,
        }
    }
}

/// Channel configuration for notification delivery.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Channel system URL (informational)
    pub system: Option<String>,

    /// Channel code: `rest-hook`, `email`, `chat-message`, `websocket`
    pub code: String,

    /// Delivery endpoint; absent for websocket channels
    pub endpoint: Option<String>,

    /// Extra headers for HTTP-based channels
    pub headers: Vec<(String, String)>,

    /// Payload MIME type
    pub content_type: String,

    /// How much resource content notifications carry
    pub content_level: ContentLevel,

    /// Idle period after which a heartbeat notification is due
    pub heartbeat_seconds: Option<u32>,

    /// Per-delivery-attempt timeout
    pub timeout_seconds: u32,

    /// Upper bound on events coalesced into one notification;
    /// absent means one event per notification
    pub max_events_per_notification: Option<u32>,
}

pub const DEFAULT_TIMEOUT_SECONDS: u32 = 30;
pub const DEFAULT_CONTENT_TYPE: &str = "application/fhir+json";

impl ChannelConfig {
    pub fn rest_hook(endpoint: impl Into<String>) -> Self {
        Self {
            system: None,
            code: "rest-hook".to_string(),
            endpoint: Some(endpoint.into()),
            headers: Vec::new(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            content_level: ContentLevel::default(),
            heartbeat_seconds: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            max_events_per_notification: None,
        }
    }

    /// Effective batch size; at least one.
    pub fn batch_limit(&self) -> usize {
        self.max_events_per_notification.map(|n| n.max(1)).unwrap_or(1) as usize
    }
}

/// Content level of a notification payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentLevel {
    /// Status metadata and event numbers only
    Empty,
    /// Status plus focus/context references
    #[default]
    IdOnly,
    /// References plus resource bodies resolved at bundling time
    FullResource,
}

impl ContentLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Empty => "empty",
            Self::IdOnly => "id-only",
            Self::FullResource => "full-resource",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "empty" => Some(Self::Empty),
            "id-only" => Some(Self::IdOnly),
            "full-resource" => Some(Self::FullResource),
            _ => None,
        }
    }
}

/// Subscription lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    /// Created, channel not yet verified and no event emitted
    Requested,
    /// Receiving notifications
    Active,
    /// Delivery failures recorded; still generating events
    Error,
    /// Terminal: generates nothing, dispatches nothing
    Off,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Active => "active",
            Self::Error => "error",
            Self::Off => "off",
        }
    }

    /// Whether this subscription still produces events.
    pub fn generates_events(&self) -> bool {
        matches!(self, Self::Requested | Self::Active | Self::Error)
    }
}

impl From<&str> for SubscriptionStatus {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "active" => Self::Active,
            "error" => Self::Error,
            "off" => Self::Off,
            _ => Self::Requested,
        }
    }
}

// =============================================================================
// EVENT & NOTIFICATION TYPES
// =============================================================================

/// One notification-worthy occurrence in a subscription's log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionEvent {
    /// Per-subscription monotonic number, starting at 1
    pub event_number: u64,

    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,

    /// `"{Type}/{id}"` reference to the resource that fired the trigger
    pub focus: String,

    /// Resolved notification-shape references
    pub additional_context: Vec<String>,

    /// Resource body at generation time; retained iff the subscription's
    /// content level is full-resource
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus_snapshot: Option<Value>,

    /// Interaction that produced the event
    pub interaction: TriggerInteraction,
}

/// A log slot addressed by event number: present, or aged out.
#[derive(Debug, Clone)]
pub enum EventSlot {
    Present(SubscriptionEvent),
    Expired(u64),
}

impl EventSlot {
    pub fn event_number(&self) -> u64 {
        match self {
            Self::Present(e) => e.event_number,
            Self::Expired(n) => *n,
        }
    }
}

/// Notification type vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationType {
    /// Channel verification on subscription creation
    Handshake,
    /// Periodic liveness signal
    Heartbeat,
    /// Actual event notification
    EventNotification,
    /// `$status` response
    QueryStatus,
    /// `$events` response
    QueryEvent,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Handshake => "handshake",
            Self::Heartbeat => "heartbeat",
            Self::EventNotification => "event-notification",
            Self::QueryStatus => "query-status",
            Self::QueryEvent => "query-event",
        }
    }
}

/// Request for the dispatcher to deliver events to a subscription.
#[derive(Debug, Clone)]
pub struct NotifyRequest {
    pub subscription_id: String,
    pub kind: NotificationType,
    pub event_numbers: Vec<u64>,
}

impl NotifyRequest {
    pub fn event(subscription_id: impl Into<String>, event_numbers: Vec<u64>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            kind: NotificationType::EventNotification,
            event_numbers,
        }
    }

    pub fn heartbeat(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            kind: NotificationType::Heartbeat,
            event_numbers: Vec::new(),
        }
    }

    pub fn handshake(subscription_id: impl Into<String>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            kind: NotificationType::Handshake,
            event_numbers: Vec::new(),
        }
    }
}

/// Outcome of one delivery attempt on a channel.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    Ok { http_status: Option<u16> },
    Retryable(String),
    Fatal(String),
}

impl DeliveryOutcome {
    pub fn ok() -> Self {
        Self::Ok { http_status: None }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }
}

/// Counters and state reported by `$status`.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub id: String,
    pub topic_url: String,
    pub status: SubscriptionStatus,
    pub events_since_start: u64,
    pub error_count: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub last_communication: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub content_level: ContentLevel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interaction_from_change_kind() {
        assert_eq!(
            TriggerInteraction::from(ChangeKind::Create),
            TriggerInteraction::Create
        );
        assert_eq!(
            TriggerInteraction::from(ChangeKind::Update),
            TriggerInteraction::Update
        );
        assert_eq!(
            TriggerInteraction::from(ChangeKind::Delete),
            TriggerInteraction::Delete
        );
    }

    #[test]
    fn test_content_level_parse() {
        assert_eq!(ContentLevel::parse("empty"), Some(ContentLevel::Empty));
        assert_eq!(ContentLevel::parse("id-only"), Some(ContentLevel::IdOnly));
        assert_eq!(
            ContentLevel::parse("full-resource"),
            Some(ContentLevel::FullResource)
        );
        assert_eq!(ContentLevel::parse("bodies"), None);
    }

    #[test]
    fn test_status_generates_events() {
        assert!(SubscriptionStatus::Requested.generates_events());
        assert!(SubscriptionStatus::Active.generates_events());
        assert!(SubscriptionStatus::Error.generates_events());
        assert!(!SubscriptionStatus::Off.generates_events());
    }

    #[test]
    fn test_batch_limit() {
        let mut channel = ChannelConfig::rest_hook("https://example.com/hook");
        assert_eq!(channel.batch_limit(), 1);
        channel.max_events_per_notification = Some(10);
        assert_eq!(channel.batch_limit(), 10);
        channel.max_events_per_notification = Some(0);
        assert_eq!(channel.batch_limit(), 1);
    }

    #[test]
    fn test_allowed_filter_params() {
        let topic = TopicDef {
            url: "http://example.org/topics/t".into(),
            title: None,
            triggers: vec![],
            can_filter_by: vec![
                FilterDefinition {
                    filter_parameter: "status".into(),
                    resource: Some("Encounter".into()),
                    description: None,
                },
                FilterDefinition {
                    filter_parameter: "patient".into(),
                    resource: None,
                    description: None,
                },
            ],
            notification_shape: vec![],
        };

        let encounter = topic.allowed_filter_params("Encounter");
        assert!(encounter.contains(&"status"));
        assert!(encounter.contains(&"patient"));

        let observation = topic.allowed_filter_params("Observation");
        assert!(!observation.contains(&"status"));
        assert!(observation.contains(&"patient"));
    }

    #[test]
    fn test_notification_type_codes() {
        assert_eq!(NotificationType::Heartbeat.as_str(), "heartbeat");
        assert_eq!(
            NotificationType::EventNotification.as_str(),
            "event-notification"
        );
        assert_eq!(NotificationType::QueryEvent.as_str(), "query-event");
    }
}
