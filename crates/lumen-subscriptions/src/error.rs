//! Subscription engine error types.

use thiserror::Error;

use lumen_core::CoreError;

/// Result type for subscription operations.
pub type SubscriptionResult<T> = Result<T, SubscriptionError>;

/// Errors that can occur during subscription operations.
///
/// The variants follow the engine's error taxonomy: `Validation` and
/// `RegistrationRejected` surface synchronously to API callers;
/// `MatchEvaluation` is always downgraded to "not matched";
/// `DeliveryRetryable`/`DeliveryFatal` drive the dispatcher's retry and
/// error accounting; `Internal` marks invariant violations that take the
/// owning subscription offline without crashing the engine.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    /// Malformed topic or subscription definition
    #[error("Validation error: {0}")]
    Validation(String),

    /// Subscription referenced unknown filters, channel, or endpoint
    #[error("Registration rejected: {0}")]
    RegistrationRejected(String),

    /// Topic not found by canonical URL
    #[error("Subscription topic not found: {0}")]
    TopicNotFound(String),

    /// Subscription not found
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    /// Query-predicate or path-expression evaluation failed
    #[error("Match evaluation error: {0}")]
    MatchEvaluation(String),

    /// Transient channel failure, counted against the retry budget
    #[error("Delivery failed (retryable): {0}")]
    DeliveryRetryable(String),

    /// Non-retryable channel failure
    #[error("Delivery failed (fatal): {0}")]
    DeliveryFatal(String),

    /// Requested event numbers fell out of the retention window
    #[error("Event {0} has expired from the log")]
    EventExpired(u64),

    /// Storage error from the resource store
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SubscriptionError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::RegistrationRejected(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<CoreError> for SubscriptionError {
    fn from(e: CoreError) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SubscriptionError {
    fn from(e: serde_json::Error) -> Self {
        Self::Validation(e.to_string())
    }
}
