//! API error mapping to HTTP responses.
//!
//! Every error surfaces as a FHIR `OperationOutcome` document with the
//! matching status code.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use lumen_core::CoreError;
use lumen_subscriptions::SubscriptionError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Gone(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Gone(_) => StatusCode::GONE,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn issue_code(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "invalid",
            Self::NotFound(_) => "not-found",
            Self::Gone(_) => "deleted",
            Self::Conflict(_) => "duplicate",
            Self::Internal(_) => "exception",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let outcome = json!({
            "resourceType": "OperationOutcome",
            "issue": [{
                "severity": "error",
                "code": self.issue_code(),
                "diagnostics": self.to_string(),
            }]
        });
        (self.status(), Json(outcome)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::ResourceNotFound { .. } => Self::NotFound(e.to_string()),
            CoreError::ResourceDeleted { .. } => Self::Gone(e.to_string()),
            CoreError::ResourceConflict { .. } => Self::Conflict(e.to_string()),
            e if e.is_client_error() => Self::BadRequest(e.to_string()),
            e => Self::Internal(e.to_string()),
        }
    }
}

impl From<SubscriptionError> for ApiError {
    fn from(e: SubscriptionError) -> Self {
        match e {
            SubscriptionError::Validation(_) | SubscriptionError::RegistrationRejected(_) => {
                Self::BadRequest(e.to_string())
            }
            SubscriptionError::TopicNotFound(_) | SubscriptionError::SubscriptionNotFound(_) => {
                Self::NotFound(e.to_string())
            }
            e => Self::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_mapping() {
        let api: ApiError = CoreError::resource_not_found("Patient", "p1").into();
        assert_eq!(api.status(), StatusCode::NOT_FOUND);

        let api: ApiError = CoreError::resource_deleted("Patient", "p1").into();
        assert_eq!(api.status(), StatusCode::GONE);

        let api: ApiError = CoreError::resource_conflict("Patient", "p1").into();
        assert_eq!(api.status(), StatusCode::CONFLICT);

        let api: ApiError = CoreError::invalid_resource("missing resourceType").into();
        assert_eq!(api.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_subscription_error_mapping() {
        let api: ApiError = SubscriptionError::rejected("bad filter").into();
        assert_eq!(api.status(), StatusCode::BAD_REQUEST);

        let api: ApiError =
            SubscriptionError::SubscriptionNotFound("s1".into()).into();
        assert_eq!(api.status(), StatusCode::NOT_FOUND);

        let api: ApiError = SubscriptionError::internal("invariant").into();
        assert_eq!(api.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
