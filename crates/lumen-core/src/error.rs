use thiserror::Error;

/// Core error types for LumenFHIR operations
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Invalid resource type: {0}")]
    InvalidResourceType(String),

    #[error("Invalid resource id: {0}")]
    InvalidId(String),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    #[error("Invalid timestamp: {0}")]
    InvalidDateTime(String),

    #[error("JSON serialization error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Resource not found: {resource_type}/{id}")]
    ResourceNotFound { resource_type: String, id: String },

    #[error("Resource conflict: {resource_type}/{id} already exists")]
    ResourceConflict { resource_type: String, id: String },

    #[error("Resource deleted: {resource_type}/{id}")]
    ResourceDeleted { resource_type: String, id: String },

    #[error("Invalid resource data: {message}")]
    InvalidResource { message: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Change feed closed")]
    FeedClosed,
}

impl CoreError {
    pub fn invalid_resource_type(resource_type: impl Into<String>) -> Self {
        Self::InvalidResourceType(resource_type.into())
    }

    pub fn invalid_id(id: impl Into<String>) -> Self {
        Self::InvalidId(id.into())
    }

    pub fn resource_not_found(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::ResourceNotFound {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    pub fn resource_conflict(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::ResourceConflict {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    /// Soft-deleted resources surface as 410 Gone.
    pub fn resource_deleted(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::ResourceDeleted {
            resource_type: resource_type.into(),
            id: id.into(),
        }
    }

    pub fn invalid_resource(message: impl Into<String>) -> Self {
        Self::InvalidResource {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Check if this error is a client error (4xx category)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidResourceType(_)
                | Self::InvalidId(_)
                | Self::InvalidReference(_)
                | Self::InvalidDateTime(_)
                | Self::InvalidResource { .. }
                | Self::ResourceNotFound { .. }
                | Self::ResourceConflict { .. }
                | Self::ResourceDeleted { .. }
                | Self::JsonError(_)
        )
    }

    /// Check if this error is a server error (5xx category)
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::FeedClosed)
    }
}

/// Convenience result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;
