//! Common error types for ModelPlay
//!
//! This module defines all error types used across the ModelPlay system.
//! All errors are convertible to gRPC status codes so whichever transport
//! wraps the hub can report them faithfully.

use modelplay_proto::FrameError;
use thiserror::Error;

/// Main error type for ModelPlay
#[derive(Error, Debug)]
pub enum ModelPlayError {
    /// Unknown model or playground
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate create, chain already/not active, mutation while active
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Chain modality mismatch
    #[error("Incompatible chain: {0}")]
    Incompatible(String),

    /// Unload refused while playgrounds still depend on the model
    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    /// Malformed request payload
    #[error("Validation error: {0}")]
    Validation(String),

    /// Model construction, loading or inference failed inside a worker
    #[error("Model error: {0}")]
    Model(String),

    /// Worker crashed, channel closed or a frame could not be decoded
    #[error("Transport error: {0}")]
    Transport(String),

    /// Timeout
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<FrameError> for ModelPlayError {
    fn from(err: FrameError) -> Self {
        ModelPlayError::Transport(err.to_string())
    }
}

impl ModelPlayError {
    /// Convert error to gRPC status code
    pub fn to_status(&self) -> tonic::Status {
        match self {
            ModelPlayError::NotFound(msg) => tonic::Status::not_found(msg.clone()),
            ModelPlayError::Conflict(msg) => {
                tonic::Status::failed_precondition(format!("Conflict: {}", msg))
            }
            ModelPlayError::Incompatible(msg) => {
                tonic::Status::invalid_argument(format!("Incompatible chain: {}", msg))
            }
            ModelPlayError::ResourceBusy(msg) => {
                tonic::Status::failed_precondition(format!("Resource busy: {}", msg))
            }
            ModelPlayError::Validation(msg) => {
                tonic::Status::invalid_argument(format!("Validation error: {}", msg))
            }
            ModelPlayError::Model(msg) => {
                tonic::Status::internal(format!("Model error: {}", msg))
            }
            ModelPlayError::Transport(msg) => {
                tonic::Status::unavailable(format!("Worker transport error: {}", msg))
            }
            ModelPlayError::Timeout(msg) => {
                tonic::Status::deadline_exceeded(format!("Timeout: {}", msg))
            }
            ModelPlayError::Config(msg) => {
                tonic::Status::internal(format!("Configuration error: {}", msg))
            }
            ModelPlayError::Serialization(err) => {
                tonic::Status::internal(format!("Serialization error: {}", err))
            }
            ModelPlayError::Io(err) => tonic::Status::internal(format!("I/O error: {}", err)),
            ModelPlayError::Internal(msg) => {
                tonic::Status::internal(format!("Internal error: {}", msg))
            }
        }
    }

    /// Whether the caller can act on the error (as opposed to a server-side failure)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ModelPlayError::NotFound(_)
                | ModelPlayError::Conflict(_)
                | ModelPlayError::Incompatible(_)
                | ModelPlayError::ResourceBusy(_)
                | ModelPlayError::Validation(_)
                | ModelPlayError::Model(_)
        )
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        ModelPlayError::NotFound(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        ModelPlayError::Conflict(msg.into())
    }

    /// Create a chain incompatibility error
    pub fn incompatible(msg: impl Into<String>) -> Self {
        ModelPlayError::Incompatible(msg.into())
    }

    /// Create a resource busy error
    pub fn resource_busy(msg: impl Into<String>) -> Self {
        ModelPlayError::ResourceBusy(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        ModelPlayError::Validation(msg.into())
    }

    /// Create a model error
    pub fn model(msg: impl Into<String>) -> Self {
        ModelPlayError::Model(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        ModelPlayError::Transport(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        ModelPlayError::Timeout(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        ModelPlayError::Config(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        ModelPlayError::Internal(msg.into())
    }
}

/// Result type alias for ModelPlay operations
pub type Result<T> = std::result::Result<T, ModelPlayError>;
