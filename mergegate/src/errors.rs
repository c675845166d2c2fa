use crate::pipeline::stages::StageFailure;
use crate::queue::{QueueError, jobs::QueueName};
use crate::store::StoreError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Caller identity header missing or malformed
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// Webhook delivery whose signature could not be verified against either key
    #[error("Invalid signature")]
    InvalidSignature,

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Path names a queue that does not exist
    #[error("Invalid queue name: {name}")]
    InvalidQueue { name: String },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// Operation not available in the current dispatch mode
    #[error("{message}")]
    NotImplemented { message: String },

    /// A pipeline stage failed in a way that cannot be degraded
    #[error(transparent)]
    Stage(#[from] StageFailure),

    /// Publishing to the queue failed
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    /// Result store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } | Error::InvalidSignature => StatusCode::UNAUTHORIZED,
            Error::BadRequest { .. } | Error::InvalidQueue { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::NotImplemented { .. } => StatusCode::NOT_IMPLEMENTED,
            Error::Stage(_) => StatusCode::BAD_GATEWAY,
            Error::Queue(queue_err) => match queue_err {
                QueueError::InvalidPayload(_) | QueueError::InvalidOptions(_) | QueueError::ScheduleInPast => StatusCode::BAD_REQUEST,
                QueueError::ProviderRejected { .. } | QueueError::Transport(_) => StatusCode::BAD_GATEWAY,
                QueueError::NotConfigured(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Store(store_err) => match store_err {
                StoreError::NotFound => StatusCode::NOT_FOUND,
                StoreError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::InvalidSignature => "Invalid signature".to_string(),
            Error::BadRequest { message } => message.clone(),
            Error::InvalidQueue { .. } => "Invalid queue name".to_string(),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::NotImplemented { message } => message.clone(),
            // Stage messages come from our own stage services and are what the caller needs to act on
            Error::Stage(failure) => failure.to_string(),
            Error::Queue(queue_err) => match queue_err {
                QueueError::InvalidPayload(_) | QueueError::InvalidOptions(_) | QueueError::ScheduleInPast => queue_err.to_string(),
                QueueError::ProviderRejected { .. } | QueueError::Transport(_) => "Failed to publish job".to_string(),
                QueueError::NotConfigured(_) => "Internal server error".to_string(),
            },
            Error::Internal { .. } => "Internal server error".to_string(),
            Error::Store(StoreError::NotFound) => "Resource not found".to_string(),
            Error::Store(StoreError::Other(_)) => "Database error occurred".to_string(),
            Error::Other(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        // Log full error details for debugging - different log levels based on severity
        match &self {
            Error::Store(StoreError::Other(_)) | Error::Internal { .. } | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Stage(_) | Error::Queue(_) => {
                tracing::warn!("Upstream error: {:#}", self);
            }
            Error::Unauthenticated { .. } | Error::InvalidSignature => {
                tracing::info!("Authentication error: {}", self);
            }
            Error::BadRequest { .. }
            | Error::InvalidQueue { .. }
            | Error::NotFound { .. }
            | Error::NotImplemented { .. }
            | Error::Store(StoreError::NotFound) => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();

        let body = match &self {
            Error::InvalidQueue { .. } => json!({
                "error": self.user_message(),
                "validQueues": QueueName::ALL.iter().map(|q| q.as_str()).collect::<Vec<_>>(),
            }),
            Error::Stage(_) => json!({
                "success": false,
                "error": self.user_message(),
            }),
            _ => json!({ "error": self.user_message() }),
        };

        (status, Json(body)).into_response()
    }
}

/// Convert from String errors (e.g., from external functions)
impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Internal { operation: msg }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
