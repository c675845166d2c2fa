//! API request and response data models.
//!
//! These define the public HTTP contract. Stored records ([`crate::store::models`]) are returned
//! as-is where the shapes coincide; everything here is either a request body, a query string, or an
//! envelope around stored data.
//!
//! - [`queues`]: job submission, bulk submission and scheduling
//! - [`analyses`]: pipeline invocation, history and metrics queries
//! - [`feedback`]: ratings of past decisions

pub mod analyses;
pub mod feedback;
pub mod queues;

use serde::Serialize;
use utoipa::ToSchema;

/// Success envelope used by the pipeline, history, feedback and analytics endpoints.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            message: None,
            data,
        }
    }

    pub fn with_message(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            data,
        }
    }
}
