//! HTTP request handlers, grouped by resource.
//!
//! - [`queues`]: job submission, bulk submission and scheduling
//! - [`webhooks`]: signed job deliveries from the queue provider
//! - [`analyses`]: pipeline invocation, decision history and metrics history
//! - [`feedback`]: ratings of decision records
//! - [`analytics`]: per-user running statistics
//!
//! Caller-scoped handlers take a [`crate::auth::CurrentUser`] and only ever see that user's data.
//! Queue and webhook handlers are service-to-service and carry no caller identity.

pub mod analyses;
pub mod analytics;
pub mod feedback;
pub mod queues;
pub mod webhooks;
