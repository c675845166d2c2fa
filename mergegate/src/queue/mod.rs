//! Durable job dispatch through a push-based queue provider.
//!
//! Jobs are published to the provider addressed at this service's own `/webhooks/{queue}` endpoint.
//! The provider stores them and calls back (at least once, with retries) with a signed request.
//! The pieces:
//!
//! - [`jobs`]: queue names, per-queue job schemas and job metadata
//! - [`publisher`]: [`publisher::QueuePublisher`] and the [`publisher::QueueProvider`] seam
//! - [`signature`]: verification of provider signatures with key rotation
//! - [`router`]: dispatch of verified deliveries to the worker service for each queue
//! - [`retry`]: the redelivery contract we request from the provider
//!
//! In `direct` mode the provider is skipped and the router is invoked in-process, which lets the
//! whole flow run locally without a provider account.

pub mod jobs;
pub mod publisher;
pub mod retry;
pub mod router;
pub mod signature;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    /// Payload does not match the queue's job schema
    #[error("Invalid job payload: {0}")]
    InvalidPayload(String),

    /// The reserved `options` object of a submission could not be read
    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Schedule time must be in the future")]
    ScheduleInPast,

    /// The provider answered with a non-success status
    #[error("Queue provider rejected publish ({status}): {message}")]
    ProviderRejected { status: u16, message: String },

    #[error("Queue provider request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Queue provider is not configured: {0}")]
    NotConfigured(String),
}
