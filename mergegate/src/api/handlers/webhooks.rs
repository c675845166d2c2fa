//! Inbound job deliveries from the queue provider.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
};
use serde_json::{Map, Value};
use tracing::{instrument, warn};

use super::queues::parse_queue_name;
use crate::{
    AppState,
    errors::{Error, Result},
    queue::{router::DeliveryOutcome, signature::SIGNATURE_HEADER},
};

/// Provider header carrying how many times the message has been retried.
pub const RETRIED_HEADER: &str = "upstash-retried";

/// Receive a job delivery.
#[utoipa::path(
    post,
    path = "/webhooks/{queue_name}",
    tag = "webhooks",
    summary = "Job delivery",
    description = "Called by the queue provider. The raw body must carry a valid `Upstash-Signature`. The job is \
    forwarded to the queue's worker service; a non-2xx answer makes the provider redeliver.",
    params(
        ("queue_name" = String, Path, description = "Queue the job was published to"),
    ),
    request_body(content = Object, description = "Job payload with `_metadata`"),
    responses(
        (status = 200, description = "Job completed"),
        (status = 400, description = "Unknown queue or invalid payload"),
        (status = 401, description = "Invalid signature"),
        (status = 500, description = "Worker service failed"),
    )
)]
#[instrument(skip_all, fields(queue = %queue_name))]
pub async fn receive_delivery(
    State(state): State<AppState>,
    Path(queue_name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<DeliveryOutcome> {
    if state.config.queue.skip_signature_verification {
        warn!("Signature verification skipped for webhook delivery");
    } else {
        let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        if let Err(e) = state.verifier.verify(signature, &body) {
            warn!(error = %e, "Rejected webhook delivery");
            return Err(Error::InvalidSignature);
        }
    }

    let queue_name = parse_queue_name(&queue_name)?;

    let payload: Map<String, Value> = serde_json::from_slice(&body).map_err(|_| Error::BadRequest {
        message: "Delivery body must be a JSON object".to_string(),
    })?;
    let attempts = headers
        .get(RETRIED_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u32>().ok());

    Ok(state.router.dispatch(queue_name, payload, attempts).await?)
}
