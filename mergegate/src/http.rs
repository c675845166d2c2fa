//! Outbound JSON-over-HTTP calls to the services this gateway orchestrates.
//!
//! Stage clients and the webhook router both make the same kind of call: one POST with a JSON body,
//! a hard timeout, and a JSON answer. Failures are classified so callers can report them without
//! inspecting `reqwest` errors themselves.

use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CallError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Transport(String),

    /// Non-2xx answer. `message` is the service's `error`/`message` field when present.
    #[error("service returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("invalid response body: {0}")]
    Decode(String),
}

/// Build a client for outbound calls.
///
/// The crate uses rustls without a baked-in crypto provider, so the process-wide default is
/// installed here if nothing installed one yet.
pub fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    reqwest::Client::builder().build()
}

/// POST `body` to `url` and decode the JSON answer.
pub async fn post_json<B: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    body: &B,
) -> Result<Value, CallError> {
    let bytes = send(client, url, timeout, body).await?;
    serde_json::from_slice(&bytes).map_err(|e| CallError::Decode(e.to_string()))
}

/// Like [`post_json`], but any 2xx answer is a success. An empty body decodes to `Null` and a
/// non-JSON body to a string.
pub async fn post_json_lenient<B: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    body: &B,
) -> Result<Value, CallError> {
    let bytes = send(client, url, timeout, body).await?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    Ok(serde_json::from_slice(&bytes).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())))
}

async fn send<B: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
    body: &B,
) -> Result<axum::body::Bytes, CallError> {
    let response = client
        .post(url)
        .timeout(timeout)
        .json(body)
        .send()
        .await
        .map_err(|e| classify(e, timeout))?;

    let status = response.status();
    let bytes = response.bytes().await.map_err(|e| classify(e, timeout))?;

    if !status.is_success() {
        return Err(CallError::Status {
            status: status.as_u16(),
            message: error_message(&bytes).unwrap_or_else(|| status.canonical_reason().unwrap_or("error").to_string()),
        });
    }
    Ok(bytes)
}

fn classify(err: reqwest::Error, timeout: Duration) -> CallError {
    if err.is_timeout() {
        CallError::Timeout(timeout)
    } else {
        CallError::Transport(err.to_string())
    }
}

fn error_message(bytes: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(bytes).ok()?;
    ["error", "message", "detail"]
        .iter()
        .find_map(|key| value.get(key).and_then(Value::as_str))
        .map(str::to_string)
}
