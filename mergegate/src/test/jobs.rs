//! Job submission and webhook delivery through the HTTP layer.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde_json::{Value, json};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::config::QueueMode;
use crate::queue::publisher::tests::RecordingProvider;
use crate::queue::signature::{SIGNATURE_HEADER, sign};
use crate::test_utils::{TEST_CURRENT_KEY, TEST_NEXT_KEY, TEST_PUBLIC_URL, create_test_app, create_test_config};

fn email(to: &str) -> Value {
    json!({"to": to, "subject": "Build finished", "body": "All green"})
}

fn signed(key: &str, queue: &str, body: &[u8]) -> String {
    sign(key, &format!("{TEST_PUBLIC_URL}/webhooks/{queue}"), body).unwrap()
}

async fn mount_email_worker(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/api/email/send"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"delivered": true})))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_submit_job_publishes_in_provider_mode() {
    let provider = Arc::new(RecordingProvider::default());
    let (server, _) = create_test_app(create_test_config("http://127.0.0.1:9"), provider.clone());

    let response = server
        .post("/queues/email/jobs")
        .json(&json!({"to": "dev@example.com", "subject": "Hi", "body": "Hello", "options": {"delay": 60}}))
        .await;

    response.assert_status(axum::http::StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body["message"], "Job queued successfully");
    assert_eq!(body["messageId"], "msg_1");
    assert_eq!(body["queueName"], "email");
    assert!(body["jobId"].as_str().unwrap().starts_with("email-"));
    assert!(body["data"].get("options").is_none());

    let requests = provider.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].destination, format!("{TEST_PUBLIC_URL}/webhooks/email"));
    assert_eq!(requests[0].delay, Some(std::time::Duration::from_secs(60)));
    assert_eq!(requests[0].body["_metadata"]["jobId"], body["jobId"]);
}

#[tokio::test]
async fn test_submit_job_rejects_unknown_queue_and_bad_payload() {
    let provider = Arc::new(RecordingProvider::default());
    let (server, _) = create_test_app(create_test_config("http://127.0.0.1:9"), provider.clone());

    let response = server.post("/queues/sms/jobs").json(&email("dev@example.com")).await;
    response.assert_status_bad_request();
    let body: Value = response.json();
    assert_eq!(body["error"], "Invalid queue name");
    assert_eq!(
        body["validQueues"],
        json!(["code-analysis", "email", "review", "failure-prediction"])
    );

    let response = server
        .post("/queues/email/jobs")
        .json(&json!({"subject": "no recipient", "body": "x"}))
        .await;
    response.assert_status_bad_request();

    assert!(provider.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_bulk_submission_reports_each_job() {
    let provider = Arc::new(RecordingProvider::default());
    let (server, _) = create_test_app(create_test_config("http://127.0.0.1:9"), provider.clone());

    let response = server
        .post("/queues/email/jobs/bulk")
        .json(&json!({"jobs": [
            email("a@example.com"),
            email("b@example.com"),
            {"subject": "missing recipient", "body": "x"},
            {"to": "d@example.com", "subject": "Later", "body": "x", "options": {"delay": 5}},
        ]}))
        .await;

    response.assert_status(axum::http::StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body["message"], "3 jobs queued successfully");
    let jobs = body["jobs"].as_array().unwrap();
    assert_eq!(jobs.len(), 4);
    assert!(jobs[0]["jobId"].is_string());
    assert!(jobs[2]["error"].as_str().unwrap().contains("Invalid job payload"));
    assert!(jobs[3]["messageId"].is_string());

    let requests = provider.requests.lock().unwrap();
    assert_eq!(requests.len(), 3);
    let delayed = requests.iter().find(|r| r.body["to"] == "d@example.com").unwrap();
    assert!(delayed.body.get("options").is_none());
    assert_eq!(delayed.delay, Some(std::time::Duration::from_secs(5)));
}

#[tokio::test]
async fn test_bulk_submission_requires_jobs() {
    let (server, _) = create_test_app(
        create_test_config("http://127.0.0.1:9"),
        Arc::new(RecordingProvider::default()),
    );

    let response = server.post("/queues/email/jobs/bulk").json(&json!({"jobs": []})).await;
    response.assert_status_bad_request();
    assert_eq!(response.json::<Value>()["error"], "Jobs must be a non-empty array");

    let response = server.post("/queues/email/jobs/bulk").json(&json!({"jobs": "all of them"})).await;
    response.assert_status_bad_request();
    assert!(response.json::<Value>()["error"].is_string());
}

#[tokio::test]
async fn test_submit_job_rejects_bad_options() {
    let provider = Arc::new(RecordingProvider::default());
    let (server, _) = create_test_app(create_test_config("http://127.0.0.1:9"), provider.clone());

    let mut job = email("dev@example.com");
    job["options"] = json!({"delay": "soon"});
    let response = server.post("/queues/email/jobs").json(&job).await;

    response.assert_status_bad_request();
    assert!(response.json::<Value>()["error"].as_str().unwrap().starts_with("Invalid options"));
    assert!(provider.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_schedule_job() {
    let provider = Arc::new(RecordingProvider::default());
    let (server, _) = create_test_app(create_test_config("http://127.0.0.1:9"), provider.clone());

    let mut payload = email("dev@example.com");
    payload["scheduleTime"] = json!((Utc::now() + Duration::minutes(10)).to_rfc3339());
    let response = server.post("/queues/email/schedule").json(&payload).await;

    response.assert_status(axum::http::StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body["message"], "Job scheduled successfully");
    assert!(body["scheduledFor"].is_string());

    let requests = provider.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    let delay = requests[0].delay.unwrap().as_secs();
    assert!((590..=600).contains(&delay), "delay was {delay}");
    assert!(requests[0].body.get("scheduleTime").is_none());
}

#[tokio::test]
async fn test_schedule_in_the_past_is_not_dispatched() {
    let provider = Arc::new(RecordingProvider::default());
    let (server, _) = create_test_app(create_test_config("http://127.0.0.1:9"), provider.clone());

    let mut payload = email("dev@example.com");
    payload["scheduleTime"] = json!((Utc::now() - Duration::minutes(1)).timestamp_millis());
    server
        .post("/queues/email/schedule")
        .json(&payload)
        .await
        .assert_status_bad_request();

    server
        .post("/queues/email/schedule")
        .json(&email("dev@example.com"))
        .await
        .assert_status_bad_request();

    assert!(provider.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_direct_mode_runs_jobs_in_process() {
    let workers = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/email/send"))
        .and(body_partial_json(json!({"to": "dev@example.com"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"delivered": true})))
        .expect(1)
        .mount(&workers)
        .await;

    let provider = Arc::new(RecordingProvider::default());
    let mut config = create_test_config(&workers.uri());
    config.queue.mode = QueueMode::Direct;
    let (server, _) = create_test_app(config, provider.clone());

    let response = server.post("/queues/email/jobs").json(&email("dev@example.com")).await;

    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["success"], true);
    assert_eq!(body["delivery"], json!({"delivered": true}));
    assert!(body["jobId"].as_str().unwrap().starts_with("test-email-"));
    assert!(provider.requests.lock().unwrap().is_empty());

    // Scheduling needs the provider
    let mut scheduled = email("dev@example.com");
    scheduled["scheduleTime"] = json!((Utc::now() + Duration::minutes(5)).to_rfc3339());
    server
        .post("/queues/email/schedule")
        .json(&scheduled)
        .await
        .assert_status(axum::http::StatusCode::NOT_IMPLEMENTED);
}

#[tokio::test]
async fn test_direct_mode_bulk_processes_every_job() {
    let workers = MockServer::start().await;
    mount_email_worker(&workers).await;

    let mut config = create_test_config(&workers.uri());
    config.queue.mode = QueueMode::Direct;
    let (server, _) = create_test_app(config, Arc::new(RecordingProvider::default()));

    let response = server
        .post("/queues/email/jobs/bulk")
        .json(&json!({"jobs": [email("a@example.com"), {"to": "b@example.com"}]}))
        .await;

    response.assert_status(axum::http::StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body["message"], "2 jobs processed");
    assert_eq!(body["jobs"][0]["result"]["success"], true);
    assert!(body["jobs"][1]["error"].is_string());
}

#[test_log::test(tokio::test)]
async fn test_signed_delivery_is_forwarded() {
    let workers = MockServer::start().await;
    mount_email_worker(&workers).await;
    let (server, _) = create_test_app(
        create_test_config(&workers.uri()),
        Arc::new(RecordingProvider::default()),
    );

    let body = serde_json::to_vec(&email("dev@example.com")).unwrap();
    let response = server
        .post("/webhooks/email")
        .add_header(SIGNATURE_HEADER, signed(TEST_CURRENT_KEY, "email", &body))
        .add_header("Content-Type", "application/json")
        .bytes(body.into())
        .await;

    response.assert_status_ok();
    let outcome: Value = response.json();
    assert_eq!(outcome["success"], true);
    assert_eq!(outcome["to"], "dev@example.com");
}

#[tokio::test]
async fn test_delivery_signed_with_next_key_is_accepted() {
    let workers = MockServer::start().await;
    mount_email_worker(&workers).await;
    let (server, _) = create_test_app(
        create_test_config(&workers.uri()),
        Arc::new(RecordingProvider::default()),
    );

    let body = serde_json::to_vec(&email("dev@example.com")).unwrap();
    server
        .post("/webhooks/email")
        .add_header(SIGNATURE_HEADER, signed(TEST_NEXT_KEY, "email", &body))
        .bytes(body.into())
        .await
        .assert_status_ok();
}

#[test_log::test(tokio::test)]
async fn test_tampered_or_unsigned_delivery_is_rejected() {
    let workers = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(0)
        .mount(&workers)
        .await;
    let (server, _) = create_test_app(
        create_test_config(&workers.uri()),
        Arc::new(RecordingProvider::default()),
    );

    let body = serde_json::to_vec(&email("dev@example.com")).unwrap();
    let signature = signed(TEST_CURRENT_KEY, "email", &body);
    let tampered = serde_json::to_vec(&email("attacker@example.com")).unwrap();

    let response = server
        .post("/webhooks/email")
        .add_header(SIGNATURE_HEADER, signature)
        .bytes(tampered.into())
        .await;
    response.assert_status_unauthorized();
    assert_eq!(response.json::<Value>()["error"], "Invalid signature");

    server
        .post("/webhooks/email")
        .add_header(SIGNATURE_HEADER, signed("some-other-key", "email", &body))
        .bytes(body.clone().into())
        .await
        .assert_status_unauthorized();

    server
        .post("/webhooks/email")
        .bytes(body.into())
        .await
        .assert_status_unauthorized();
}

#[tokio::test]
async fn test_delivery_to_unknown_queue() {
    let (server, _) = create_test_app(
        create_test_config("http://127.0.0.1:9"),
        Arc::new(RecordingProvider::default()),
    );

    let body = serde_json::to_vec(&email("dev@example.com")).unwrap();
    let response = server
        .post("/webhooks/sms")
        .add_header(SIGNATURE_HEADER, signed(TEST_CURRENT_KEY, "sms", &body))
        .bytes(body.into())
        .await;

    response.assert_status_bad_request();
    assert!(response.json::<Value>()["validQueues"].is_array());
}

#[tokio::test]
async fn test_worker_failure_asks_for_redelivery() {
    let workers = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/email/send"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "smtp down"})))
        .mount(&workers)
        .await;
    let (server, _) = create_test_app(
        create_test_config(&workers.uri()),
        Arc::new(RecordingProvider::default()),
    );

    let body = serde_json::to_vec(&email("dev@example.com")).unwrap();
    let response = server
        .post("/webhooks/email")
        .add_header(SIGNATURE_HEADER, signed(TEST_CURRENT_KEY, "email", &body))
        .add_header("upstash-retried", "2")
        .bytes(body.into())
        .await;

    response.assert_status(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    let outcome: Value = response.json();
    assert_eq!(outcome["error"], "Email delivery failed");
    assert!(outcome["message"].as_str().unwrap().contains("smtp down"));
}

#[tokio::test]
async fn test_skip_verification_accepts_unsigned_delivery() {
    let workers = MockServer::start().await;
    mount_email_worker(&workers).await;
    let mut config = create_test_config(&workers.uri());
    config.queue.skip_signature_verification = true;
    let (server, _) = create_test_app(config, Arc::new(RecordingProvider::default()));

    server
        .post("/webhooks/email")
        .json(&email("dev@example.com"))
        .await
        .assert_status_ok();
}
