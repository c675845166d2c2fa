//! End-to-end tests through the full router.

mod jobs;

use crate::test_utils::create_test_config;
use crate::{Application, create_cors_layer};

#[tokio::test]
async fn test_application_starts_with_in_memory_store() {
    let server = Application::new(create_test_config("http://127.0.0.1:9"))
        .await
        .unwrap()
        .into_test_server();

    let response = server.get("/healthz").await;
    response.assert_status_ok();
    response.assert_text("OK");
}

#[tokio::test]
async fn test_direct_mode_starts_without_provider_token() {
    let mut config = create_test_config("http://127.0.0.1:9");
    config.queue.mode = crate::config::QueueMode::Direct;
    config.queue.token = None;

    let server = Application::new(config).await.unwrap().into_test_server();
    server.get("/healthz").await.assert_status_ok();
}

#[tokio::test]
async fn test_docs_are_served() {
    let server = Application::new(create_test_config("http://127.0.0.1:9"))
        .await
        .unwrap()
        .into_test_server();

    server.get("/docs").await.assert_status_ok();
}

#[tokio::test]
async fn test_metrics_endpoint_follows_config() {
    let server = Application::new(create_test_config("http://127.0.0.1:9"))
        .await
        .unwrap()
        .into_test_server();
    server.get("/internal/metrics").await.assert_status_not_found();

    let mut config = create_test_config("http://127.0.0.1:9");
    config.enable_metrics = true;
    let server = Application::new(config).await.unwrap().into_test_server();
    server.get("/internal/metrics").await.assert_status_ok();
}

#[test]
fn test_cors_layer_rejects_bad_origin() {
    let mut config = create_test_config("http://127.0.0.1:9");
    config.cors_allowed_origins = vec!["https://ok.example.com".to_string()];
    assert!(create_cors_layer(&config).is_ok());

    config.cors_allowed_origins = vec!["*".to_string()];
    assert!(create_cors_layer(&config).is_ok());

    config.cors_allowed_origins = vec!["bad\norigin".to_string()];
    assert!(create_cors_layer(&config).is_err());
}
