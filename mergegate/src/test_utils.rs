//! Test utilities shared by unit and integration tests.

use std::sync::Arc;
use std::time::Duration;

use axum_test::TestServer;
use chrono::Utc;
use serde_json::json;
use uuid::Uuid;

use crate::config::{Config, QueueMode, ServiceEndpoint, SigningKeys, StagesConfig, WorkersConfig};
use crate::pipeline::models::{CodeQuality, Review};
use crate::queue::publisher::QueueProvider;
use crate::store::{
    ResultStore,
    in_memory::InMemoryStore,
    models::{AnalysisResult, AnalysisSection, ChangeMetrics, Overall, Performance, PredictionSection},
};

pub const TEST_CURRENT_KEY: &str = "sig_current_test_key";
pub const TEST_NEXT_KEY: &str = "sig_next_test_key";
pub const TEST_PUBLIC_URL: &str = "https://gate.example.com";

fn endpoint(base: &str, path: &str, timeout: Duration) -> ServiceEndpoint {
    ServiceEndpoint {
        url: format!("{base}{path}"),
        timeout,
    }
}

/// Stage services rooted at `base`. The review timeout is short so fallback tests stay fast.
pub fn test_stages(base: &str) -> StagesConfig {
    StagesConfig {
        analysis: endpoint(base, "/analysis", Duration::from_secs(5)),
        prediction: endpoint(base, "/predict", Duration::from_secs(5)),
        review: endpoint(base, "/review", Duration::from_millis(500)),
    }
}

pub fn test_workers(base: &str) -> WorkersConfig {
    WorkersConfig {
        code_analysis: endpoint(base, "/api/analyze", Duration::from_secs(5)),
        email: endpoint(base, "/api/email/send", Duration::from_secs(5)),
        review: endpoint(base, "/api/review/generate", Duration::from_secs(5)),
        failure_prediction: endpoint(base, "/api/predict", Duration::from_secs(5)),
    }
}

/// Provider-mode config with every downstream service rooted at `mock_uri`.
pub fn create_test_config(mock_uri: &str) -> Config {
    let mut config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        stages: test_stages(mock_uri),
        workers: test_workers(mock_uri),
        enable_metrics: false,
        ..Default::default()
    };
    config.queue.mode = QueueMode::Provider;
    config.queue.token = Some("test-token".to_string());
    config.queue.provider_url = mock_uri.to_string();
    config.queue.public_base_url = TEST_PUBLIC_URL.to_string();
    config.queue.signing = SigningKeys {
        current_key: Some(TEST_CURRENT_KEY.to_string()),
        next_key: Some(TEST_NEXT_KEY.to_string()),
    };
    config
}

/// Build a test server around an in-memory store and the given queue provider.
pub fn create_test_app(config: Config, provider: Arc<dyn QueueProvider>) -> (TestServer, Arc<InMemoryStore>) {
    let store = Arc::new(InMemoryStore::new());
    let state = crate::build_state(config, store.clone() as Arc<dyn ResultStore>, provider).expect("Failed to build state");
    let router = crate::build_router(&state).expect("Failed to build router");
    (TestServer::new(router).expect("Failed to create test server"), store)
}

/// A complete decision record for `user`, timestamped now.
pub fn sample_result(user: &str, repository: Option<&str>) -> AnalysisResult {
    AnalysisResult {
        id: Uuid::new_v4(),
        user_id: user.to_string(),
        file_id: format!("file_{}", Utc::now().timestamp_millis()),
        developer: user.to_string(),
        repository_full_name: repository.map(str::to_string),
        pr_id: Some("42".to_string()),
        pr_url: repository.map(|r| format!("https://github.com/{r}/pull/42")),
        timestamp: Utc::now(),
        metrics: ChangeMetrics {
            lines_of_code: Some(120.0),
            cyclomatic_complexity: 6.0,
            maintainability_index: Some(72.5),
            lines_added: 30,
            lines_deleted: 4,
            files_changed: 2,
        },
        analysis: AnalysisSection {
            metrics: json!({"cyclomaticComplexity": 6, "linesOfCode": 120}),
            mern_patterns: json!({}),
            dependencies: json!({}),
            warnings: vec![],
        },
        prediction: PredictionSection {
            predicted_failure: 0,
            failure_probability: 0.12,
            will_fail: false,
            confidence: Some("high".to_string()),
            recommendation: Some("Safe to merge".to_string()),
        },
        review: Review {
            summary: "Small, well-tested change".to_string(),
            risk_level: "low".to_string(),
            should_merge: true,
            issues: vec![],
            recommendations: vec![],
            code_quality: CodeQuality {
                score: 85.0,
                strengths: vec!["tests".to_string()],
                weaknesses: vec![],
            },
            generated_at: Some(Utc::now()),
            fallback: false,
        },
        overall: Overall {
            can_merge: true,
            requires_review: false,
            critical_issues_count: 0,
        },
        performance: Performance {
            total_duration: 4.5,
            analysis_duration: 1.0,
            prediction_duration: 0.5,
            review_duration: 3.0,
            average_duration: 1.5,
        },
        build_duration: 0.0,
        code_coverage_change: 0.0,
        previous_failure_rate: 0.1,
    }
}
