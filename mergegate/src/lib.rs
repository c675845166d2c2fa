//! # mergegate: merge decisions for pull requests
//!
//! `mergegate` turns a code change into a merge decision. It calls three stage services in order
//! (structural analysis, failure prediction, natural-language review), combines their answers with
//! fixed rules into `canMerge` / `requiresReview`, stores the decision record, and keeps running
//! per-user statistics over those records.
//!
//! It also fronts a small background job system: jobs are validated and published to an external
//! queue provider (QStash), which later calls back into `/webhooks/{queue}` with a signed delivery.
//! The delivery is verified and forwarded to the worker service for that queue.
//!
//! ## Architecture
//!
//! The HTTP layer is [Axum](https://github.com/tokio-rs/axum). State is shared through
//! [`AppState`], built once in [`Application::new`].
//!
//! ```text
//! client ──> /queues/{q}/jobs ──> QueuePublisher ──> provider ──> /webhooks/{q}
//!                                                                   │ SignatureVerifier
//!                                                                   └─> WebhookRouter ──> worker service
//!
//! client ──> /analyze-pr ──> Orchestrator ──> analysis ──> prediction ──> review
//!                                 │
//!                                 └─> ResultStore ──> AnalyticsAggregator
//! ```
//!
//! - [`queue`]: job schemas, publishing, signature verification, delivery routing
//! - [`pipeline`]: stage clients and the orchestrator
//! - [`store`]: decision records, feedback and analytics rows (in-memory or PostgreSQL)
//! - [`analytics`]: incremental and recalculated per-user statistics
//! - [`api`]: HTTP handlers and models
//!
//! ## Getting Started
//!
//! ```no_run
//! use mergegate::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::default();
//!     mergegate::telemetry::init_telemetry(config.enable_otel_export)?;
//!
//!     Application::new(config)
//!         .await?
//!         .serve(async {
//!             let _ = tokio::signal::ctrl_c().await;
//!         })
//!         .await
//! }
//! ```
//!
//! ## Configuration
//!
//! See the [`config`] module.

pub mod analytics;
pub mod api;
pub mod auth;
pub mod config;
pub mod errors;
pub mod http;
mod openapi;
pub mod pipeline;
pub mod queue;
pub mod store;
pub mod telemetry;
pub mod types;

#[cfg(test)]
pub mod test_utils;

use anyhow::Context;
use axum::{
    Router,
    http::HeaderValue,
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
pub use config::Config;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, warn};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

use crate::{
    analytics::AnalyticsAggregator,
    config::{QueueMode, StoreConfig},
    openapi::ApiDoc,
    pipeline::{Orchestrator, stages::StageClients},
    queue::{
        publisher::{QstashProvider, QueueProvider, QueuePublisher},
        router::WebhookRouter,
        signature::SignatureVerifier,
    },
    store::{ResultStore, in_memory::InMemoryStore, postgres::PostgresStore},
};

/// Application state shared across all request handlers.
///
/// # Example
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .store(store)
///     .publisher(publisher)
///     .router(router)
///     .verifier(verifier)
///     .orchestrator(orchestrator)
///     .analytics(analytics)
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn ResultStore>,
    pub publisher: QueuePublisher,
    pub router: WebhookRouter,
    pub verifier: SignatureVerifier,
    pub orchestrator: Orchestrator,
    pub analytics: AnalyticsAggregator,
}

/// Get the mergegate database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// Queue provider used when no real provider is configured (direct mode). Publishing through it is a
/// configuration error, since direct mode never publishes.
struct NoProvider;

#[async_trait::async_trait]
impl QueueProvider for NoProvider {
    async fn publish(&self, _request: queue::publisher::PublishRequest) -> Result<String, queue::QueueError> {
        Err(queue::QueueError::NotConfigured(
            "no queue provider in direct mode".to_string(),
        ))
    }
}

async fn setup_store(config: &Config) -> anyhow::Result<Arc<dyn ResultStore>> {
    match &config.store {
        StoreConfig::Memory => {
            info!("Using in-memory result store; records are lost on restart");
            Ok(Arc::new(InMemoryStore::new()))
        }
        StoreConfig::Postgres { url, max_connections } => {
            let store = PostgresStore::connect(url, *max_connections)
                .await
                .context("connecting to PostgreSQL")?;
            store.migrate().await.context("running migrations")?;
            info!("Using PostgreSQL result store");
            Ok(Arc::new(store))
        }
    }
}

/// Assemble the shared state from configuration and an already-opened store.
pub fn build_state(config: Config, store: Arc<dyn ResultStore>, provider: Arc<dyn QueueProvider>) -> anyhow::Result<AppState> {
    let client = http::build_client().context("building HTTP client")?;

    let publisher = QueuePublisher::new(provider, &config.queue);
    let router = WebhookRouter::new(client.clone(), config.workers.clone(), &config.queue.completed_jobs);
    let verifier = SignatureVerifier::new(&config.queue.signing);
    let analytics = AnalyticsAggregator::new(store.clone());
    let orchestrator = Orchestrator::new(StageClients::new(client, &config.stages), store.clone(), analytics.clone());

    Ok(AppState::builder()
        .config(config)
        .store(store)
        .publisher(publisher)
        .router(router)
        .verifier(verifier)
        .orchestrator(orchestrator)
        .analytics(analytics)
        .build())
}

/// Create CORS layer from configuration
fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    // tower-http rejects `*` inside an origin list
    let allow_origin = if config.cors_allowed_origins.iter().any(|o| o == "*") {
        AllowOrigin::any()
    } else {
        let mut origins = Vec::new();
        for origin in &config.cors_allowed_origins {
            origins.push(origin.parse::<HeaderValue>()?);
        }
        AllowOrigin::list(origins)
    };

    Ok(CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::HeaderName::try_from(config.auth.user_header.as_str())?,
        ]))
}

/// Build the application router with all endpoints and middleware
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    use api::handlers::{analyses, analytics, feedback, queues, webhooks};

    let api_routes = Router::new()
        // Pipeline
        .route("/analyze-pr", post(analyses::analyze_pr))
        .route("/analyses", get(analyses::list_analyses))
        .route("/analyses/{id}", get(analyses::get_analysis))
        .route(
            "/repositories/{repository_full_name}/analyses",
            get(analyses::list_repository_analyses),
        )
        .route("/metrics-history", get(analyses::metrics_history))
        // Feedback
        .route("/feedback", post(feedback::submit_feedback).get(feedback::list_feedback))
        // Analytics
        .route("/analytics", get(analytics::get_analytics))
        .route("/analytics/recalculate", post(analytics::recalculate_analytics))
        // Job submission
        .route("/queues/{queue_name}/jobs", post(queues::submit_job))
        .route("/queues/{queue_name}/jobs/bulk", post(queues::submit_bulk_jobs))
        .route("/queues/{queue_name}/schedule", post(queues::schedule_job))
        // Provider callbacks
        .route("/webhooks/{queue_name}", post(webhooks::receive_delivery))
        .with_state(state.clone());

    let mut router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .merge(api_routes)
        .merge(Scalar::with_url("/docs", ApiDoc::openapi()));

    if !state.config.cors_allowed_origins.is_empty() {
        router = router.layer(create_cors_layer(&state.config)?);
    }

    // Add Prometheus metrics if enabled
    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::DEBUG))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// Main application struct that owns the router and configuration.
///
/// # Lifecycle
///
/// 1. **Create**: [`Application::new`] opens the store (running migrations for PostgreSQL), builds
///    the queue provider and stage clients, and assembles the router
/// 2. **Serve**: [`Application::serve`] binds to a TCP port and starts handling requests
/// 3. **Shutdown**: when the shutdown future resolves, in-flight requests drain and telemetry is flushed
pub struct Application {
    router: Router,
    config: Config,
}

impl Application {
    /// Create a new application instance with all resources initialized
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting mergegate with configuration: {:#?}", config);

        if config.queue.mode == QueueMode::Direct {
            warn!("Queue direct mode is enabled: jobs run in-process and are never published. Do not use in production.");
        }
        if config.queue.skip_signature_verification {
            warn!("Webhook signature verification is disabled. Do not use in production.");
        }

        let store = setup_store(&config).await?;
        let provider: Arc<dyn QueueProvider> = match config.queue.mode {
            QueueMode::Provider => Arc::new(QstashProvider::new(http::build_client()?, &config.queue)?),
            QueueMode::Direct => Arc::new(NoProvider),
        };

        let state = build_state(config.clone(), store, provider)?;
        let router = build_router(&state)?;

        Ok(Self { router, config })
    }

    /// Convert application into a test server (for tests)
    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router).expect("Failed to create test server")
    }

    /// Start serving the application
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("mergegate listening on http://{}", bind_addr);

        axum::serve(listener, self.router).with_graceful_shutdown(shutdown).await?;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}

#[cfg(test)]
mod test;
