//! HTTP clients for the analysis, prediction and review stage services.
//!
//! One call per stage, no retries. Any failure (transport, timeout, non-2xx, unreadable body)
//! becomes a [`StageFailure`]; whether that failure is fatal is the orchestrator's decision.

use serde_json::{Value, json};
use std::fmt;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, instrument};

use super::models::{AnalysisOutput, PipelineRequest, PredictionOutput, Review};
use crate::config::{ServiceEndpoint, StagesConfig};
use crate::http::{CallError, post_json};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Analysis,
    Prediction,
    Review,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Analysis => "analysis",
            Stage::Prediction => "prediction",
            Stage::Review => "review",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Analysis => f.write_str("Analysis"),
            Stage::Prediction => f.write_str("Prediction"),
            Stage::Review => f.write_str("Review"),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("{stage} failed: {message}")]
pub struct StageFailure {
    pub stage: Stage,
    pub message: String,
}

impl StageFailure {
    fn new(stage: Stage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
        }
    }

    fn from_call(stage: Stage, err: CallError) -> Self {
        let message = match err {
            CallError::Status { message, .. } => message,
            other => other.to_string(),
        };
        Self::new(stage, message)
    }
}

/// Where the review lives in a review-service response. Locations are checked by presence in
/// declaration order; the first one present decides the shape, and a review that does not parse
/// there is [`ReviewShape::Malformed`] rather than a reason to look further.
#[derive(Debug)]
pub enum ReviewShape {
    /// `{ data: { review: {...} } }`
    DataReview(Review),
    /// `{ data: {...} }`
    Data(Review),
    /// `{ review: {...} }`
    Review(Review),
    /// The review is the body itself
    Root(Review),
    Malformed { location: &'static str, reason: String },
    Unrecognized,
}

fn present<'a>(value: Option<&'a Value>) -> Option<&'a Value> {
    value.filter(|v| !v.is_null())
}

impl ReviewShape {
    pub fn classify(body: &Value) -> ReviewShape {
        let data = present(body.get("data"));

        if let Some(review) = present(data.and_then(|d| d.get("review"))) {
            return Self::parse(review, "data.review", ReviewShape::DataReview);
        }
        if let Some(data) = data {
            return Self::parse(data, "data", ReviewShape::Data);
        }
        if let Some(review) = present(body.get("review")) {
            return Self::parse(review, "review", ReviewShape::Review);
        }
        match serde_json::from_value::<Review>(body.clone()) {
            Ok(review) if body.is_object() => ReviewShape::Root(review),
            _ => ReviewShape::Unrecognized,
        }
    }

    fn parse(value: &Value, location: &'static str, shape: fn(Review) -> ReviewShape) -> ReviewShape {
        match serde_json::from_value::<Review>(value.clone()) {
            Ok(review) => shape(review),
            Err(e) => ReviewShape::Malformed {
                location,
                reason: e.to_string(),
            },
        }
    }

    pub fn into_review(self) -> Result<Review, String> {
        match self {
            ReviewShape::DataReview(review) | ReviewShape::Data(review) | ReviewShape::Review(review) | ReviewShape::Root(review) => {
                Ok(review)
            }
            ReviewShape::Malformed { location, reason } => Err(format!("malformed review at `{location}`: {reason}")),
            ReviewShape::Unrecognized => Err("unrecognised review response shape".to_string()),
        }
    }
}

/// Services commonly wrap their answer as `{ data: ... }`.
fn unwrap_data(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.get("data").is_some_and(Value::is_object) => map.remove("data").unwrap_or_default(),
        other => other,
    }
}

#[derive(Clone)]
pub struct StageClients {
    client: reqwest::Client,
    analysis: ServiceEndpoint,
    prediction: ServiceEndpoint,
    review: ServiceEndpoint,
}

impl StageClients {
    pub fn new(client: reqwest::Client, config: &StagesConfig) -> Self {
        Self {
            client,
            analysis: config.analysis.clone(),
            prediction: config.prediction.clone(),
            review: config.review.clone(),
        }
    }

    async fn call(&self, stage: Stage, endpoint: &ServiceEndpoint, body: &Value) -> Result<Value, StageFailure> {
        let started = Instant::now();
        let result = post_json(&self.client, &endpoint.url, endpoint.timeout, body).await;
        let elapsed = started.elapsed().as_secs_f64();

        metrics::histogram!("mergegate_stage_duration_seconds", "stage" => stage.as_str()).record(elapsed);
        debug!(stage = stage.as_str(), elapsed_secs = elapsed, ok = result.is_ok(), "Stage call finished");

        result.map_err(|e| StageFailure::from_call(stage, e))
    }

    /// Structural analysis of the submitted code.
    #[instrument(skip_all, err)]
    pub async fn analyze(&self, request: &PipelineRequest, file_id: &str, developer: &str) -> Result<AnalysisOutput, StageFailure> {
        let body = json!({
            "code": request.code,
            "fileId": file_id,
            "developer": developer,
            "linesAdded": request.lines_added,
            "linesDeleted": request.lines_deleted,
            "filesChanged": request.files_changed,
            "codeCoverageChange": request.code_coverage_change,
            "buildDuration": request.build_duration,
            "previousFailureRate": request.previous_failure_rate,
        });

        let response = self.call(Stage::Analysis, &self.analysis, &body).await?;
        serde_json::from_value(unwrap_data(response))
            .map_err(|e| StageFailure::new(Stage::Analysis, format!("unrecognised analysis response: {e}")))
    }

    /// Failure probability from the ML feature vector.
    #[instrument(skip_all, err)]
    pub async fn predict(&self, features: &Value) -> Result<PredictionOutput, StageFailure> {
        let response = self.call(Stage::Prediction, &self.prediction, features).await?;
        let prediction: PredictionOutput = serde_json::from_value(unwrap_data(response))
            .map_err(|e| StageFailure::new(Stage::Prediction, format!("unrecognised prediction response: {e}")))?;

        if !(0.0..=1.0).contains(&prediction.failure_probability) {
            return Err(StageFailure::new(
                Stage::Prediction,
                format!("failure_probability {} is outside [0, 1]", prediction.failure_probability),
            ));
        }
        Ok(prediction)
    }

    /// Natural-language review of the change, informed by the first two stages.
    #[instrument(skip_all, err)]
    pub async fn review(&self, file_id: &str, analysis: &AnalysisOutput, prediction: &PredictionOutput) -> Result<Review, StageFailure> {
        let body = json!({
            "analysis": {
                "fileId": file_id,
                "metrics": analysis.metrics,
                "functions": analysis.functions,
                "mernPatterns": analysis.mern_patterns,
                "dependencies": analysis.dependencies,
            },
            "prediction": {
                "predicted_failure": prediction.predicted_failure,
                "failure_probability": prediction.failure_probability,
                "will_fail": prediction.will_fail(),
                "confidence": prediction.confidence,
            },
        });

        let response = self.call(Stage::Review, &self.review, &body).await?;
        ReviewShape::classify(&response)
            .into_review()
            .map_err(|message| StageFailure::new(Stage::Review, message))
    }
}
