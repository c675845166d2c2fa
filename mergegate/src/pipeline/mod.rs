//! The merge-decision pipeline.
//!
//! A [`PipelineRequest`](models::PipelineRequest) passes through the analysis, prediction and review
//! stage services in that order ([`stages`]), and the [`orchestrator`] folds their outputs into one
//! [`AnalysisResult`](crate::store::models::AnalysisResult) carrying the merge decision.

pub mod models;
pub mod orchestrator;
pub mod stages;

pub use orchestrator::{Orchestrator, PipelineStage};
