use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::store::models::Feedback;
use crate::types::AnalysisId;

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FeedbackCreate {
    #[schema(value_type = Option<String>, format = "uuid")]
    pub analysis_id: Option<AnalysisId>,
    /// 1-5
    pub rating: Option<i64>,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FeedbackList {
    /// Newest first
    pub feedback: Vec<Feedback>,
}
