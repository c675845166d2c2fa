use uuid::Uuid;

/// Caller identity as supplied by the upstream gateway. Opaque to this service.
pub type UserId = String;
pub type AnalysisId = Uuid;
pub type FeedbackId = Uuid;

/// Abbreviate a UUID to its first 8 characters for more readable logs
pub fn abbrev_uuid(uuid: &Uuid) -> String {
    uuid.to_string().chars().take(8).collect()
}
