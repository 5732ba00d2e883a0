//! Error taxonomy shared by the sync client, matcher, and application tracker.

use thiserror::Error;

use crate::models::ApplicationStatus;

pub type GrantResult<T> = std::result::Result<T, GrantError>;

#[derive(Debug, Error)]
pub enum GrantError {
    /// Every source in the fallback chain failed. Nothing was written.
    #[error("grant source unavailable: {}", attempts.join("; "))]
    SourceUnavailable { attempts: Vec<String> },

    /// A single source record could not be normalised. Skipped and counted.
    #[error("record {record} skipped: {reason}")]
    RecordParse { record: String, reason: String },

    #[error("project cannot be scored: {0}")]
    InvalidProject(String),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        from: ApplicationStatus,
        to: ApplicationStatus,
    },

    #[error("no match exists for project {project_id} and grant {grant_id}")]
    NoMatchFound { project_id: String, grant_id: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("validation error: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl GrantError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        GrantError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Machine-readable code used by the HTTP error body.
    pub fn code(&self) -> &'static str {
        match self {
            GrantError::SourceUnavailable { .. } => "source_unavailable",
            GrantError::RecordParse { .. } => "record_parse",
            GrantError::InvalidProject(_) => "invalid_project",
            GrantError::InvalidTransition { .. } => "invalid_transition",
            GrantError::NoMatchFound { .. } => "no_match_found",
            GrantError::NotFound { .. } => "not_found",
            GrantError::Validation(_) => "bad_request",
            GrantError::Database(_) | GrantError::Json(_) | GrantError::Other(_) => "internal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_unavailable_lists_attempts() {
        let err = GrantError::SourceUnavailable {
            attempts: vec!["api: timeout".into(), "scrape: 503".into()],
        };
        assert_eq!(
            err.to_string(),
            "grant source unavailable: api: timeout; scrape: 503"
        );
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = GrantError::InvalidTransition {
            from: ApplicationStatus::Accepted,
            to: ApplicationStatus::Submitted,
        };
        assert_eq!(err.to_string(), "invalid transition from accepted to submitted");
        assert_eq!(err.code(), "invalid_transition");
    }
}
