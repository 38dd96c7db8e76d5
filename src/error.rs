//! Error types for AI Jobs.

use std::time::Duration;

use uuid::Uuid;

use crate::jobs::state::JobStage;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Record store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: Uuid },

    #[error("Record {id} changed concurrently: expected stage {expected}, found {actual}")]
    Conflict {
        id: Uuid,
        expected: JobStage,
        actual: JobStage,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} is in stage {from}, cannot transition to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStage,
        to: JobStage,
    },

    #[error("Job {id} cannot be cancelled in stage {stage}")]
    InvalidState { id: Uuid, stage: JobStage },

    #[error("{0}")]
    UpstreamFailure(String),

    #[error("{stage} step timed out after {timeout:?}")]
    Timeout { stage: JobStage, timeout: Duration },

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for JobError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { ref entity, id } if entity == "job" => Self::NotFound { id },
            other => Self::Store(other),
        }
    }
}

impl From<LlmError> for JobError {
    fn from(e: LlmError) -> Self {
        Self::UpstreamFailure(e.to_string())
    }
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LlmError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RequestFailed { .. } | Self::RateLimited { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_not_found_maps_to_job_not_found() {
        let id = Uuid::new_v4();
        let err: JobError = StoreError::NotFound {
            entity: "job".into(),
            id,
        }
        .into();
        assert!(matches!(err, JobError::NotFound { id: found } if found == id));

        let err: JobError = StoreError::NotFound {
            entity: "session".into(),
            id,
        }
        .into();
        assert!(matches!(err, JobError::Store(_)));
    }

    #[test]
    fn upstream_failure_preserves_message() {
        let err: JobError = LlmError::InvalidResponse {
            provider: "anthropic".into(),
            reason: "empty body".into(),
        }
        .into();
        assert!(err.to_string().contains("empty body"));
    }

    #[test]
    fn retryable_errors() {
        assert!(
            LlmError::RateLimited {
                provider: "p".into(),
                retry_after: None
            }
            .is_retryable()
        );
        assert!(!LlmError::AuthFailed { provider: "p".into() }.is_retryable());
    }
}
