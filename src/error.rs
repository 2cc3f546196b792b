use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Run-level errors. Only these abort a run; everything a single task can hit
/// is folded into a [`FailureReason`] instead.
#[derive(Debug, Error)]
pub enum ConvoyError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Engine has been cleaned up")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Errors from the resource pool.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool exhausted ({capacity} resources in use or retiring)")]
    Exhausted { capacity: usize },

    #[error("failed to create resource: {0}")]
    Creation(String),

    #[error("pool has been cleaned up")]
    Closed,
}

/// Errors from credential providers.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("provider {provider} unavailable: {message}")]
    Unavailable { provider: String, message: String },

    #[error("no credential provider configured")]
    NoProviders,

    #[error("credential fetch was aborted")]
    Aborted,
}

/// A workflow step the external driver could not complete.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{step}: {message}")]
pub struct StepError {
    pub step: String,
    pub message: String,
}

impl StepError {
    pub fn new(step: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            message: message.into(),
        }
    }
}

/// Why a task ended in `Failed`. All of these are task-fatal and none are
/// retried inside the task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    ResourceUnavailable(String),
    CredentialUnavailable(String),
    WorkflowStepFailed(String),
    ChallengeUnsolved { submissions: u32 },
    ConfirmationTimeout,
    /// The target explicitly reported a negative final acknowledgment.
    Rejected(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::ResourceUnavailable(msg) => write!(f, "resource unavailable: {msg}"),
            FailureReason::CredentialUnavailable(msg) => {
                write!(f, "credential unavailable: {msg}")
            }
            FailureReason::WorkflowStepFailed(msg) => write!(f, "workflow step failed: {msg}"),
            FailureReason::ChallengeUnsolved { submissions } => {
                write!(f, "challenge unsolved after {submissions} submissions")
            }
            FailureReason::ConfirmationTimeout => write!(f, "no confirmation code received"),
            FailureReason::Rejected(msg) => write!(f, "rejected: {msg}"),
        }
    }
}

impl From<PoolError> for FailureReason {
    fn from(e: PoolError) -> Self {
        FailureReason::ResourceUnavailable(e.to_string())
    }
}

impl From<CredentialError> for FailureReason {
    fn from(e: CredentialError) -> Self {
        FailureReason::CredentialUnavailable(e.to_string())
    }
}

impl From<StepError> for FailureReason {
    fn from(e: StepError) -> Self {
        FailureReason::WorkflowStepFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reason_display() {
        let reason = FailureReason::ChallengeUnsolved { submissions: 6 };
        assert_eq!(reason.to_string(), "challenge unsolved after 6 submissions");

        let reason: FailureReason = StepError::new("fill_identity", "field missing").into();
        assert_eq!(
            reason.to_string(),
            "workflow step failed: fill_identity: field missing"
        );
    }

    #[test]
    fn pool_error_maps_to_resource_unavailable() {
        let reason: FailureReason = PoolError::Exhausted { capacity: 4 }.into();
        assert!(matches!(reason, FailureReason::ResourceUnavailable(_)));
    }

    #[test]
    fn credential_error_display() {
        let err = CredentialError::Unavailable {
            provider: "primary".into(),
            message: "HTTP 503".into(),
        };
        assert_eq!(err.to_string(), "provider primary unavailable: HTTP 503");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ConvoyError>();
        assert_send_sync::<FailureReason>();
    }
}
