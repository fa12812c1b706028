//! Typed workflow error taxonomy.
//!
//! Every failure that escapes a workflow is one of these variants; the api
//! layer maps them onto HTTP statuses and the orchestrator maps them onto
//! terminal progress events and audit outcomes.

use roost_common::ErrorKind;
use thiserror::Error;

/// Normalized orchestration failure.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Bad input or violated precondition. No side effect has occurred.
    #[error("{0}")]
    Validation(String),

    /// The target record does not exist (or belongs to someone else).
    #[error("{0} not found")]
    NotFound(&'static str),

    /// Another workflow currently holds the agent's operation lock.
    #[error("agent is busy with another operation")]
    Conflict,

    /// A cloud backend call failed. `message` carries the vendor error
    /// text verbatim for audit and debugging.
    #[error("{step}: {message}")]
    Backend { step: String, message: String },

    /// A step exceeded its deadline.
    #[error("step '{step}' exceeded its {seconds}s deadline")]
    Timeout { step: String, seconds: u64 },

    /// Teardown removed some but not all resources; `detail` names the
    /// resources that failed.
    #[error("teardown incomplete: {detail}")]
    Partial { detail: String },

    /// The state store failed mid-workflow.
    #[error("state store: {0}")]
    Store(String),
}

impl OrchestratorError {
    /// Wire classification for this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::NotFound(_) => ErrorKind::ValidationError,
            Self::Conflict => ErrorKind::Conflict,
            Self::Backend { .. } | Self::Store(_) => ErrorKind::BackendError,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Partial { .. } => ErrorKind::PartialFailure,
        }
    }

    /// Wrap a store failure, flattening the anyhow chain into one line.
    #[must_use]
    pub fn store(err: &anyhow::Error) -> Self {
        Self::Store(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_onto_wire_taxonomy() {
        assert_eq!(
            OrchestratorError::Validation("bad name".into()).kind(),
            ErrorKind::ValidationError
        );
        assert_eq!(OrchestratorError::Conflict.kind(), ErrorKind::Conflict);
        assert_eq!(
            OrchestratorError::Timeout {
                step: "health probe".into(),
                seconds: 600
            }
            .kind(),
            ErrorKind::Timeout
        );
        assert_eq!(
            OrchestratorError::Partial {
                detail: "instance".into()
            }
            .kind(),
            ErrorKind::PartialFailure
        );
    }

    #[test]
    fn backend_error_preserves_vendor_text() {
        let err = OrchestratorError::Backend {
            step: "provision instance".into(),
            message: "QUOTA_EXCEEDED: CPUS quota exceeded in zone us-central1-a".into(),
        };
        assert!(err.to_string().contains("QUOTA_EXCEEDED"));
    }
}
