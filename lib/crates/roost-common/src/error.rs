//! Normalized failure taxonomy for workflow execution.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure classification carried on terminal `error` events and in audit
/// detail documents. Vendor-specific error text travels in the accompanying
/// message, never as its own type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input, rejected before any side effect.
    ValidationError,
    /// The agent's operation lock is already held.
    Conflict,
    /// A cloud backend call failed; the vendor message is preserved verbatim.
    BackendError,
    /// A step exceeded its deadline.
    Timeout,
    /// Teardown removed some but not all resources.
    PartialFailure,
}

impl ErrorKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "validation_error",
            Self::Conflict => "conflict",
            Self::BackendError => "backend_error",
            Self::Timeout => "timeout",
            Self::PartialFailure => "partial_failure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wire form of a failed workflow, returned by non-streaming calls.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{kind}: {message}")]
pub struct WorkflowError {
    pub kind: ErrorKind,
    pub message: String,
}
