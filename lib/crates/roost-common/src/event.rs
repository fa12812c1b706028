//! Streamed progress protocol for workflow executions.

use serde::{Deserialize, Serialize};

use crate::agent::AgentSnapshot;
use crate::error::ErrorKind;

/// One event in a workflow's ordered progress sequence.
///
/// A workflow emits any number of `log` / `span_start` / `span_end` events
/// followed by exactly one terminal event (`complete` or `error`). Spans may
/// nest; `depth` is 0 for top-level steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Log {
        message: String,
    },
    SpanStart {
        name: String,
        depth: u32,
    },
    SpanEnd {
        name: String,
        depth: u32,
        elapsed_ms: u64,
    },
    Complete {
        agent: AgentSnapshot,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl ProgressEvent {
    /// True for the events that close a workflow's stream.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }

    /// Event name as used for the SSE `event:` field.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Log { .. } => "log",
            Self::SpanStart { .. } => "span_start",
            Self::SpanEnd { .. } => "span_end",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }
}
