//! Shared wire types for the roost control plane.
//!
//! Everything here crosses a process boundary (HTTP bodies, SSE events,
//! audit detail documents), so the serde representations are the contract.
//! No I/O and no async in this crate.

pub mod agent;
pub mod error;
pub mod event;

pub use agent::{AgentSnapshot, AgentStatus, PlatformKind, WorkflowKind};
pub use error::{ErrorKind, WorkflowError};
pub use event::ProgressEvent;
