//! Application services — use-cases driving the ports, plus the in-process
//! mechanisms the orchestrator is built from (keyed locks, progress
//! channels).

pub mod credentials;
pub mod locks;
pub mod orchestrator;
pub mod progress;
pub mod scoping;

pub use credentials::CredentialService;
pub use orchestrator::{
    Caller, CreateAgent, Orchestrator, OrchestratorSettings, WorkflowHandle, WorkflowRequest,
};
pub use scoping::CredentialScopingService;
