//! Capability backend selection.
//!
//! One implementation of the four capability ports exists per vendor and is
//! chosen exactly once at process start from configuration. The orchestrator
//! only ever sees the trait objects bundled here. The `local` vendor is an
//! in-process implementation used for development and tests; real cloud SDK
//! bindings plug in as additional [`BackendKind`] variants with their own
//! modules.

pub mod local;

use std::sync::Arc;

use serde::Deserialize;

use crate::application::ports::{
    ComputeBackend, IdentityBackend, ObjectStoreBackend, SecretBackend,
};
use crate::infra::crypto::SecretSealer;

/// Configured vendor choice.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Local,
}

/// The four capability implementations for the selected vendor.
#[derive(Clone)]
pub struct Backends {
    pub compute: Arc<dyn ComputeBackend>,
    pub objects: Arc<dyn ObjectStoreBackend>,
    pub secrets: Arc<dyn SecretBackend>,
    pub identity: Arc<dyn IdentityBackend>,
}

impl Backends {
    /// Build the backend set for `kind`.
    #[must_use]
    pub fn build(kind: BackendKind, sealer: SecretSealer) -> Self {
        match kind {
            BackendKind::Local => Self {
                compute: Arc::new(local::LocalCompute::new()),
                objects: Arc::new(local::LocalObjectStore::new()),
                secrets: Arc::new(local::LocalSecrets::new(sealer)),
                identity: Arc::new(local::LocalIdentity),
            },
        }
    }
}
