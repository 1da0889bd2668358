use spirereg_core::{SpiffeId, ValidationError};
use spirereg_registry::RegistryError;

use crate::manifest::ManifestError;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Rejected locally; no RPC was issued.
    #[error("validation: {0}")]
    Validation(#[from] ValidationError),
    /// Surfaced with its original classification.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// An update path found the live entry under a different parent. The
    /// server cannot reparent in place; plan again to get a replace.
    #[error("entry {entry_id} moved from parent {observed} (desired {desired}); re-plan to replace it")]
    ParentChanged { entry_id: String, observed: SpiffeId, desired: SpiffeId },
    #[error("manifest: {0}")]
    Manifest(#[from] ManifestError),
}

impl ReconcileError {
    pub fn is_retryable(&self) -> bool { matches!(self, ReconcileError::Registry(e) if e.is_retryable()) }

    /// Failures caused by local input rather than by the server.
    pub fn is_local(&self) -> bool { matches!(self, ReconcileError::Validation(_) | ReconcileError::Manifest(_)) }
}
