//! Registry error taxonomy.

use serde::{Deserialize, Serialize};

use crate::status::{Code, RpcStatus};

/// Classified registry failure. The orchestrator relies on the variant to
/// tell configuration mistakes from transient outages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum RegistryError {
    #[error("already_exists: {0}")]
    AlreadyExists(String),
    #[error("not_found: {0}")]
    NotFound(String),
    /// Optimistic-concurrency guard tripped: the revision supplied with an
    /// update is no longer current.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid_argument: {0}")]
    InvalidArgument(String),
    /// Transport-level failure; retryable by the caller with backoff.
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("unknown: {0}")]
    Unknown(String),
}

impl RegistryError {
    pub fn is_retryable(&self) -> bool { matches!(self, RegistryError::Unavailable(_)) }

    pub fn is_not_found(&self) -> bool { matches!(self, RegistryError::NotFound(_)) }
}

impl From<RpcStatus> for RegistryError {
    fn from(s: RpcStatus) -> Self {
        let msg = s.message;
        match s.code {
            Code::AlreadyExists => RegistryError::AlreadyExists(msg),
            Code::NotFound => RegistryError::NotFound(msg),
            Code::FailedPrecondition | Code::Aborted => RegistryError::Conflict(msg),
            Code::InvalidArgument | Code::OutOfRange => RegistryError::InvalidArgument(msg),
            Code::Unavailable | Code::DeadlineExceeded => RegistryError::Unavailable(msg),
            other => RegistryError::Unknown(format!("{}: {}", other, msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_table() {
        let cases = [
            (Code::AlreadyExists, "already_exists"),
            (Code::NotFound, "not_found"),
            (Code::FailedPrecondition, "conflict"),
            (Code::Aborted, "conflict"),
            (Code::InvalidArgument, "invalid_argument"),
            (Code::OutOfRange, "invalid_argument"),
            (Code::Unavailable, "unavailable"),
            (Code::DeadlineExceeded, "unavailable"),
            (Code::PermissionDenied, "unknown"),
            (Code::Internal, "unknown"),
        ];
        for (code, prefix) in cases {
            let e = RegistryError::from(RpcStatus::new(code, "m"));
            assert!(e.to_string().starts_with(prefix), "{code} -> {e}");
        }
    }

    #[test]
    fn only_unavailable_is_retryable() {
        assert!(RegistryError::Unavailable("x".into()).is_retryable());
        assert!(!RegistryError::Conflict("x".into()).is_retryable());
        assert!(!RegistryError::Unknown("x".into()).is_retryable());
    }
}
