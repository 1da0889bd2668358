//! Local validation errors. None of these ever reach the server.

use serde::{Deserialize, Serialize};

/// Errors raised while parsing a SPIFFE ID.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum IdError {
    #[error("invalid trust domain {0:?}: must be non-empty and use only [a-z0-9-.]")]
    InvalidTrustDomain(String),
    #[error("invalid path segment {0:?}: must be non-empty, not '.' or '..', and free of '/'")]
    InvalidPathSegment(String),
    #[error("invalid SPIFFE ID {0:?}: expected spiffe://<trust-domain>[/<segment>...]")]
    InvalidScheme(String),
}

/// Errors raised while normalizing a selector list.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum SelectorError {
    #[error("duplicate selector {kind}:{value}")]
    DuplicateSelector { kind: String, value: String },
    #[error("selector type is empty")]
    EmptySelectorType,
    #[error("selector value is empty (type {0})")]
    EmptySelectorValue(String),
    #[error("selector type {0:?} must not contain ':' or whitespace")]
    InvalidSelectorType(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ValidationErrorKind {
    #[error(transparent)]
    Id(#[from] IdError),
    #[error(transparent)]
    Selector(#[from] SelectorError),
    #[error("at least one selector is required")]
    EmptySelectors,
    #[error("spiffe_id must differ from parent_id ({0})")]
    SelfParenting(String),
    #[error("federated trust domain {0} must not carry a path")]
    NotTrustDomainOnly(String),
    #[error("must be >= 0 (got {0})")]
    Negative(i64),
    #[error("value {0} is out of range")]
    OutOfRange(i64),
    #[error("invalid DNS name {0:?}")]
    InvalidDnsName(String),
    #[error("is server-assigned and must not be set by the client")]
    ServerAssigned,
}

/// A validation failure tagged with the offending field (`spiffe_id`,
/// `selectors[2]`, `federates_with[0]`, ...).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[error("{field}: {kind}")]
pub struct ValidationError {
    pub field: String,
    pub kind: ValidationErrorKind,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, kind: impl Into<ValidationErrorKind>) -> Self {
        Self { field: field.into(), kind: kind.into() }
    }
}
