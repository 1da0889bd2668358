//! spirereg registry: a thin client over the SPIRE server entry API.
//!
//! The client owns request/response translation and error classification
//! only. It does not cache and does not retry; retry policy belongs to the
//! reconciler. Transports plug in behind [`RegistryTransport`].

#![forbid(unsafe_code)]

pub mod auth;
pub mod client;
pub mod error;
pub mod kube_exec;
pub mod memory;
pub mod status;
pub mod transport;

pub use auth::{connect, AuthConfig, ConfigError, KubeExecAuth, RawAuth, X509Auth};
pub use client::RegistryClient;
pub use error::RegistryError;
pub use kube_exec::KubeExecTransport;
pub use memory::{CallCounts, InMemoryRegistry, Op};
pub use status::{Code, RpcStatus};
pub use transport::{CreatedEntry, ListFilter, RegistryTransport};
