//! Authentication strategy and the connection factory.
//!
//! Configuration carries two optional blocks; exactly one must be set.
//! [`RawAuth`] is what gets deserialized, [`AuthConfig`] is what the rest of
//! the code sees.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::RegistryError;
use crate::kube_exec::KubeExecTransport;
use crate::transport::RegistryTransport;

pub const DEFAULT_SERVER_BINARY: &str = "/opt/spire/bin/spire-server";

fn default_server_binary() -> String { DEFAULT_SERVER_BINARY.to_string() }

/// Reach the server by exec'ing its CLI inside the server pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KubeExecAuth {
    pub namespace: String,
    /// Kubernetes label selector, e.g. `app=spire-server`.
    pub label_selectors: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<String>,
    #[serde(default = "default_server_binary")]
    pub server_binary: String,
}

impl KubeExecAuth {
    pub fn new(namespace: impl Into<String>, label_selectors: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            label_selectors: label_selectors.into(),
            container: None,
            socket_path: None,
            server_binary: default_server_binary(),
        }
    }
}

/// Direct connection to the server API using an X509-SVID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct X509Auth {
    pub server_host: String,
    pub server_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthConfig {
    KubeExec(KubeExecAuth),
    X509(X509Auth),
}

impl AuthConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            AuthConfig::KubeExec(_) => "kube_exec",
            AuthConfig::X509(_) => "x509",
        }
    }
}

/// Auth blocks as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_kube_exec: Option<KubeExecAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_x509: Option<X509Auth>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("auth_kube_exec and auth_x509 are mutually exclusive")]
    ConflictingAuth,
    #[error("one of auth_kube_exec or auth_x509 is required")]
    MissingAuth,
    #[error("{field}: {reason}")]
    Invalid { field: String, reason: String },
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field: field.to_string(), reason: reason.to_string() }
}

impl TryFrom<RawAuth> for AuthConfig {
    type Error = ConfigError;

    fn try_from(raw: RawAuth) -> Result<Self, ConfigError> {
        match (raw.auth_kube_exec, raw.auth_x509) {
            (Some(_), Some(_)) => Err(ConfigError::ConflictingAuth),
            (None, None) => Err(ConfigError::MissingAuth),
            (Some(k), None) => {
                if k.namespace.trim().is_empty() {
                    return Err(invalid("auth_kube_exec.namespace", "must not be empty"));
                }
                if k.label_selectors.trim().is_empty() {
                    return Err(invalid("auth_kube_exec.label_selectors", "must not be empty"));
                }
                if k.server_binary.trim().is_empty() {
                    return Err(invalid("auth_kube_exec.server_binary", "must not be empty"));
                }
                Ok(AuthConfig::KubeExec(k))
            }
            (None, Some(x)) => {
                if x.server_host.trim().is_empty() {
                    return Err(invalid("auth_x509.server_host", "must not be empty"));
                }
                if x.server_port == 0 {
                    return Err(invalid("auth_x509.server_port", "must be non-zero"));
                }
                Ok(AuthConfig::X509(x))
            }
        }
    }
}

/// Build the transport for `auth`. The returned handle is long-lived and
/// meant to be shared across every client and reconciler.
pub async fn connect(auth: &AuthConfig) -> Result<Arc<dyn RegistryTransport>, RegistryError> {
    match auth {
        AuthConfig::KubeExec(k) => {
            let t = KubeExecTransport::connect(k.clone()).await?;
            info!(namespace = %k.namespace, selector = %k.label_selectors, "kube-exec transport ready");
            Ok(Arc::new(t))
        }
        AuthConfig::X509(x) => Err(RegistryError::InvalidArgument(format!(
            "no X509-SVID channel factory for {}:{}; supply a RegistryTransport directly",
            x.server_host, x.server_port
        ))),
    }
}
