//! Manifest loader: YAML with an auth block and a map of named entries.
//!
//! ```yaml
//! auth_kube_exec: { namespace: spire, label_selectors: app=spire-server }
//! entries:
//!   web:
//!     spiffe_id: spiffe://example.org/web
//!     parent_id: { trust_domain: example.org, segments: [spire-agent] }
//!     selectors: [{ type: k8s, value: "ns:default" }]
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value as Json;
use spirereg_core::{EntrySpec, RegistrationEntry, ValidationError};
use spirereg_registry::{AuthConfig, ConfigError, KubeExecAuth, RawAuth, X509Auth};
use tracing::debug;

fn max_manifest_bytes() -> usize {
    std::env::var("SPIREREG_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000)
}

fn max_manifest_nodes() -> usize {
    std::env::var("SPIREREG_MAX_MANIFEST_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("manifest too large (>{0} bytes)")]
    TooLarge(usize),
    #[error("manifest too complex (>{0} nodes)")]
    TooComplex(usize),
    #[error("parsing manifest: {0}")]
    Parse(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("entries.{key}.{source}")]
    Entry { key: String, source: ValidationError },
    #[error("entry key must not be empty")]
    EmptyKey,
    #[error("entries {first} and {second} describe the same registration (spiffe_id, parent_id, selectors)")]
    DuplicateEntry { first: String, second: String },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default)]
    auth_kube_exec: Option<KubeExecAuth>,
    #[serde(default)]
    auth_x509: Option<X509Auth>,
    #[serde(default)]
    entries: BTreeMap<String, EntrySpec>,
}

/// A loaded manifest. Entries are validated and keyed by their manifest
/// name, which is how the previously observed state is looked up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// `None` when the manifest carries no auth block; the caller then has
    /// to supply one.
    pub auth: Option<AuthConfig>,
    pub entries: BTreeMap<String, RegistrationEntry>,
}

impl Manifest {
    pub fn from_yaml(yaml: &str) -> Result<Self, ManifestError> {
        let max_bytes = max_manifest_bytes();
        if yaml.len() > max_bytes {
            return Err(ManifestError::TooLarge(max_bytes));
        }
        let val: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(|e| ManifestError::Parse(e.to_string()))?;
        let json = serde_json::to_value(val).map_err(|e| ManifestError::Parse(e.to_string()))?;
        let max_nodes = max_manifest_nodes();
        if node_budget_exceeded(&json, max_nodes) {
            return Err(ManifestError::TooComplex(max_nodes));
        }
        // an empty document parses as null
        let json = if json.is_null() { Json::Object(Default::default()) } else { json };
        let raw: RawManifest = serde_json::from_value(json).map_err(|e| ManifestError::Parse(e.to_string()))?;

        let auth = match (raw.auth_kube_exec, raw.auth_x509) {
            (None, None) => None,
            (k, x) => Some(AuthConfig::try_from(RawAuth { auth_kube_exec: k, auth_x509: x })?),
        };

        let mut entries: BTreeMap<String, RegistrationEntry> = BTreeMap::new();
        for (key, spec) in raw.entries {
            if key.trim().is_empty() {
                return Err(ManifestError::EmptyKey);
            }
            let entry = spec.into_entry().map_err(|source| ManifestError::Entry { key: key.clone(), source })?;
            if let Some((first, _)) = entries.iter().find(|(_, e)| e.same_identity(&entry)) {
                return Err(ManifestError::DuplicateEntry { first: first.clone(), second: key });
            }
            entries.insert(key, entry);
        }
        debug!(entries = entries.len(), auth = auth.as_ref().map(AuthConfig::kind), "manifest loaded");
        Ok(Self { auth, entries })
    }

    pub fn require_auth(&self) -> Result<&AuthConfig, ConfigError> { self.auth.as_ref().ok_or(ConfigError::MissingAuth) }
}
