//! Wire shape of a registration entry as exchanged with the registry API.
//!
//! IDs travel as canonical SPIFFE ID strings and durations as integer
//! seconds. Zero TTL / expiry are passed through untouched: the server reads
//! zero as "unset". Unknown fields land in `extra` and survive a
//! `from_wire` / `to_wire` cycle through [`RegistrationEntry::extensions`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::entry::{Field, RegistrationEntry};
use crate::error::{ValidationError, ValidationErrorKind as K};
use crate::selector::{Selector, SelectorSet};
use crate::spiffe_id::SpiffeId;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSelector {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEntry {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub spiffe_id: String,
    pub parent_id: String,
    #[serde(default)]
    pub selectors: Vec<WireSelector>,
    #[serde(default)]
    pub ttl: i32,
    #[serde(default)]
    pub federates_with: Vec<String>,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub downstream: bool,
    #[serde(default)]
    pub entry_expiry: i64,
    #[serde(default)]
    pub dns_names: Vec<String>,
    #[serde(default)]
    pub revision_number: i64,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl RegistrationEntry {
    /// Lossless mapping to the wire shape. Sets serialize in sorted order.
    pub fn to_wire(&self) -> WireEntry {
        WireEntry {
            id: self.entry_id.clone().unwrap_or_default(),
            spiffe_id: self.spiffe_id.to_string(),
            parent_id: self.parent_id.to_string(),
            selectors: self
                .selectors
                .iter()
                .map(|s| WireSelector { kind: s.kind.clone(), value: s.value.clone() })
                .collect(),
            ttl: self.ttl_seconds,
            federates_with: self.federates_with.iter().map(|td| td.to_string()).collect(),
            admin: self.admin,
            downstream: self.downstream,
            entry_expiry: self.entry_expiry,
            dns_names: self.dns_names.iter().cloned().collect(),
            revision_number: self.revision_number,
            extra: self.extensions.clone(),
        }
    }

    /// Inverse of [`to_wire`](Self::to_wire).
    ///
    /// Only structural checks run here (IDs parse, selectors are a set,
    /// numbers are non-negative); the full [`validate`](Self::validate) is
    /// not applied so that entries the server accepted can always be read.
    /// Federated trust domains are accepted bare (`partner.org`) or as IDs.
    pub fn from_wire(wire: WireEntry) -> Result<Self, ValidationError> {
        let spiffe_id: SpiffeId =
            wire.spiffe_id.parse().map_err(|e| ValidationError::new(Field::SpiffeId.as_str(), e))?;
        let parent_id: SpiffeId =
            wire.parent_id.parse().map_err(|e| ValidationError::new(Field::ParentId.as_str(), e))?;
        let selectors = SelectorSet::normalize_indexed(
            wire.selectors.into_iter().map(|s| Selector::new(s.kind, s.value)).collect::<Vec<_>>(),
        )
        .map_err(|(i, e)| ValidationError::new(format!("selectors[{i}]"), e))?;
        if wire.ttl < 0 {
            return Err(ValidationError::new(Field::Ttl.as_str(), K::Negative(wire.ttl.into())));
        }
        if wire.entry_expiry < 0 {
            return Err(ValidationError::new(Field::EntryExpiry.as_str(), K::Negative(wire.entry_expiry)));
        }
        let mut federates_with = BTreeSet::new();
        for (i, raw) in wire.federates_with.iter().enumerate() {
            let td = if raw.starts_with("spiffe://") { raw.parse() } else { SpiffeId::trust_domain_root(raw) };
            federates_with.insert(td.map_err(|e| ValidationError::new(format!("federates_with[{i}]"), e))?);
        }
        Ok(RegistrationEntry {
            entry_id: if wire.id.is_empty() { None } else { Some(wire.id) },
            spiffe_id,
            parent_id,
            selectors,
            ttl_seconds: wire.ttl,
            federates_with,
            admin: wire.admin,
            downstream: wire.downstream,
            dns_names: wire.dns_names.into_iter().collect(),
            entry_expiry: wire.entry_expiry,
            revision_number: wire.revision_number,
            extensions: wire.extra,
        })
    }
}

impl From<&RegistrationEntry> for WireEntry {
    fn from(e: &RegistrationEntry) -> Self { e.to_wire() }
}

impl TryFrom<WireEntry> for RegistrationEntry {
    type Error = ValidationError;
    fn try_from(w: WireEntry) -> Result<Self, Self::Error> { RegistrationEntry::from_wire(w) }
}
