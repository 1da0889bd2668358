//! Registration entry model and its invariants.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationErrorKind as K};
use crate::selector::{Selector, SelectorSet};
use crate::spiffe_id::{IdInput, SpiffeId};

/// Entry attributes, named the way operators write them in manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    EntryId,
    SpiffeId,
    ParentId,
    Selectors,
    Ttl,
    FederatesWith,
    Admin,
    Downstream,
    EntryExpiry,
    DnsNames,
    RevisionNumber,
}

impl Field {
    /// Fields an update may change. `parent_id` is fixed after create.
    pub const MUTABLE: [Field; 8] = [
        Field::SpiffeId,
        Field::Selectors,
        Field::Ttl,
        Field::FederatesWith,
        Field::Admin,
        Field::Downstream,
        Field::EntryExpiry,
        Field::DnsNames,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::EntryId => "entry_id",
            Field::SpiffeId => "spiffe_id",
            Field::ParentId => "parent_id",
            Field::Selectors => "selectors",
            Field::Ttl => "ttl",
            Field::FederatesWith => "federates_with",
            Field::Admin => "admin",
            Field::Downstream => "downstream",
            Field::EntryExpiry => "entry_expiry",
            Field::DnsNames => "dns_names",
            Field::RevisionNumber => "revision_number",
        }
    }

    fn at(&self, idx: usize) -> String { format!("{}[{}]", self.as_str(), idx) }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// A workload registration entry.
///
/// `entry_id` and `revision_number` belong to the server: they are absent
/// (`None` / `0`) on desired entries and filled in from create/update
/// responses. Federation and DNS lists are sets; they serialize sorted so
/// diffs stay deterministic. `extensions` carries wire fields this crate
/// does not model; they are preserved but never compared.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_id: Option<String>,
    pub spiffe_id: SpiffeId,
    pub parent_id: SpiffeId,
    pub selectors: SelectorSet,
    /// SVID time to live; 0 means the server default.
    #[serde(default)]
    pub ttl_seconds: i32,
    #[serde(default)]
    pub federates_with: BTreeSet<SpiffeId>,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub downstream: bool,
    #[serde(default)]
    pub dns_names: BTreeSet<String>,
    /// Absolute expiry in epoch seconds; 0 means none.
    #[serde(default)]
    pub entry_expiry: i64,
    #[serde(default)]
    pub revision_number: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

impl RegistrationEntry {
    pub fn new(spiffe_id: SpiffeId, parent_id: SpiffeId, selectors: SelectorSet) -> Self {
        Self {
            entry_id: None,
            spiffe_id,
            parent_id,
            selectors,
            ttl_seconds: 0,
            federates_with: BTreeSet::new(),
            admin: false,
            downstream: false,
            dns_names: BTreeSet::new(),
            entry_expiry: 0,
            revision_number: 0,
            extensions: BTreeMap::new(),
        }
    }

    /// Check every local invariant; returns the first violation found.
    /// Set-valued fields hold no input order, so their violations name the
    /// field and the offending value rather than a position.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.selectors.is_empty() {
            return Err(ValidationError::new(Field::Selectors.as_str(), K::EmptySelectors));
        }
        if self.spiffe_id == self.parent_id {
            return Err(ValidationError::new(Field::SpiffeId.as_str(), K::SelfParenting(self.spiffe_id.to_string())));
        }
        if self.ttl_seconds < 0 {
            return Err(ValidationError::new(Field::Ttl.as_str(), K::Negative(self.ttl_seconds.into())));
        }
        if let Some(td) = self.federates_with.iter().find(|td| !td.is_trust_domain_only()) {
            return Err(ValidationError::new(Field::FederatesWith.as_str(), K::NotTrustDomainOnly(td.to_string())));
        }
        if let Some(name) = self.dns_names.iter().find(|n| !is_valid_dns_name(n)) {
            return Err(ValidationError::new(Field::DnsNames.as_str(), K::InvalidDnsName(name.clone())));
        }
        if self.entry_expiry < 0 {
            return Err(ValidationError::new(Field::EntryExpiry.as_str(), K::Negative(self.entry_expiry)));
        }
        if self.revision_number < 0 {
            return Err(ValidationError::new(Field::RevisionNumber.as_str(), K::Negative(self.revision_number)));
        }
        Ok(())
    }

    /// [`validate`](Self::validate) plus the rule that server-owned fields
    /// are unset. Applied to entries built from configuration.
    pub fn validate_desired(&self) -> Result<(), ValidationError> {
        if self.entry_id.is_some() {
            return Err(ValidationError::new(Field::EntryId.as_str(), K::ServerAssigned));
        }
        if self.revision_number != 0 {
            return Err(ValidationError::new(Field::RevisionNumber.as_str(), K::ServerAssigned));
        }
        self.validate()
    }

    /// Same (spiffe_id, parent_id, selector set): the server's uniqueness key.
    pub fn same_identity(&self, other: &RegistrationEntry) -> bool {
        self.spiffe_id == other.spiffe_id && self.parent_id == other.parent_id && self.selectors == other.selectors
    }

    /// Mutable fields whose values differ between `self` and `other`.
    pub fn changed_fields(&self, other: &RegistrationEntry) -> Vec<Field> {
        Field::MUTABLE
            .into_iter()
            .filter(|f| match f {
                Field::SpiffeId => self.spiffe_id != other.spiffe_id,
                Field::Selectors => self.selectors != other.selectors,
                Field::Ttl => self.ttl_seconds != other.ttl_seconds,
                Field::FederatesWith => self.federates_with != other.federates_with,
                Field::Admin => self.admin != other.admin,
                Field::Downstream => self.downstream != other.downstream,
                Field::EntryExpiry => self.entry_expiry != other.entry_expiry,
                Field::DnsNames => self.dns_names != other.dns_names,
                _ => false,
            })
            .collect()
    }

    /// Merge the server-assigned id and revision back into the entry.
    pub fn with_server_state(mut self, entry_id: impl Into<String>, revision_number: i64) -> Self {
        self.entry_id = Some(entry_id.into());
        self.revision_number = revision_number;
        self
    }
}

/// Accepts RFC 1123 host names plus a single leading `*.` wildcard label.
pub fn is_valid_dns_name(name: &str) -> bool {
    let body = name.strip_prefix("*.").unwrap_or(name);
    if body.is_empty() || name.len() > 253 {
        return false;
    }
    body.split('.').all(|label| {
        let b = label.as_bytes();
        !b.is_empty()
            && b.len() <= 63
            && b.iter().all(|c| c.is_ascii_alphanumeric() || *c == b'-')
            && b[0] != b'-'
            && b[b.len() - 1] != b'-'
    })
}

/// A desired entry as written by an operator, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntrySpec {
    pub spiffe_id: IdInput,
    pub parent_id: IdInput,
    #[serde(default)]
    pub selectors: Vec<Selector>,
    #[serde(default)]
    pub ttl: i64,
    #[serde(default)]
    pub federates_with: Vec<IdInput>,
    #[serde(default)]
    pub admin: bool,
    #[serde(default)]
    pub downstream: bool,
    #[serde(default)]
    pub entry_expiry: i64,
    #[serde(default)]
    pub dns_names: Vec<String>,
}

impl EntrySpec {
    /// Resolve IDs, normalize selectors and apply [`RegistrationEntry::validate_desired`].
    pub fn into_entry(self) -> Result<RegistrationEntry, ValidationError> {
        let spiffe_id = self.spiffe_id.resolve().map_err(|e| ValidationError::new(Field::SpiffeId.as_str(), e))?;
        let parent_id = self.parent_id.resolve().map_err(|e| ValidationError::new(Field::ParentId.as_str(), e))?;
        let selectors =
            SelectorSet::normalize_indexed(self.selectors).map_err(|(i, e)| ValidationError::new(Field::Selectors.at(i), e))?;
        let ttl_seconds = i32::try_from(self.ttl).map_err(|_| {
            let kind = if self.ttl < 0 { K::Negative(self.ttl) } else { K::OutOfRange(self.ttl) };
            ValidationError::new(Field::Ttl.as_str(), kind)
        })?;
        let mut federates_with = BTreeSet::new();
        for (i, raw) in self.federates_with.iter().enumerate() {
            let td = raw.resolve().map_err(|e| ValidationError::new(Field::FederatesWith.at(i), e))?;
            if !td.is_trust_domain_only() {
                return Err(ValidationError::new(Field::FederatesWith.at(i), K::NotTrustDomainOnly(td.to_string())));
            }
            federates_with.insert(td);
        }
        for (i, name) in self.dns_names.iter().enumerate() {
            if !is_valid_dns_name(name) {
                return Err(ValidationError::new(Field::DnsNames.at(i), K::InvalidDnsName(name.clone())));
            }
        }
        let entry = RegistrationEntry {
            federates_with,
            ttl_seconds,
            admin: self.admin,
            downstream: self.downstream,
            dns_names: self.dns_names.into_iter().collect(),
            entry_expiry: self.entry_expiry,
            ..RegistrationEntry::new(spiffe_id, parent_id, selectors)
        };
        entry.validate_desired()?;
        Ok(entry)
    }
}

impl From<&RegistrationEntry> for EntrySpec {
    fn from(e: &RegistrationEntry) -> Self {
        Self {
            spiffe_id: IdInput::from(&e.spiffe_id),
            parent_id: IdInput::from(&e.parent_id),
            selectors: e.selectors.iter().cloned().collect(),
            ttl: e.ttl_seconds.into(),
            federates_with: e.federates_with.iter().map(IdInput::from).collect(),
            admin: e.admin,
            downstream: e.downstream,
            entry_expiry: e.entry_expiry,
            dns_names: e.dns_names.iter().cloned().collect(),
        }
    }
}
