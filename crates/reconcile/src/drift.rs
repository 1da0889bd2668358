//! Field-by-field comparison of desired and observed entries.

use std::collections::BTreeSet;
use std::fmt::Display;

use serde::{Deserialize, Serialize};
use spirereg_core::{Field, RegistrationEntry};

use crate::plan::EntryState;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    pub fn is_empty(&self) -> bool { self.adds == 0 && self.updates == 0 && self.removes == 0 }
}

/// One differing field. Set-valued fields list the members only desired
/// (`added`) and only observed (`removed`); scalar fields leave both empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: Field,
    pub desired: String,
    pub observed: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub added: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    /// `Absent` when the server has no matching entry.
    pub state: EntryState,
    pub entry_id: Option<String>,
    pub revision_number: Option<i64>,
    pub changes: Vec<FieldChange>,
    pub summary: DiffSummary,
}

impl DriftReport {
    pub(crate) fn absent() -> Self {
        Self { state: EntryState::Absent, entry_id: None, revision_number: None, changes: Vec::new(), summary: DiffSummary::default() }
    }

    pub(crate) fn against(desired: &RegistrationEntry, observed: &RegistrationEntry) -> Self {
        let changes = diff(desired, observed);
        let summary = summarize(&changes);
        Self {
            state: EntryState::Present,
            entry_id: observed.entry_id.clone(),
            revision_number: Some(observed.revision_number),
            changes,
            summary,
        }
    }

    pub fn has_drift(&self) -> bool { self.state == EntryState::Absent || !self.changes.is_empty() }
}

fn render<T: Display>(items: impl IntoIterator<Item = T>) -> String {
    let parts: Vec<String> = items.into_iter().map(|i| i.to_string()).collect();
    format!("[{}]", parts.join(", "))
}

fn set_change<T: Ord + Display>(field: Field, desired: &BTreeSet<T>, observed: &BTreeSet<T>) -> Option<FieldChange> {
    if desired == observed {
        return None;
    }
    Some(FieldChange {
        field,
        desired: render(desired),
        observed: render(observed),
        added: desired.difference(observed).map(|t| t.to_string()).collect(),
        removed: observed.difference(desired).map(|t| t.to_string()).collect(),
    })
}

fn scalar_change<T: PartialEq + Display>(field: Field, desired: &T, observed: &T) -> Option<FieldChange> {
    (desired != observed).then(|| FieldChange {
        field,
        desired: desired.to_string(),
        observed: observed.to_string(),
        added: Vec::new(),
        removed: Vec::new(),
    })
}

/// Every field where `observed` differs from `desired`, parent included.
/// Selectors and the federation and DNS lists compare as sets.
/// Server-owned fields and unmodelled extensions are ignored.
pub fn diff(desired: &RegistrationEntry, observed: &RegistrationEntry) -> Vec<FieldChange> {
    let mut out = Vec::new();
    out.extend(scalar_change(Field::ParentId, &desired.parent_id, &observed.parent_id));
    for field in Field::MUTABLE {
        let change = match field {
            Field::SpiffeId => scalar_change(field, &desired.spiffe_id, &observed.spiffe_id),
            Field::Selectors => {
                let d: BTreeSet<_> = desired.selectors.iter().collect();
                let o: BTreeSet<_> = observed.selectors.iter().collect();
                set_change(field, &d, &o)
            }
            Field::Ttl => scalar_change(field, &desired.ttl_seconds, &observed.ttl_seconds),
            Field::FederatesWith => set_change(field, &desired.federates_with, &observed.federates_with),
            Field::Admin => scalar_change(field, &desired.admin, &observed.admin),
            Field::Downstream => scalar_change(field, &desired.downstream, &observed.downstream),
            Field::EntryExpiry => scalar_change(field, &desired.entry_expiry, &observed.entry_expiry),
            Field::DnsNames => set_change(field, &desired.dns_names, &observed.dns_names),
            _ => None,
        };
        out.extend(change);
    }
    out
}

fn summarize(changes: &[FieldChange]) -> DiffSummary {
    let mut s = DiffSummary::default();
    for c in changes {
        if c.added.is_empty() && c.removed.is_empty() {
            s.updates += 1;
        } else {
            s.adds += c.added.len();
            s.removes += c.removed.len();
        }
    }
    s
}
