//! Plans: what to do with one managed entry, decided without I/O.

use std::fmt;

use serde::{Deserialize, Serialize};
use spirereg_core::{Field, RegistrationEntry};

use crate::error::ReconcileError;

/// Lifecycle of one managed entry. `Creating`, `Updating` and `Deleting`
/// only exist while an RPC is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Absent,
    Creating,
    Present,
    Updating,
    Deleting,
}

impl fmt::Display for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntryState::Absent => "absent",
            EntryState::Creating => "creating",
            EntryState::Present => "present",
            EntryState::Updating => "updating",
            EntryState::Deleting => "deleting",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum Plan {
    Create { desired: RegistrationEntry },
    /// `changes` lists the mutable fields that differ from `observed`.
    Update { desired: RegistrationEntry, observed: RegistrationEntry, changes: Vec<Field> },
    /// Parent changed: delete `observed`, then create `desired`.
    Replace { desired: RegistrationEntry, observed: RegistrationEntry },
    Delete { entry_id: String },
    NoOp { entry: RegistrationEntry },
}

impl Plan {
    pub fn kind(&self) -> &'static str {
        match self {
            Plan::Create { .. } => "create",
            Plan::Update { .. } => "update",
            Plan::Replace { .. } => "replace",
            Plan::Delete { .. } => "delete",
            Plan::NoOp { .. } => "noop",
        }
    }

    pub fn is_noop(&self) -> bool { matches!(self, Plan::NoOp { .. }) }

    /// State the entry is in before the plan runs.
    pub fn from_state(&self) -> EntryState {
        match self {
            Plan::Create { .. } => EntryState::Absent,
            _ => EntryState::Present,
        }
    }

    /// State while the plan's RPCs are in flight.
    pub fn transient_state(&self) -> EntryState {
        match self {
            Plan::Create { .. } | Plan::Replace { .. } => EntryState::Creating,
            Plan::Update { .. } => EntryState::Updating,
            Plan::Delete { .. } => EntryState::Deleting,
            Plan::NoOp { .. } => EntryState::Present,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Created,
    /// Create hit `AlreadyExists` and the existing entry was taken over.
    Adopted,
    Updated,
    Replaced,
    Deleted,
    /// Delete found nothing to delete.
    AlreadyAbsent,
    Unchanged,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Created => "created",
            Action::Adopted => "adopted",
            Action::Updated => "updated",
            Action::Replaced => "replaced",
            Action::Deleted => "deleted",
            Action::AlreadyAbsent => "already-absent",
            Action::Unchanged => "unchanged",
        })
    }
}

/// Result of applying a plan. `entry` is the server's view after the
/// apply, with id and revision filled in; `None` once absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub action: Action,
    pub state: EntryState,
    pub entry: Option<RegistrationEntry>,
}

impl ApplyOutcome {
    pub(crate) fn present(action: Action, entry: RegistrationEntry) -> Self {
        Self { action, state: EntryState::Present, entry: Some(entry) }
    }

    pub(crate) fn absent(action: Action) -> Self { Self { action, state: EntryState::Absent, entry: None } }

    pub fn entry_id(&self) -> Option<&str> { self.entry.as_ref().and_then(|e| e.entry_id.as_deref()) }
}

/// Decide how to move from `observed` to `desired`.
///
/// `desired` is validated first; a validation error means nothing may be
/// sent to the server. An `observed` entry without an id is treated as
/// unknown to the server.
pub fn plan(desired: &RegistrationEntry, observed: Option<&RegistrationEntry>) -> Result<Plan, ReconcileError> {
    desired.validate_desired()?;
    let observed = match observed {
        Some(o) if o.entry_id.is_some() => o,
        _ => return Ok(Plan::Create { desired: desired.clone() }),
    };
    if observed.parent_id != desired.parent_id {
        return Ok(Plan::Replace { desired: desired.clone(), observed: observed.clone() });
    }
    let changes = desired.changed_fields(observed);
    if changes.is_empty() {
        Ok(Plan::NoOp { entry: observed.clone() })
    } else {
        Ok(Plan::Update { desired: desired.clone(), observed: observed.clone(), changes })
    }
}

pub fn plan_removal(entry_id: impl Into<String>) -> Plan { Plan::Delete { entry_id: entry_id.into() } }
