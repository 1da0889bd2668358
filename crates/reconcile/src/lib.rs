//! spirereg reconcile: decides which registry call brings a registration
//! entry in line with its desired state, and makes it.
//!
//! [`plan()`] is pure. [`Reconciler`] talks to the registry and recovers
//! locally from the three benign failures: `AlreadyExists` on create
//! (adopt), `NotFound` on delete (already gone) and one `Conflict` on
//! update (re-read and retry).

#![forbid(unsafe_code)]

pub mod drift;
pub mod error;
pub mod manifest;
pub mod plan;
pub mod reconciler;

pub use drift::{diff, DiffSummary, DriftReport, FieldChange};
pub use error::ReconcileError;
pub use manifest::{Manifest, ManifestError};
pub use plan::{plan, plan_removal, Action, ApplyOutcome, EntryState, Plan};
pub use reconciler::Reconciler;
