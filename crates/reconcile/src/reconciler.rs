//! The reconciler: drives one entry through create, update, replace or
//! delete against the registry.
//!
//! Each call runs sequentially for its entry and keeps no state between
//! calls. Many entries may be reconciled concurrently on clones of one
//! `Reconciler`; the server's revision check is the only guard against
//! concurrent writers.

use metrics::counter;
use spirereg_core::RegistrationEntry;
use spirereg_registry::{ListFilter, RegistryClient, RegistryError};
use tracing::{debug, info, warn};

use crate::drift::DriftReport;
use crate::error::ReconcileError;
use crate::plan::{self, Action, ApplyOutcome, EntryState, Plan};

#[derive(Debug, Clone)]
pub struct Reconciler {
    client: RegistryClient,
}

fn transition(id: Option<&str>, from: EntryState, to: EntryState) {
    info!(entry_id = id.unwrap_or("-"), %from, %to, "entry state");
}

impl Reconciler {
    pub fn new(client: RegistryClient) -> Self { Self { client } }

    pub fn client(&self) -> &RegistryClient { &self.client }

    /// See [`plan::plan`].
    pub fn plan(&self, desired: &RegistrationEntry, observed: Option<&RegistrationEntry>) -> Result<Plan, ReconcileError> {
        plan::plan(desired, observed)
    }

    pub fn plan_removal(&self, entry_id: &str) -> Plan { plan::plan_removal(entry_id) }

    /// Current server view of `entry_id`.
    pub async fn observe(&self, entry_id: &str) -> Result<RegistrationEntry, ReconcileError> {
        Ok(self.client.get(entry_id).await?)
    }

    /// Plan against live state. `entry_id` is the id last seen for this
    /// entry; if the server no longer knows it the plan is a create.
    pub async fn refresh(&self, desired: &RegistrationEntry, entry_id: Option<&str>) -> Result<Plan, ReconcileError> {
        desired.validate_desired()?;
        let observed = match entry_id {
            None => None,
            Some(id) => match self.client.get(id).await {
                Ok(e) => Some(e),
                Err(RegistryError::NotFound(_)) => {
                    debug!(entry_id = id, "last seen entry is gone; planning create");
                    None
                }
                Err(e) => return Err(e.into()),
            },
        };
        plan::plan(desired, observed.as_ref())
    }

    /// Refresh, then apply.
    pub async fn reconcile(&self, desired: &RegistrationEntry, entry_id: Option<&str>) -> Result<ApplyOutcome, ReconcileError> {
        let p = self.refresh(desired, entry_id).await?;
        self.apply(p).await
    }

    /// Compare desired with live state without changing anything. Without
    /// an `entry_id` the entry is looked up by its identity.
    pub async fn drift(&self, desired: &RegistrationEntry, entry_id: Option<&str>) -> Result<DriftReport, ReconcileError> {
        desired.validate_desired()?;
        let observed = match entry_id {
            Some(id) => match self.client.get(id).await {
                Ok(e) => Some(e),
                Err(RegistryError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            },
            None => self.find_existing(desired).await?,
        };
        let report = match observed {
            Some(o) => DriftReport::against(desired, &o),
            None => DriftReport::absent(),
        };
        if report.has_drift() {
            counter!("reconcile_drift_total", 1u64);
            info!(
                spiffe_id = %desired.spiffe_id,
                state = %report.state,
                changes = report.changes.len(),
                "drift detected"
            );
        }
        Ok(report)
    }

    /// Execute `plan`. The desired entry is validated again here, since a
    /// plan need not come from [`plan::plan`].
    pub async fn apply(&self, plan: Plan) -> Result<ApplyOutcome, ReconcileError> {
        match &plan {
            Plan::Create { desired } | Plan::Update { desired, .. } | Plan::Replace { desired, .. } => {
                desired.validate_desired()?
            }
            Plan::Delete { .. } | Plan::NoOp { .. } => {}
        }
        let from = plan.from_state();
        let during = plan.transient_state();
        match plan {
            Plan::NoOp { entry } => {
                debug!(entry_id = entry.entry_id.as_deref().unwrap_or("-"), "no changes");
                Ok(ApplyOutcome::present(Action::Unchanged, entry))
            }
            Plan::Create { desired } => {
                transition(None, from, during);
                let out = self.create(&desired).await?;
                transition(out.entry_id(), during, out.state);
                Ok(out)
            }
            Plan::Update { desired, observed, changes } => {
                let id = observed.entry_id.clone();
                transition(id.as_deref(), from, during);
                debug!(entry_id = id.as_deref().unwrap_or("-"), ?changes, "updating");
                let entry = self.update_with_retry(&desired, observed).await?;
                transition(id.as_deref(), during, EntryState::Present);
                Ok(ApplyOutcome::present(Action::Updated, entry))
            }
            Plan::Replace { desired, observed } => {
                let old = observed.entry_id.clone().unwrap_or_default();
                warn!(entry_id = %old, from = %observed.parent_id, to = %desired.parent_id, "parent changed; replacing entry");
                transition(Some(old.as_str()), from, EntryState::Deleting);
                self.delete(&old).await?;
                transition(Some(old.as_str()), EntryState::Deleting, EntryState::Absent);
                transition(None, EntryState::Absent, during);
                let mut out = self.create(&desired).await?;
                transition(out.entry_id(), during, out.state);
                out.action = Action::Replaced;
                Ok(out)
            }
            Plan::Delete { entry_id } => {
                transition(Some(entry_id.as_str()), from, during);
                let action = self.delete(&entry_id).await?;
                transition(Some(entry_id.as_str()), during, EntryState::Absent);
                Ok(ApplyOutcome::absent(action))
            }
        }
    }

    /// Create; on `AlreadyExists` adopt the matching entry and push any
    /// residual difference through the update path.
    async fn create(&self, desired: &RegistrationEntry) -> Result<ApplyOutcome, ReconcileError> {
        match self.client.create(desired).await {
            Ok((id, rev)) => {
                counter!("reconcile_create_total", 1u64);
                Ok(ApplyOutcome::present(Action::Created, desired.clone().with_server_state(id, rev)))
            }
            Err(RegistryError::AlreadyExists(msg)) => {
                let Some(existing) = self.find_existing(desired).await? else {
                    // the duplicate vanished between create and list
                    return Err(RegistryError::AlreadyExists(msg).into());
                };
                counter!("reconcile_adopt_total", 1u64);
                warn!(
                    entry_id = existing.entry_id.as_deref().unwrap_or("-"),
                    revision = existing.revision_number,
                    "create reported already_exists; adopting existing entry"
                );
                if desired.changed_fields(&existing).is_empty() {
                    return Ok(ApplyOutcome::present(Action::Adopted, existing));
                }
                let entry = self.update_with_retry(desired, existing).await?;
                Ok(ApplyOutcome::present(Action::Adopted, entry))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, entry_id: &str) -> Result<Action, ReconcileError> {
        match self.client.delete(entry_id).await {
            Ok(()) => {
                counter!("reconcile_delete_total", 1u64);
                Ok(Action::Deleted)
            }
            Err(RegistryError::NotFound(_)) => {
                warn!(entry_id, "delete: entry already gone");
                Ok(Action::AlreadyAbsent)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Update `observed` to match `desired`. One `Conflict` triggers a
    /// re-read and a single retry against the fresh revision; a second
    /// one is returned to the caller.
    async fn update_with_retry(
        &self,
        desired: &RegistrationEntry,
        observed: RegistrationEntry,
    ) -> Result<RegistrationEntry, ReconcileError> {
        let msg = match self.push_update(desired, &observed).await {
            Err(RegistryError::Conflict(msg)) => msg,
            other => return Ok(other?),
        };
        let id = observed.entry_id.clone().unwrap_or_default();
        counter!("reconcile_conflict_retry_total", 1u64);
        warn!(entry_id = %id, stale_revision = observed.revision_number, error = %msg, "update conflict; re-reading");

        let fresh = self.client.get(&id).await?;
        if fresh.parent_id != desired.parent_id {
            return Err(ReconcileError::ParentChanged {
                entry_id: id,
                observed: fresh.parent_id,
                desired: desired.parent_id.clone(),
            });
        }
        if desired.changed_fields(&fresh).is_empty() {
            debug!(entry_id = %id, revision = fresh.revision_number, "concurrent writer already converged");
            return Ok(fresh);
        }
        Ok(self.push_update(desired, &fresh).await?)
    }

    async fn push_update(
        &self,
        desired: &RegistrationEntry,
        base: &RegistrationEntry,
    ) -> Result<RegistrationEntry, RegistryError> {
        let next = RegistrationEntry {
            entry_id: base.entry_id.clone(),
            revision_number: base.revision_number,
            extensions: base.extensions.clone(),
            ..desired.clone()
        };
        let rev = self.client.update(&next).await?;
        counter!("reconcile_update_total", 1u64);
        Ok(RegistrationEntry { revision_number: rev, ..next })
    }

    /// The server entry with the same spiffe_id, parent_id and selector set
    /// as `desired`, if any.
    async fn find_existing(&self, desired: &RegistrationEntry) -> Result<Option<RegistrationEntry>, ReconcileError> {
        let filter = ListFilter {
            parent_id: Some(desired.parent_id.to_string()),
            spiffe_id: Some(desired.spiffe_id.to_string()),
        };
        let found = self.client.list(&filter).await?;
        Ok(found.into_iter().find(|e| e.same_identity(desired)))
    }
}
