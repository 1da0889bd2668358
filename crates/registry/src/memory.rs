//! In-memory registry with SPIRE entry semantics: server-assigned ids,
//! revision 1 on create and +1 per update, uniqueness on
//! (spiffe_id, parent_id, selector set), and a revision guard on update.
//!
//! Counts calls per operation and can fail the next call of an operation
//! with a chosen status, which is what the reconciler tests lean on.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use spirereg_core::WireEntry;
use tracing::trace;
use uuid::Uuid;

use crate::status::{Code, RpcStatus};
use crate::transport::{CreatedEntry, ListFilter, RegistryTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Op {
    Create,
    Get,
    Update,
    Delete,
    List,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub create: usize,
    pub get: usize,
    pub update: usize,
    pub delete: usize,
    pub list: usize,
}

#[derive(Default)]
struct State {
    entries: BTreeMap<String, WireEntry>,
    calls: CallCounts,
    inject: HashMap<Op, VecDeque<RpcStatus>>,
}

impl State {
    fn enter(&mut self, op: Op) -> Result<(), RpcStatus> {
        let slot = match op {
            Op::Create => &mut self.calls.create,
            Op::Get => &mut self.calls.get,
            Op::Update => &mut self.calls.update,
            Op::Delete => &mut self.calls.delete,
            Op::List => &mut self.calls.list,
        };
        *slot += 1;
        match self.inject.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(status) => {
                trace!(?op, code = %status.code, "injected failure");
                Err(status)
            }
            None => Ok(()),
        }
    }

    fn duplicate_of(&self, e: &WireEntry, skip_id: Option<&str>) -> Option<&str> {
        let key = identity(e);
        self.entries
            .iter()
            .find(|(id, other)| Some(id.as_str()) != skip_id && identity(other) == key)
            .map(|(id, _)| id.as_str())
    }
}

fn identity(e: &WireEntry) -> (&str, &str, BTreeSet<(&str, &str)>) {
    let sels = e.selectors.iter().map(|s| (s.kind.as_str(), s.value.as_str())).collect();
    (e.spiffe_id.as_str(), e.parent_id.as_str(), sels)
}

fn check_shape(e: &WireEntry) -> Result<(), RpcStatus> {
    if e.spiffe_id.is_empty() || e.parent_id.is_empty() {
        return Err(RpcStatus::new(Code::InvalidArgument, "spiffe_id and parent_id are required"));
    }
    if e.selectors.is_empty() {
        return Err(RpcStatus::new(Code::InvalidArgument, "at least one selector is required"));
    }
    Ok(())
}

#[derive(Default)]
pub struct InMemoryRegistry {
    state: Mutex<State>,
}

impl InMemoryRegistry {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(|p| p.into_inner()) }

    pub fn calls(&self) -> CallCounts { self.lock().calls }

    /// Fail the next call of `op` with `status`. Queued failures are consumed
    /// in order, one per call.
    pub fn fail_next(&self, op: Op, status: RpcStatus) { self.lock().inject.entry(op).or_default().push_back(status); }

    /// Insert an entry directly, as if another client had created it.
    /// Missing id and zero revision are filled in.
    pub fn seed(&self, mut entry: WireEntry) -> String {
        if entry.id.is_empty() {
            entry.id = Uuid::new_v4().to_string();
        }
        if entry.revision_number == 0 {
            entry.revision_number = 1;
        }
        let id = entry.id.clone();
        self.lock().entries.insert(id.clone(), entry);
        id
    }

    /// Remove an entry behind the client's back.
    pub fn remove(&self, id: &str) -> Option<WireEntry> { self.lock().entries.remove(id) }

    /// Modify an entry behind the client's back; bumps its revision.
    pub fn mutate(&self, id: &str, f: impl FnOnce(&mut WireEntry)) -> Option<i64> {
        let mut st = self.lock();
        let e = st.entries.get_mut(id)?;
        f(e);
        e.revision_number += 1;
        Some(e.revision_number)
    }

    pub fn entries(&self) -> Vec<WireEntry> { self.lock().entries.values().cloned().collect() }
}

#[async_trait::async_trait]
impl RegistryTransport for InMemoryRegistry {
    async fn create_entry(&self, entry: &WireEntry) -> Result<CreatedEntry, RpcStatus> {
        let mut st = self.lock();
        st.enter(Op::Create)?;
        check_shape(entry)?;
        if let Some(existing) = st.duplicate_of(entry, None) {
            return Err(RpcStatus::new(Code::AlreadyExists, format!("similar entry already exists: {}", existing)));
        }
        let mut stored = entry.clone();
        stored.id = Uuid::new_v4().to_string();
        stored.revision_number = 1;
        let created = CreatedEntry { id: stored.id.clone(), revision_number: stored.revision_number };
        st.entries.insert(stored.id.clone(), stored);
        Ok(created)
    }

    async fn get_entry(&self, id: &str) -> Result<WireEntry, RpcStatus> {
        let mut st = self.lock();
        st.enter(Op::Get)?;
        st.entries.get(id).cloned().ok_or_else(|| RpcStatus::not_found(format!("entry {} not found", id)))
    }

    async fn update_entry(&self, entry: &WireEntry) -> Result<i64, RpcStatus> {
        let mut st = self.lock();
        st.enter(Op::Update)?;
        check_shape(entry)?;
        let current = st
            .entries
            .get(&entry.id)
            .map(|e| e.revision_number)
            .ok_or_else(|| RpcStatus::not_found(format!("entry {} not found", entry.id)))?;
        if current != entry.revision_number {
            return Err(RpcStatus::new(
                Code::FailedPrecondition,
                format!("revision mismatch for {}: current {}, supplied {}", entry.id, current, entry.revision_number),
            ));
        }
        if let Some(existing) = st.duplicate_of(entry, Some(&entry.id)) {
            return Err(RpcStatus::new(Code::AlreadyExists, format!("similar entry already exists: {}", existing)));
        }
        let mut stored = entry.clone();
        stored.revision_number = current + 1;
        st.entries.insert(stored.id.clone(), stored);
        Ok(current + 1)
    }

    async fn delete_entry(&self, id: &str) -> Result<(), RpcStatus> {
        let mut st = self.lock();
        st.enter(Op::Delete)?;
        st.entries.remove(id).map(|_| ()).ok_or_else(|| RpcStatus::not_found(format!("entry {} not found", id)))
    }

    async fn list_entries(&self, filter: &ListFilter) -> Result<Vec<WireEntry>, RpcStatus> {
        let mut st = self.lock();
        st.enter(Op::List)?;
        Ok(st.entries.values().filter(|e| filter.matches(e)).cloned().collect())
    }

    fn name(&self) -> &'static str { "memory" }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spirereg_core::WireSelector;

    fn wire(spiffe: &str, sels: &[(&str, &str)]) -> WireEntry {
        WireEntry {
            spiffe_id: spiffe.into(),
            parent_id: "spiffe://example.org/agent".into(),
            selectors: sels.iter().map(|(k, v)| WireSelector { kind: (*k).into(), value: (*v).into() }).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn duplicate_detection_ignores_selector_order() {
        let reg = InMemoryRegistry::new();
        reg.create_entry(&wire("spiffe://example.org/a", &[("k8s", "x"), ("k8s", "y")])).await.unwrap();
        let err = reg.create_entry(&wire("spiffe://example.org/a", &[("k8s", "y"), ("k8s", "x")])).await.unwrap_err();
        assert_eq!(err.code, Code::AlreadyExists);
        reg.create_entry(&wire("spiffe://example.org/a", &[("k8s", "x")])).await.unwrap();
        assert_eq!(reg.calls().create, 3);
    }

    #[tokio::test]
    async fn injected_failures_fire_once_each() {
        let reg = InMemoryRegistry::new();
        let id = reg.seed(wire("spiffe://example.org/a", &[("k8s", "x")]));
        reg.fail_next(Op::Get, RpcStatus::unavailable("blip"));
        assert_eq!(reg.get_entry(&id).await.unwrap_err().code, Code::Unavailable);
        assert_eq!(reg.get_entry(&id).await.unwrap().revision_number, 1);
        assert_eq!(reg.calls().get, 2);
    }

    #[tokio::test]
    async fn update_guards_revision_and_bumps() {
        let reg = InMemoryRegistry::new();
        let id = reg.seed(wire("spiffe://example.org/a", &[("k8s", "x")]));
        let mut e = reg.get_entry(&id).await.unwrap();
        e.ttl = 60;
        assert_eq!(reg.update_entry(&e).await.unwrap(), 2);
        assert_eq!(reg.update_entry(&e).await.unwrap_err().code, Code::FailedPrecondition);
        assert_eq!(reg.mutate(&id, |w| w.admin = true), Some(3));
    }

    #[tokio::test]
    async fn list_filters_on_parent_and_spiffe_id() {
        let reg = InMemoryRegistry::new();
        reg.seed(wire("spiffe://example.org/a", &[("k8s", "x")]));
        reg.seed(wire("spiffe://example.org/b", &[("k8s", "x")]));
        let all = reg.list_entries(&ListFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        let only_a = ListFilter { spiffe_id: Some("spiffe://example.org/a".into()), ..Default::default() };
        assert_eq!(reg.list_entries(&only_a).await.unwrap().len(), 1);
        let other_parent = ListFilter { parent_id: Some("spiffe://example.org/other".into()), ..Default::default() };
        assert!(reg.list_entries(&other_parent).await.unwrap().is_empty());
    }
}
