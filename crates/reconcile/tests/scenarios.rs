#![forbid(unsafe_code)]

use std::sync::Arc;

use spirereg_core::{Field, RegistrationEntry, Selector, SelectorSet, SpiffeId};
use spirereg_reconcile::{Action, EntryState, Plan, ReconcileError, Reconciler};
use spirereg_registry::{Code, InMemoryRegistry, Op, RegistryClient, RegistryError, RpcStatus};

fn id(s: &str) -> SpiffeId { s.parse().unwrap() }

fn web(sels: &[(&str, &str)]) -> RegistrationEntry {
    RegistrationEntry::new(
        id("spiffe://example.org/web"),
        id("spiffe://example.org/spire-agent"),
        SelectorSet::normalize(sels.iter().map(|(k, v)| Selector::new(*k, *v))).unwrap(),
    )
}

fn setup() -> (Arc<InMemoryRegistry>, Reconciler) {
    let reg = Arc::new(InMemoryRegistry::new());
    let rec = Reconciler::new(RegistryClient::new(reg.clone()));
    (reg, rec)
}

#[tokio::test]
async fn create_against_empty_server_is_present_at_revision_one() {
    let (reg, rec) = setup();
    let desired = web(&[("k8s", "ns:default")]);
    let plan = rec.refresh(&desired, None).await.unwrap();
    assert_eq!(plan.kind(), "create");
    let out = rec.apply(plan).await.unwrap();
    assert_eq!(out.action, Action::Created);
    assert_eq!(out.state, EntryState::Present);
    let entry = out.entry.unwrap();
    assert_eq!(entry.revision_number, 1);
    assert!(entry.entry_id.is_some());
    assert_eq!(reg.calls().create, 1);
}

#[tokio::test]
async fn adding_a_selector_is_one_update_and_one_revision() {
    let (reg, rec) = setup();
    let first = rec.reconcile(&web(&[("k8s", "ns:default")]), None).await.unwrap();
    let entry_id = first.entry_id().unwrap().to_string();

    let desired = web(&[("k8s", "ns:default"), ("k8s", "sa:myapp")]);
    let out = rec.reconcile(&desired, Some(&entry_id)).await.unwrap();
    assert_eq!(out.action, Action::Updated);
    assert_eq!(out.entry.as_ref().unwrap().revision_number, 2);
    assert_eq!(out.entry_id(), Some(entry_id.as_str()));
    assert_eq!(reg.calls().update, 1);
    assert_eq!(reg.entries()[0].selectors.len(), 2);
}

#[tokio::test]
async fn applying_twice_issues_no_second_update() {
    let (reg, rec) = setup();
    let desired = web(&[("k8s", "ns:default")]);
    let out = rec.reconcile(&desired, None).await.unwrap();
    let entry_id = out.entry_id().unwrap().to_string();

    let again = rec.reconcile(&desired, Some(&entry_id)).await.unwrap();
    assert_eq!(again.action, Action::Unchanged);
    let third = rec.reconcile(&desired, Some(&entry_id)).await.unwrap();
    assert_eq!(third.action, Action::Unchanged);
    assert_eq!(reg.calls().update, 0);
    assert_eq!(reg.calls().create, 1);
    assert!(!rec.drift(&desired, Some(&entry_id)).await.unwrap().has_drift());
}

#[tokio::test]
async fn one_conflict_is_retried_once() {
    let (reg, rec) = setup();
    let out = rec.reconcile(&web(&[("k8s", "ns:default")]), None).await.unwrap();
    let entry_id = out.entry_id().unwrap().to_string();

    reg.fail_next(Op::Update, RpcStatus::new(Code::FailedPrecondition, "revision changed"));
    let mut desired = web(&[("k8s", "ns:default")]);
    desired.ttl_seconds = 300;
    let out = rec.reconcile(&desired, Some(&entry_id)).await.unwrap();
    assert_eq!(out.action, Action::Updated);
    assert_eq!(out.entry.unwrap().ttl_seconds, 300);
    assert_eq!(reg.calls().update, 2);
}

#[tokio::test]
async fn conflict_from_concurrent_writer_recomputes_against_fresh_revision() {
    let (reg, rec) = setup();
    let out = rec.reconcile(&web(&[("k8s", "ns:default")]), None).await.unwrap();
    let observed = out.entry.unwrap();
    let entry_id = observed.entry_id.clone().unwrap();

    // someone else flips admin after we observed revision 1
    assert_eq!(reg.mutate(&entry_id, |w| w.admin = true), Some(2));

    let mut desired = web(&[("k8s", "ns:default")]);
    desired.dns_names.insert("web.example.org".into());
    let plan = rec.plan(&desired, Some(&observed)).unwrap();
    let out = rec.apply(plan).await.unwrap();
    let entry = out.entry.unwrap();
    assert_eq!(entry.revision_number, 3);
    // desired state wins over the concurrent change
    assert!(!entry.admin);
    assert_eq!(reg.calls().update, 2);
    assert_eq!(reg.calls().get, 1);
}

#[tokio::test]
async fn second_conflict_is_fatal() {
    let (reg, rec) = setup();
    let out = rec.reconcile(&web(&[("k8s", "ns:default")]), None).await.unwrap();
    let entry_id = out.entry_id().unwrap().to_string();

    reg.fail_next(Op::Update, RpcStatus::new(Code::FailedPrecondition, "revision changed"));
    reg.fail_next(Op::Update, RpcStatus::new(Code::Aborted, "revision changed again"));
    let mut desired = web(&[("k8s", "ns:default")]);
    desired.admin = true;
    let err = rec.reconcile(&desired, Some(&entry_id)).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Registry(RegistryError::Conflict(_))), "{err}");
    assert_eq!(reg.calls().update, 2);
    assert!(!reg.entries()[0].admin);
}

#[tokio::test]
async fn conflict_with_reparented_entry_is_surfaced() {
    let (reg, rec) = setup();
    let out = rec.reconcile(&web(&[("k8s", "ns:default")]), None).await.unwrap();
    let observed = out.entry.unwrap();
    let entry_id = observed.entry_id.clone().unwrap();
    reg.mutate(&entry_id, |w| w.parent_id = "spiffe://example.org/elsewhere".into());

    let mut desired = web(&[("k8s", "ns:default")]);
    desired.ttl_seconds = 60;
    let plan = rec.plan(&desired, Some(&observed)).unwrap();
    let err = rec.apply(plan).await.unwrap_err();
    assert!(matches!(err, ReconcileError::ParentChanged { .. }), "{err}");
}

#[tokio::test]
async fn already_exists_adopts_the_matching_entry() {
    let (reg, rec) = setup();
    let desired = web(&[("k8s", "ns:default"), ("k8s", "sa:web")]);
    // a previous create succeeded server-side but its response was lost
    let existing = reg.seed(desired.to_wire());

    let out = rec.reconcile(&desired, None).await.unwrap();
    assert_eq!(out.action, Action::Adopted);
    assert_eq!(out.entry_id(), Some(existing.as_str()));
    assert_eq!(out.entry.unwrap().revision_number, 1);
    assert_eq!(reg.calls().create, 1);
    assert_eq!(reg.calls().list, 1);
    assert_eq!(reg.calls().update, 0);
    assert_eq!(reg.entries().len(), 1);
}

#[tokio::test]
async fn adoption_applies_residual_differences() {
    let (reg, rec) = setup();
    let mut seeded = web(&[("k8s", "ns:default")]);
    seeded.ttl_seconds = 60;
    let existing = reg.seed(seeded.to_wire());

    let out = rec.reconcile(&web(&[("k8s", "ns:default")]), None).await.unwrap();
    assert_eq!(out.action, Action::Adopted);
    let entry = out.entry.unwrap();
    assert_eq!(entry.entry_id.as_deref(), Some(existing.as_str()));
    assert_eq!(entry.ttl_seconds, 0);
    assert_eq!(entry.revision_number, 2);
    assert_eq!(reg.calls().update, 1);
}

#[tokio::test]
async fn already_exists_without_a_match_is_surfaced() {
    let (reg, rec) = setup();
    reg.fail_next(Op::Create, RpcStatus::new(Code::AlreadyExists, "similar entry already exists"));
    let err = rec.reconcile(&web(&[("k8s", "ns:default")]), None).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Registry(RegistryError::AlreadyExists(_))), "{err}");
}

#[tokio::test]
async fn deleting_a_vanished_entry_ends_absent() {
    let (reg, rec) = setup();
    let out = rec.reconcile(&web(&[("k8s", "ns:default")]), None).await.unwrap();
    let entry_id = out.entry_id().unwrap().to_string();
    reg.remove(&entry_id);

    let out = rec.apply(rec.plan_removal(&entry_id)).await.unwrap();
    assert_eq!(out.state, EntryState::Absent);
    assert_eq!(out.action, Action::AlreadyAbsent);
    assert!(out.entry.is_none());
    assert_eq!(reg.calls().delete, 1);
}

#[tokio::test]
async fn delete_removes_the_entry() {
    let (reg, rec) = setup();
    let out = rec.reconcile(&web(&[("k8s", "ns:default")]), None).await.unwrap();
    let out = rec.apply(rec.plan_removal(out.entry_id().unwrap())).await.unwrap();
    assert_eq!(out.action, Action::Deleted);
    assert!(reg.entries().is_empty());
}

#[tokio::test]
async fn validation_errors_abort_before_any_rpc() {
    let (reg, rec) = setup();
    let mut desired = web(&[("k8s", "ns:default")]);
    desired.federates_with.insert(id("spiffe://partner.org/not-a-root"));

    let err = rec.reconcile(&desired, Some("e1")).await.unwrap_err();
    match err {
        ReconcileError::Validation(v) => assert_eq!(v.field, "federates_with"),
        other => panic!("unexpected {other}"),
    }
    assert!(rec.drift(&desired, None).await.is_err());
    assert_eq!(reg.calls(), Default::default());
}

#[tokio::test]
async fn hand_built_plans_are_validated_before_any_rpc() {
    let (reg, rec) = setup();
    let mut self_parented = web(&[("k8s", "ns:default")]);
    self_parented.parent_id = self_parented.spiffe_id.clone();

    let err = rec.apply(Plan::Create { desired: self_parented.clone() }).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Validation(ref v) if v.field == "spiffe_id"), "{err}");

    let observed = web(&[("k8s", "ns:default")]).with_server_state("e1", 1);
    let err = rec
        .apply(Plan::Replace { desired: self_parented.clone(), observed: observed.clone() })
        .await
        .unwrap_err();
    assert!(err.is_local());

    let mut no_selectors = web(&[("k8s", "ns:default")]);
    no_selectors.selectors = SelectorSet::default();
    let err = rec.apply(Plan::Update { desired: no_selectors, observed, changes: vec![Field::Selectors] }).await.unwrap_err();
    assert!(err.is_local());

    assert_eq!(reg.calls(), Default::default());
    assert!(reg.entries().is_empty());
}

#[tokio::test]
async fn stale_entry_id_plans_a_create() {
    let (reg, rec) = setup();
    let plan = rec.refresh(&web(&[("k8s", "ns:default")]), Some("gone")).await.unwrap();
    assert!(matches!(plan, Plan::Create { .. }));
    assert_eq!(reg.calls().get, 1);
}

#[tokio::test]
async fn parent_change_replaces_the_entry() {
    let (reg, rec) = setup();
    let out = rec.reconcile(&web(&[("k8s", "ns:default")]), None).await.unwrap();
    let old_id = out.entry_id().unwrap().to_string();

    let mut desired = web(&[("k8s", "ns:default")]);
    desired.parent_id = id("spiffe://example.org/other-agent");
    let out = rec.reconcile(&desired, Some(&old_id)).await.unwrap();
    assert_eq!(out.action, Action::Replaced);
    assert_ne!(out.entry_id(), Some(old_id.as_str()));
    assert_eq!(reg.calls().update, 0);
    assert_eq!(reg.calls().delete, 1);
    let entries = reg.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].parent_id, "spiffe://example.org/other-agent");
}

#[tokio::test]
async fn drift_is_reported_not_corrected() {
    let (reg, rec) = setup();
    let desired = web(&[("k8s", "ns:default")]);
    let out = rec.reconcile(&desired, None).await.unwrap();
    let entry_id = out.entry_id().unwrap().to_string();
    reg.mutate(&entry_id, |w| {
        w.ttl = 120;
        w.selectors.push(spirereg_core::WireSelector { kind: "k8s".into(), value: "sa:intruder".into() });
    });

    let report = rec.drift(&desired, Some(&entry_id)).await.unwrap();
    assert!(report.has_drift());
    assert_eq!(report.revision_number, Some(2));
    let fields: Vec<Field> = report.changes.iter().map(|c| c.field).collect();
    assert_eq!(fields, vec![Field::Selectors, Field::Ttl]);
    assert_eq!(report.changes[0].removed, vec!["k8s:sa:intruder"]);
    assert_eq!(reg.calls().update, 0);

    // lookup by identity no longer matches: selectors changed
    let by_identity = rec.drift(&desired, None).await.unwrap();
    assert_eq!(by_identity.state, EntryState::Absent);
}

#[tokio::test]
async fn transport_failures_keep_their_classification() {
    let (reg, rec) = setup();
    reg.fail_next(Op::Create, RpcStatus::unavailable("connection refused"));
    let err = rec.reconcile(&web(&[("k8s", "ns:default")]), None).await.unwrap_err();
    assert!(err.is_retryable(), "{err}");

    reg.fail_next(Op::Create, RpcStatus::new(Code::PermissionDenied, "nope"));
    let err = rec.reconcile(&web(&[("k8s", "ns:default")]), None).await.unwrap_err();
    assert!(matches!(err, ReconcileError::Registry(RegistryError::Unknown(_))));
    assert!(!err.is_retryable());
    assert!(reg.entries().is_empty());
}
