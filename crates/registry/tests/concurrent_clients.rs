#![forbid(unsafe_code)]

use std::sync::Arc;

use spirereg_core::{RegistrationEntry, Selector, SelectorSet};
use spirereg_registry::{InMemoryRegistry, ListFilter, RegistryClient, RegistryError};

fn entry(n: usize) -> RegistrationEntry {
    RegistrationEntry::new(
        format!("spiffe://example.org/svc-{}", n).parse().unwrap(),
        "spiffe://example.org/spire-agent".parse().unwrap(),
        SelectorSet::normalize([Selector::new("k8s", format!("sa:svc-{}", n))]).unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn clients_share_one_transport() {
    let reg = Arc::new(InMemoryRegistry::new());
    let client = RegistryClient::new(reg.clone());
    let mut handles = Vec::new();
    for n in 0..32 {
        let c = client.clone();
        handles.push(tokio::spawn(async move { c.create(&entry(n)).await }));
    }
    for h in handles {
        let (_, rev) = h.await.unwrap().unwrap();
        assert_eq!(rev, 1);
    }
    assert_eq!(reg.calls().create, 32);
    assert_eq!(client.list(&ListFilter::default()).await.unwrap().len(), 32);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_updates_let_exactly_one_win() {
    let reg = Arc::new(InMemoryRegistry::new());
    let client = RegistryClient::new(reg.clone());
    let (id, rev) = client.create(&entry(0)).await.unwrap();
    let base = entry(0).with_server_state(id, rev);

    let mut handles = Vec::new();
    for ttl in 1..=8 {
        let c = client.clone();
        let mut e = base.clone();
        e.ttl_seconds = ttl * 10;
        handles.push(tokio::spawn(async move { c.update(&e).await }));
    }
    let mut won = 0;
    for h in handles {
        match h.await.unwrap() {
            Ok(rev) => {
                assert_eq!(rev, 2);
                won += 1;
            }
            Err(e) => assert!(matches!(e, RegistryError::Conflict(_)), "{e}"),
        }
    }
    assert_eq!(won, 1);
}
