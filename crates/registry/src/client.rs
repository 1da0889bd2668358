//! Registry client: Create/Get/Update/Delete/List over a transport.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use spirereg_core::RegistrationEntry;
use tracing::debug;

use crate::error::RegistryError;
use crate::status::RpcStatus;
use crate::transport::{ListFilter, RegistryTransport};

/// Cheap to clone; clones share the underlying transport.
#[derive(Clone)]
pub struct RegistryClient {
    transport: Arc<dyn RegistryTransport>,
    call_timeout: Option<Duration>,
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient")
            .field("transport", &self.transport.name())
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl RegistryClient {
    pub fn new(transport: Arc<dyn RegistryTransport>) -> Self { Self { transport, call_timeout: None } }

    /// Abandon any single RPC that runs longer than `timeout`; it is then
    /// reported as `Unavailable`.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    async fn call<T, F>(&self, op: &'static str, fut: F) -> Result<T, RegistryError>
    where
        F: Future<Output = Result<T, RpcStatus>>,
    {
        let t0 = Instant::now();
        counter!("registry_rpc_total", 1u64, "op" => op);
        let res = match self.call_timeout {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(r) => r.map_err(RegistryError::from),
                Err(_) => Err(RegistryError::Unavailable(format!("{} exceeded deadline of {:?}", op, limit))),
            },
            None => fut.await.map_err(RegistryError::from),
        };
        let took_ms = t0.elapsed().as_secs_f64() * 1000.0;
        histogram!("registry_rpc_latency_ms", took_ms, "op" => op);
        match &res {
            Ok(_) => debug!(op, transport = self.transport.name(), took_ms, "registry call ok"),
            Err(e) => {
                counter!("registry_rpc_err_total", 1u64, "op" => op);
                debug!(op, transport = self.transport.name(), took_ms, error = %e, "registry call failed");
            }
        }
        res
    }

    /// Create `entry`; returns the server-assigned id and revision.
    pub async fn create(&self, entry: &RegistrationEntry) -> Result<(String, i64), RegistryError> {
        let wire = entry.to_wire();
        let created = self.call("create", self.transport.create_entry(&wire)).await?;
        Ok((created.id, created.revision_number))
    }

    pub async fn get(&self, entry_id: &str) -> Result<RegistrationEntry, RegistryError> {
        let wire = self.call("get", self.transport.get_entry(entry_id)).await?;
        decode(wire)
    }

    /// Update an existing entry. `entry.entry_id` must be set and
    /// `entry.revision_number` must be the revision being replaced.
    pub async fn update(&self, entry: &RegistrationEntry) -> Result<i64, RegistryError> {
        if entry.entry_id.as_deref().map_or(true, str::is_empty) {
            return Err(RegistryError::InvalidArgument("update requires an entry_id".into()));
        }
        let wire = entry.to_wire();
        self.call("update", self.transport.update_entry(&wire)).await
    }

    pub async fn delete(&self, entry_id: &str) -> Result<(), RegistryError> {
        self.call("delete", self.transport.delete_entry(entry_id)).await
    }

    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<RegistrationEntry>, RegistryError> {
        let wires = self.call("list", self.transport.list_entries(filter)).await?;
        wires.into_iter().map(decode).collect()
    }
}

fn decode(wire: spirereg_core::WireEntry) -> Result<RegistrationEntry, RegistryError> {
    RegistrationEntry::from_wire(wire).map_err(|e| RegistryError::Unknown(format!("malformed entry from server: {}", e)))
}
