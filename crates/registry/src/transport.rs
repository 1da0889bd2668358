//! Wire-level registry API, implemented by transports.

use serde::{Deserialize, Serialize};
use spirereg_core::WireEntry;

use crate::status::RpcStatus;

/// Server-side filter for `ListEntries`. Values are canonical SPIFFE IDs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListFilter {
    pub parent_id: Option<String>,
    pub spiffe_id: Option<String>,
}

impl ListFilter {
    pub fn matches(&self, e: &WireEntry) -> bool {
        self.parent_id.as_deref().map_or(true, |p| p == e.parent_id)
            && self.spiffe_id.as_deref().map_or(true, |s| s == e.spiffe_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedEntry {
    pub id: String,
    pub revision_number: i64,
}

/// The registry RPC surface. One call per method; implementations must not
/// retry. Dropping a returned future abandons the call.
#[async_trait::async_trait]
pub trait RegistryTransport: Send + Sync {
    async fn create_entry(&self, entry: &WireEntry) -> Result<CreatedEntry, RpcStatus>;

    async fn get_entry(&self, id: &str) -> Result<WireEntry, RpcStatus>;

    /// `entry.id` and `entry.revision_number` identify the revision being
    /// replaced; returns the new revision.
    async fn update_entry(&self, entry: &WireEntry) -> Result<i64, RpcStatus>;

    async fn delete_entry(&self, id: &str) -> Result<(), RpcStatus>;

    async fn list_entries(&self, filter: &ListFilter) -> Result<Vec<WireEntry>, RpcStatus>;

    /// Short label for logs.
    fn name(&self) -> &'static str { "custom" }
}
