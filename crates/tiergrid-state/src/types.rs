//! Persisted record types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tiergrid_core::RetentionPolicy;

/// What a ledger entry provisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Network,
    Storage,
    Cluster,
    Listener,
    Pool,
    Routes,
    Discovery,
    Workload,
}

/// One provisioned step of the deployment graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    /// Graph step id, e.g. `pool:game`.
    pub id: String,
    pub kind: ResourceKind,
    /// Declared state this resource was converged to.
    pub spec: serde_json::Value,
    /// sha256 hex over `spec` and the upstream outputs it consumed.
    pub fingerprint: String,
    /// Values surfaced to dependent steps (addresses, identifiers).
    pub outputs: BTreeMap<String, String>,
    pub retention: RetentionPolicy,
    /// Monotonic creation sequence; teardown runs in reverse.
    pub sequence: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ResourceRecord {
    pub fn output(&self, name: &str) -> Option<&str> {
        self.outputs.get(name).map(String::as_str)
    }
}

/// A single named slot in the discovery channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiscoveryRecord {
    pub key: String,
    pub value: String,
    /// Starts at 1 and increases by one per value change, across retracts.
    pub version: u64,
    pub updated_at: u64,
}

/// Seconds since the Unix epoch; zero if the clock is before it.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
