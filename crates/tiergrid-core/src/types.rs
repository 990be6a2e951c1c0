//! Shared types used across TierGrid crates.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of a target pool (e.g. `web`, `game`).
pub type PoolName = String;

/// Unique identifier for a replica within its pool.
pub type ReplicaId = String;

// ── Endpoints ─────────────────────────────────────────────────────

/// Wire protocol spoken at an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Http,
    Ws,
}

impl Protocol {
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Ws => "ws",
        }
    }
}

/// A single routable destination. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
        }
    }

    /// `host:port`, suitable for a TCP connect.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `scheme://host:port`
    pub fn url(&self) -> String {
        format!("{}://{}", self.protocol.scheme(), self.authority())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.url())
    }
}

// ── Pools ─────────────────────────────────────────────────────────

/// Traffic class served by a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolClass {
    /// Short-lived HTTP exchanges.
    RequestResponse,
    /// Long-lived upgraded connections (WebSocket).
    Streaming,
}

/// What a route rule demands of a request's protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolRequirement {
    #[default]
    Any,
    UpgradeRequired,
}

impl ProtocolRequirement {
    pub fn is_satisfied_by(&self, wants_upgrade: bool) -> bool {
        match self {
            ProtocolRequirement::Any => true,
            ProtocolRequirement::UpgradeRequired => wants_upgrade,
        }
    }
}

/// Health state of a replica, as seen by the router.
///
/// Transitions are driven by check results and the drain signal, never
/// by the replica itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaHealth {
    #[default]
    Unknown,
    Healthy,
    Unhealthy,
    Draining,
}

impl ReplicaHealth {
    /// Whether the replica may receive new sessions.
    pub fn admits_new(&self) -> bool {
        matches!(self, ReplicaHealth::Healthy)
    }

    /// Whether the replica may keep serving an existing sticky session.
    pub fn serves_existing(&self) -> bool {
        matches!(self, ReplicaHealth::Healthy | ReplicaHealth::Draining)
    }
}

/// Health check contract shared by every member of a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckPolicy {
    /// Plain-HTTP path checked on each replica.
    pub path: String,
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive successes before a replica becomes healthy.
    pub healthy_threshold: u32,
    /// Consecutive failures before a replica becomes unhealthy.
    pub unhealthy_threshold: u32,
}

impl Default for HealthCheckPolicy {
    fn default() -> Self {
        Self {
            path: "/healthz".to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }
}

/// Client affinity for pools whose replicas hold session state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StickinessPolicy {
    /// Cookie carrying the client-affinity key.
    pub cookie: String,
    /// How long a binding lives after it is established.
    pub duration: Duration,
}

impl Default for StickinessPolicy {
    fn default() -> Self {
        Self {
            cookie: "TIERGRID_AFFINITY".to_string(),
            duration: Duration::from_secs(86_400),
        }
    }
}

/// Policy fields of a target pool. Fixed for the pool's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPolicy {
    pub protocol_class: ProtocolClass,
    pub health: HealthCheckPolicy,
    pub idle_timeout: Duration,
    pub stickiness: Option<StickinessPolicy>,
    /// Grace period a draining replica keeps before removal.
    pub deregistration_delay: Duration,
}

impl PoolPolicy {
    pub fn request_response() -> Self {
        Self {
            protocol_class: ProtocolClass::RequestResponse,
            health: HealthCheckPolicy::default(),
            idle_timeout: Duration::from_secs(60),
            stickiness: None,
            deregistration_delay: Duration::from_secs(30),
        }
    }

    pub fn streaming() -> Self {
        Self {
            protocol_class: ProtocolClass::Streaming,
            health: HealthCheckPolicy::default(),
            idle_timeout: Duration::from_secs(3600),
            stickiness: Some(StickinessPolicy::default()),
            deregistration_delay: Duration::from_secs(30),
        }
    }
}

// ── Storage & discovery ───────────────────────────────────────────

/// Whether a stateful resource outlives the deployment that created it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Destroyed with the deployment.
    #[default]
    Ephemeral,
    /// Survives teardown.
    Persistent,
}

/// Opaque handle to the managed key-value table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageHandle {
    pub identifier: String,
    pub partition_key: String,
    pub retention: RetentionPolicy,
}

/// What a discovery consumer does when its record is not published yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryFallback {
    /// Refuse to start with a clear error.
    #[default]
    FailClosed,
    /// Start without the discovered value.
    Degraded,
}

// ── Environment surface ───────────────────────────────────────────

/// Environment variable names injected into every replica.
pub mod env {
    pub const REGION: &str = "TIERGRID_REGION";
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
    pub const STORAGE_TABLE: &str = "STORAGE_TABLE_NAME";
    /// Request/response workloads only.
    pub const DISCOVERY_KEY: &str = "WS_ENDPOINT_PARAM";
    /// Request/response workloads only.
    pub const BASE_URL: &str = "API_BASE_URL";
}
