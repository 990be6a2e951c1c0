//! topology.toml configuration parser.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::types::*;

/// Priority reserved for the listener's catch-all rule.
pub const DEFAULT_ROUTE_PRIORITY: u32 = u32::MAX;

/// Smallest accepted debounce threshold. A single check never flips admission.
pub const MIN_HEALTH_THRESHOLD: u32 = 2;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub project: ProjectConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub listener: ListenerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    pub pools: BTreeMap<PoolName, PoolConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub workloads: BTreeMap<String, WorkloadConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub max_azs: u32,
    pub nat_gateways: u32,
    pub cidr_mask: u8,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_azs: 2,
            nat_gateways: 1,
            cidr_mask: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub table_name: String,
    #[serde(default = "default_partition_key")]
    pub partition_key: String,
    #[serde(default)]
    pub retention: RetentionPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Externally reachable `host[:port]` of the listener.
    #[serde(default = "default_public_host")]
    pub public_host: String,
    /// Pool receiving every request no explicit route claims.
    pub default_pool: PoolName,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_discovery_key")]
    pub key: String,
    #[serde(default)]
    pub fallback: DiscoveryFallback,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            key: default_discovery_key(),
            fallback: DiscoveryFallback::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub protocol: ProtocolClass,
    pub health: Option<HealthConfig>,
    pub idle_timeout: Option<String>,
    pub stickiness: Option<StickinessConfig>,
    pub deregistration_delay: Option<String>,
    /// Longest silence a live session may have. Streaming pools only.
    pub max_silent_interval: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    pub path: Option<String>,
    pub interval: Option<String>,
    pub timeout: Option<String>,
    pub healthy_threshold: Option<u32>,
    pub unhealthy_threshold: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StickinessConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub cookie: Option<String>,
    pub duration: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteConfig {
    pub path: String,
    #[serde(default)]
    pub upgrade: ProtocolRequirement,
    pub pool: PoolName,
    pub priority: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub image: String,
    pub pool: PoolName,
    #[serde(default = "default_replica_host")]
    pub host: String,
    pub port: u16,
    #[serde(default = "default_one")]
    pub desired: u32,
    #[serde(default = "default_one")]
    pub min: u32,
    #[serde(default = "default_max_replicas")]
    pub max: u32,
    #[serde(default = "default_cpu")]
    pub cpu: u32,
    #[serde(default = "default_memory_mib")]
    pub memory_mib: u32,
    /// Self base URL handed to request/response replicas. Derived from the
    /// listener's public host when unset.
    pub base_url: Option<String>,
}

fn default_region() -> String {
    "local".to_string()
}
fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_partition_key() -> String {
    "id".to_string()
}
fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_public_host() -> String {
    "localhost:8080".to_string()
}
fn default_discovery_key() -> String {
    "/tiergrid/ws_endpoint".to_string()
}
fn default_replica_host() -> String {
    "127.0.0.1".to_string()
}
fn default_true() -> bool {
    true
}
fn default_one() -> u32 {
    1
}
fn default_max_replicas() -> u32 {
    4
}
fn default_cpu() -> u32 {
    512
}
fn default_memory_mib() -> u32 {
    1024
}

impl PoolConfig {
    /// Resolve this pool's policy, filling unset fields from the
    /// protocol-class defaults.
    pub fn policy(&self) -> ConfigResult<PoolPolicy> {
        let mut policy = match self.protocol {
            ProtocolClass::RequestResponse => PoolPolicy::request_response(),
            ProtocolClass::Streaming => PoolPolicy::streaming(),
        };

        if let Some(health) = &self.health {
            if let Some(path) = &health.path {
                policy.health.path = path.clone();
            }
            if let Some(interval) = &health.interval {
                policy.health.interval = parse_duration(interval)?;
            }
            if let Some(timeout) = &health.timeout {
                policy.health.timeout = parse_duration(timeout)?;
            }
            if let Some(n) = health.healthy_threshold {
                policy.health.healthy_threshold = n;
            }
            if let Some(n) = health.unhealthy_threshold {
                policy.health.unhealthy_threshold = n;
            }
        }
        if let Some(idle) = &self.idle_timeout {
            policy.idle_timeout = parse_duration(idle)?;
        }
        if let Some(delay) = &self.deregistration_delay {
            policy.deregistration_delay = parse_duration(delay)?;
        }
        if let Some(sticky) = &self.stickiness {
            policy.stickiness = if sticky.enabled {
                let mut s = StickinessPolicy::default();
                if let Some(cookie) = &sticky.cookie {
                    s.cookie = cookie.clone();
                }
                if let Some(duration) = &sticky.duration {
                    s.duration = parse_duration(duration)?;
                }
                Some(s)
            } else {
                None
            };
        }
        Ok(policy)
    }

    fn max_silent(&self) -> ConfigResult<Option<Duration>> {
        self.max_silent_interval
            .as_deref()
            .map(parse_duration)
            .transpose()
    }
}

impl WorkloadConfig {
    /// Endpoint of the replica at `index`. Replicas occupy consecutive ports.
    pub fn replica_endpoint(&self, index: u32) -> Endpoint {
        Endpoint::new(
            self.host.clone(),
            self.port.saturating_add(index as u16),
            Protocol::Http,
        )
    }
}

impl StorageConfig {
    pub fn handle(&self) -> StorageHandle {
        StorageHandle {
            identifier: self.table_name.clone(),
            partition_key: self.partition_key.clone(),
            retention: self.retention,
        }
    }
}

impl TopologyConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: TopologyConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn storage_handle(&self) -> StorageHandle {
        self.storage.handle()
    }

    pub fn pool_policy(&self, pool: &str) -> ConfigResult<PoolPolicy> {
        self.pools
            .get(pool)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown pool {pool:?}")))?
            .policy()
    }

    /// Path prefix of the first upgrade-only route into a streaming pool,
    /// e.g. `/ws` for `/ws/*`.
    pub fn streaming_route_prefix(&self) -> Option<String> {
        let mut routes: Vec<&RouteConfig> = self.routes.iter().collect();
        routes.sort_by_key(|r| r.priority);
        routes
            .into_iter()
            .find(|r| {
                r.upgrade == ProtocolRequirement::UpgradeRequired
                    && self
                        .pools
                        .get(&r.pool)
                        .is_some_and(|p| p.protocol == ProtocolClass::Streaming)
            })
            .map(|r| {
                let trimmed = r.path.trim_end_matches('*').trim_end_matches('/');
                if trimmed.is_empty() {
                    "/".to_string()
                } else {
                    trimmed.to_string()
                }
            })
    }

    /// Check cross-references and policy constraints.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.pools.is_empty() {
            return Err(ConfigError::Invalid("at least one pool is required".into()));
        }
        if self.storage.table_name.is_empty() {
            return Err(ConfigError::Invalid("storage.table_name is empty".into()));
        }
        if !self.pools.contains_key(&self.listener.default_pool) {
            return Err(ConfigError::Invalid(format!(
                "listener.default_pool references unknown pool {:?}",
                self.listener.default_pool
            )));
        }

        for (name, pool) in &self.pools {
            let policy = pool.policy()?;
            if policy.health.healthy_threshold < MIN_HEALTH_THRESHOLD
                || policy.health.unhealthy_threshold < MIN_HEALTH_THRESHOLD
            {
                return Err(ConfigError::Invalid(format!(
                    "pool {name:?}: health thresholds must be at least {MIN_HEALTH_THRESHOLD}"
                )));
            }
            if policy.health.interval.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "pool {name:?}: health interval must be non-zero"
                )));
            }
            if !policy.health.path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "pool {name:?}: health path must start with '/'"
                )));
            }
            if let Some(silent) = pool.max_silent()? {
                if policy.idle_timeout <= silent {
                    return Err(ConfigError::Invalid(format!(
                        "pool {name:?}: idle_timeout {:?} must exceed max_silent_interval {silent:?}",
                        policy.idle_timeout
                    )));
                }
            }
        }

        let mut priorities = HashSet::new();
        for route in &self.routes {
            if !self.pools.contains_key(&route.pool) {
                return Err(ConfigError::Invalid(format!(
                    "route {:?} references unknown pool {:?}",
                    route.path, route.pool
                )));
            }
            if !route.path.starts_with('/') {
                return Err(ConfigError::Invalid(format!(
                    "route {:?} must start with '/'",
                    route.path
                )));
            }
            if route.priority == DEFAULT_ROUTE_PRIORITY {
                return Err(ConfigError::Invalid(format!(
                    "route {:?}: priority {} is reserved for the default pool",
                    route.path, DEFAULT_ROUTE_PRIORITY
                )));
            }
            if !priorities.insert(route.priority) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate route priority {}",
                    route.priority
                )));
            }
        }

        if self.streaming_route_prefix().is_none() {
            return Err(ConfigError::Invalid(
                "no upgrade-only route targets a streaming pool".into(),
            ));
        }

        for (name, workload) in &self.workloads {
            if !self.pools.contains_key(&workload.pool) {
                return Err(ConfigError::Invalid(format!(
                    "workload {name:?} references unknown pool {:?}",
                    workload.pool
                )));
            }
            if workload.min > workload.max {
                return Err(ConfigError::Invalid(format!(
                    "workload {name:?}: min {} exceeds max {}",
                    workload.min, workload.max
                )));
            }
            if workload.desired < workload.min || workload.desired > workload.max {
                return Err(ConfigError::Invalid(format!(
                    "workload {name:?}: desired {} outside [{}, {}]",
                    workload.desired, workload.min, workload.max
                )));
            }
            if workload.port == 0 {
                return Err(ConfigError::Invalid(format!(
                    "workload {name:?}: port must be non-zero"
                )));
            }
            let last_port = u32::from(workload.port) + workload.max.saturating_sub(1);
            if last_port > u32::from(u16::MAX) {
                return Err(ConfigError::Invalid(format!(
                    "workload {name:?}: {} replicas from port {} overrun port {}",
                    workload.max,
                    workload.port,
                    u16::MAX
                )));
            }
        }

        Ok(())
    }

    /// Scaffold the canonical two-pool topology: a request/response `web`
    /// pool as the default and a sticky streaming `game` pool under `/ws/*`.
    pub fn scaffold(name: &str) -> Self {
        let mut pools = BTreeMap::new();
        pools.insert(
            "web".to_string(),
            PoolConfig {
                protocol: ProtocolClass::RequestResponse,
                health: Some(HealthConfig {
                    path: Some("/healthz".to_string()),
                    interval: Some("30s".to_string()),
                    timeout: Some("10s".to_string()),
                    healthy_threshold: Some(2),
                    unhealthy_threshold: Some(3),
                }),
                idle_timeout: Some("60s".to_string()),
                stickiness: None,
                deregistration_delay: None,
                max_silent_interval: None,
            },
        );
        pools.insert(
            "game".to_string(),
            PoolConfig {
                protocol: ProtocolClass::Streaming,
                health: Some(HealthConfig {
                    path: Some("/healthz".to_string()),
                    interval: Some("30s".to_string()),
                    timeout: Some("10s".to_string()),
                    healthy_threshold: Some(2),
                    unhealthy_threshold: Some(3),
                }),
                idle_timeout: Some("3600s".to_string()),
                stickiness: Some(StickinessConfig {
                    enabled: true,
                    cookie: None,
                    duration: Some("1d".to_string()),
                }),
                deregistration_delay: Some("30s".to_string()),
                max_silent_interval: Some("5m".to_string()),
            },
        );

        let mut workloads = BTreeMap::new();
        workloads.insert(
            "web".to_string(),
            WorkloadConfig {
                image: format!("{name}-web:latest"),
                pool: "web".to_string(),
                host: default_replica_host(),
                port: 9000,
                desired: 1,
                min: 1,
                max: 4,
                cpu: 512,
                memory_mib: 1024,
                base_url: None,
            },
        );
        workloads.insert(
            "game".to_string(),
            WorkloadConfig {
                image: format!("{name}-game:latest"),
                pool: "game".to_string(),
                host: default_replica_host(),
                port: 9100,
                desired: 1,
                min: 1,
                max: 4,
                cpu: 512,
                memory_mib: 1024,
                base_url: None,
            },
        );

        TopologyConfig {
            project: ProjectConfig {
                name: name.to_string(),
                region: default_region(),
                log_level: default_log_level(),
            },
            network: NetworkConfig::default(),
            storage: StorageConfig {
                table_name: format!("{name}_games"),
                partition_key: "game_id".to_string(),
                retention: RetentionPolicy::Ephemeral,
            },
            listener: ListenerConfig {
                bind: default_bind(),
                public_host: default_public_host(),
                default_pool: "web".to_string(),
            },
            discovery: DiscoveryConfig {
                key: format!("/{name}/ws_endpoint"),
                fallback: DiscoveryFallback::FailClosed,
            },
            pools,
            routes: vec![
                RouteConfig {
                    path: "/ws/*".to_string(),
                    upgrade: ProtocolRequirement::UpgradeRequired,
                    pool: "game".to_string(),
                    priority: 100,
                },
                RouteConfig {
                    path: "/api/*".to_string(),
                    upgrade: ProtocolRequirement::Any,
                    pool: "web".to_string(),
                    priority: 200,
                },
            ],
            workloads,
        }
    }
}

/// Parse a duration string like "5s", "500ms", "2m", "1h", "1d".
///
/// A bare number is read as seconds.
pub fn parse_duration(s: &str) -> ConfigResult<Duration> {
    let s = s.trim();
    let invalid = || ConfigError::Duration(s.to_string());

    let (digits, unit_secs, millis) = if let Some(ms) = s.strip_suffix("ms") {
        (ms, 0, true)
    } else if let Some(secs) = s.strip_suffix('s') {
        (secs, 1, false)
    } else if let Some(mins) = s.strip_suffix('m') {
        (mins, 60, false)
    } else if let Some(hours) = s.strip_suffix('h') {
        (hours, 3600, false)
    } else if let Some(days) = s.strip_suffix('d') {
        (days, 86_400, false)
    } else {
        (s, 1, false)
    };

    let value: u64 = digits.trim().parse().map_err(|_| invalid())?;
    if millis {
        Ok(Duration::from_millis(value))
    } else {
        value
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(invalid)
    }
}
