//! tiergrid-core: shared types and the `topology.toml` parser.
//!
//! Every other TierGrid crate speaks in these types: endpoints, pool
//! policies, replica health, retention. The topology file is the single
//! declarative input; everything downstream is derived from it.

pub mod config;
pub mod error;
pub mod types;

pub use config::{
    parse_duration, DiscoveryConfig, HealthConfig, ListenerConfig, NetworkConfig, PoolConfig,
    ProjectConfig, RouteConfig, StickinessConfig, StorageConfig, TopologyConfig, WorkloadConfig,
};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
