//! tiergrid-health: debounced health checking for target pools.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   └── per-pool task
//!       ├── sweep: reap drained replicas, purge expired bindings,
//!       │          launch due checks (http_check → CheckResult)
//!       └── apply: HealthTracker per replica → TargetPool::set_health
//! ```
//!
//! A replica enters service after `healthy_threshold` consecutive passing
//! checks and leaves after `unhealthy_threshold` consecutive failures.
//! Failing replicas are checked with exponential backoff capped at 60s.

pub mod checker;
pub mod monitor;

pub use checker::{http_check, CheckResult, HealthTracker};
pub use monitor::HealthMonitor;
