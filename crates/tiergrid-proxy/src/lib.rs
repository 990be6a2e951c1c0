//! tiergrid-proxy: the single public listener and its routing decisions.
//!
//! # Components
//!
//! - **`router`**: priority-ordered path rules selecting exactly one pool
//! - **`pool`**: replica membership, admission, round-robin selection
//! - **`affinity`**: first-writer-wins client → replica bindings
//! - **`pattern`**: `*` / `?` path patterns
//! - **`listener`**: hyper server forwarding plain and upgraded traffic
//!
//! ```text
//! request ──► PathRouter::dispatch ──► TargetPool::select ──► replica
//!                 │ no rule: 404          │ none healthy: 503
//! ```

pub mod affinity;
pub mod error;
pub mod listener;
pub mod pattern;
pub mod pool;
pub mod router;

pub use affinity::{AffinityMap, Binding};
pub use error::{ForwardError, ProxyError, ProxyResult, RouteError};
pub use listener::{serve, ProxyBody};
pub use pattern::PathPattern;
pub use pool::{Replica, Selection, TargetPool};
pub use router::{rules_from_config, Dispatch, InboundRequest, PathRouter, RouteRule};
