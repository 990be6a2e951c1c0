//! tiergrid-state: resource ledger and discovery channel for TierGrid.
//!
//! Backed by [redb](https://docs.rs/redb). Two tables:
//!
//! - `resources`: one [`ResourceRecord`] per provisioned graph step, keyed by
//!   step id. The deployer diffs against it to converge idempotently.
//! - `parameters`: versioned [`DiscoveryRecord`]s. The store implements
//!   [`ParameterChannel`], so the same database serves publish and resolve.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod channel;
pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use channel::{
    resolve_at_startup, DiscoveryError, MemoryChannel, ParameterChannel, Resolution,
};
pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
