//! tiergrid-deploy: turns a topology file into provisioned resources and a
//! running routing layer.
//!
//! # Flow
//!
//! ```text
//! TopologyConfig ──► DeploymentGraph::for_topology ──► execution_order
//!                                                         │
//!        ledger (StateStore) ◄── Deployer::apply ◄────────┘
//!              │                    │ Provisioner::{create, update, destroy}
//!              │                    └ ServiceRegistrar::register (workloads)
//!              ▼
//!   Deployer::registrations ──► build_runtime ──► PathRouter + TargetPools
//! ```

pub mod deployer;
pub mod error;
pub mod graph;
pub mod provider;
pub mod registrar;
pub mod runtime;

pub use deployer::{fingerprint, Action, ApplyReport, Change, Deployer};
pub use error::{DeployError, DeployResult};
pub use graph::{DeploymentGraph, GraphError, Step, StepId};
pub use provider::{LocalProvisioner, Outputs, Provisioner};
pub use registrar::{Registration, ReplicaSpec, ScaleOutcome, ServiceRegistrar};
pub use runtime::{build_runtime, Runtime};
