//! Deployment graph: provisioning steps and their declared dependencies.
//!
//! The standard topology orders steps as:
//!
//! ```text
//! network ─┬─► storage ───────────────────────────────┐
//!          └─► cluster ─► listener ─► pool:<name> ─┬──┴─► workload:<name>
//!                 └───────────────────────►┘       └─► routes ─► discovery ─┘
//!                                                   (request/response only)
//! ```
//!
//! Order is computed with Kahn's algorithm; ties break by step id so the
//! same graph always yields the same order.

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;
use tiergrid_core::{ProtocolClass, TopologyConfig};
use tiergrid_state::ResourceKind;

pub type StepId = String;

pub const NETWORK: &str = "network";
pub const STORAGE: &str = "storage";
pub const CLUSTER: &str = "cluster";
pub const LISTENER: &str = "listener";
pub const ROUTES: &str = "routes";
pub const DISCOVERY: &str = "discovery";

pub fn pool_step(name: &str) -> StepId {
    format!("pool:{name}")
}

pub fn workload_step(name: &str) -> StepId {
    format!("workload:{name}")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    #[error("step {step} depends on unknown step {missing}")]
    MissingDependency { step: StepId, missing: StepId },

    #[error("dependency cycle among steps: {}", .0.join(", "))]
    Cycle(Vec<StepId>),

    #[error("step declared twice: {0}")]
    DuplicateStep(StepId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub id: StepId,
    pub kind: ResourceKind,
    pub depends_on: BTreeSet<StepId>,
}

#[derive(Debug, Clone, Default)]
pub struct DeploymentGraph {
    steps: BTreeMap<StepId, Step>,
}

impl DeploymentGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        id: &str,
        kind: ResourceKind,
        depends_on: &[&str],
    ) -> Result<(), GraphError> {
        if self.steps.contains_key(id) {
            return Err(GraphError::DuplicateStep(id.to_string()));
        }
        self.steps.insert(
            id.to_string(),
            Step {
                id: id.to_string(),
                kind,
                depends_on: depends_on.iter().map(|d| d.to_string()).collect(),
            },
        );
        Ok(())
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.steps.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Every dependency names a declared step.
    pub fn validate(&self) -> Result<(), GraphError> {
        for step in self.steps.values() {
            if let Some(missing) = step.depends_on.iter().find(|d| !self.steps.contains_key(*d)) {
                return Err(GraphError::MissingDependency {
                    step: step.id.clone(),
                    missing: missing.clone(),
                });
            }
        }
        Ok(())
    }

    /// Steps grouped into waves. Every step's dependencies live in an
    /// earlier wave, so steps within one wave are independent.
    pub fn levels(&self) -> Result<Vec<Vec<&Step>>, GraphError> {
        self.validate()?;

        let mut remaining: BTreeMap<&str, usize> = self
            .steps
            .values()
            .map(|s| (s.id.as_str(), s.depends_on.len()))
            .collect();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for step in self.steps.values() {
            for dep in &step.depends_on {
                dependents.entry(dep.as_str()).or_default().push(step.id.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = remaining
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut levels = Vec::new();
        let mut placed = 0;

        while !ready.is_empty() {
            let wave: Vec<&str> = ready.iter().copied().collect();
            ready.clear();
            for id in &wave {
                remaining.remove(id);
                for dependent in dependents.get(id).into_iter().flatten() {
                    if let Some(n) = remaining.get_mut(dependent) {
                        *n -= 1;
                        if *n == 0 {
                            ready.insert(*dependent);
                        }
                    }
                }
            }
            placed += wave.len();
            levels.push(wave.iter().filter_map(|id| self.steps.get(*id)).collect());
        }

        if placed < self.steps.len() {
            return Err(GraphError::Cycle(
                remaining.keys().map(|id| id.to_string()).collect(),
            ));
        }
        Ok(levels)
    }

    /// A total order consistent with every dependency.
    pub fn execution_order(&self) -> Result<Vec<&Step>, GraphError> {
        Ok(self.levels()?.into_iter().flatten().collect())
    }

    /// The graph for a validated topology.
    pub fn for_topology(config: &TopologyConfig) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        graph.add(NETWORK, ResourceKind::Network, &[])?;
        graph.add(STORAGE, ResourceKind::Storage, &[NETWORK])?;
        graph.add(CLUSTER, ResourceKind::Cluster, &[NETWORK])?;
        graph.add(LISTENER, ResourceKind::Listener, &[CLUSTER])?;

        let pool_ids: Vec<StepId> = config.pools.keys().map(|n| pool_step(n)).collect();
        for id in &pool_ids {
            graph.add(id, ResourceKind::Pool, &[LISTENER, CLUSTER])?;
        }
        let pool_refs: Vec<&str> = pool_ids.iter().map(String::as_str).collect();
        graph.add(ROUTES, ResourceKind::Routes, &pool_refs)?;
        graph.add(DISCOVERY, ResourceKind::Discovery, &[ROUTES])?;

        for (name, workload) in &config.workloads {
            let pool = pool_step(&workload.pool);
            let mut deps = vec![pool.as_str(), STORAGE];
            let consumes_discovery = config
                .pools
                .get(&workload.pool)
                .is_some_and(|p| p.protocol == ProtocolClass::RequestResponse);
            if consumes_discovery {
                deps.push(DISCOVERY);
            }
            graph.add(&workload_step(name), ResourceKind::Workload, &deps)?;
        }
        Ok(graph)
    }
}
