//! Service registration: binds a workload's replica fleet to its pool and
//! fixes the environment every replica starts with.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tiergrid_core::{env, Endpoint, PoolName, Protocol, ProtocolClass, ReplicaId, WorkloadConfig};
use tiergrid_proxy::{ProxyError, ProxyResult, TargetPool};
use tiergrid_state::{ParameterChannel, ResourceRecord};
use tracing::{debug, info};

use crate::error::{DeployError, DeployResult};
use crate::graph::{workload_step, DISCOVERY, LISTENER, STORAGE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSpec {
    pub id: ReplicaId,
    pub endpoint: Endpoint,
}

/// A workload bound to its pool. Persisted as the workload step's spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub workload: String,
    pub pool: PoolName,
    pub image: String,
    pub protocol_class: ProtocolClass,
    pub host: String,
    pub base_port: u16,
    pub min: u32,
    pub max: u32,
    pub cpu: u32,
    pub memory_mib: u32,
    pub replicas: Vec<ReplicaSpec>,
    /// Shared by every replica.
    pub env: BTreeMap<String, String>,
}

/// Replicas added and drained by one scale call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleOutcome {
    pub added: Vec<ReplicaId>,
    pub drained: Vec<ReplicaId>,
}

/// What registration consumes from already-provisioned steps.
pub struct ServiceRegistrar<'a> {
    pub region: &'a str,
    pub log_level: &'a str,
    pub storage: Option<&'a ResourceRecord>,
    pub listener: Option<&'a ResourceRecord>,
    pub discovery_key: &'a str,
    pub channel: &'a dyn ParameterChannel,
}

impl ServiceRegistrar<'_> {
    /// Build the registration for workload `name`.
    ///
    /// Fails with an ordering fault when storage is not provisioned, or, for
    /// request/response workloads, when the listener or the discovery record
    /// is missing.
    pub fn register(
        &self,
        name: &str,
        workload: &WorkloadConfig,
        class: ProtocolClass,
    ) -> DeployResult<Registration> {
        let step = workload_step(name);
        let table = self
            .storage
            .and_then(|s| s.output("table"))
            .ok_or_else(|| DeployError::ordering(&step, STORAGE))?;

        let mut vars = BTreeMap::new();
        vars.insert(env::REGION.to_string(), self.region.to_string());
        vars.insert(env::LOG_LEVEL.to_string(), self.log_level.to_string());
        vars.insert(env::STORAGE_TABLE.to_string(), table.to_string());

        if class == ProtocolClass::RequestResponse {
            if self.channel.resolve(self.discovery_key)?.is_none() {
                return Err(DeployError::ordering(
                    &step,
                    format!("{DISCOVERY} record {}", self.discovery_key),
                ));
            }
            let base_url = match &workload.base_url {
                Some(url) => url.clone(),
                None => {
                    let dns = self
                        .listener
                        .and_then(|l| l.output("dns_name"))
                        .ok_or_else(|| DeployError::ordering(&step, LISTENER))?;
                    format!("http://{dns}")
                }
            };
            vars.insert(env::DISCOVERY_KEY.to_string(), self.discovery_key.to_string());
            vars.insert(env::BASE_URL.to_string(), base_url);
        }

        let desired = workload.desired.max(workload.min).min(workload.max);
        let replicas = (0..desired)
            .map(|i| ReplicaSpec {
                id: replica_id(name, i),
                endpoint: workload.replica_endpoint(i),
            })
            .collect();

        debug!(workload = name, pool = %workload.pool, replicas = desired, "workload registered");
        Ok(Registration {
            workload: name.to_string(),
            pool: workload.pool.clone(),
            image: workload.image.clone(),
            protocol_class: class,
            host: workload.host.clone(),
            base_port: workload.port,
            min: workload.min,
            max: workload.max,
            cpu: workload.cpu,
            memory_mib: workload.memory_mib,
            replicas,
            env: vars,
        })
    }
}

fn replica_id(workload: &str, index: u32) -> ReplicaId {
    format!("{workload}-{index}")
}

/// Add `replica` to `pool`, or readmit it if it is still draining there.
/// Returns whether the pool gained a serving member.
fn join(pool: &TargetPool, replica: &ReplicaSpec) -> ProxyResult<bool> {
    match pool.add_replica(&replica.id, replica.endpoint.clone()) {
        Ok(()) => Ok(true),
        Err(ProxyError::DuplicateReplica { .. }) => pool.readmit(&replica.id),
        Err(e) => Err(e),
    }
}

impl Registration {
    fn endpoint(&self, index: u32) -> Endpoint {
        Endpoint::new(
            self.host.clone(),
            self.base_port.saturating_add(index as u16),
            Protocol::Http,
        )
    }

    /// Put every replica into `pool`. Replicas already serving are left
    /// alone and draining ones are readmitted. New members start in
    /// `unknown` health and wait for checks.
    pub fn attach(&self, pool: &TargetPool) -> ProxyResult<usize> {
        if pool.name() != self.pool {
            return Err(ProxyError::UnknownPool(self.pool.clone()));
        }
        let mut added = 0;
        for replica in &self.replicas {
            if join(pool, replica)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Resize the fleet to `desired`, clamped to `[min, max]`.
    ///
    /// Growth adds replicas to the pool. Shrinking drains the
    /// highest-index replicas and returns immediately; the pool reaps them
    /// once their deregistration delay passes.
    pub fn scale(&mut self, desired: u32, pool: &TargetPool) -> ProxyResult<ScaleOutcome> {
        let target = desired.max(self.min).min(self.max) as usize;
        let mut outcome = ScaleOutcome::default();

        while self.replicas.len() < target {
            let index = self.replicas.len() as u32;
            let replica = ReplicaSpec {
                id: replica_id(&self.workload, index),
                endpoint: self.endpoint(index),
            };
            if join(pool, &replica)? {
                outcome.added.push(replica.id.clone());
            }
            self.replicas.push(replica);
        }

        if self.replicas.len() > target {
            for replica in self.replicas.split_off(target).into_iter().rev() {
                match pool.drain(&replica.id) {
                    Ok(()) | Err(ProxyError::UnknownReplica { .. }) => {}
                    Err(e) => return Err(e),
                }
                outcome.drained.push(replica.id);
            }
        }

        if !outcome.added.is_empty() || !outcome.drained.is_empty() {
            info!(
                workload = %self.workload,
                pool = %self.pool,
                replicas = self.replicas.len(),
                added = outcome.added.len(),
                drained = outcome.drained.len(),
                "workload scaled"
            );
        }
        Ok(outcome)
    }
}
