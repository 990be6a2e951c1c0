//! Assemble the live routing layer from a topology and its registrations.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tiergrid_core::TopologyConfig;
use tiergrid_proxy::{rules_from_config, PathRouter, ProxyError, ProxyResult, TargetPool};
use tracing::info;

use crate::error::DeployResult;
use crate::registrar::{Registration, ScaleOutcome};

pub struct Runtime {
    pub router: Arc<PathRouter>,
    pub pools: Vec<Arc<TargetPool>>,
    /// Registrations currently reflected in the pools, by workload.
    registered: Mutex<BTreeMap<String, Registration>>,
}

impl Runtime {
    pub fn pool(&self, name: &str) -> Option<&Arc<TargetPool>> {
        self.pools.iter().find(|p| p.name() == name)
    }

    fn pool_for(&self, registration: &Registration) -> ProxyResult<&Arc<TargetPool>> {
        self.pool(&registration.pool)
            .ok_or_else(|| ProxyError::UnknownPool(registration.pool.clone()))
    }

    /// Bring pool membership in line with freshly read registrations.
    ///
    /// A workload whose fleet only changed in size is scaled: surplus
    /// replicas drain and are reaped by the health monitor after their
    /// deregistration delay. A workload that moved host, base port or pool
    /// drains its old fleet and attaches the new one. Workloads no longer
    /// registered drain completely.
    pub fn sync(&self, registrations: &[Registration]) -> ProxyResult<ScaleOutcome> {
        let mut registered = self.registered.lock().expect("runtime lock");
        let mut outcome = ScaleOutcome::default();

        for next in registrations {
            let pool = self.pool_for(next)?;
            match registered.get(&next.workload) {
                Some(current) if current == next => continue,
                Some(current) if same_layout(current, next) => {
                    let mut resized = current.clone();
                    resized.min = next.min;
                    resized.max = next.max;
                    let step = resized.scale(next.replicas.len() as u32, pool)?;
                    outcome.added.extend(step.added);
                    outcome.drained.extend(step.drained);
                }
                Some(current) => {
                    outcome.drained.extend(drain_all(current, self.pool_for(current)?)?);
                    attach_logged(next, pool, &mut outcome)?;
                }
                None => attach_logged(next, pool, &mut outcome)?,
            }
            registered.insert(next.workload.clone(), next.clone());
        }

        let gone: Vec<String> = registered
            .keys()
            .filter(|w| !registrations.iter().any(|r| &r.workload == *w))
            .cloned()
            .collect();
        for workload in gone {
            if let Some(current) = registered.remove(&workload) {
                outcome.drained.extend(drain_all(&current, self.pool_for(&current)?)?);
                info!(%workload, "workload deregistered");
            }
        }
        Ok(outcome)
    }
}

fn same_layout(a: &Registration, b: &Registration) -> bool {
    a.pool == b.pool && a.host == b.host && a.base_port == b.base_port
}

fn attach_logged(
    registration: &Registration,
    pool: &TargetPool,
    outcome: &mut ScaleOutcome,
) -> ProxyResult<()> {
    let before: Vec<String> = pool.replicas().into_iter().map(|r| r.id).collect();
    let attached = registration.attach(pool)?;
    outcome.added.extend(
        registration
            .replicas
            .iter()
            .filter(|r| !before.contains(&r.id))
            .map(|r| r.id.clone()),
    );
    info!(
        workload = %registration.workload,
        pool = %registration.pool,
        attached,
        "workload attached"
    );
    Ok(())
}

fn drain_all(registration: &Registration, pool: &TargetPool) -> ProxyResult<Vec<String>> {
    let mut drained = Vec::new();
    for replica in registration.replicas.iter().rev() {
        match pool.drain(&replica.id) {
            Ok(()) => drained.push(replica.id.clone()),
            Err(ProxyError::UnknownReplica { .. }) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(drained)
}

/// One pool per declared pool, every registered replica attached (in
/// `unknown` health), and the router over the declared rules.
pub fn build_runtime(
    config: &TopologyConfig,
    registrations: &[Registration],
) -> DeployResult<Runtime> {
    let mut pools = Vec::with_capacity(config.pools.len());
    for (name, pool) in &config.pools {
        pools.push(Arc::new(TargetPool::new(name, pool.policy()?)));
    }

    let router = PathRouter::new(rules_from_config(config)?, pools.clone())?;
    let runtime = Runtime {
        router: Arc::new(router),
        pools,
        registered: Mutex::new(BTreeMap::new()),
    };
    runtime.sync(registrations)?;
    Ok(runtime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tiergrid_core::{Endpoint, Protocol, ProtocolClass, ReplicaHealth};
    use tiergrid_proxy::InboundRequest;

    use crate::registrar::ReplicaSpec;

    fn registration(workload: &str, pool: &str, replicas: u16) -> Registration {
        Registration {
            workload: workload.to_string(),
            pool: pool.to_string(),
            image: format!("{workload}:latest"),
            protocol_class: ProtocolClass::RequestResponse,
            host: "127.0.0.1".to_string(),
            base_port: 9000,
            min: 1,
            max: 4,
            cpu: 256,
            memory_mib: 512,
            replicas: (0..replicas)
                .map(|i| ReplicaSpec {
                    id: format!("{workload}-{i}"),
                    endpoint: Endpoint::new("127.0.0.1", 9000 + i, Protocol::Http),
                })
                .collect(),
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn builds_pools_and_router() {
        let config = TopologyConfig::scaffold("wordbash");
        let runtime = build_runtime(&config, &[registration("web", "web", 2)]).unwrap();

        assert_eq!(runtime.pools.len(), 2);
        assert_eq!(runtime.pool("web").unwrap().replicas().len(), 2);
        assert!(runtime.pool("game").unwrap().replicas().is_empty());
        assert!(runtime.pool("game").unwrap().affinity().is_some());

        let pool = runtime
            .router
            .route(&InboundRequest::new("/ws/lobby").upgrade())
            .unwrap();
        assert_eq!(pool.name(), "game");
    }

    #[test]
    fn sync_drains_removed_replicas_and_readmits_on_regrowth() {
        let config = TopologyConfig::scaffold("wordbash");
        let runtime = build_runtime(&config, &[registration("web", "web", 3)]).unwrap();
        let web = Arc::clone(runtime.pool("web").unwrap());

        let shrunk = runtime.sync(&[registration("web", "web", 1)]).unwrap();
        assert_eq!(shrunk.drained, vec!["web-2", "web-1"]);
        assert_eq!(web.replica("web-2").unwrap().health, ReplicaHealth::Draining);
        assert_eq!(web.replica("web-0").unwrap().health, ReplicaHealth::Unknown);

        let regrown = runtime.sync(&[registration("web", "web", 2)]).unwrap();
        assert_eq!(regrown.added, vec!["web-1"]);
        assert!(regrown.drained.is_empty());
        assert_eq!(web.replica("web-1").unwrap().health, ReplicaHealth::Unknown);
        assert_eq!(web.replica("web-2").unwrap().health, ReplicaHealth::Draining);
    }

    #[test]
    fn sync_is_a_no_op_for_unchanged_registrations() {
        let config = TopologyConfig::scaffold("wordbash");
        let regs = [registration("web", "web", 2)];
        let runtime = build_runtime(&config, &regs).unwrap();
        assert_eq!(runtime.sync(&regs).unwrap(), ScaleOutcome::default());
    }

    #[test]
    fn sync_drains_deregistered_workload() {
        let config = TopologyConfig::scaffold("wordbash");
        let runtime = build_runtime(&config, &[registration("web", "web", 2)]).unwrap();
        let outcome = runtime.sync(&[]).unwrap();
        assert_eq!(outcome.drained, vec!["web-1", "web-0"]);
        assert!(runtime
            .pool("web")
            .unwrap()
            .replicas()
            .iter()
            .all(|r| r.health == ReplicaHealth::Draining));
    }

    #[test]
    fn registration_for_unknown_pool_fails() {
        let config = TopologyConfig::scaffold("wordbash");
        assert!(build_runtime(&config, &[registration("batch", "batch", 1)]).is_err());
    }
}
