//! Convergence of a topology against the resource ledger.
//!
//! Every graph step has a desired record: the declared spec plus a
//! fingerprint over that spec and the outputs of the steps it depends on.
//! Applying walks the graph in order and compares fingerprints with the
//! ledger. Equal means no call, absent means `create`, different means
//! `update`. Ledgered steps the graph no longer has are destroyed last,
//! newest first.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tiergrid_core::{RetentionPolicy, TopologyConfig};
use tiergrid_state::{epoch_secs, ParameterChannel, ResourceKind, ResourceRecord, StateStore};
use tracing::{debug, error, info, warn};

use crate::error::{DeployError, DeployResult};
use crate::graph::{DeploymentGraph, Step, DISCOVERY, LISTENER, STORAGE};
use crate::provider::Provisioner;
use crate::registrar::{Registration, ServiceRegistrar};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Update,
    Unchanged,
    Destroy,
    /// Kept through teardown by its retention policy.
    Retain,
}

impl Action {
    pub fn is_mutation(&self) -> bool {
        matches!(self, Action::Create | Action::Update | Action::Destroy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Change {
    pub step: String,
    pub kind: ResourceKind,
    pub action: Action,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub changes: Vec<Change>,
}

impl ApplyReport {
    fn push(&mut self, step: &str, kind: ResourceKind, action: Action) {
        self.changes.push(Change {
            step: step.to_string(),
            kind,
            action,
        });
    }

    pub fn mutations(&self) -> usize {
        self.changes.iter().filter(|c| c.action.is_mutation()).count()
    }

    pub fn action(&self, step: &str) -> Option<Action> {
        self.changes.iter().find(|c| c.step == step).map(|c| c.action)
    }

    pub fn steps_with(&self, action: Action) -> Vec<&str> {
        self.changes
            .iter()
            .filter(|c| c.action == action)
            .map(|c| c.step.as_str())
            .collect()
    }
}

pub struct Deployer {
    store: StateStore,
    provisioner: Arc<dyn Provisioner>,
}

impl Deployer {
    pub fn new(store: StateStore, provisioner: Arc<dyn Provisioner>) -> Self {
        Self { store, provisioner }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Converge the ledger to `config`.
    ///
    /// Stops at the first failing step. Steps converged before it stay in
    /// the ledger, so the next apply resumes where this one failed.
    pub fn apply(&self, config: &TopologyConfig) -> DeployResult<ApplyReport> {
        let report = self.converge(config, true)?;
        info!(
            project = %config.project.name,
            mutations = report.mutations(),
            steps = report.changes.len(),
            "apply finished"
        );
        Ok(report)
    }

    /// What `apply` would do, without touching anything.
    ///
    /// A step downstream of a pending change is reported as changing too,
    /// since its inputs are not known until the change runs.
    pub fn plan(&self, config: &TopologyConfig) -> DeployResult<ApplyReport> {
        self.converge(config, false)
    }

    fn converge(&self, config: &TopologyConfig, mutate: bool) -> DeployResult<ApplyReport> {
        let graph = DeploymentGraph::for_topology(config)?;
        let order = graph.execution_order()?;
        let mut report = ApplyReport::default();
        let mut converged: BTreeMap<String, ResourceRecord> = BTreeMap::new();
        let mut pending: BTreeSet<String> = BTreeSet::new();

        for step in order {
            let existing = self.store.get_resource(&step.id)?;

            if !mutate && step.depends_on.iter().any(|d| pending.contains(d)) {
                let action = if existing.is_some() {
                    Action::Update
                } else {
                    Action::Create
                };
                pending.insert(step.id.clone());
                report.push(&step.id, step.kind, action);
                continue;
            }

            let desired = self.desired_record(config, step, &converged)?;
            let action = match &existing {
                Some(current) if current.fingerprint == desired.fingerprint => Action::Unchanged,
                Some(_) => Action::Update,
                None => Action::Create,
            };
            report.push(&step.id, step.kind, action);

            if !mutate {
                match existing {
                    Some(current) if action == Action::Unchanged => {
                        converged.insert(step.id.clone(), current);
                    }
                    _ => {
                        pending.insert(step.id.clone());
                    }
                }
                continue;
            }

            // Ledger sequence doubles as teardown order, so every record must
            // sort after the records it depends on.
            let floor = step
                .depends_on
                .iter()
                .filter_map(|d| converged.get(d))
                .map(|r| r.sequence)
                .max()
                .unwrap_or(0);

            let record = match (action, existing) {
                (Action::Unchanged, Some(mut current)) => {
                    if current.sequence <= floor {
                        current.sequence = self.store.next_sequence()?;
                        self.store.put_resource(&current)?;
                        debug!(step = %step.id, sequence = current.sequence, "unchanged, resequenced");
                    } else {
                        debug!(step = %step.id, "unchanged");
                    }
                    current
                }
                (Action::Update, Some(current)) => {
                    let outputs = self
                        .provisioner
                        .update(&current, &desired)
                        .inspect_err(|e| error!(step = %step.id, error = %e, "update failed"))?;
                    let sequence = if current.sequence <= floor {
                        self.store.next_sequence()?
                    } else {
                        current.sequence
                    };
                    let record = ResourceRecord {
                        outputs,
                        sequence,
                        created_at: current.created_at,
                        ..desired
                    };
                    self.store.put_resource(&record)?;
                    record
                }
                _ => {
                    let outputs = self
                        .provisioner
                        .create(&desired)
                        .inspect_err(|e| error!(step = %step.id, error = %e, "create failed"))?;
                    let record = ResourceRecord {
                        outputs,
                        sequence: self.store.next_sequence()?,
                        ..desired
                    };
                    self.store.put_resource(&record)?;
                    record
                }
            };

            if record.kind == ResourceKind::Discovery {
                self.publish_discovery(&record)?;
            }
            converged.insert(step.id.clone(), record);
        }

        let mut stale: Vec<ResourceRecord> = self
            .store
            .list_resources()?
            .into_iter()
            .filter(|r| !graph.contains(&r.id))
            .collect();
        stale.sort_by_key(|r| std::cmp::Reverse(r.sequence));
        for record in stale {
            report.push(&record.id, record.kind, Action::Destroy);
            if mutate {
                self.destroy_record(&record)?;
            }
        }

        Ok(report)
    }

    /// Publish the discovery record unless the channel already holds it.
    fn publish_discovery(&self, record: &ResourceRecord) -> DeployResult<()> {
        let (Some(key), Some(value)) = (record.output("key"), record.output("value")) else {
            return Err(DeployError::provision(&record.id, "discovery outputs missing"));
        };
        let current = self.store.resolve(key)?;
        if current.as_ref().map(|r| r.value.as_str()) != Some(value) {
            let published = self.store.publish(key, value)?;
            info!(%key, %value, version = published.version, "discovery record published");
        }
        Ok(())
    }

    fn destroy_record(&self, record: &ResourceRecord) -> DeployResult<()> {
        if record.kind == ResourceKind::Discovery {
            if let Some(key) = record.output("key") {
                self.store.retract(key)?;
            }
        }
        self.provisioner
            .destroy(record)
            .inspect_err(|e| error!(step = %record.id, error = %e, "destroy failed"))?;
        self.store.delete_resource(&record.id)?;
        Ok(())
    }

    /// Tear everything down, newest first.
    ///
    /// Storage survives when its retention is persistent or `keep_data` is
    /// set; its ledger entry stays so a later apply adopts it unchanged.
    pub fn destroy(&self, keep_data: bool) -> DeployResult<ApplyReport> {
        let mut records = self.store.list_resources()?;
        records.reverse();
        let mut report = ApplyReport::default();

        for record in records {
            let retained = record.kind == ResourceKind::Storage
                && (keep_data || record.retention == RetentionPolicy::Persistent);
            if retained {
                warn!(step = %record.id, "storage retained");
                report.push(&record.id, record.kind, Action::Retain);
                continue;
            }
            self.destroy_record(&record)?;
            report.push(&record.id, record.kind, Action::Destroy);
        }
        info!(mutations = report.mutations(), "destroy finished");
        Ok(report)
    }

    /// Operator-facing values derived from the ledger.
    pub fn outputs(&self) -> DeployResult<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        if let Some(listener) = self.store.get_resource(LISTENER)? {
            if let Some(address) = listener.output("address") {
                out.insert("listener_address".to_string(), address.to_string());
            }
            if let Some(dns) = listener.output("dns_name") {
                out.insert("web_url".to_string(), format!("http://{dns}"));
            }
        }
        if let Some(discovery) = self.store.get_resource(DISCOVERY)? {
            if let Some(value) = discovery.output("value") {
                out.insert("websocket_url".to_string(), value.to_string());
            }
            if let Some(key) = discovery.output("key") {
                out.insert("discovery_key".to_string(), key.to_string());
            }
        }
        if let Some(storage) = self.store.get_resource(STORAGE)? {
            if let Some(table) = storage.output("table") {
                out.insert("storage_table".to_string(), table.to_string());
            }
        }
        Ok(out)
    }

    /// Registrations of every provisioned workload.
    pub fn registrations(&self) -> DeployResult<Vec<Registration>> {
        self.store
            .list_resources()?
            .into_iter()
            .filter(|r| r.kind == ResourceKind::Workload)
            .map(|r| serde_json::from_value::<Registration>(r.spec).map_err(DeployError::from))
            .collect()
    }

    fn desired_record(
        &self,
        config: &TopologyConfig,
        step: &Step,
        converged: &BTreeMap<String, ResourceRecord>,
    ) -> DeployResult<ResourceRecord> {
        let mut retention = RetentionPolicy::Ephemeral;
        let spec: Value = match step.kind {
            ResourceKind::Network => serde_json::to_value(&config.network)?,
            ResourceKind::Storage => {
                retention = config.storage.retention;
                serde_json::to_value(&config.storage)?
            }
            ResourceKind::Cluster => json!({
                "name": format!("{}-cluster", config.project.name),
                "region": config.project.region,
            }),
            ResourceKind::Listener => serde_json::to_value(&config.listener)?,
            ResourceKind::Pool => {
                let name = step.id.strip_prefix("pool:").unwrap_or(&step.id);
                let pool = config
                    .pools
                    .get(name)
                    .ok_or_else(|| DeployError::ordering(&step.id, name))?;
                json!({ "name": name, "config": pool })
            }
            ResourceKind::Routes => json!({
                "rules": config.routes,
                "default_pool": config.listener.default_pool,
            }),
            ResourceKind::Discovery => {
                let dns = upstream(converged, step, LISTENER)?
                    .output("dns_name")
                    .ok_or_else(|| DeployError::ordering(&step.id, LISTENER))?;
                let prefix = config
                    .streaming_route_prefix()
                    .ok_or_else(|| DeployError::ordering(&step.id, "streaming route"))?;
                json!({
                    "key": config.discovery.key,
                    "value": format!("ws://{dns}{prefix}"),
                })
            }
            ResourceKind::Workload => {
                let name = step.id.strip_prefix("workload:").unwrap_or(&step.id);
                let workload = config
                    .workloads
                    .get(name)
                    .ok_or_else(|| DeployError::ordering(&step.id, name))?;
                let class = config.pool_policy(&workload.pool)?.protocol_class;
                let registrar = ServiceRegistrar {
                    region: &config.project.region,
                    log_level: &config.project.log_level,
                    storage: converged.get(STORAGE),
                    listener: converged.get(LISTENER),
                    discovery_key: &config.discovery.key,
                    channel: &self.store,
                };
                serde_json::to_value(registrar.register(name, workload, class)?)?
            }
        };

        let mut inputs = Vec::with_capacity(step.depends_on.len());
        for dep in &step.depends_on {
            inputs.push((dep.as_str(), &upstream(converged, step, dep)?.outputs));
        }

        let now = epoch_secs();
        Ok(ResourceRecord {
            id: step.id.clone(),
            kind: step.kind,
            fingerprint: fingerprint(step.kind, &spec, &inputs),
            spec,
            outputs: BTreeMap::new(),
            retention,
            sequence: 0,
            created_at: now,
            updated_at: now,
        })
    }
}

fn upstream<'a>(
    converged: &'a BTreeMap<String, ResourceRecord>,
    step: &Step,
    id: &str,
) -> DeployResult<&'a ResourceRecord> {
    converged
        .get(id)
        .ok_or_else(|| DeployError::ordering(&step.id, id))
}

/// sha256 hex over a step's kind, spec and consumed upstream outputs.
pub fn fingerprint(
    kind: ResourceKind,
    spec: &Value,
    inputs: &[(&str, &BTreeMap<String, String>)],
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{kind:?}\n").as_bytes());
    hasher.update(spec.to_string().as_bytes());
    for (id, outputs) in inputs {
        hasher.update(format!("\n{id}").as_bytes());
        for (k, v) in *outputs {
            hasher.update(format!("\n{k}={v}").as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_tracks_spec_and_inputs() {
        let spec = json!({"bind": "0.0.0.0:8080"});
        let outputs: BTreeMap<String, String> =
            [("name".to_string(), "a".to_string())].into_iter().collect();
        let other: BTreeMap<String, String> =
            [("name".to_string(), "b".to_string())].into_iter().collect();

        let base = fingerprint(ResourceKind::Listener, &spec, &[("cluster", &outputs)]);
        assert_eq!(base.len(), 64);
        assert_eq!(
            base,
            fingerprint(ResourceKind::Listener, &spec, &[("cluster", &outputs)])
        );
        assert_ne!(
            base,
            fingerprint(ResourceKind::Listener, &spec, &[("cluster", &other)])
        );
        assert_ne!(
            base,
            fingerprint(
                ResourceKind::Listener,
                &json!({"bind": "0.0.0.0:9090"}),
                &[("cluster", &outputs)]
            )
        );
    }

    #[test]
    fn report_counts_only_mutations() {
        let mut report = ApplyReport::default();
        report.push("network", ResourceKind::Network, Action::Unchanged);
        report.push("storage", ResourceKind::Storage, Action::Retain);
        report.push("workload:web", ResourceKind::Workload, Action::Update);
        assert_eq!(report.mutations(), 1);
        assert_eq!(report.action("storage"), Some(Action::Retain));
        assert_eq!(report.steps_with(Action::Update), vec!["workload:web"]);
    }
}
