//! Provisioner seam and the local provisioner.
//!
//! The deployer decides what changes; a [`Provisioner`] carries it out and
//! reports the outputs dependents consume. [`LocalProvisioner`] runs the
//! whole topology on one host: it derives addresses from the declared
//! specs and keeps the storage tier as a directory under the data dir.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tiergrid_state::{ResourceKind, ResourceRecord};
use tracing::{debug, info};

use crate::error::{DeployError, DeployResult};

pub type Outputs = BTreeMap<String, String>;

pub trait Provisioner: Send + Sync {
    fn create(&self, desired: &ResourceRecord) -> DeployResult<Outputs>;
    fn update(&self, current: &ResourceRecord, desired: &ResourceRecord) -> DeployResult<Outputs>;
    fn destroy(&self, record: &ResourceRecord) -> DeployResult<()>;
}

pub struct LocalProvisioner {
    data_dir: PathBuf,
}

impl LocalProvisioner {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
        }
    }

    pub fn storage_dir(&self, table: &str) -> PathBuf {
        self.data_dir.join("storage").join(table)
    }

    fn outputs(&self, record: &ResourceRecord) -> DeployResult<Outputs> {
        let spec = &record.spec;
        let field = |name: &str| spec_str(record, name);
        let mut out = Outputs::new();
        match record.kind {
            ResourceKind::Network => {
                let azs = spec.get("max_azs").and_then(Value::as_u64).unwrap_or(1);
                let mask = spec.get("cidr_mask").and_then(Value::as_u64).unwrap_or(24);
                out.insert("subnets".into(), (azs * 2).to_string());
                out.insert("cidr_mask".into(), mask.to_string());
            }
            ResourceKind::Storage => {
                let table = field("table_name")?;
                out.insert("table".into(), table.to_string());
                out.insert(
                    "path".into(),
                    self.storage_dir(table).display().to_string(),
                );
            }
            ResourceKind::Cluster => {
                out.insert("name".into(), field("name")?.to_string());
            }
            ResourceKind::Listener => {
                out.insert("address".into(), field("bind")?.to_string());
                out.insert("dns_name".into(), field("public_host")?.to_string());
            }
            ResourceKind::Pool => {
                out.insert("name".into(), field("name")?.to_string());
            }
            ResourceKind::Routes => {
                let rules = spec.get("rules").and_then(Value::as_array).map_or(0, Vec::len);
                out.insert("rules".into(), rules.to_string());
            }
            ResourceKind::Discovery => {
                out.insert("key".into(), field("key")?.to_string());
                out.insert("value".into(), field("value")?.to_string());
            }
            ResourceKind::Workload => {
                let replicas = spec.get("replicas").and_then(Value::as_array).map_or(0, Vec::len);
                out.insert("image".into(), field("image")?.to_string());
                out.insert("replicas".into(), replicas.to_string());
            }
        }
        Ok(out)
    }

    fn ensure_storage(&self, record: &ResourceRecord) -> DeployResult<()> {
        let dir = self.storage_dir(spec_str(record, "table_name")?);
        std::fs::create_dir_all(&dir)
            .map_err(|e| DeployError::provision(&record.id, format!("{}: {e}", dir.display())))?;
        debug!(path = %dir.display(), "storage table ready");
        Ok(())
    }
}

fn spec_str<'a>(record: &'a ResourceRecord, name: &str) -> DeployResult<&'a str> {
    record
        .spec
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| DeployError::provision(&record.id, format!("spec field {name:?} missing")))
}

impl Provisioner for LocalProvisioner {
    fn create(&self, desired: &ResourceRecord) -> DeployResult<Outputs> {
        if desired.kind == ResourceKind::Storage {
            self.ensure_storage(desired)?;
        }
        info!(step = %desired.id, "resource created");
        self.outputs(desired)
    }

    fn update(&self, current: &ResourceRecord, desired: &ResourceRecord) -> DeployResult<Outputs> {
        // A renamed table is a new table; the old directory stays until destroy.
        if desired.kind == ResourceKind::Storage {
            self.ensure_storage(desired)?;
        }
        info!(step = %desired.id, previous = %current.fingerprint, "resource updated");
        self.outputs(desired)
    }

    fn destroy(&self, record: &ResourceRecord) -> DeployResult<()> {
        if record.kind == ResourceKind::Storage {
            let dir = self.storage_dir(spec_str(record, "table_name")?);
            if dir.exists() {
                std::fs::remove_dir_all(&dir).map_err(|e| {
                    DeployError::provision(&record.id, format!("{}: {e}", dir.display()))
                })?;
            }
        }
        info!(step = %record.id, "resource destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tiergrid_core::RetentionPolicy;

    fn record(kind: ResourceKind, spec: Value) -> ResourceRecord {
        ResourceRecord {
            id: format!("{kind:?}").to_lowercase(),
            kind,
            spec,
            fingerprint: String::new(),
            outputs: Outputs::new(),
            retention: RetentionPolicy::Ephemeral,
            sequence: 1,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn storage_lives_in_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = LocalProvisioner::new(dir.path());
        let storage = record(
            ResourceKind::Storage,
            serde_json::json!({"table_name": "games", "partition_key": "id"}),
        );

        let outputs = provisioner.create(&storage).unwrap();
        assert_eq!(outputs["table"], "games");
        assert!(provisioner.storage_dir("games").is_dir());

        provisioner.destroy(&storage).unwrap();
        assert!(!provisioner.storage_dir("games").exists());
    }

    #[test]
    fn listener_outputs_address_and_dns_name() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = LocalProvisioner::new(dir.path());
        let listener = record(
            ResourceKind::Listener,
            serde_json::json!({"bind": "0.0.0.0:8080", "public_host": "play.example"}),
        );
        let outputs = provisioner.create(&listener).unwrap();
        assert_eq!(outputs["address"], "0.0.0.0:8080");
        assert_eq!(outputs["dns_name"], "play.example");
    }

    #[test]
    fn missing_spec_field_is_provision_error() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = LocalProvisioner::new(dir.path());
        let listener = record(ResourceKind::Listener, serde_json::json!({}));
        assert!(matches!(
            provisioner.create(&listener),
            Err(DeployError::Provision { .. })
        ));
    }
}
