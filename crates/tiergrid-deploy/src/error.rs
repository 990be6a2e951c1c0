//! Deployer error types.

use thiserror::Error;

use crate::graph::GraphError;

pub type DeployResult<T> = Result<T, DeployError>;

#[derive(Debug, Error)]
pub enum DeployError {
    /// A step ran before something it consumes was provisioned.
    #[error("ordering fault in {step}: {missing} is not provisioned yet")]
    Ordering { step: String, missing: String },

    #[error("invalid deployment graph: {0}")]
    Graph(#[from] GraphError),

    #[error("provisioning {step} failed: {reason}")]
    Provision { step: String, reason: String },

    #[error("state error: {0}")]
    State(#[from] tiergrid_state::StateError),

    #[error("config error: {0}")]
    Config(#[from] tiergrid_core::ConfigError),

    #[error("proxy error: {0}")]
    Proxy(#[from] tiergrid_proxy::ProxyError),

    #[error(transparent)]
    Discovery(#[from] tiergrid_state::DiscoveryError),

    #[error("resource spec error: {0}")]
    Spec(#[from] serde_json::Error),
}

impl DeployError {
    pub(crate) fn ordering(step: &str, missing: impl Into<String>) -> Self {
        DeployError::Ordering {
            step: step.to_string(),
            missing: missing.into(),
        }
    }

    pub(crate) fn provision(step: &str, reason: impl Into<String>) -> Self {
        DeployError::Provision {
            step: step.to_string(),
            reason: reason.into(),
        }
    }
}
