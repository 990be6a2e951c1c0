//! Proxy error types.

use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

/// Errors raised while building or mutating the routing table.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid path pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("route targets unknown pool: {0}")]
    UnknownPool(String),

    #[error("pool registered twice: {0}")]
    DuplicatePool(String),

    #[error("two rules share priority {0}")]
    DuplicatePriority(u32),

    #[error("replica {replica} already in pool {pool}")]
    DuplicateReplica { pool: String, replica: String },

    #[error("replica {replica} not in pool {pool}")]
    UnknownReplica { pool: String, replica: String },
}

/// Per-request routing outcome that never reaches a replica.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RouteError {
    #[error("no route matches {path}")]
    NoRoute { path: String },

    #[error("pool {pool} has no healthy replicas")]
    Unavailable { pool: String },
}

/// Failures talking to the selected replica.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("connect to {authority} failed: {source}")]
    Connect {
        authority: String,
        #[source]
        source: std::io::Error,
    },

    #[error("connect to {0} timed out")]
    ConnectTimeout(String),

    #[error("upstream handshake failed: {0}")]
    Handshake(#[source] hyper::Error),

    #[error("upstream request failed: {0}")]
    Upstream(#[source] hyper::Error),

    #[error("upstream idle for longer than {0:?}")]
    Idle(std::time::Duration),
}
