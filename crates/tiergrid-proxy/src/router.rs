//! Request routing: maps each inbound request to exactly one pool.
//!
//! Rules are evaluated in ascending priority. The first rule whose pattern
//! matches the path and whose protocol requirement is met wins. Priorities
//! are unique, so overlapping patterns still resolve deterministically.
//! The listener's default pool is installed as a catch-all at the lowest
//! priority.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tiergrid_core::config::DEFAULT_ROUTE_PRIORITY;
use tiergrid_core::{PoolName, ProtocolRequirement, TopologyConfig};
use tracing::debug;

use crate::error::{ProxyError, ProxyResult, RouteError};
use crate::pattern::PathPattern;
use crate::pool::{Selection, TargetPool};

/// The parts of a request routing looks at.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundRequest {
    pub path: String,
    pub wants_upgrade: bool,
    pub cookies: HashMap<String, String>,
}

impl InboundRequest {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            ..Self::default()
        }
    }

    pub fn upgrade(mut self) -> Self {
        self.wants_upgrade = true;
        self
    }

    pub fn with_cookie(mut self, name: &str, value: &str) -> Self {
        self.cookies.insert(name.to_string(), value.to_string());
        self
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    /// Extract path, upgrade intent and cookies from an HTTP request.
    ///
    /// Upgrade intent means a `Connection` header carrying the `upgrade`
    /// token together with a non-empty `Upgrade` header.
    pub fn from_http<B>(req: &http::Request<B>) -> Self {
        let headers = req.headers();
        let connection_upgrade = headers
            .get_all(http::header::CONNECTION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(','))
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
        let upgrade_protocol = headers
            .get(http::header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| !v.trim().is_empty());

        let cookies = headers
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .flat_map(|v| v.split(';'))
            .filter_map(|pair| pair.split_once('='))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();

        Self {
            path: req.uri().path().to_string(),
            wants_upgrade: connection_upgrade && upgrade_protocol,
            cookies,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub pattern: PathPattern,
    pub requirement: ProtocolRequirement,
    pub target: PoolName,
    /// Lower values are evaluated first.
    pub priority: u32,
}

impl RouteRule {
    pub fn new(
        pattern: &str,
        requirement: ProtocolRequirement,
        target: &str,
        priority: u32,
    ) -> ProxyResult<Self> {
        Ok(Self {
            pattern: PathPattern::new(pattern)?,
            requirement,
            target: target.to_string(),
            priority,
        })
    }

    /// Lowest-priority rule sending everything else to `target`.
    pub fn default_to(target: &str) -> Self {
        Self {
            pattern: PathPattern::catch_all(),
            requirement: ProtocolRequirement::Any,
            target: target.to_string(),
            priority: DEFAULT_ROUTE_PRIORITY,
        }
    }

    pub fn matches(&self, req: &InboundRequest) -> bool {
        self.requirement.is_satisfied_by(req.wants_upgrade) && self.pattern.matches(&req.path)
    }
}

/// Build the rule table declared by a topology, default rule included.
pub fn rules_from_config(config: &TopologyConfig) -> ProxyResult<Vec<RouteRule>> {
    let mut rules = config
        .routes
        .iter()
        .map(|r| RouteRule::new(&r.path, r.upgrade, &r.pool, r.priority))
        .collect::<ProxyResult<Vec<_>>>()?;
    rules.push(RouteRule::default_to(&config.listener.default_pool));
    Ok(rules)
}

/// Outcome of a successful dispatch.
#[derive(Clone)]
pub struct Dispatch {
    pub pool: Arc<TargetPool>,
    pub selection: Selection,
    /// Affinity key minted for a client that arrived without one. It is
    /// bound only by [`Dispatch::commit_affinity`].
    pub issued_affinity: Option<String>,
}

impl Dispatch {
    /// Bind the minted key to the selected replica once the replica has
    /// accepted the session. Returns the key to hand back as a cookie.
    pub fn commit_affinity(&self) -> Option<&str> {
        let key = self.issued_affinity.as_deref()?;
        let affinity = self.pool.affinity()?;
        affinity.bind(key, &self.selection.replica.id);
        Some(key)
    }
}

/// Immutable rule table plus the pools it dispatches to.
pub struct PathRouter {
    rules: Vec<RouteRule>,
    pools: HashMap<PoolName, Arc<TargetPool>>,
}

impl PathRouter {
    pub fn new(mut rules: Vec<RouteRule>, pools: Vec<Arc<TargetPool>>) -> ProxyResult<Self> {
        let mut by_name = HashMap::new();
        for pool in pools {
            let name = pool.name().to_string();
            if by_name.insert(name.clone(), pool).is_some() {
                return Err(ProxyError::DuplicatePool(name));
            }
        }

        let mut priorities = HashSet::new();
        for rule in &rules {
            if !by_name.contains_key(&rule.target) {
                return Err(ProxyError::UnknownPool(rule.target.clone()));
            }
            if !priorities.insert(rule.priority) {
                return Err(ProxyError::DuplicatePriority(rule.priority));
            }
        }
        rules.sort_by_key(|r| r.priority);

        Ok(Self {
            rules,
            pools: by_name,
        })
    }

    pub fn rules(&self) -> &[RouteRule] {
        &self.rules
    }

    pub fn pool(&self, name: &str) -> Option<&Arc<TargetPool>> {
        self.pools.get(name)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Arc<TargetPool>> {
        self.pools.values()
    }

    /// Select the pool for a request.
    pub fn route(&self, req: &InboundRequest) -> Result<&Arc<TargetPool>, RouteError> {
        let rule = self
            .rules
            .iter()
            .find(|rule| rule.matches(req))
            .ok_or_else(|| RouteError::NoRoute {
                path: req.path.clone(),
            })?;
        debug!(
            path = %req.path,
            upgrade = req.wants_upgrade,
            rule = rule.pattern.as_str(),
            pool = %rule.target,
            "route matched"
        );
        self.pools
            .get(&rule.target)
            .ok_or_else(|| RouteError::NoRoute {
                path: req.path.clone(),
            })
    }

    /// Route, then pick a replica honouring the pool's stickiness.
    pub fn dispatch(&self, req: &InboundRequest) -> Result<Dispatch, RouteError> {
        let pool = self.route(req)?;

        // A minted key has no binding yet, so selection is plain round-robin.
        let (key, issued) = match &pool.policy().stickiness {
            Some(sticky) => match req.cookie(&sticky.cookie) {
                Some(existing) => (Some(existing), None),
                None => (None, Some(uuid::Uuid::new_v4().simple().to_string())),
            },
            None => (None, None),
        };

        let selection = pool.select(key)?;
        Ok(Dispatch {
            pool: Arc::clone(pool),
            selection,
            issued_affinity: issued,
        })
    }
}
