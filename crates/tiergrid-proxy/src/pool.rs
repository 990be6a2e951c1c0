//! Target pools: replica membership, admission and selection.
//!
//! A pool's policy is fixed at construction; only membership and health
//! change afterwards. Health is written by a single owner (the pool's
//! health monitor) and the drain signal; the request path only reads.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::time::Instant;

use tiergrid_core::{Endpoint, PoolName, PoolPolicy, ReplicaHealth, ReplicaId};
use tracing::{debug, info};

use crate::affinity::AffinityMap;
use crate::error::{ProxyError, ProxyResult, RouteError};

/// A compute endpoint inside a pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replica {
    pub id: ReplicaId,
    /// Back-reference only.
    pub pool: PoolName,
    pub endpoint: Endpoint,
    pub health: ReplicaHealth,
}

struct Member {
    replica: Replica,
    draining_since: Option<Instant>,
}

/// The replica chosen for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub replica: Replica,
    /// Whether an existing sticky binding decided the choice.
    pub resumed: bool,
}

pub struct TargetPool {
    name: PoolName,
    policy: PoolPolicy,
    members: RwLock<Vec<Member>>,
    counter: AtomicUsize,
    affinity: Option<AffinityMap>,
}

impl TargetPool {
    pub fn new(name: &str, policy: PoolPolicy) -> Self {
        let affinity = policy
            .stickiness
            .as_ref()
            .map(|s| AffinityMap::new(s.duration));
        Self {
            name: name.to_string(),
            policy,
            members: RwLock::new(Vec::new()),
            counter: AtomicUsize::new(0),
            affinity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> &PoolPolicy {
        &self.policy
    }

    pub fn affinity(&self) -> Option<&AffinityMap> {
        self.affinity.as_ref()
    }

    /// Add a replica in `Unknown` health. It receives traffic only after
    /// passing its health checks.
    pub fn add_replica(&self, id: &str, endpoint: Endpoint) -> ProxyResult<()> {
        let mut members = self.members.write().expect("pool lock");
        if members.iter().any(|m| m.replica.id == id) {
            return Err(ProxyError::DuplicateReplica {
                pool: self.name.clone(),
                replica: id.to_string(),
            });
        }
        members.push(Member {
            replica: Replica {
                id: id.to_string(),
                pool: self.name.clone(),
                endpoint,
                health: ReplicaHealth::Unknown,
            },
            draining_since: None,
        });
        debug!(pool = %self.name, replica = id, "replica registered");
        Ok(())
    }

    pub fn replicas(&self) -> Vec<Replica> {
        let members = self.members.read().expect("pool lock");
        members.iter().map(|m| m.replica.clone()).collect()
    }

    pub fn replica(&self, id: &str) -> Option<Replica> {
        let members = self.members.read().expect("pool lock");
        members
            .iter()
            .find(|m| m.replica.id == id)
            .map(|m| m.replica.clone())
    }

    pub fn healthy_count(&self) -> usize {
        let members = self.members.read().expect("pool lock");
        members
            .iter()
            .filter(|m| m.replica.health.admits_new())
            .count()
    }

    /// Apply a debounced health verdict. Returns true if the state changed.
    ///
    /// Draining replicas keep draining whatever their checks say.
    pub fn set_health(&self, id: &str, health: ReplicaHealth) -> bool {
        if health == ReplicaHealth::Draining {
            return self.drain(id).is_ok();
        }
        let mut members = self.members.write().expect("pool lock");
        let Some(member) = members.iter_mut().find(|m| m.replica.id == id) else {
            return false;
        };
        if member.replica.health == ReplicaHealth::Draining || member.replica.health == health {
            return false;
        }
        debug!(
            pool = %self.name,
            replica = id,
            from = ?member.replica.health,
            to = ?health,
            "replica health changed"
        );
        member.replica.health = health;
        true
    }

    /// Stop admitting new sessions to `id`. Existing sticky sessions keep
    /// reaching it until they end or the deregistration delay elapses.
    pub fn drain(&self, id: &str) -> ProxyResult<()> {
        let mut members = self.members.write().expect("pool lock");
        let member = members
            .iter_mut()
            .find(|m| m.replica.id == id)
            .ok_or_else(|| ProxyError::UnknownReplica {
                pool: self.name.clone(),
                replica: id.to_string(),
            })?;
        if member.draining_since.is_none() {
            member.replica.health = ReplicaHealth::Draining;
            member.draining_since = Some(Instant::now());
            info!(pool = %self.name, replica = id, "replica draining");
        }
        Ok(())
    }

    /// Cancel a drain. The replica goes back to `Unknown` and takes new
    /// sessions again once its checks pass. Returns false if it was not
    /// draining.
    pub fn readmit(&self, id: &str) -> ProxyResult<bool> {
        let mut members = self.members.write().expect("pool lock");
        let member = members
            .iter_mut()
            .find(|m| m.replica.id == id)
            .ok_or_else(|| ProxyError::UnknownReplica {
                pool: self.name.clone(),
                replica: id.to_string(),
            })?;
        if member.draining_since.take().is_none() {
            return Ok(false);
        }
        member.replica.health = ReplicaHealth::Unknown;
        info!(pool = %self.name, replica = id, "replica readmitted");
        Ok(true)
    }

    /// Remove a replica and every sticky binding pointing at it.
    pub fn remove_replica(&self, id: &str) -> Option<Replica> {
        let removed = {
            let mut members = self.members.write().expect("pool lock");
            let idx = members.iter().position(|m| m.replica.id == id)?;
            members.remove(idx).replica
        };
        if let Some(affinity) = &self.affinity {
            affinity.release_replica(id);
        }
        info!(pool = %self.name, replica = id, "replica deregistered");
        Some(removed)
    }

    /// Remove draining replicas whose deregistration delay has elapsed.
    pub fn reap_drained(&self) -> Vec<ReplicaId> {
        let delay = self.policy.deregistration_delay;
        let expired: Vec<ReplicaId> = {
            let members = self.members.read().expect("pool lock");
            members
                .iter()
                .filter(|m| m.draining_since.is_some_and(|t| t.elapsed() >= delay))
                .map(|m| m.replica.id.clone())
                .collect()
        };
        for id in &expired {
            self.remove_replica(id);
        }
        expired
    }

    /// Pick a replica for a request.
    ///
    /// With stickiness, an existing live binding for `affinity_key` wins;
    /// otherwise a healthy replica is chosen round-robin and bound through
    /// check-and-set, so racing first contacts converge on one replica.
    pub fn select(&self, affinity_key: Option<&str>) -> Result<Selection, RouteError> {
        let members = self.members.read().expect("pool lock");

        let (Some(affinity), Some(key)) = (&self.affinity, affinity_key) else {
            let candidate = self.next_healthy(&members)?;
            return Ok(Selection {
                replica: candidate.clone(),
                resumed: false,
            });
        };

        if let Some(binding) = affinity.lookup(key) {
            let live = members
                .iter()
                .find(|m| m.replica.id == binding.replica)
                .filter(|m| m.replica.health.serves_existing());
            match live {
                Some(member) if !affinity.is_expired(&binding) => {
                    return Ok(Selection {
                        replica: member.replica.clone(),
                        resumed: true,
                    });
                }
                _ => {
                    affinity.release_if(key, &binding.replica);
                }
            }
        }

        let candidate = self.next_healthy(&members)?;
        let winner = affinity.bind(key, &candidate.id);
        let replica = members
            .iter()
            .find(|m| m.replica.id == winner && m.replica.health.serves_existing())
            .map(|m| &m.replica)
            .unwrap_or(candidate);
        Ok(Selection {
            replica: replica.clone(),
            resumed: false,
        })
    }

    fn next_healthy<'a>(&self, members: &'a [Member]) -> Result<&'a Replica, RouteError> {
        let healthy: Vec<&Replica> = members
            .iter()
            .map(|m| &m.replica)
            .filter(|r| r.health.admits_new())
            .collect();
        if healthy.is_empty() {
            return Err(RouteError::Unavailable {
                pool: self.name.clone(),
            });
        }
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        Ok(healthy[idx])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;
    use tiergrid_core::{Protocol, StickinessPolicy};

    fn ep(port: u16) -> Endpoint {
        Endpoint::new("10.0.0.1", port, Protocol::Http)
    }

    fn healthy_pool(name: &str, policy: PoolPolicy, n: u16) -> TargetPool {
        let pool = TargetPool::new(name, policy);
        for i in 0..n {
            let id = format!("{name}-{i}");
            pool.add_replica(&id, ep(9000 + i)).unwrap();
            pool.set_health(&id, ReplicaHealth::Healthy);
        }
        pool
    }

    #[test]
    fn round_robin_over_healthy() {
        let pool = healthy_pool("web", PoolPolicy::request_response(), 3);
        let picks: Vec<String> = (0..4)
            .map(|_| pool.select(None).unwrap().replica.id)
            .collect();
        assert_eq!(picks, vec!["web-0", "web-1", "web-2", "web-0"]);
    }

    #[test]
    fn new_replicas_start_unknown_and_get_no_traffic() {
        let pool = TargetPool::new("web", PoolPolicy::request_response());
        pool.add_replica("web-0", ep(9000)).unwrap();
        assert_eq!(pool.replica("web-0").unwrap().health, ReplicaHealth::Unknown);
        assert_eq!(
            pool.select(None),
            Err(RouteError::Unavailable {
                pool: "web".to_string()
            })
        );
    }

    #[test]
    fn duplicate_replica_rejected() {
        let pool = TargetPool::new("web", PoolPolicy::request_response());
        pool.add_replica("web-0", ep(9000)).unwrap();
        assert!(matches!(
            pool.add_replica("web-0", ep(9001)),
            Err(ProxyError::DuplicateReplica { .. })
        ));
    }

    #[test]
    fn unhealthy_replicas_are_skipped() {
        let pool = healthy_pool("web", PoolPolicy::request_response(), 2);
        pool.set_health("web-0", ReplicaHealth::Unhealthy);
        for _ in 0..4 {
            assert_eq!(pool.select(None).unwrap().replica.id, "web-1");
        }
        assert_eq!(pool.healthy_count(), 1);
    }

    #[test]
    fn zero_healthy_is_unavailable() {
        let pool = healthy_pool("game", PoolPolicy::streaming(), 1);
        pool.set_health("game-0", ReplicaHealth::Unhealthy);
        assert!(matches!(
            pool.select(Some("client")),
            Err(RouteError::Unavailable { .. })
        ));
    }

    #[test]
    fn sticky_key_resumes_same_replica() {
        let pool = healthy_pool("game", PoolPolicy::streaming(), 3);
        let first = pool.select(Some("client-a")).unwrap();
        assert!(!first.resumed);
        for _ in 0..5 {
            let again = pool.select(Some("client-a")).unwrap();
            assert!(again.resumed);
            assert_eq!(again.replica.id, first.replica.id);
        }
    }

    #[test]
    fn draining_keeps_existing_sessions_but_takes_no_new_ones() {
        let pool = healthy_pool("game", PoolPolicy::streaming(), 2);
        let bound = pool.select(Some("client-a")).unwrap().replica.id;
        pool.drain(&bound).unwrap();

        assert_eq!(pool.select(Some("client-a")).unwrap().replica.id, bound);
        for i in 0..4 {
            let other = pool.select(Some(&format!("new-{i}"))).unwrap();
            assert_ne!(other.replica.id, bound);
        }
    }

    #[test]
    fn health_updates_do_not_undo_drain() {
        let pool = healthy_pool("game", PoolPolicy::streaming(), 1);
        pool.drain("game-0").unwrap();
        assert!(!pool.set_health("game-0", ReplicaHealth::Healthy));
        assert_eq!(pool.replica("game-0").unwrap().health, ReplicaHealth::Draining);
    }

    #[test]
    fn readmit_cancels_drain() {
        let pool = healthy_pool("game", PoolPolicy::streaming(), 1);
        pool.drain("game-0").unwrap();
        assert!(pool.readmit("game-0").unwrap());
        assert_eq!(pool.replica("game-0").unwrap().health, ReplicaHealth::Unknown);
        assert!(pool.reap_drained().is_empty());
        assert!(pool.set_health("game-0", ReplicaHealth::Healthy));

        assert!(!pool.readmit("game-0").unwrap());
        assert!(pool.readmit("game-9").is_err());
    }

    #[test]
    fn unhealthy_binding_is_released_and_rebound() {
        let pool = healthy_pool("game", PoolPolicy::streaming(), 2);
        let bound = pool.select(Some("client-a")).unwrap().replica.id;
        pool.set_health(&bound, ReplicaHealth::Unhealthy);

        let moved = pool.select(Some("client-a")).unwrap();
        assert_ne!(moved.replica.id, bound);
        assert!(!moved.resumed);
        assert_eq!(pool.affinity().unwrap().lookup("client-a").unwrap().replica, moved.replica.id);
    }

    #[test]
    fn expired_binding_is_reassigned() {
        let mut policy = PoolPolicy::streaming();
        policy.stickiness = Some(StickinessPolicy {
            cookie: "c".to_string(),
            duration: Duration::ZERO,
        });
        let pool = healthy_pool("game", policy, 2);
        pool.select(Some("client-a")).unwrap();
        assert!(!pool.select(Some("client-a")).unwrap().resumed);
    }

    #[test]
    fn remove_replica_drops_bindings() {
        let pool = healthy_pool("game", PoolPolicy::streaming(), 2);
        let bound = pool.select(Some("client-a")).unwrap().replica.id;
        assert!(pool.remove_replica(&bound).is_some());
        assert!(pool.affinity().unwrap().lookup("client-a").is_none());
        assert!(pool.remove_replica(&bound).is_none());
    }

    #[test]
    fn reap_drained_honours_delay() {
        let mut policy = PoolPolicy::streaming();
        policy.deregistration_delay = Duration::ZERO;
        let pool = healthy_pool("game", policy, 2);
        pool.drain("game-1").unwrap();
        assert_eq!(pool.reap_drained(), vec!["game-1".to_string()]);
        assert_eq!(pool.replicas().len(), 1);

        let pool = healthy_pool("game", PoolPolicy::streaming(), 2);
        pool.drain("game-1").unwrap();
        assert!(pool.reap_drained().is_empty());
    }

    #[test]
    fn concurrent_first_contacts_share_a_replica() {
        let pool = Arc::new(healthy_pool("game", PoolPolicy::streaming(), 4));
        let barrier = Arc::new(Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    pool.select(Some("client-a")).unwrap().replica.id
                })
            })
            .collect();

        let ids: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|id| id == &ids[0]));
    }
}
