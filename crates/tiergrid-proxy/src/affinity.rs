//! Sticky-session bindings.
//!
//! Maps a client-affinity key to the replica holding that client's session.
//! A binding is set exactly once through [`AffinityMap::bind`]: the first
//! writer for a key wins and every concurrent contender reads the winner.
//! Bindings are only ever dropped (expiry, replica gone), never rewritten
//! in place.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tiergrid_core::ReplicaId;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub replica: ReplicaId,
    pub bound_at: Instant,
}

/// Bindings held per pool before new keys stop being recorded.
pub const DEFAULT_CAPACITY: usize = 100_000;

pub struct AffinityMap {
    bindings: DashMap<String, Binding>,
    ttl: Duration,
    capacity: usize,
}

impl AffinityMap {
    pub fn new(ttl: Duration) -> Self {
        Self::with_capacity(ttl, DEFAULT_CAPACITY)
    }

    /// Concurrent first binds may overshoot `capacity` by a few entries.
    pub fn with_capacity(ttl: Duration, capacity: usize) -> Self {
        Self {
            bindings: DashMap::new(),
            ttl,
            capacity,
        }
    }

    pub fn lookup(&self, key: &str) -> Option<Binding> {
        self.bindings.get(key).map(|b| b.value().clone())
    }

    pub fn is_expired(&self, binding: &Binding) -> bool {
        binding.bound_at.elapsed() >= self.ttl
    }

    /// Check-and-set: bind `key` to `candidate` unless a binding exists.
    ///
    /// Returns the replica the key is bound to after the call. A full map
    /// first drops expired bindings; if it is still full the key stays
    /// unbound and `candidate` is returned.
    pub fn bind(&self, key: &str, candidate: &str) -> ReplicaId {
        if self.bindings.len() >= self.capacity && !self.bindings.contains_key(key) {
            self.purge_expired();
            if self.bindings.len() >= self.capacity {
                warn!(key, capacity = self.capacity, "affinity table full, binding skipped");
                return candidate.to_string();
            }
        }
        match self.bindings.entry(key.to_string()) {
            Entry::Occupied(existing) => existing.get().replica.clone(),
            Entry::Vacant(slot) => {
                debug!(key, replica = candidate, "affinity established");
                slot.insert(Binding {
                    replica: candidate.to_string(),
                    bound_at: Instant::now(),
                });
                candidate.to_string()
            }
        }
    }

    /// Drop the binding for `key` only if it still points at `replica`.
    pub fn release_if(&self, key: &str, replica: &str) -> bool {
        self.bindings
            .remove_if(key, |_, b| b.replica == replica)
            .is_some()
    }

    /// Drop every binding to `replica`. Returns how many were dropped.
    pub fn release_replica(&self, replica: &str) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, b| b.replica != replica);
        before.saturating_sub(self.bindings.len())
    }

    pub fn purge_expired(&self) -> usize {
        let before = self.bindings.len();
        let ttl = self.ttl;
        self.bindings.retain(|_, b| b.bound_at.elapsed() < ttl);
        before.saturating_sub(self.bindings.len())
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn first_bind_wins() {
        let map = AffinityMap::new(Duration::from_secs(60));
        assert_eq!(map.bind("client-a", "game-0"), "game-0");
        assert_eq!(map.bind("client-a", "game-1"), "game-0");
        assert_eq!(map.lookup("client-a").unwrap().replica, "game-0");
    }

    #[test]
    fn release_if_ignores_other_replica() {
        let map = AffinityMap::new(Duration::from_secs(60));
        map.bind("client-a", "game-0");
        assert!(!map.release_if("client-a", "game-1"));
        assert!(map.release_if("client-a", "game-0"));
        assert!(map.lookup("client-a").is_none());
    }

    #[test]
    fn release_replica_drops_all_its_bindings() {
        let map = AffinityMap::new(Duration::from_secs(60));
        map.bind("a", "game-0");
        map.bind("b", "game-0");
        map.bind("c", "game-1");
        assert_eq!(map.release_replica("game-0"), 2);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn zero_ttl_expires_immediately() {
        let map = AffinityMap::new(Duration::ZERO);
        map.bind("a", "game-0");
        let binding = map.lookup("a").unwrap();
        assert!(map.is_expired(&binding));
        assert_eq!(map.purge_expired(), 1);
        assert!(map.is_empty());
    }

    #[test]
    fn full_map_stops_recording_new_keys() {
        let map = AffinityMap::with_capacity(Duration::from_secs(60), 2);
        map.bind("a", "game-0");
        map.bind("b", "game-1");
        assert_eq!(map.bind("c", "game-0"), "game-0");
        assert!(map.lookup("c").is_none());
        assert_eq!(map.len(), 2);
        assert_eq!(map.bind("a", "game-1"), "game-0");
    }

    #[test]
    fn full_map_reclaims_expired_bindings() {
        let map = AffinityMap::with_capacity(Duration::ZERO, 1);
        map.bind("a", "game-0");
        map.bind("b", "game-1");
        assert_eq!(map.len(), 1);
        assert_eq!(map.lookup("b").unwrap().replica, "game-1");
    }

    #[test]
    fn concurrent_first_contacts_converge() {
        let map = Arc::new(AffinityMap::new(Duration::from_secs(60)));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let map = Arc::clone(&map);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    map.bind("client-a", &format!("game-{i}"))
                })
            })
            .collect();

        let winners: Vec<ReplicaId> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(winners.iter().all(|w| w == &winners[0]));
        assert_eq!(map.lookup("client-a").unwrap().replica, winners[0]);
    }
}
