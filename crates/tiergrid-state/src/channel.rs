//! Discovery channel: versioned key/value slots for one-way service
//! discovery.
//!
//! A producer publishes a value once its own address is known; consumers
//! resolve at their own startup. The two sides never coordinate: a consumer
//! may see nothing, or an older value, and must pick a fallback instead of
//! waiting.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tiergrid_core::DiscoveryFallback;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::store::StateStore;
use crate::types::{epoch_secs, DiscoveryRecord};

/// Publish/resolve contract of the discovery channel.
///
/// `publish` replaces the whole record atomically; `resolve` returns a
/// snapshot or `None` if nothing was published yet.
pub trait ParameterChannel: Send + Sync {
    fn publish(&self, key: &str, value: &str) -> StateResult<DiscoveryRecord>;
    fn resolve(&self, key: &str) -> StateResult<Option<DiscoveryRecord>>;
    /// Remove a record. Returns true if it existed.
    fn retract(&self, key: &str) -> StateResult<bool>;
}

impl ParameterChannel for StateStore {
    fn publish(&self, key: &str, value: &str) -> StateResult<DiscoveryRecord> {
        self.put_parameter(key, value)
    }

    fn resolve(&self, key: &str) -> StateResult<Option<DiscoveryRecord>> {
        self.get_parameter(key)
    }

    fn retract(&self, key: &str) -> StateResult<bool> {
        self.delete_parameter(key)
    }
}

/// In-process channel. Records are swapped whole under a write lock so a
/// reader sees either the old or the new record.
#[derive(Default)]
pub struct MemoryChannel {
    slots: RwLock<Slots>,
}

#[derive(Default)]
struct Slots {
    live: HashMap<String, Arc<DiscoveryRecord>>,
    /// Last version of each retracted key.
    retired: HashMap<String, u64>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParameterChannel for MemoryChannel {
    fn publish(&self, key: &str, value: &str) -> StateResult<DiscoveryRecord> {
        let mut guard = self.slots.write().expect("channel lock");
        let slots = &mut *guard;
        let version = match slots.live.get(key) {
            Some(current) if current.value == value => return Ok(current.as_ref().clone()),
            Some(current) => current.version + 1,
            None => slots.retired.remove(key).unwrap_or(0) + 1,
        };
        let record = Arc::new(DiscoveryRecord {
            key: key.to_string(),
            value: value.to_string(),
            version,
            updated_at: epoch_secs(),
        });
        slots.live.insert(key.to_string(), Arc::clone(&record));
        debug!(%key, version, "parameter published");
        Ok(record.as_ref().clone())
    }

    fn resolve(&self, key: &str) -> StateResult<Option<DiscoveryRecord>> {
        let slots = self.slots.read().expect("channel lock");
        Ok(slots.live.get(key).map(|r| r.as_ref().clone()))
    }

    fn retract(&self, key: &str) -> StateResult<bool> {
        let mut slots = self.slots.write().expect("channel lock");
        match slots.live.remove(key) {
            Some(record) => {
                slots.retired.insert(key.to_string(), record.version);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Outcome of a consumer's startup read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Published(DiscoveryRecord),
    /// Nothing published; the consumer runs without the value.
    Degraded { key: String },
}

impl Resolution {
    pub fn value(&self) -> Option<&str> {
        match self {
            Resolution::Published(record) => Some(&record.value),
            Resolution::Degraded { .. } => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("discovery record {key:?} is not published yet; redeploy once the producer is up")]
    Unpublished { key: String },

    #[error(transparent)]
    State(#[from] StateError),
}

/// Snapshot a discovery record at process start.
///
/// The value is read once; later publishes reach this consumer only after
/// a restart.
pub fn resolve_at_startup(
    channel: &dyn ParameterChannel,
    key: &str,
    fallback: DiscoveryFallback,
) -> Result<Resolution, DiscoveryError> {
    match channel.resolve(key)? {
        Some(record) => {
            debug!(%key, version = record.version, "discovery record resolved");
            Ok(Resolution::Published(record))
        }
        None => match fallback {
            DiscoveryFallback::FailClosed => Err(DiscoveryError::Unpublished {
                key: key.to_string(),
            }),
            DiscoveryFallback::Degraded => {
                warn!(%key, "discovery record absent, starting degraded");
                Ok(Resolution::Degraded {
                    key: key.to_string(),
                })
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn resolve_before_publish_is_absent() {
        let channel = MemoryChannel::new();
        assert!(channel.resolve("/app/ws").unwrap().is_none());

        let store = StateStore::open_in_memory().unwrap();
        assert!(ParameterChannel::resolve(&store, "/app/ws").unwrap().is_none());
    }

    #[test]
    fn publish_overwrites_and_bumps_version() {
        let channel = MemoryChannel::new();
        let v1 = channel.publish("/app/ws", "ws://a/ws").unwrap();
        let v2 = channel.publish("/app/ws", "ws://b/ws").unwrap();
        assert_eq!((v1.version, v2.version), (1, 2));
        assert_eq!(channel.resolve("/app/ws").unwrap().unwrap().value, "ws://b/ws");
    }

    #[test]
    fn republishing_same_value_keeps_version() {
        let channel = MemoryChannel::new();
        channel.publish("/app/ws", "ws://a/ws").unwrap();
        let again = channel.publish("/app/ws", "ws://a/ws").unwrap();
        assert_eq!(again.version, 1);
    }

    #[test]
    fn retract_removes_record() {
        let channel = MemoryChannel::new();
        channel.publish("/app/ws", "ws://a/ws").unwrap();
        assert!(channel.retract("/app/ws").unwrap());
        assert!(!channel.retract("/app/ws").unwrap());
        assert!(channel.resolve("/app/ws").unwrap().is_none());
    }

    #[test]
    fn versions_keep_rising_across_retract() {
        let channel = MemoryChannel::new();
        channel.publish("/app/ws", "ws://a/ws").unwrap();
        channel.publish("/app/ws", "ws://b/ws").unwrap();
        channel.retract("/app/ws").unwrap();
        assert_eq!(channel.publish("/app/ws", "ws://a/ws").unwrap().version, 3);
    }

    #[test]
    fn concurrent_readers_never_see_partial_values() {
        let v1 = "ws://first.example/ws".repeat(8);
        let v2 = "ws://second.example/ws".repeat(8);
        let channel = Arc::new(MemoryChannel::new());
        channel.publish("/app/ws", &v1).unwrap();

        let writer = {
            let channel = Arc::clone(&channel);
            let (v1, v2) = (v1.clone(), v2.clone());
            thread::spawn(move || {
                for i in 0..500 {
                    let value = if i % 2 == 0 { &v2 } else { &v1 };
                    channel.publish("/app/ws", value).unwrap();
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let channel = Arc::clone(&channel);
                let (v1, v2) = (v1.clone(), v2.clone());
                thread::spawn(move || {
                    for _ in 0..500 {
                        let record = channel.resolve("/app/ws").unwrap().unwrap();
                        assert!(record.value == v1 || record.value == v2);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }

    #[test]
    fn startup_fail_closed_on_absence() {
        let channel = MemoryChannel::new();
        let err = resolve_at_startup(&channel, "/app/ws", DiscoveryFallback::FailClosed)
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::Unpublished { .. }));
        assert!(err.to_string().contains("/app/ws"));
    }

    #[test]
    fn startup_degraded_on_absence() {
        let channel = MemoryChannel::new();
        let res = resolve_at_startup(&channel, "/app/ws", DiscoveryFallback::Degraded).unwrap();
        assert_eq!(res.value(), None);
    }

    #[test]
    fn startup_snapshot_does_not_follow_later_publishes() {
        let store = StateStore::open_in_memory().unwrap();
        store.publish("/app/ws", "ws://a/ws").unwrap();
        let snapshot =
            resolve_at_startup(&store, "/app/ws", DiscoveryFallback::FailClosed).unwrap();

        store.publish("/app/ws", "ws://b/ws").unwrap();
        assert_eq!(snapshot.value(), Some("ws://a/ws"));
    }
}
