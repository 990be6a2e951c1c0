//! Health monitor: one background task per target pool.
//!
//! Each pool task sweeps its membership on a short tick, launches a check
//! for every replica whose backoff has elapsed, and folds the results
//! back through a channel. Only the pool task touches a replica's tracker,
//! so a replica's verdict has a single writer and the last completed check
//! decides it. The same sweep reaps drained replicas and expired sticky
//! bindings.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tiergrid_core::{HealthCheckPolicy, PoolName, ReplicaHealth, ReplicaId};
use tiergrid_proxy::TargetPool;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::checker::{http_check, CheckResult, HealthTracker};

const MAX_SWEEP_TICK: Duration = Duration::from_secs(1);

struct MonitorSlot {
    handle: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
}

/// Manages health monitors for all pools behind the listener.
#[derive(Default)]
pub struct HealthMonitor {
    monitors: Arc<RwLock<HashMap<PoolName, MonitorSlot>>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start monitoring `pool`, replacing any monitor already running for
    /// a pool of that name.
    pub async fn start(&self, pool: Arc<TargetPool>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let name = pool.name().to_string();
        let path = pool.policy().health.path.clone();
        let handle = tokio::spawn(run_pool_loop(pool, shutdown_rx));

        let mut monitors = self.monitors.write().await;
        if let Some(old) = monitors.insert(
            name.clone(),
            MonitorSlot {
                handle,
                shutdown_tx,
            },
        ) {
            let _ = old.shutdown_tx.send(true);
            old.handle.abort();
        }
        info!(pool = %name, %path, "health monitor started");
    }

    pub async fn stop(&self, pool: &str) {
        let mut monitors = self.monitors.write().await;
        if let Some(slot) = monitors.remove(pool) {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            info!(%pool, "health monitor stopped");
        }
    }

    pub async fn stop_all(&self) {
        let mut monitors = self.monitors.write().await;
        for (pool, slot) in monitors.drain() {
            let _ = slot.shutdown_tx.send(true);
            slot.handle.abort();
            debug!(%pool, "health monitor stopped");
        }
        info!("all health monitors stopped");
    }

    pub async fn active_monitors(&self) -> Vec<PoolName> {
        let monitors = self.monitors.read().await;
        monitors.keys().cloned().collect()
    }

    pub async fn is_monitoring(&self, pool: &str) -> bool {
        let monitors = self.monitors.read().await;
        monitors.contains_key(pool)
    }
}

struct ReplicaCheck {
    tracker: HealthTracker,
    next_due: Instant,
    in_flight: bool,
}

async fn run_pool_loop(pool: Arc<TargetPool>, mut shutdown: watch::Receiver<bool>) {
    let policy = pool.policy().health.clone();
    let mut checks: HashMap<ReplicaId, ReplicaCheck> = HashMap::new();
    let (tx, mut rx) = mpsc::channel::<(ReplicaId, CheckResult)>(64);
    let mut ticker = tokio::time::interval(policy.interval.min(MAX_SWEEP_TICK));

    debug!(pool = %pool.name(), "health loop starting");
    loop {
        tokio::select! {
            _ = ticker.tick() => sweep(&pool, &policy, &mut checks, &tx),
            Some((replica, result)) = rx.recv() => apply(&pool, &mut checks, replica, result),
            _ = shutdown.changed() => {
                debug!(pool = %pool.name(), "health loop shutting down");
                break;
            }
        }
    }
}

fn sweep(
    pool: &TargetPool,
    policy: &HealthCheckPolicy,
    checks: &mut HashMap<ReplicaId, ReplicaCheck>,
    tx: &mpsc::Sender<(ReplicaId, CheckResult)>,
) {
    for reaped in pool.reap_drained() {
        checks.remove(&reaped);
    }
    if let Some(affinity) = pool.affinity() {
        let purged = affinity.purge_expired();
        if purged > 0 {
            debug!(pool = %pool.name(), purged, "expired affinity bindings purged");
        }
    }

    let replicas = pool.replicas();
    checks.retain(|id, _| replicas.iter().any(|r| &r.id == id));

    let now = Instant::now();
    for replica in replicas {
        if replica.health == ReplicaHealth::Draining {
            continue;
        }
        let check = checks
            .entry(replica.id.clone())
            .or_insert_with(|| ReplicaCheck {
                tracker: HealthTracker::new(policy),
                next_due: now,
                in_flight: false,
            });
        if check.in_flight || now < check.next_due {
            continue;
        }
        check.in_flight = true;
        check.next_due = now + check.tracker.next_interval();

        let tx = tx.clone();
        let address = replica.endpoint.authority();
        let path = policy.path.clone();
        let timeout = policy.timeout;
        tokio::spawn(async move {
            let result = http_check(&address, &path, timeout).await;
            let _ = tx.send((replica.id, result)).await;
        });
    }
}

fn apply(
    pool: &TargetPool,
    checks: &mut HashMap<ReplicaId, ReplicaCheck>,
    replica: ReplicaId,
    result: CheckResult,
) {
    let Some(check) = checks.get_mut(&replica) else {
        return;
    };
    check.in_flight = false;
    let before = check.tracker.status();
    let status = check.tracker.record(result);
    if !result.is_success() {
        check.next_due = Instant::now() + check.tracker.next_interval();
    }
    if status == before || status == ReplicaHealth::Unknown {
        return;
    }
    if !pool.set_health(&replica, status) {
        return;
    }
    let healthy = pool.healthy_count();
    if status == ReplicaHealth::Unhealthy {
        warn!(pool = %pool.name(), %replica, from = ?before, healthy, "replica ejected");
    } else {
        info!(pool = %pool.name(), %replica, from = ?before, to = ?status, healthy, "replica admitted");
    }
}
