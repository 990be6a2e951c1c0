use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tiergrid_core::TopologyConfig;
use tiergrid_deploy::{build_runtime, Registration};
use tiergrid_health::HealthMonitor;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How often the ledger is re-read for scaled or removed workloads.
const LEDGER_RELOAD: Duration = Duration::from_secs(5);

/// Build pools from the ledger and serve until Ctrl-C.
///
/// `load` reads the current registrations. It runs once at startup and then
/// on every reload tick, so replicas dropped by a later `apply` drain out of
/// their pools and new ones join without a restart.
pub async fn run<F>(config: TopologyConfig, load: F) -> anyhow::Result<()>
where
    F: Fn() -> anyhow::Result<Vec<Registration>>,
{
    let registrations = load()?;
    if registrations.is_empty() {
        warn!("no workloads provisioned; run `tiergridd apply` first");
    }

    let runtime = build_runtime(&config, &registrations)?;
    let monitor = HealthMonitor::new();
    for pool in &runtime.pools {
        monitor.start(Arc::clone(pool)).await;
    }

    let listener = TcpListener::bind(&config.listener.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.listener.bind))?;
    info!(
        address = %config.listener.bind,
        public_host = %config.listener.public_host,
        pools = runtime.pools.len(),
        "tiergridd listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(tiergrid_proxy::serve(
        listener,
        Arc::clone(&runtime.router),
        shutdown_rx,
    ));

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut reload = tokio::time::interval(LEDGER_RELOAD);
    reload.tick().await;
    loop {
        tokio::select! {
            signal = &mut ctrl_c => {
                signal?;
                info!("shutdown signal received");
                break;
            }
            _ = reload.tick() => {
                let synced = load().and_then(|regs| runtime.sync(&regs).map_err(Into::into));
                match synced {
                    Ok(outcome) if outcome.added.is_empty() && outcome.drained.is_empty() => {
                        debug!("ledger unchanged");
                    }
                    Ok(outcome) => info!(
                        added = ?outcome.added,
                        drained = ?outcome.drained,
                        "pool membership synced from ledger"
                    ),
                    Err(e) => warn!(error = %e, "ledger reload failed"),
                }
            }
        }
    }
    let _ = shutdown_tx.send(true);

    server.await??;
    monitor.stop_all().await;
    info!("tiergridd stopped");
    Ok(())
}
