//! Health check logic.
//!
//! A replica's verdict only flips after a run of identical check results:
//! `unhealthy_threshold` consecutive failures to leave service and
//! `healthy_threshold` consecutive successes to (re-)enter it. Failing
//! replicas are checked with exponential backoff.

use std::time::Duration;

use tiergrid_core::{HealthCheckPolicy, ReplicaHealth};
use tracing::{debug, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Result of a single health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The check could not complete (connect error, timeout).
    Failed,
}

impl CheckResult {
    pub fn is_success(&self) -> bool {
        matches!(self, CheckResult::Healthy)
    }
}

/// Consecutive-result counter for one replica.
#[derive(Debug)]
pub struct HealthTracker {
    status: ReplicaHealth,
    consecutive_failures: u32,
    consecutive_successes: u32,
    unhealthy_threshold: u32,
    healthy_threshold: u32,
    current_backoff: Duration,
    base_interval: Duration,
    max_backoff: Duration,
}

impl HealthTracker {
    pub fn new(policy: &HealthCheckPolicy) -> Self {
        Self::with_thresholds(
            policy.unhealthy_threshold,
            policy.healthy_threshold,
            policy.interval,
        )
    }

    pub fn with_thresholds(
        unhealthy_threshold: u32,
        healthy_threshold: u32,
        interval: Duration,
    ) -> Self {
        Self {
            status: ReplicaHealth::Unknown,
            consecutive_failures: 0,
            consecutive_successes: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            healthy_threshold: healthy_threshold.max(1),
            current_backoff: interval,
            base_interval: interval,
            max_backoff: MAX_BACKOFF.max(interval),
        }
    }

    /// Record a check result and return the debounced status.
    pub fn record(&mut self, result: CheckResult) -> ReplicaHealth {
        if result.is_success() {
            self.consecutive_failures = 0;
            self.consecutive_successes = self.consecutive_successes.saturating_add(1);
            self.current_backoff = self.base_interval;

            if self.consecutive_successes >= self.healthy_threshold
                && self.status != ReplicaHealth::Healthy
            {
                debug!(
                    successes = self.consecutive_successes,
                    threshold = self.healthy_threshold,
                    "replica passed health checks"
                );
                self.status = ReplicaHealth::Healthy;
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            self.current_backoff = (self.current_backoff * 2).min(self.max_backoff);

            if self.consecutive_failures >= self.unhealthy_threshold
                && self.status != ReplicaHealth::Unhealthy
            {
                warn!(
                    failures = self.consecutive_failures,
                    threshold = self.unhealthy_threshold,
                    "replica failed health checks"
                );
                self.status = ReplicaHealth::Unhealthy;
            }
        }
        self.status
    }

    pub fn status(&self) -> ReplicaHealth {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.consecutive_successes
    }

    /// Delay before the next check.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }
}

/// GET `path` on `address` and classify the answer.
///
/// 2xx is `Healthy`, any other status is `Unhealthy`, and connection
/// errors or exceeding `timeout` are `Failed`.
pub async fn http_check(address: &str, path: &str, timeout: Duration) -> CheckResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health check connection failed");
                return CheckResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health check handshake failed");
                return CheckResult::Failed;
            }
        };
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(path)
            .header("host", address)
            .header("user-agent", "tiergrid-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health check request invalid");
                return CheckResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => CheckResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health check non-2xx");
                CheckResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "health check request failed");
                CheckResult::Failed
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "health check timed out");
        CheckResult::Failed
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> HealthCheckPolicy {
        HealthCheckPolicy {
            path: "/healthz".to_string(),
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(2),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
        }
    }

    #[test]
    fn starts_unknown() {
        let tracker = HealthTracker::new(&policy());
        assert_eq!(tracker.status(), ReplicaHealth::Unknown);
        assert_eq!(tracker.consecutive_failures(), 0);
    }

    #[test]
    fn single_success_is_not_enough_to_admit() {
        let mut tracker = HealthTracker::new(&policy());
        assert_eq!(tracker.record(CheckResult::Healthy), ReplicaHealth::Unknown);
        assert_eq!(tracker.record(CheckResult::Healthy), ReplicaHealth::Healthy);
    }

    #[test]
    fn stays_healthy_under_failure_threshold() {
        let mut tracker = HealthTracker::new(&policy());
        tracker.record(CheckResult::Healthy);
        tracker.record(CheckResult::Healthy);

        tracker.record(CheckResult::Unhealthy);
        tracker.record(CheckResult::Failed);
        assert_eq!(tracker.status(), ReplicaHealth::Healthy);
        assert_eq!(tracker.consecutive_failures(), 2);

        assert_eq!(tracker.record(CheckResult::Unhealthy), ReplicaHealth::Unhealthy);
    }

    #[test]
    fn interleaved_success_resets_failure_run() {
        let mut tracker = HealthTracker::new(&policy());
        tracker.record(CheckResult::Healthy);
        tracker.record(CheckResult::Healthy);
        for _ in 0..5 {
            tracker.record(CheckResult::Failed);
            tracker.record(CheckResult::Failed);
            tracker.record(CheckResult::Healthy);
        }
        assert_eq!(tracker.status(), ReplicaHealth::Healthy);
    }

    #[test]
    fn recovery_needs_healthy_threshold_successes() {
        let mut tracker = HealthTracker::with_thresholds(5, 3, Duration::from_secs(1));
        for _ in 0..4 {
            tracker.record(CheckResult::Unhealthy);
        }
        assert_ne!(tracker.status(), ReplicaHealth::Unhealthy);
        tracker.record(CheckResult::Unhealthy);
        assert_eq!(tracker.status(), ReplicaHealth::Unhealthy);

        tracker.record(CheckResult::Healthy);
        tracker.record(CheckResult::Healthy);
        assert_eq!(tracker.status(), ReplicaHealth::Unhealthy);
        assert_eq!(tracker.consecutive_successes(), 2);
        tracker.record(CheckResult::Healthy);
        assert_eq!(tracker.status(), ReplicaHealth::Healthy);
    }

    #[test]
    fn failures_back_off_exponentially_and_cap() {
        let mut tracker = HealthTracker::with_thresholds(100, 1, Duration::from_secs(1));
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));
        tracker.record(CheckResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(2));
        tracker.record(CheckResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(4));

        for _ in 0..10 {
            tracker.record(CheckResult::Failed);
        }
        assert_eq!(tracker.next_interval(), Duration::from_secs(60));

        tracker.record(CheckResult::Healthy);
        assert_eq!(tracker.next_interval(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_cap_never_below_base_interval() {
        let mut tracker = HealthTracker::with_thresholds(3, 1, Duration::from_secs(90));
        tracker.record(CheckResult::Failed);
        assert_eq!(tracker.next_interval(), Duration::from_secs(90));
    }

    #[tokio::test]
    async fn check_to_closed_port_fails() {
        let result = http_check("127.0.0.1:1", "/healthz", Duration::from_millis(200)).await;
        assert_eq!(result, CheckResult::Failed);
    }
}
