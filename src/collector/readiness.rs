//! Bounded readiness polling for the collector daemon set

use std::time::Duration;

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::backend::ClusterBackend;
use crate::collector::cancel::CancelSignal;
use crate::error::{Error, Result};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(3600);

// Stand-in for "no deadline" when interval × attempts overflows the clock
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Interval, attempt cap and overall deadline for a polling loop
///
/// Both the attempt cap and the deadline are enforced; whichever is hit
/// first ends the wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    interval: Duration,
    max_attempts: u32,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl PollPolicy {
    /// Rejects a zero interval, zero attempts and intervals above
    /// [`MAX_POLL_INTERVAL`]
    pub fn new(interval: Duration, max_attempts: u32) -> Result<Self> {
        if interval.is_zero() || max_attempts == 0 {
            return Err(Error::ConfigError(
                "readiness interval and attempts must be non-zero".to_string(),
            ));
        }
        if interval > MAX_POLL_INTERVAL {
            return Err(Error::ConfigError(format!(
                "readiness interval {:?} exceeds the maximum of {:?}",
                interval, MAX_POLL_INTERVAL
            )));
        }
        Ok(Self {
            interval,
            max_attempts,
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Overall time budget: interval × max attempts
    pub fn deadline(&self) -> Duration {
        self.interval.saturating_mul(self.max_attempts)
    }
}

/// Health of a daemon set, derived from its live pods
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DaemonHealth {
    pub pods: usize,
    /// Pods whose first container reports ready
    pub ready_pods: usize,
}

impl DaemonHealth {
    pub fn from_pods(pods: &[Pod]) -> Self {
        Self {
            pods: pods.len(),
            ready_pods: pods.iter().filter(|p| first_container_ready(p)).count(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready_pods > 0
    }
}

fn first_container_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.first())
        .map(|status| status.ready)
        .unwrap_or(false)
}

/// Block until at least one pod of `daemon_set` reports ready
///
/// The first check happens one interval after the call. Backend errors end
/// the wait immediately and are not retried.
pub async fn wait_until_ready(
    backend: &dyn ClusterBackend,
    daemon_set: &DaemonSet,
    policy: PollPolicy,
    cancel: &CancelSignal,
) -> Result<DaemonHealth> {
    let name = daemon_set.name_any();
    let started = Instant::now();
    let deadline = started
        .checked_add(policy.deadline())
        .unwrap_or_else(|| started + FAR_FUTURE);

    let mut ticker = interval_at(started + policy.interval, policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut attempts = 0;
    while attempts < policy.max_attempts {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled(format!(
                    "waiting for daemon set '{name}' to become ready"
                )));
            }
            _ = ticker.tick() => {}
            _ = sleep_until(deadline) => break,
        }
        attempts += 1;

        let pods = backend.list_daemon_set_pods(daemon_set).await.map_err(|e| {
            e.during("list pods of", format!("daemon set '{name}'"))
        })?;
        let health = DaemonHealth::from_pods(&pods);
        debug!(
            "Readiness attempt {}/{} for daemon set {}: {:?}",
            attempts, policy.max_attempts, name, health
        );
        if health.is_ready() {
            info!(
                "Daemon set {} has {} ready pod(s) after {:?}",
                name,
                health.ready_pods,
                started.elapsed()
            );
            return Ok(health);
        }
    }

    Err(Error::ReadinessTimeout {
        daemon_set: name,
        attempts,
        elapsed: started.elapsed(),
    })
}
