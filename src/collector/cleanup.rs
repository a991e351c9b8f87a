//! Checkpoint database cleanup for a running collector
//!
//! The collector's tailing offsets live in a host directory on every node.
//! Wiping it under a live collector is unsafe, so the daemon set is first
//! scheduled off every node, its pods are awaited until gone, the directory
//! is cleared on each node that hosted a pod, and scheduling is restored.
//!
//! [`CleanupSession`] encodes the steps as types: a node can only be wiped
//! from a session whose pods have all been observed terminated.

use std::collections::{BTreeMap, BTreeSet};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use k8s_openapi::api::apps::v1::DaemonSet;
use kube::ResourceExt;
use tracing::{error, info, instrument, warn};

use crate::backend::{ClusterBackend, NodeCommand};
use crate::collector::cancel::CancelSignal;
use crate::collector::readiness::{wait_until_ready, DaemonHealth, PollPolicy};
use crate::collector::resources::CHECKPOINT_DB_HOST_PATH;
use crate::error::{Error, Result};

/// Node selector key no node carries; applying it unschedules every replica
pub const EVICTION_SELECTOR_KEY: &str = "logs-collector.io/checkpoint-cleanup";
pub const EVICTION_SELECTOR_VALUE: &str = "no-node-matches";

pub const DEFAULT_TERMINATION_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CleanupOptions {
    /// Upper bound on waiting for evicted pods to disappear
    pub termination_timeout: Duration,
    /// Used for the final readiness check
    pub readiness: PollPolicy,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            termination_timeout: DEFAULT_TERMINATION_TIMEOUT,
            readiness: PollPolicy::default(),
        }
    }
}

/// What a completed cleanup touched
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CleanupReport {
    pub pods: Vec<String>,
    pub nodes: Vec<String>,
    pub health: DaemonHealth,
}

fn eviction_selector() -> BTreeMap<String, String> {
    BTreeMap::from([(
        EVICTION_SELECTOR_KEY.to_string(),
        EVICTION_SELECTOR_VALUE.to_string(),
    )])
}

// ============================================================================
// Session states
// ============================================================================

/// Pods and nodes recorded, nothing changed yet
pub struct Discovered;
/// Node selector points at no node
pub struct Evicted;
/// Every recorded pod has been observed terminated
pub struct Drained;
/// Checkpoint directory cleared on every recorded node
pub struct Wiped;
/// Scheduling re-enabled
pub struct Restored;

/// One pass of the cleanup sequence
///
/// Pods and nodes are captured once at discovery and never refreshed.
pub struct CleanupSession<'a, S> {
    backend: &'a dyn ClusterBackend,
    namespace: String,
    name: String,
    daemon_set: DaemonSet,
    pods: Vec<String>,
    nodes: BTreeSet<String>,
    _state: PhantomData<S>,
}

impl<'a, S> CleanupSession<'a, S> {
    fn advance<T>(self) -> CleanupSession<'a, T> {
        CleanupSession {
            backend: self.backend,
            namespace: self.namespace,
            name: self.name,
            daemon_set: self.daemon_set,
            pods: self.pods,
            nodes: self.nodes,
            _state: PhantomData,
        }
    }

    pub fn pods(&self) -> &[String] {
        &self.pods
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(String::as_str)
    }

    fn target(&self) -> String {
        format!(
            "daemon set '{}' in namespace '{}'",
            self.name, self.namespace
        )
    }
}

impl<'a> CleanupSession<'a, Discovered> {
    /// Record the pods the daemon set currently runs and their nodes
    pub async fn discover(
        backend: &'a dyn ClusterBackend,
        daemon_set: &DaemonSet,
    ) -> Result<CleanupSession<'a, Discovered>> {
        let name = daemon_set.name_any();
        let namespace = daemon_set.namespace().unwrap_or_default();
        let listed = backend
            .list_daemon_set_pods(daemon_set)
            .await
            .map_err(|e| e.during("list pods of", format!("daemon set '{name}'")))?;
        if listed.is_empty() {
            return Err(Error::NoManagedPods { namespace, name });
        }

        let pods: Vec<String> = listed.iter().map(|p| p.name_any()).collect();
        let nodes: BTreeSet<String> = listed
            .iter()
            .filter_map(|p| p.spec.as_ref().and_then(|s| s.node_name.clone()))
            .collect();
        let unbound = listed
            .iter()
            .filter(|p| p.spec.as_ref().and_then(|s| s.node_name.as_ref()).is_none())
            .count();
        if unbound > 0 {
            warn!(
                "{} of {} pod(s) of daemon set {} are not bound to a node",
                unbound,
                pods.len(),
                name
            );
        }
        info!(
            "Daemon set {} runs {} pod(s) on {} node(s)",
            name,
            pods.len(),
            nodes.len()
        );

        Ok(CleanupSession {
            backend,
            namespace,
            name,
            daemon_set: daemon_set.clone(),
            pods,
            nodes,
            _state: PhantomData,
        })
    }

    /// Point the node selector at no node so every replica is removed
    pub async fn evict(self) -> Result<CleanupSession<'a, Evicted>> {
        info!("Evicting {} from all nodes", self.target());
        self.backend
            .patch_node_selector(&self.namespace, &self.name, &eviction_selector())
            .await
            .map_err(|e| e.during("evict", self.target()))?;
        Ok(self.advance())
    }
}

impl<'a> CleanupSession<'a, Evicted> {
    /// Block until every recorded pod is gone
    pub async fn await_termination(
        self,
        timeout: Duration,
        cancel: &CancelSignal,
    ) -> Result<CleanupSession<'a, Drained>> {
        info!(
            "Waiting up to {:?} for {} pod(s) to terminate",
            timeout,
            self.pods.len()
        );
        let backend = self.backend;
        let namespace = self.namespace.as_str();
        let waits = self.pods.iter().map(|pod| async move {
            match tokio::time::timeout(timeout, backend.wait_for_pod_termination(namespace, pod))
                .await
            {
                Ok(result) => result.map_err(|e| {
                    e.during(
                        "wait for termination of",
                        format!("pod '{pod}' in namespace '{namespace}'"),
                    )
                }),
                Err(_) => Err(Error::TerminationTimeout {
                    pod: pod.clone(),
                    timeout,
                }),
            }
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(Error::Cancelled(format!(
                    "waiting for pods of {} to terminate",
                    self.target()
                )));
            }
            result = try_join_all(waits) => {
                result?;
            }
        }
        Ok(self.advance())
    }
}

impl<'a> CleanupSession<'a, Drained> {
    /// Clear the checkpoint directory on every node that hosted a pod
    pub async fn wipe_checkpoints(self) -> Result<CleanupSession<'a, Wiped>> {
        let command = NodeCommand::remove_dir_contents(CHECKPOINT_DB_HOST_PATH);
        for node in &self.nodes {
            info!("Clearing {} on node {}", CHECKPOINT_DB_HOST_PATH, node);
            self.backend
                .run_on_node(&self.namespace, node, &command)
                .await
                .map_err(|e| e.during("clear checkpoint db on", format!("node '{node}'")))?;
        }
        Ok(self.advance())
    }
}

impl<'a> CleanupSession<'a, Wiped> {
    /// Clear the node selector of the daemon set
    ///
    /// The re-fetch only checks that the daemon set still exists and warns if
    /// it is being deleted. The patch itself is a merge patch by name and does
    /// not depend on the fetched object.
    pub async fn restore(mut self) -> Result<CleanupSession<'a, Restored>> {
        let current = self
            .backend
            .get_daemon_set(&self.namespace, &self.name)
            .await
            .map_err(|e| e.during("get", self.target()))?;
        if current.metadata.deletion_timestamp.is_some() {
            warn!("{} is being deleted", self.target());
        }
        info!("Restoring scheduling of {}", self.target());
        self.daemon_set = self
            .backend
            .patch_node_selector(&self.namespace, &self.name, &BTreeMap::new())
            .await
            .map_err(|e| e.during("restore scheduling of", self.target()))?;
        Ok(self.advance())
    }
}

impl<'a> CleanupSession<'a, Restored> {
    /// Wait for a ready replica of the restored daemon set
    pub async fn verify(self, policy: PollPolicy, cancel: &CancelSignal) -> Result<CleanupReport> {
        let health = wait_until_ready(self.backend, &self.daemon_set, policy, cancel).await?;
        Ok(CleanupReport {
            pods: self.pods,
            nodes: self.nodes.into_iter().collect(),
            health,
        })
    }
}

// ============================================================================
// Choreographer
// ============================================================================

/// Runs the checkpoint cleanup sequence against a running collector
pub struct CheckpointCleaner {
    backend: Arc<dyn ClusterBackend>,
    options: CleanupOptions,
}

impl CheckpointCleaner {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self {
            backend,
            options: CleanupOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CleanupOptions) -> Self {
        self.options = options;
        self
    }

    /// Look the daemon set up by name and clean it
    pub async fn clean_by_name(
        &self,
        namespace: &str,
        name: &str,
        cancel: &CancelSignal,
    ) -> Result<CleanupReport> {
        let daemon_set = self
            .backend
            .get_daemon_set(namespace, name)
            .await
            .map_err(|e| {
                e.during(
                    "get",
                    format!("daemon set '{name}' in namespace '{namespace}'"),
                )
            })?;
        self.clean(&daemon_set, cancel).await
    }

    /// Wipe the checkpoint db of every node running `daemon_set`
    ///
    /// A failure after eviction leaves the daemon set scheduled on no node and
    /// is returned as [`Error::SchedulingSuspended`]; scheduling is not
    /// restored automatically.
    #[instrument(skip(self, daemon_set, cancel), fields(name = %daemon_set.name_any(), namespace = daemon_set.namespace()))]
    pub async fn clean(&self, daemon_set: &DaemonSet, cancel: &CancelSignal) -> Result<CleanupReport> {
        let session = CleanupSession::discover(self.backend.as_ref(), daemon_set).await?;
        let namespace = session.namespace.clone();
        let name = session.name.clone();

        let evicted = session.evict().await?;

        let restored = match self.drain_and_restore(evicted, cancel).await {
            Ok(restored) => restored,
            Err(cause) => {
                error!(
                    "Cleanup of daemon set {} in namespace {} failed: {}",
                    name, namespace, cause
                );
                error!(
                    "ACTION REQUIRED: daemon set '{}' in namespace '{}' is scheduled on no node. \
                     Remove node selector '{}' from its pod template to restore log collection",
                    name, namespace, EVICTION_SELECTOR_KEY
                );
                return Err(Error::SchedulingSuspended {
                    namespace,
                    name,
                    cause: Box::new(cause),
                });
            }
        };

        match restored.verify(self.options.readiness, cancel).await {
            Ok(report) => {
                info!(
                    "Cleared checkpoint db on {} node(s); {} pod(s) ready",
                    report.nodes.len(),
                    report.health.ready_pods
                );
                Ok(report)
            }
            Err(e) => {
                error!(
                    "ACTION REQUIRED: daemon set '{}' in namespace '{}' has no ready pod after cleanup: {}",
                    name, namespace, e
                );
                Err(e)
            }
        }
    }

    async fn drain_and_restore<'a>(
        &self,
        evicted: CleanupSession<'a, Evicted>,
        cancel: &CancelSignal,
    ) -> Result<CleanupSession<'a, Restored>> {
        evicted
            .await_termination(self.options.termination_timeout, cancel)
            .await?
            .wipe_checkpoints()
            .await?
            .restore()
            .await
    }
}
