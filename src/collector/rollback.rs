//! Compensating actions for collector provisioning
//!
//! Each successfully created object is pushed onto a [`RollbackStack`]. On
//! failure the stack is unwound newest-first; on success it is disarmed and
//! handed to the caller as a [`Teardown`].

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::backend::ClusterBackend;
use crate::collector::naming::collector_selector;
use crate::collector::types::{CollectorGuid, ResourceRef};
use crate::error::{OrphanedResource, Result};

/// Outcome of removing a list of resources
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub removed: Vec<ResourceRef>,
    /// Already gone before we tried
    pub already_absent: Vec<ResourceRef>,
    pub orphaned: Vec<OrphanedResource>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.orphaned.is_empty()
    }
}

/// Delete `resources` in the given order, tolerating ones already gone
///
/// Removal failures are never retried; each one is logged with an operator
/// call-to-action and returned in the report.
pub async fn remove_resources(
    backend: &dyn ClusterBackend,
    resources: impl IntoIterator<Item = &ResourceRef>,
) -> RollbackReport {
    let mut report = RollbackReport::default();
    for resource in resources {
        match backend.delete(resource).await {
            Ok(()) => report.removed.push(resource.clone()),
            Err(e) if e.is_not_found() => {
                warn!("{} not found, already deleted", resource);
                report.already_absent.push(resource.clone());
            }
            Err(e) => {
                let orphan = OrphanedResource {
                    resource: resource.clone(),
                    cause: e.to_string(),
                };
                error!("Removing {} exited with an error: {}", resource, e);
                error!("{}", orphan);
                report.orphaned.push(orphan);
            }
        }
    }
    report
}

/// LIFO stack of "delete this resource" actions with an explicit commit point
pub struct RollbackStack {
    backend: Arc<dyn ClusterBackend>,
    created: Vec<ResourceRef>,
    armed: bool,
}

impl RollbackStack {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Self {
        Self {
            backend,
            created: Vec::new(),
            armed: true,
        }
    }

    /// Register a freshly created resource
    pub fn push(&mut self, resource: ResourceRef) {
        self.created.push(resource);
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Remove everything pushed so far, newest first
    pub async fn unwind(mut self) -> RollbackReport {
        self.armed = false;
        let created = std::mem::take(&mut self.created);
        info!("Rolling back {} created resource(s)", created.len());
        remove_resources(self.backend.as_ref(), created.iter().rev()).await
    }

    /// Commit: stop rolling back and hand the actions over as a teardown
    pub fn disarm(mut self) -> Teardown {
        self.armed = false;
        Teardown {
            backend: self.backend.clone(),
            resources: std::mem::take(&mut self.created),
        }
    }
}

impl Drop for RollbackStack {
    fn drop(&mut self) {
        if !self.armed || self.created.is_empty() {
            return;
        }
        // The owning future was dropped mid-provisioning; unwind in the background
        let created = std::mem::take(&mut self.created);
        let backend = self.backend.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(
                    "Provisioning abandoned with {} resource(s) created; rolling back",
                    created.len()
                );
                handle.spawn(async move {
                    remove_resources(backend.as_ref(), created.iter().rev()).await;
                });
            }
            Err(_) => {
                for resource in created.iter().rev() {
                    error!(
                        "ACTION REQUIRED: You'll need to manually remove the logs collector {}",
                        resource
                    );
                }
            }
        }
    }
}

/// Detachable "remove everything" capability for a committed deployment
///
/// Running it more than once is safe: resources already gone are skipped.
#[derive(Clone)]
pub struct Teardown {
    backend: Arc<dyn ClusterBackend>,
    /// Creation order
    resources: Vec<ResourceRef>,
}

impl std::fmt::Debug for Teardown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Teardown")
            .field("resources", &self.resources)
            .finish()
    }
}

impl Teardown {
    pub fn new(backend: Arc<dyn ClusterBackend>, resources: Vec<ResourceRef>) -> Self {
        Self { backend, resources }
    }

    /// Resources in creation order
    pub fn resources(&self) -> &[ResourceRef] {
        &self.resources
    }

    /// Delete every resource in reverse dependency order
    pub async fn run(&self) -> RollbackReport {
        info!("Removing {} logs collector resource(s)", self.resources.len());
        remove_resources(self.backend.as_ref(), self.resources.iter().rev()).await
    }
}

/// Rebuild the teardown of a collector from its identity label
///
/// For callers that no longer hold the [`Teardown`] returned at provisioning.
pub async fn find_collector_resources(
    backend: Arc<dyn ClusterBackend>,
    guid: &CollectorGuid,
) -> Result<Teardown> {
    let selector = collector_selector(guid);
    let mut resources = backend
        .list_resources(&selector)
        .await
        .map_err(|e| e.during("list resources of", format!("logs collector {guid}")))?;
    resources.sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.name.cmp(&b.name)));
    info!(
        "Found {} resource(s) belonging to logs collector {}",
        resources.len(),
        guid
    );
    Ok(Teardown::new(backend, resources))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::{FailPoint, FakeBackend};
    use crate::collector::types::ResourceKind;
    use k8s_openapi::api::core::v1::Namespace;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    async fn seeded(backend: &FakeBackend, names: &[&str]) -> Vec<ResourceRef> {
        let mut refs = Vec::new();
        for name in names {
            let ns = Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            };
            backend.create_namespace(&ns).await.unwrap();
            refs.push(ResourceRef::cluster_scoped(ResourceKind::Namespace, *name));
        }
        refs
    }

    #[tokio::test]
    async fn test_unwind_is_lifo() {
        let backend = Arc::new(FakeBackend::new());
        let refs = seeded(&backend, &["first", "second", "third"]).await;

        let mut stack = RollbackStack::new(backend.clone());
        for r in &refs {
            stack.push(r.clone());
        }
        assert!(stack.is_armed());
        let report = stack.unwind().await;

        let removed: Vec<&str> = report.removed.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(removed, vec!["third", "second", "first"]);
        assert!(report.is_clean());
        assert!(backend.live_objects().is_empty());
    }

    #[tokio::test]
    async fn test_disarm_keeps_resources() {
        let backend = Arc::new(FakeBackend::new());
        let refs = seeded(&backend, &["kept"]).await;

        let mut stack = RollbackStack::new(backend.clone());
        stack.push(refs[0].clone());
        let teardown = stack.disarm();

        // dropping a disarmed stack must not delete anything
        tokio::task::yield_now().await;
        assert_eq!(backend.live_objects().len(), 1);
        assert_eq!(teardown.resources(), &refs[..]);
    }

    #[tokio::test]
    async fn test_teardown_twice_tolerates_missing() {
        let backend = Arc::new(FakeBackend::new());
        let refs = seeded(&backend, &["a", "b"]).await;
        let teardown = Teardown::new(backend.clone(), refs);

        let first = teardown.run().await;
        assert_eq!(first.removed.len(), 2);
        let second = teardown.run().await;
        assert!(second.is_clean());
        assert!(second.removed.is_empty());
        assert_eq!(second.already_absent.len(), 2);
    }

    #[tokio::test]
    async fn test_failed_removal_reported_not_retried() {
        let backend = Arc::new(FakeBackend::new().fail_at(FailPoint::Delete(ResourceKind::Namespace)));
        let refs = seeded(&backend, &["stuck"]).await;
        let teardown = Teardown::new(backend.clone(), refs.clone());

        let report = teardown.run().await;
        assert_eq!(report.orphaned.len(), 1);
        assert_eq!(report.orphaned[0].resource, refs[0]);
        let deletes = backend
            .calls()
            .iter()
            .filter(|c| c.starts_with("delete"))
            .count();
        assert_eq!(deletes, 1);
    }

    #[tokio::test]
    async fn test_dropped_armed_stack_unwinds_in_background() {
        let backend = Arc::new(FakeBackend::new());
        let refs = seeded(&backend, &["abandoned"]).await;

        {
            let mut stack = RollbackStack::new(backend.clone());
            stack.push(refs[0].clone());
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(backend.live_objects().is_empty());
    }

    #[tokio::test]
    async fn test_find_collector_resources_by_label() {
        use std::collections::BTreeMap;

        use crate::collector::naming::LABEL_COLLECTOR_GUID;

        let backend = Arc::new(FakeBackend::new());
        let guid = CollectorGuid::new("abc123");
        for (name, owner) in [("mine", "abc123"), ("other", "zzz999")] {
            let ns = Namespace {
                metadata: ObjectMeta {
                    name: Some(name.to_string()),
                    labels: Some(BTreeMap::from([(
                        LABEL_COLLECTOR_GUID.to_string(),
                        owner.to_string(),
                    )])),
                    ..Default::default()
                },
                ..Default::default()
            };
            backend.create_namespace(&ns).await.unwrap();
        }

        let teardown = find_collector_resources(backend.clone(), &guid).await.unwrap();
        assert_eq!(
            teardown.resources(),
            &[ResourceRef::cluster_scoped(ResourceKind::Namespace, "mine")]
        );
        assert!(teardown.run().await.is_clean());
        assert_eq!(
            backend.live_objects(),
            vec![ResourceRef::cluster_scoped(ResourceKind::Namespace, "other")]
        );
    }
}
