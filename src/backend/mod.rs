//! Cluster backend seam
//!
//! Everything the provisioner and the cleanup choreography need from the
//! cluster goes through [`ClusterBackend`]. [`KubeBackend`] implements it on
//! top of a `kube::Client`; tests substitute an in-memory fake.

#[cfg(test)]
pub(crate) mod fake;
mod kube_backend;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};

pub use kube_backend::KubeBackend;

use crate::collector::types::ResourceRef;
use crate::error::Result;

/// A command run with host filesystem access on one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeCommand {
    /// Host directory made available to the command
    pub host_path: String,
    /// Where `host_path` is mounted for the command
    pub mount_path: String,
    pub argv: Vec<String>,
}

impl NodeCommand {
    /// Remove everything inside `host_path`, keeping the directory itself
    pub fn remove_dir_contents(host_path: &str) -> Self {
        let mount_path = "/host-dir".to_string();
        Self {
            host_path: host_path.to_string(),
            argv: vec![
                "sh".to_string(),
                "-c".to_string(),
                format!("rm -rf {mount_path}/*"),
            ],
            mount_path,
        }
    }
}

/// Cluster operations consumed by collector provisioning and cleanup
///
/// Implementations must report a missing object as an error for which
/// [`crate::Error::is_not_found`] is true.
#[async_trait]
pub trait ClusterBackend: Send + Sync {
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace>;

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<ServiceAccount>;

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole>;

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding>;

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap>;

    async fn create_daemon_set(&self, daemon_set: &DaemonSet) -> Result<DaemonSet>;

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<DaemonSet>;

    /// Every collector-kind object matching a label selector
    async fn list_resources(&self, label_selector: &str) -> Result<Vec<ResourceRef>>;

    async fn delete(&self, resource: &ResourceRef) -> Result<()>;

    /// Replace the pod template's node selector; an empty map clears it
    async fn patch_node_selector(
        &self,
        namespace: &str,
        name: &str,
        node_selector: &BTreeMap<String, String>,
    ) -> Result<DaemonSet>;

    async fn list_daemon_set_pods(&self, daemon_set: &DaemonSet) -> Result<Vec<Pod>>;

    /// Block until the pod no longer exists
    async fn wait_for_pod_termination(&self, namespace: &str, name: &str) -> Result<()>;

    /// Run `command` on `node` with node-level filesystem access
    async fn run_on_node(&self, namespace: &str, node: &str, command: &NodeCommand)
        -> Result<()>;
}
