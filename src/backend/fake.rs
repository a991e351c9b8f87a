//! In-memory [`ClusterBackend`] for unit tests
//!
//! Records every call, lets tests inject failures at named points and
//! scripts when daemon set pods start reporting ready.

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{
    ConfigMap, ContainerStatus, Namespace, Pod, PodSpec, PodStatus, ServiceAccount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::ErrorResponse;
use kube::ResourceExt;

use super::{ClusterBackend, NodeCommand};
use crate::collector::types::{ResourceKind, ResourceRef};
use crate::error::{Error, Result};

/// Places where the fake can be told to fail
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailPoint {
    Create(ResourceKind),
    Delete(ResourceKind),
    GetDaemonSet,
    /// Patching in a non-empty node selector
    Evict,
    /// Patching the node selector back to empty
    Restore,
    ListPods,
    WaitTermination,
    /// Pod termination never completes
    HangTermination,
    RunOnNode,
}

#[derive(Default)]
struct State {
    objects: Vec<(ResourceRef, BTreeMap<String, String>)>,
    daemon_sets: Vec<DaemonSet>,
    /// (pod name, node name)
    pods: Vec<(String, String)>,
    terminated: HashSet<String>,
    /// Pods report ready from this list call on; `None` means never
    ready_from_call: Option<u32>,
    list_calls: u32,
    failures: HashSet<FailPoint>,
    calls: Vec<String>,
    violations: Vec<String>,
}

pub struct FakeBackend {
    state: Mutex<State>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn injected(point: FailPoint) -> Error {
    Error::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("injected failure at {point:?}"),
        reason: "InternalError".to_string(),
        code: 500,
    }))
}

impl FakeBackend {
    /// One pod on `node-a`, ready on the first poll
    pub fn new() -> Self {
        let state = State {
            pods: vec![("collector-pod-0".to_string(), "node-a".to_string())],
            ready_from_call: Some(1),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn with_pods(self, pods: &[(&str, &str)]) -> Self {
        self.state.lock().unwrap().pods = pods
            .iter()
            .map(|(pod, node)| (pod.to_string(), node.to_string()))
            .collect();
        self
    }

    pub fn ready_from_call(self, call: Option<u32>) -> Self {
        self.state.lock().unwrap().ready_from_call = call;
        self
    }

    pub fn fail_at(self, point: FailPoint) -> Self {
        self.state.lock().unwrap().failures.insert(point);
        self
    }

    pub fn insert_daemon_set(&self, daemon_set: DaemonSet) {
        let mut state = self.state.lock().unwrap();
        state.objects.push((
            ResourceRef::of(ResourceKind::DaemonSet, &daemon_set),
            daemon_set.labels().clone(),
        ));
        state.daemon_sets.push(daemon_set);
    }

    /// Every object currently stored
    pub fn live_objects(&self) -> Vec<ResourceRef> {
        self.state
            .lock()
            .unwrap()
            .objects
            .iter()
            .map(|(r, _)| r.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Node commands issued while a pod on that node was still live
    pub fn violations(&self) -> Vec<String> {
        self.state.lock().unwrap().violations.clone()
    }

    pub fn list_calls(&self) -> u32 {
        self.state.lock().unwrap().list_calls
    }

    pub fn node_selector(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
        let state = self.state.lock().unwrap();
        state
            .daemon_sets
            .iter()
            .find(|ds| ds.namespace().as_deref() == Some(namespace) && ds.name_any() == name)
            .and_then(|ds| ds.spec.as_ref())
            .and_then(|spec| spec.template.spec.as_ref())
            .and_then(|pod| pod.node_selector.clone())
    }

    fn check(&self, point: FailPoint) -> Result<()> {
        if self.state.lock().unwrap().failures.contains(&point) {
            Err(injected(point))
        } else {
            Ok(())
        }
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn store<K: ResourceExt + Clone>(&self, kind: ResourceKind, object: &K) -> Result<K> {
        self.record(format!("create {}", kind));
        self.check(FailPoint::Create(kind))?;
        let mut state = self.state.lock().unwrap();
        state
            .objects
            .push((ResourceRef::of(kind, object), object.labels().clone()));
        Ok(object.clone())
    }
}

fn selector_matches(selector: &str, labels: &BTreeMap<String, String>) -> bool {
    selector.split(',').all(|pair| match pair.split_once('=') {
        Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
        None => false,
    })
}

#[async_trait]
impl ClusterBackend for FakeBackend {
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
        self.store(ResourceKind::Namespace, namespace)
    }

    async fn create_service_account(&self, account: &ServiceAccount) -> Result<ServiceAccount> {
        self.store(ResourceKind::ServiceAccount, account)
    }

    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole> {
        self.store(ResourceKind::ClusterRole, role)
    }

    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding> {
        self.store(ResourceKind::ClusterRoleBinding, binding)
    }

    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        self.store(ResourceKind::ConfigMap, config_map)
    }

    async fn create_daemon_set(&self, daemon_set: &DaemonSet) -> Result<DaemonSet> {
        let created = self.store(ResourceKind::DaemonSet, daemon_set)?;
        self.state.lock().unwrap().daemon_sets.push(created.clone());
        Ok(created)
    }

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<DaemonSet> {
        self.record(format!("get DaemonSet {name}"));
        self.check(FailPoint::GetDaemonSet)?;
        let state = self.state.lock().unwrap();
        state
            .daemon_sets
            .iter()
            .find(|ds| ds.namespace().as_deref() == Some(namespace) && ds.name_any() == name)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: ResourceKind::DaemonSet,
                name: name.to_string(),
            })
    }

    async fn list_resources(&self, label_selector: &str) -> Result<Vec<ResourceRef>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .objects
            .iter()
            .filter(|(_, labels)| selector_matches(label_selector, labels))
            .map(|(r, _)| r.clone())
            .collect())
    }

    async fn delete(&self, resource: &ResourceRef) -> Result<()> {
        self.record(format!("delete {}", resource.kind));
        self.check(FailPoint::Delete(resource.kind))?;
        let mut state = self.state.lock().unwrap();
        let before = state.objects.len();
        state.objects.retain(|(r, _)| r != resource);
        if resource.kind == ResourceKind::DaemonSet {
            state.daemon_sets.retain(|ds| {
                !(ds.name_any() == resource.name && ds.namespace() == resource.namespace)
            });
        }
        if state.objects.len() == before {
            return Err(Error::NotFound {
                kind: resource.kind,
                name: resource.name.clone(),
            });
        }
        Ok(())
    }

    async fn patch_node_selector(
        &self,
        namespace: &str,
        name: &str,
        node_selector: &BTreeMap<String, String>,
    ) -> Result<DaemonSet> {
        let point = if node_selector.is_empty() {
            FailPoint::Restore
        } else {
            FailPoint::Evict
        };
        self.record(format!("patch node selector {:?}", node_selector));
        self.check(point)?;

        let mut state = self.state.lock().unwrap();
        let daemon_set = state
            .daemon_sets
            .iter_mut()
            .find(|ds| ds.namespace().as_deref() == Some(namespace) && ds.name_any() == name)
            .ok_or_else(|| Error::NotFound {
                kind: ResourceKind::DaemonSet,
                name: name.to_string(),
            })?;
        let pod_spec = daemon_set
            .spec
            .get_or_insert_with(Default::default)
            .template
            .spec
            .get_or_insert_with(Default::default);
        pod_spec.node_selector = if node_selector.is_empty() {
            None
        } else {
            Some(node_selector.clone())
        };
        Ok(daemon_set.clone())
    }

    async fn list_daemon_set_pods(&self, daemon_set: &DaemonSet) -> Result<Vec<Pod>> {
        self.check(FailPoint::ListPods)?;
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        let ready = state
            .ready_from_call
            .map(|from| state.list_calls >= from)
            .unwrap_or(false);

        // once scheduling is restored, replacements for terminated pods come back
        let scheduling_enabled = state
            .daemon_sets
            .iter()
            .find(|ds| ds.name_any() == daemon_set.name_any())
            .and_then(|ds| ds.spec.as_ref())
            .and_then(|spec| spec.template.spec.as_ref())
            .map(|pod| pod.node_selector.as_ref().map_or(true, |s| s.is_empty()))
            .unwrap_or(true);

        let namespace = daemon_set.namespace();
        Ok(state
            .pods
            .iter()
            .filter(|(pod, _)| scheduling_enabled || !state.terminated.contains(pod))
            .map(|(pod, node)| Pod {
                metadata: ObjectMeta {
                    name: Some(pod.clone()),
                    namespace: namespace.clone(),
                    ..Default::default()
                },
                spec: Some(PodSpec {
                    node_name: Some(node.clone()),
                    ..Default::default()
                }),
                status: Some(PodStatus {
                    container_statuses: Some(vec![ContainerStatus {
                        name: "fluent-bit".to_string(),
                        ready,
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            })
            .collect())
    }

    async fn wait_for_pod_termination(&self, _namespace: &str, name: &str) -> Result<()> {
        self.record(format!("wait {name}"));
        self.check(FailPoint::WaitTermination)?;
        if self.check(FailPoint::HangTermination).is_err() {
            std::future::pending::<()>().await;
        }
        self.state.lock().unwrap().terminated.insert(name.to_string());
        Ok(())
    }

    async fn run_on_node(&self, _namespace: &str, node: &str, command: &NodeCommand) -> Result<()> {
        self.record(format!("run {node} {}", command.host_path));
        self.check(FailPoint::RunOnNode)?;
        let mut state = self.state.lock().unwrap();
        let live: Vec<String> = state
            .pods
            .iter()
            .filter(|(pod, pod_node)| pod_node == node && !state.terminated.contains(pod))
            .map(|(pod, _)| pod.clone())
            .collect();
        for pod in live {
            state
                .violations
                .push(format!("node {node} cleaned while pod {pod} was live"));
        }
        Ok(())
    }
}
