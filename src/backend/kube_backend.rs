//! [`ClusterBackend`] on top of the Kubernetes API

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{
    ConfigMap, Container, HostPathVolumeSource, Namespace, Pod, PodSpec, SecurityContext,
    ServiceAccount, Toleration, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use super::{ClusterBackend, NodeCommand};
use crate::collector::naming::LABEL_MANAGED_BY;
use crate::collector::resources::daemon_set_pod_selector;
use crate::collector::types::{ResourceKind, ResourceRef};
use crate::error::{Error, Result};

const NODE_HELPER_PREFIX: &str = "logs-collector-node-helper";
const NODE_HELPER_IMAGE: &str = "busybox:1.36";
const NODE_HELPER_VOLUME: &str = "host-dir";
const DEFAULT_NODE_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Kubernetes-backed cluster operations
#[derive(Clone)]
pub struct KubeBackend {
    client: Client,
    node_command_timeout: Duration,
}

impl KubeBackend {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            node_command_timeout: DEFAULT_NODE_COMMAND_TIMEOUT,
        }
    }

    /// How long a node helper pod may run before it is abandoned
    pub fn with_node_command_timeout(mut self, timeout: Duration) -> Self {
        self.node_command_timeout = timeout;
        self
    }

    fn required_namespace<'a>(resource: &'a ResourceRef) -> Result<&'a str> {
        resource.namespace.as_deref().ok_or_else(|| {
            Error::ConfigError(format!("{} has no namespace", resource))
        })
    }

    fn namespace_of<K: ResourceExt>(object: &K) -> Result<String> {
        object.namespace().ok_or_else(|| {
            Error::ConfigError(format!(
                "object '{}' has no namespace set",
                object.name_any()
            ))
        })
    }
}

fn not_found_or(kind: ResourceKind, name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(e) if e.code == 404 => Error::NotFound {
            kind,
            name: name.to_string(),
        },
        e => Error::KubeError(e),
    }
}

async fn delete_object<K>(api: Api<K>, name: &str) -> kube::Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    api.delete(name, &DeleteParams::background())
        .await
        .map(|_| ())
}

async fn list_refs<K>(
    api: Api<K>,
    kind: ResourceKind,
    params: &ListParams,
) -> Result<Vec<ResourceRef>>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let list = api.list(params).await?;
    Ok(list
        .items
        .iter()
        .map(|object| ResourceRef::of(kind, object))
        .collect())
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

fn pod_completed(pod: Option<&Pod>) -> bool {
    matches!(pod.and_then(pod_phase), Some("Succeeded") | Some("Failed"))
}

fn build_node_helper_pod(namespace: &str, node: &str, command: &NodeCommand) -> Pod {
    Pod {
        metadata: ObjectMeta {
            generate_name: Some(format!("{NODE_HELPER_PREFIX}-")),
            namespace: Some(namespace.to_string()),
            labels: Some(BTreeMap::from([(
                LABEL_MANAGED_BY.to_string(),
                "logs-collector-k8s".to_string(),
            )])),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            restart_policy: Some("Never".to_string()),
            containers: vec![Container {
                name: "node-helper".to_string(),
                image: Some(NODE_HELPER_IMAGE.to_string()),
                command: Some(command.argv.clone()),
                security_context: Some(SecurityContext {
                    privileged: Some(true),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![VolumeMount {
                    name: NODE_HELPER_VOLUME.to_string(),
                    mount_path: command.mount_path.clone(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: NODE_HELPER_VOLUME.to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: command.host_path.clone(),
                    type_: Some("DirectoryOrCreate".to_string()),
                }),
                ..Default::default()
            }]),
            // must land on tainted nodes too, the collector runs there
            tolerations: Some(vec![Toleration {
                operator: Some("Exists".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: None,
    }
}

#[async_trait]
impl ClusterBackend for KubeBackend {
    #[instrument(skip(self, namespace), fields(name = ?namespace.metadata.name))]
    async fn create_namespace(&self, namespace: &Namespace) -> Result<Namespace> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let created = api.create(&PostParams::default(), namespace).await?;
        info!("Created Namespace {}", created.name_any());
        Ok(created)
    }

    #[instrument(skip(self, account), fields(name = ?account.metadata.name))]
    async fn create_service_account(&self, account: &ServiceAccount) -> Result<ServiceAccount> {
        let api: Api<ServiceAccount> =
            Api::namespaced(self.client.clone(), &Self::namespace_of(account)?);
        let created = api.create(&PostParams::default(), account).await?;
        info!("Created ServiceAccount {}", created.name_any());
        Ok(created)
    }

    #[instrument(skip(self, role), fields(name = ?role.metadata.name))]
    async fn create_cluster_role(&self, role: &ClusterRole) -> Result<ClusterRole> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        let created = api.create(&PostParams::default(), role).await?;
        info!("Created ClusterRole {}", created.name_any());
        Ok(created)
    }

    #[instrument(skip(self, binding), fields(name = ?binding.metadata.name))]
    async fn create_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
    ) -> Result<ClusterRoleBinding> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let created = api.create(&PostParams::default(), binding).await?;
        info!("Created ClusterRoleBinding {}", created.name_any());
        Ok(created)
    }

    #[instrument(skip(self, config_map), fields(name = ?config_map.metadata.name))]
    async fn create_config_map(&self, config_map: &ConfigMap) -> Result<ConfigMap> {
        let api: Api<ConfigMap> =
            Api::namespaced(self.client.clone(), &Self::namespace_of(config_map)?);
        let created = api.create(&PostParams::default(), config_map).await?;
        info!("Created ConfigMap {}", created.name_any());
        Ok(created)
    }

    #[instrument(skip(self, daemon_set), fields(name = ?daemon_set.metadata.name))]
    async fn create_daemon_set(&self, daemon_set: &DaemonSet) -> Result<DaemonSet> {
        let api: Api<DaemonSet> =
            Api::namespaced(self.client.clone(), &Self::namespace_of(daemon_set)?);
        let created = api.create(&PostParams::default(), daemon_set).await?;
        info!("Created DaemonSet {}", created.name_any());
        Ok(created)
    }

    async fn get_daemon_set(&self, namespace: &str, name: &str) -> Result<DaemonSet> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| not_found_or(ResourceKind::DaemonSet, name, e))
    }

    async fn list_resources(&self, label_selector: &str) -> Result<Vec<ResourceRef>> {
        let params = ListParams::default().labels(label_selector);
        let client = &self.client;

        let mut found = Vec::new();
        found.extend(
            list_refs(
                Api::<Namespace>::all(client.clone()),
                ResourceKind::Namespace,
                &params,
            )
            .await?,
        );
        found.extend(
            list_refs(
                Api::<ServiceAccount>::all(client.clone()),
                ResourceKind::ServiceAccount,
                &params,
            )
            .await?,
        );
        found.extend(
            list_refs(
                Api::<ClusterRole>::all(client.clone()),
                ResourceKind::ClusterRole,
                &params,
            )
            .await?,
        );
        found.extend(
            list_refs(
                Api::<ClusterRoleBinding>::all(client.clone()),
                ResourceKind::ClusterRoleBinding,
                &params,
            )
            .await?,
        );
        found.extend(
            list_refs(
                Api::<ConfigMap>::all(client.clone()),
                ResourceKind::ConfigMap,
                &params,
            )
            .await?,
        );
        found.extend(
            list_refs(
                Api::<DaemonSet>::all(client.clone()),
                ResourceKind::DaemonSet,
                &params,
            )
            .await?,
        );
        Ok(found)
    }

    #[instrument(skip(self), fields(resource = %resource))]
    async fn delete(&self, resource: &ResourceRef) -> Result<()> {
        let client = self.client.clone();
        let name = resource.name.as_str();
        let result = match resource.kind {
            ResourceKind::Namespace => delete_object(Api::<Namespace>::all(client), name).await,
            ResourceKind::ClusterRole => {
                delete_object(Api::<ClusterRole>::all(client), name).await
            }
            ResourceKind::ClusterRoleBinding => {
                delete_object(Api::<ClusterRoleBinding>::all(client), name).await
            }
            ResourceKind::ServiceAccount => {
                let ns = Self::required_namespace(resource)?;
                delete_object(Api::<ServiceAccount>::namespaced(client, ns), name).await
            }
            ResourceKind::ConfigMap => {
                let ns = Self::required_namespace(resource)?;
                delete_object(Api::<ConfigMap>::namespaced(client, ns), name).await
            }
            ResourceKind::DaemonSet => {
                let ns = Self::required_namespace(resource)?;
                delete_object(Api::<DaemonSet>::namespaced(client, ns), name).await
            }
        };

        match result {
            Ok(()) => {
                info!("Deleted {}", resource);
                Ok(())
            }
            Err(e) => Err(not_found_or(resource.kind, name, e)),
        }
    }

    #[instrument(skip(self, node_selector), fields(namespace = %namespace, name = %name))]
    async fn patch_node_selector(
        &self,
        namespace: &str,
        name: &str,
        node_selector: &BTreeMap<String, String>,
    ) -> Result<DaemonSet> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);

        // A merge patch only adds keys; null is what removes the selector
        let selector = if node_selector.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::to_value(node_selector)?
        };
        let patch = json!({
            "spec": {
                "template": {
                    "spec": {
                        "nodeSelector": selector
                    }
                }
            }
        });

        let patched = api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| not_found_or(ResourceKind::DaemonSet, name, e))?;
        info!("Patched node selector of DaemonSet {} to {:?}", name, node_selector);
        Ok(patched)
    }

    async fn list_daemon_set_pods(&self, daemon_set: &DaemonSet) -> Result<Vec<Pod>> {
        let namespace = Self::namespace_of(daemon_set)?;
        let selector = daemon_set_pod_selector(daemon_set).ok_or_else(|| {
            Error::ConfigError(format!(
                "DaemonSet '{}' has no label selector",
                daemon_set.name_any()
            ))
        })?;

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let pods = api.list(&ListParams::default().labels(&selector)).await?;
        debug!(
            "DaemonSet {} manages {} pod(s)",
            daemon_set.name_any(),
            pods.items.len()
        );
        Ok(pods.items)
    }

    #[instrument(skip(self))]
    async fn wait_for_pod_termination(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let Some(pod) = api.get_opt(name).await? else {
            debug!("Pod {} already gone", name);
            return Ok(());
        };
        let uid = pod.uid().unwrap_or_default();

        await_condition(api, name, conditions::is_deleted(&uid)).await?;
        debug!("Pod {} terminated", name);
        Ok(())
    }

    #[instrument(skip(self, command), fields(host_path = %command.host_path))]
    async fn run_on_node(
        &self,
        namespace: &str,
        node: &str,
        command: &NodeCommand,
    ) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let helper = build_node_helper_pod(namespace, node, command);
        let created = api.create(&PostParams::default(), &helper).await?;
        let pod_name = created.name_any();
        info!("Started node helper pod {} on node {}", pod_name, node);

        let outcome = tokio::time::timeout(
            self.node_command_timeout,
            await_condition(api.clone(), &pod_name, pod_completed),
        )
        .await;

        if let Err(e) = api.delete(&pod_name, &DeleteParams::background()).await {
            warn!("Failed to delete node helper pod {}: {:?}", pod_name, e);
        }

        let finished = match outcome {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::NodeCommandFailed {
                    node: node.to_string(),
                    message: format!(
                        "helper pod '{}' did not finish within {:?}",
                        pod_name, self.node_command_timeout
                    ),
                })
            }
        };

        match finished.as_ref().and_then(pod_phase) {
            Some("Succeeded") => Ok(()),
            phase => Err(Error::NodeCommandFailed {
                node: node.to_string(),
                message: format!("helper pod '{}' ended in phase {:?}", pod_name, phase),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::cleanup::{EVICTION_SELECTOR_KEY, EVICTION_SELECTOR_VALUE};
    use k8s_openapi::api::apps::v1::DaemonSetSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn backend_for(server: &MockServer) -> KubeBackend {
        let config = kube::Config::new(server.uri().parse().expect("mock server uri"));
        let client = Client::try_from(config).expect("client from config");
        KubeBackend::new(client)
    }

    fn not_found_body() -> serde_json::Value {
        json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": "not found",
            "reason": "NotFound",
            "code": 404
        })
    }

    #[test]
    fn test_node_helper_pod_is_pinned_and_privileged() {
        let command = NodeCommand::remove_dir_contents("/var/lib/checkpoints");
        let pod = build_node_helper_pod("logs", "worker-1", &command);
        let spec = pod.spec.unwrap();

        assert_eq!(spec.node_name.as_deref(), Some("worker-1"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        let container = &spec.containers[0];
        assert_eq!(
            container.security_context.as_ref().unwrap().privileged,
            Some(true)
        );
        assert_eq!(
            container.command.as_ref().unwrap(),
            &vec![
                "sh".to_string(),
                "-c".to_string(),
                "rm -rf /host-dir/*".to_string()
            ]
        );
        let volume = &spec.volumes.unwrap()[0];
        assert_eq!(
            volume.host_path.as_ref().unwrap().path,
            "/var/lib/checkpoints"
        );
    }

    #[test]
    fn test_pod_completed() {
        let mut pod = Pod::default();
        assert!(!pod_completed(Some(&pod)));
        pod.status = Some(k8s_openapi::api::core::v1::PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        assert!(pod_completed(Some(&pod)));
        assert!(!pod_completed(None));
    }

    #[tokio::test]
    async fn test_create_namespace_posts_to_api() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/namespaces"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "apiVersion": "v1",
                "kind": "Namespace",
                "metadata": { "name": "logs-ns" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend_for(&server).await;
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some("logs-ns".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let created = backend.create_namespace(&namespace).await.unwrap();
        assert_eq!(created.name_any(), "logs-ns");
    }

    #[tokio::test]
    async fn test_delete_missing_config_map_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/namespaces/logs/configmaps/cfg"))
            .respond_with(ResponseTemplate::new(404).set_body_json(not_found_body()))
            .mount(&server)
            .await;

        let backend = backend_for(&server).await;
        let err = backend
            .delete(&ResourceRef::namespaced(ResourceKind::ConfigMap, "logs", "cfg"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(matches!(
            err,
            Error::NotFound {
                kind: ResourceKind::ConfigMap,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_delete_namespaced_kind_requires_namespace() {
        let server = MockServer::start().await;
        let backend = backend_for(&server).await;
        let err = backend
            .delete(&ResourceRef::cluster_scoped(ResourceKind::DaemonSet, "ds"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_server_error_is_not_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/apis/rbac.authorization.k8s.io/v1/clusterroles/reader"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "kind": "Status",
                "apiVersion": "v1",
                "metadata": {},
                "status": "Failure",
                "message": "etcd unavailable",
                "reason": "InternalError",
                "code": 500
            })))
            .mount(&server)
            .await;

        let backend = backend_for(&server).await;
        let err = backend
            .delete(&ResourceRef::cluster_scoped(ResourceKind::ClusterRole, "reader"))
            .await
            .unwrap_err();
        assert!(!err.is_not_found());
        assert!(matches!(err, Error::KubeError(_)));
    }

    fn daemon_set_body(node_selector: serde_json::Value) -> serde_json::Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "DaemonSet",
            "metadata": { "name": "collector", "namespace": "logs" },
            "spec": {
                "selector": { "matchLabels": { "app": "collector" } },
                "template": { "spec": { "containers": [], "nodeSelector": node_selector } }
            }
        })
    }

    #[tokio::test]
    async fn test_evict_patch_sets_sentinel_selector() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/apis/apps/v1/namespaces/logs/daemonsets/collector"))
            .and(header("content-type", "application/merge-patch+json"))
            .and(body_json(json!({
                "spec": {
                    "template": {
                        "spec": {
                            "nodeSelector": { EVICTION_SELECTOR_KEY: EVICTION_SELECTOR_VALUE }
                        }
                    }
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(daemon_set_body(
                json!({ EVICTION_SELECTOR_KEY: EVICTION_SELECTOR_VALUE }),
            )))
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend_for(&server).await;
        let selector = BTreeMap::from([(
            EVICTION_SELECTOR_KEY.to_string(),
            EVICTION_SELECTOR_VALUE.to_string(),
        )]);
        let patched = backend
            .patch_node_selector("logs", "collector", &selector)
            .await
            .unwrap();
        let applied = patched
            .spec
            .and_then(|s| s.template.spec)
            .and_then(|s| s.node_selector)
            .unwrap();
        assert_eq!(applied, selector);
    }

    #[tokio::test]
    async fn test_restore_patch_sends_null_selector() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/apis/apps/v1/namespaces/logs/daemonsets/collector"))
            .and(body_json(json!({
                "spec": { "template": { "spec": { "nodeSelector": null } } }
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(daemon_set_body(json!(null))),
            )
            .expect(1)
            .mount(&server)
            .await;

        let backend = backend_for(&server).await;
        let patched = backend
            .patch_node_selector("logs", "collector", &BTreeMap::new())
            .await
            .unwrap();
        assert!(patched
            .spec
            .and_then(|s| s.template.spec)
            .and_then(|s| s.node_selector)
            .is_none());
    }

    #[tokio::test]
    async fn test_patch_missing_daemon_set_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/apis/apps/v1/namespaces/logs/daemonsets/collector"))
            .respond_with(ResponseTemplate::new(404).set_body_json(not_found_body()))
            .mount(&server)
            .await;

        let backend = backend_for(&server).await;
        let err = backend
            .patch_node_selector("logs", "collector", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::NotFound {
                kind: ResourceKind::DaemonSet,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_list_daemon_set_pods_uses_label_selector() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/logs/pods"))
            .and(query_param("labelSelector", "app=collector,tier=logging"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "v1",
                "kind": "PodList",
                "metadata": {},
                "items": [
                    { "metadata": { "name": "collector-a", "namespace": "logs" } },
                    { "metadata": { "name": "collector-b", "namespace": "logs" } }
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let daemon_set = DaemonSet {
            metadata: ObjectMeta {
                name: Some("collector".to_string()),
                namespace: Some("logs".to_string()),
                ..Default::default()
            },
            spec: Some(DaemonSetSpec {
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([
                        ("tier".to_string(), "logging".to_string()),
                        ("app".to_string(), "collector".to_string()),
                    ])),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        let backend = backend_for(&server).await;
        let pods = backend.list_daemon_set_pods(&daemon_set).await.unwrap();
        let names: Vec<String> = pods.iter().map(|p| p.name_any()).collect();
        assert_eq!(names, vec!["collector-a", "collector-b"]);
    }

    #[tokio::test]
    async fn test_list_pods_without_selector_is_rejected() {
        let server = MockServer::start().await;
        let backend = backend_for(&server).await;
        let daemon_set = DaemonSet {
            metadata: ObjectMeta {
                name: Some("collector".to_string()),
                namespace: Some("logs".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = backend.list_daemon_set_pods(&daemon_set).await.unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }
}
