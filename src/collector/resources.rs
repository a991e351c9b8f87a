//! Kubernetes object builders for the logs collector
//!
//! Every object a collector deployment consists of is built here as plain
//! data, so the pod template can be tested without a cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, ExecAction, HTTPGetAction,
    HostPathVolumeSource, Lifecycle, LifecycleHandler, Namespace, PodSpec, PodTemplateSpec, Probe,
    ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use crate::collector::naming::ObjectAttributes;
use crate::collector::render::{
    CHECKPOINT_DB_MOUNT_PATH, CONFIG_MOUNT_PATH, MAIN_CONFIG_KEY,
};
use crate::collector::types::PortSpec;
use crate::error::{Error, Result};

pub const COLLECTOR_CONTAINER_NAME: &str = "fluent-bit";
pub const DEFAULT_COLLECTOR_IMAGE: &str = "fluent/fluent-bit:3.1.4";
/// Health endpoint served on the collector's HTTP port
pub const HTTP_HEALTH_CHECK_ENDPOINT: &str = "/api/v1/health";

const COLLECTOR_BINARY: &str = "/fluent-bit/bin/fluent-bit";
const COLLECTOR_WORKDIR: &str = "/fluent-bit/etc";

const VAR_LOG_PATH: &str = "/var/log";
const DOCKER_CONTAINERS_PATH: &str = "/var/lib/docker/containers";
const CONTAINER_LOGS_PATH: &str = "/var/log/containers";
const HOST_LOGS_PATH: &str = "/var/log/host-logs";
/// Node directory backing the checkpoint db volume
pub const CHECKPOINT_DB_HOST_PATH: &str = CHECKPOINT_DB_MOUNT_PATH;

// ============================================================================
// Metadata
// ============================================================================

fn object_meta(attrs: &ObjectAttributes, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(attrs.name.clone()),
        namespace: namespace.map(str::to_string),
        labels: Some(attrs.labels.clone()),
        annotations: if attrs.annotations.is_empty() {
            None
        } else {
            Some(attrs.annotations.clone())
        },
        ..Default::default()
    }
}

// ============================================================================
// Namespace, ServiceAccount, RBAC
// ============================================================================

pub fn build_namespace(attrs: &ObjectAttributes) -> Namespace {
    Namespace {
        metadata: object_meta(attrs, None),
        ..Default::default()
    }
}

pub fn build_service_account(attrs: &ObjectAttributes, namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: object_meta(attrs, Some(namespace)),
        ..Default::default()
    }
}

/// Cluster-wide read access to pods and their logs
pub fn build_cluster_role(attrs: &ObjectAttributes) -> ClusterRole {
    ClusterRole {
        metadata: object_meta(attrs, None),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["pods".to_string(), "pods/log".to_string()]),
            verbs: vec!["get".to_string(), "list".to_string()],
            ..Default::default()
        }]),
        ..Default::default()
    }
}

pub fn build_cluster_role_binding(
    attrs: &ObjectAttributes,
    service_account: &ServiceAccount,
    cluster_role: &ClusterRole,
) -> ClusterRoleBinding {
    ClusterRoleBinding {
        metadata: object_meta(attrs, None),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role.metadata.name.clone().unwrap_or_default(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: service_account.metadata.name.clone().unwrap_or_default(),
            namespace: service_account.metadata.namespace.clone(),
            ..Default::default()
        }]),
    }
}

// ============================================================================
// ConfigMap
// ============================================================================

pub fn build_config_map(
    attrs: &ObjectAttributes,
    namespace: &str,
    data: BTreeMap<String, String>,
) -> ConfigMap {
    ConfigMap {
        metadata: object_meta(attrs, Some(namespace)),
        data: Some(data),
        ..Default::default()
    }
}

// ============================================================================
// Ports
// ============================================================================

/// Translate logical ports into container ports, named by port id
pub fn to_container_ports(ports: &BTreeMap<String, PortSpec>) -> Result<Vec<ContainerPort>> {
    ports
        .iter()
        .map(|(id, spec)| {
            validate_port_name(id)?;
            Ok(ContainerPort {
                name: Some(id.clone()),
                container_port: i32::from(spec.number),
                protocol: Some(spec.transport.as_kubernetes_str().to_string()),
                ..Default::default()
            })
        })
        .collect()
}

/// Container port names are IANA service names: at most 15 chars, lowercase
/// alphanumerics and '-', at least one letter
fn validate_port_name(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 15
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && id.chars().any(|c| c.is_ascii_lowercase())
        && !id.starts_with('-')
        && !id.ends_with('-');
    if valid {
        Ok(())
    } else {
        Err(Error::ConfigError(format!(
            "'{id}' is not a valid container port name"
        )))
    }
}

// ============================================================================
// Volumes
// ============================================================================

/// Where a collector volume's content comes from
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VolumeKind {
    /// A directory on the node
    HostPath(String),
    /// The rendered collector ConfigMap
    ConfigPayload(String),
}

/// One volume plus its mount in the collector container
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CollectorVolume {
    pub name: &'static str,
    pub kind: VolumeKind,
    pub mount_path: String,
}

impl CollectorVolume {
    fn host_path(name: &'static str, path: &str) -> Self {
        Self {
            name,
            kind: VolumeKind::HostPath(path.to_string()),
            mount_path: path.to_string(),
        }
    }

    pub fn to_volume(&self) -> Volume {
        match &self.kind {
            VolumeKind::HostPath(path) => Volume {
                name: self.name.to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: path.clone(),
                    type_: Some("DirectoryOrCreate".to_string()),
                }),
                ..Default::default()
            },
            VolumeKind::ConfigPayload(config_map) => Volume {
                name: self.name.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: Some(config_map.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }

    pub fn to_mount(&self) -> VolumeMount {
        VolumeMount {
            name: self.name.to_string(),
            mount_path: self.mount_path.clone(),
            read_only: Some(false),
            ..Default::default()
        }
    }
}

/// The six volumes every collector pod mounts
pub fn collector_volumes(config_map_name: &str) -> Vec<CollectorVolume> {
    vec![
        // node log directories read by the tail input
        CollectorVolume::host_path("varlog", VAR_LOG_PATH),
        CollectorVolume::host_path("varlibdockercontainers", DOCKER_CONTAINERS_PATH),
        CollectorVolume::host_path("varlogcontainers", CONTAINER_LOGS_PATH),
        CollectorVolume {
            name: "collector-config",
            kind: VolumeKind::ConfigPayload(config_map_name.to_string()),
            mount_path: CONFIG_MOUNT_PATH.to_string(),
        },
        CollectorVolume::host_path("host-logs", HOST_LOGS_PATH),
        CollectorVolume::host_path("checkpoint-db", CHECKPOINT_DB_HOST_PATH),
    ]
}

// ============================================================================
// DaemonSet
// ============================================================================

/// Collector container with its config argument and checkpoint pre-stop hook
/// Readiness probe against the collector's health endpoint on the named port
pub fn health_probe(http_port_id: &str) -> Probe {
    Probe {
        http_get: Some(HTTPGetAction {
            path: Some(HTTP_HEALTH_CHECK_ENDPOINT.to_string()),
            port: IntOrString::String(http_port_id.to_string()),
            ..Default::default()
        }),
        period_seconds: Some(5),
        ..Default::default()
    }
}

fn build_container(
    image: &str,
    ports: Vec<ContainerPort>,
    http_port_id: &str,
    volumes: &[CollectorVolume],
) -> Container {
    Container {
        name: COLLECTOR_CONTAINER_NAME.to_string(),
        image: Some(image.to_string()),
        command: Some(vec![COLLECTOR_BINARY.to_string()]),
        args: Some(vec![
            format!("--workdir={COLLECTOR_WORKDIR}"),
            format!("--config={CONFIG_MOUNT_PATH}/{MAIN_CONFIG_KEY}"),
        ]),
        ports: Some(ports),
        readiness_probe: Some(health_probe(http_port_id)),
        // Only runs on graceful shutdown; a crashed pod keeps its checkpoint db
        lifecycle: Some(Lifecycle {
            pre_stop: Some(LifecycleHandler {
                exec: Some(ExecAction {
                    command: Some(vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        format!("rm -rf {CHECKPOINT_DB_MOUNT_PATH}/*"),
                    ]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        volume_mounts: Some(volumes.iter().map(CollectorVolume::to_mount).collect()),
        ..Default::default()
    }
}

pub fn build_daemon_set(
    attrs: &ObjectAttributes,
    namespace: &str,
    service_account_name: &str,
    config_map_name: &str,
    ports: Vec<ContainerPort>,
    http_port_id: &str,
    image: &str,
) -> DaemonSet {
    let volumes = collector_volumes(config_map_name);

    let pod_spec = PodSpec {
        service_account_name: Some(service_account_name.to_string()),
        containers: vec![build_container(image, ports, http_port_id, &volumes)],
        volumes: Some(volumes.iter().map(CollectorVolume::to_volume).collect()),
        ..Default::default()
    };

    DaemonSet {
        metadata: object_meta(attrs, Some(namespace)),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(attrs.labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(attrs.labels.clone()),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Label selector string matching the pods a daemon set manages
pub fn daemon_set_pod_selector(daemon_set: &DaemonSet) -> Option<String> {
    let labels = daemon_set
        .spec
        .as_ref()?
        .selector
        .match_labels
        .as_ref()
        .filter(|labels| !labels.is_empty())?;
    Some(
        labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(","),
    )
}
