//! Shared types for the logs collector
//!
//! These types describe the resources a collector deployment owns, the
//! user-supplied filter and parser rules, and the port declarations that end
//! up on the daemon's pod template.

use std::fmt;
use std::time::Duration;

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Unique identity of one collector deployment
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectorGuid(String);

impl CollectorGuid {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectorGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The six kinds of Kubernetes object a collector deployment is built from
///
/// Declaration order is creation order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Namespace,
    ServiceAccount,
    ClusterRole,
    ClusterRoleBinding,
    ConfigMap,
    DaemonSet,
}

impl ResourceKind {
    /// All kinds in dependency (creation) order
    pub const CREATION_ORDER: [ResourceKind; 6] = [
        ResourceKind::Namespace,
        ResourceKind::ServiceAccount,
        ResourceKind::ClusterRole,
        ResourceKind::ClusterRoleBinding,
        ResourceKind::ConfigMap,
        ResourceKind::DaemonSet,
    ];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Namespace => write!(f, "Namespace"),
            ResourceKind::ServiceAccount => write!(f, "ServiceAccount"),
            ResourceKind::ClusterRole => write!(f, "ClusterRole"),
            ResourceKind::ClusterRoleBinding => write!(f, "ClusterRoleBinding"),
            ResourceKind::ConfigMap => write!(f, "ConfigMap"),
            ResourceKind::DaemonSet => write!(f, "DaemonSet"),
        }
    }
}

/// Identity of a live cluster object: kind, name and (for namespaced kinds) namespace
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ResourceRef {
    pub fn cluster_scoped(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: None,
        }
    }

    pub fn namespaced(
        kind: ResourceKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Build a reference from an object returned by the API server
    pub fn of<K: ResourceExt>(kind: ResourceKind, object: &K) -> Self {
        Self {
            kind,
            name: object.name_any(),
            namespace: object.namespace(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} '{}' in namespace '{}'", self.kind, self.name, ns),
            None => write!(f, "{} '{}'", self.kind, self.name),
        }
    }
}

/// The committed set of objects backing one collector deployment
#[derive(Clone, Debug)]
pub struct ResourceSet {
    pub namespace: Namespace,
    pub service_account: ServiceAccount,
    pub cluster_role: ClusterRole,
    pub cluster_role_binding: ClusterRoleBinding,
    pub config_map: ConfigMap,
    pub daemon_set: DaemonSet,
}

impl ResourceSet {
    /// References to every member, in creation order
    pub fn refs(&self) -> Vec<ResourceRef> {
        vec![
            ResourceRef::of(ResourceKind::Namespace, &self.namespace),
            ResourceRef::of(ResourceKind::ServiceAccount, &self.service_account),
            ResourceRef::of(ResourceKind::ClusterRole, &self.cluster_role),
            ResourceRef::of(ResourceKind::ClusterRoleBinding, &self.cluster_role_binding),
            ResourceRef::of(ResourceKind::ConfigMap, &self.config_map),
            ResourceRef::of(ResourceKind::DaemonSet, &self.daemon_set),
        ]
    }
}

/// Extra `Key value` line inside a filter stanza
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterParam {
    pub key: String,
    pub value: String,
}

/// A user-supplied filter rule, rendered as one `[FILTER]` stanza
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub name: String,
    #[serde(rename = "match")]
    pub match_pattern: String,
    #[serde(default)]
    pub params: Vec<FilterParam>,
}

impl Filter {
    /// Reject values that would break out of the `[FILTER]` stanza
    pub fn validate(&self) -> Result<()> {
        check_config_token("filter name", &self.name)?;
        check_config_value("filter match", &self.match_pattern)?;
        for param in &self.params {
            check_config_token("filter param key", &param.key)?;
            check_config_value("filter param value", &param.value)?;
        }
        Ok(())
    }
}

/// Extra `Key value` line inside a parser stanza
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParserParam {
    pub key: String,
    pub value: String,
}

/// A user-supplied parser rule, rendered as one `[PARSER]` stanza
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parser {
    pub name: String,
    pub format: String,
    #[serde(default)]
    pub params: Vec<ParserParam>,
}

impl Parser {
    /// Reject values that would break out of the `[PARSER]` stanza
    pub fn validate(&self) -> Result<()> {
        check_config_token("parser name", &self.name)?;
        check_config_token("parser format", &self.format)?;
        for param in &self.params {
            check_config_token("parser param key", &param.key)?;
            check_config_value("parser param value", &param.value)?;
        }
        Ok(())
    }
}

/// A config value may contain spaces but no newline or other control character
pub(crate) fn check_config_value(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::ConfigError(format!("{what} must not be empty")));
    }
    if value.chars().any(char::is_control) {
        return Err(Error::ConfigError(format!(
            "{what} {value:?} contains a control character"
        )));
    }
    Ok(())
}

/// Names and keys are single words
fn check_config_token(what: &str, value: &str) -> Result<()> {
    check_config_value(what, value)?;
    if value.chars().any(char::is_whitespace) {
        return Err(Error::ConfigError(format!(
            "{what} {value:?} must not contain whitespace"
        )));
    }
    Ok(())
}

/// Transport protocol of a declared port
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportProtocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
}

impl TransportProtocol {
    /// The protocol string Kubernetes expects on a container port
    pub fn as_kubernetes_str(self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Udp => "UDP",
            TransportProtocol::Sctp => "SCTP",
        }
    }
}

/// A logical port the collector listens on
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortSpec {
    pub number: u16,
    pub transport: TransportProtocol,
    pub application_protocol: Option<String>,
    /// How long a caller should wait for the port to open; `None` means no wait rule
    pub wait: Option<Duration>,
}

impl PortSpec {
    pub fn new(
        number: u16,
        transport: TransportProtocol,
        application_protocol: Option<&str>,
        wait: Option<Duration>,
    ) -> Result<Self> {
        if number == 0 {
            return Err(Error::ConfigError(
                "port number must be non-zero".to_string(),
            ));
        }
        Ok(Self {
            number,
            transport,
            application_protocol: application_protocol.map(str::to_string),
            wait,
        })
    }
}
