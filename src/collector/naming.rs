//! Names, labels and annotations for collector-owned objects
//!
//! The provisioner treats the provider as opaque; [`DefaultAttributesProvider`]
//! is the implementation used by the binary.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::collector::types::{CollectorGuid, ResourceKind};
use crate::error::{Error, Result};

pub const LABEL_APP_NAME: &str = "app.kubernetes.io/name";
pub const LABEL_COMPONENT: &str = "app.kubernetes.io/component";
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_COLLECTOR_GUID: &str = "logs-collector.io/guid";
pub const ANNOTATION_RESOURCE_ROLE: &str = "logs-collector.io/resource-role";

const APP_NAME: &str = "logs-collector";
const MANAGED_BY: &str = "logs-collector-k8s";

/// Name, labels and annotations for one object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectAttributes {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

/// Deterministic naming for every role in a collector deployment
pub trait ObjectAttributesProvider: Send + Sync {
    fn attributes(&self, kind: ResourceKind, guid: &CollectorGuid) -> Result<ObjectAttributes>;
}

/// Source of fresh collector identities
pub trait IdentitySource: Send + Sync {
    fn next_guid(&self) -> Result<CollectorGuid>;
}

/// Random v4 UUIDs, hyphen-free so they fit inside DNS labels
#[derive(Clone, Copy, Debug, Default)]
pub struct UuidIdentitySource;

impl IdentitySource for UuidIdentitySource {
    fn next_guid(&self) -> Result<CollectorGuid> {
        Ok(CollectorGuid::new(Uuid::new_v4().simple().to_string()))
    }
}

/// Label selector matching every object of one collector deployment
pub fn collector_selector(guid: &CollectorGuid) -> String {
    format!("{}={}", LABEL_COLLECTOR_GUID, guid)
}

#[derive(Clone, Debug)]
pub struct DefaultAttributesProvider {
    prefix: String,
}

impl Default for DefaultAttributesProvider {
    fn default() -> Self {
        Self::new(APP_NAME)
    }
}

impl DefaultAttributesProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    fn suffix(kind: ResourceKind) -> &'static str {
        match kind {
            ResourceKind::Namespace => "ns",
            ResourceKind::ServiceAccount => "sa",
            ResourceKind::ClusterRole => "role",
            ResourceKind::ClusterRoleBinding => "binding",
            ResourceKind::ConfigMap => "config",
            ResourceKind::DaemonSet => "daemon",
        }
    }
}

impl ObjectAttributesProvider for DefaultAttributesProvider {
    fn attributes(&self, kind: ResourceKind, guid: &CollectorGuid) -> Result<ObjectAttributes> {
        // Only the first 12 hex chars: enough to be unique per cluster, short enough for 63-char names
        let short_guid: String = guid.as_str().chars().take(12).collect();
        let name = format!("{}-{}-{}", self.prefix, short_guid, Self::suffix(kind));
        validate_dns_label(&name)?;

        let labels = BTreeMap::from([
            (LABEL_APP_NAME.to_string(), APP_NAME.to_string()),
            (
                LABEL_COMPONENT.to_string(),
                Self::suffix(kind).to_string(),
            ),
            (LABEL_MANAGED_BY.to_string(), MANAGED_BY.to_string()),
            (LABEL_COLLECTOR_GUID.to_string(), guid.to_string()),
        ]);
        let annotations = BTreeMap::from([(
            ANNOTATION_RESOURCE_ROLE.to_string(),
            kind.to_string(),
        )]);

        Ok(ObjectAttributes {
            name,
            labels,
            annotations,
        })
    }
}

/// Check a name against RFC 1123 label rules
pub fn validate_dns_label(name: &str) -> Result<()> {
    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let valid_edges = name
        .chars()
        .next()
        .zip(name.chars().last())
        .map(|(first, last)| first.is_ascii_alphanumeric() && last.is_ascii_alphanumeric())
        .unwrap_or(false);

    if name.len() > 63 || !valid_chars || !valid_edges {
        return Err(Error::IdentityError(format!(
            "'{name}' is not a valid RFC 1123 label"
        )));
    }
    Ok(())
}
