//! Error types for collector provisioning and maintenance

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::collector::types::{ResourceKind, ResourceRef};

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// The addressed object does not exist
    #[error("{kind} '{name}' not found")]
    NotFound { kind: ResourceKind, name: String },

    /// Invalid settings or parameters
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Collector config template failed to render
    #[error("Template rendering error: {0}")]
    RenderError(#[from] tera::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// A unique collector identity could not be produced
    #[error("Failed to generate collector identity: {0}")]
    IdentityError(String),

    /// A backend call failed; carries what was being attempted
    #[error("Failed to {operation} {resource}: {source}")]
    OperationFailed {
        operation: &'static str,
        resource: String,
        #[source]
        source: Box<Error>,
    },

    /// No managed pod reported ready within the polling budget
    #[error(
        "Timed out after {attempts} attempt(s) ({elapsed:?}) waiting for a ready pod of daemon set '{daemon_set}'"
    )]
    ReadinessTimeout {
        daemon_set: String,
        attempts: u32,
        elapsed: Duration,
    },

    /// A pod did not disappear within the allowed time
    #[error("Timed out after {timeout:?} waiting for pod '{pod}' to terminate")]
    TerminationTimeout { pod: String, timeout: Duration },

    /// Watching an object for a condition failed
    #[error("Wait error: {0}")]
    WaitError(#[from] kube::runtime::wait::Error),

    /// The caller asked us to stop
    #[error("Cancelled while {0}")]
    Cancelled(String),

    /// Cleanup has nothing to target
    #[error("No pods found for logs collector daemon set '{name}' in namespace '{namespace}'")]
    NoManagedPods { namespace: String, name: String },

    /// A command executed on a node did not succeed
    #[error("Command on node '{node}' failed: {message}")]
    NodeCommandFailed { node: String, message: String },

    /// Provisioning failed and the created resources were rolled back
    #[error("Provisioning aborted: {cause}{}", orphan_suffix(.orphaned))]
    ProvisionAborted {
        #[source]
        cause: Box<Error>,
        orphaned: Vec<OrphanedResource>,
    },

    /// Cleanup failed after the daemon set was evicted from every node
    #[error(
        "Cleanup of daemon set '{name}' in namespace '{namespace}' failed with scheduling suspended: {cause}"
    )]
    SchedulingSuspended {
        namespace: String,
        name: String,
        #[source]
        cause: Box<Error>,
    },
}

impl Error {
    /// True if the error means "the object is already gone"
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::KubeError(kube::Error::Api(e)) => e.code == 404,
            Error::OperationFailed { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Resources a failed provisioning call could not remove
    pub fn orphaned_resources(&self) -> &[OrphanedResource] {
        match self {
            Error::ProvisionAborted { orphaned, .. } => orphaned,
            _ => &[],
        }
    }

    /// Wrap a backend failure with the operation and resource it concerned
    pub fn during(self, operation: &'static str, resource: impl fmt::Display) -> Self {
        Error::OperationFailed {
            operation,
            resource: resource.to_string(),
            source: Box::new(self),
        }
    }
}

fn orphan_suffix(orphaned: &[OrphanedResource]) -> String {
    if orphaned.is_empty() {
        String::new()
    } else {
        format!(" ({} resource(s) require manual removal)", orphaned.len())
    }
}

/// A resource that could not be removed during rollback or teardown
///
/// Returned through the error channel so remediation tooling can act on it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrphanedResource {
    pub resource: ResourceRef,
    pub cause: String,
}

impl fmt::Display for OrphanedResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ACTION REQUIRED: You'll need to manually remove the logs collector {} (removal failed: {})",
            self.resource, self.cause
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16) -> Error {
        Error::KubeError(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Test".to_string(),
            code,
        }))
    }

    #[test]
    fn test_not_found_detection() {
        assert!(api_error(404).is_not_found());
        assert!(!api_error(500).is_not_found());
        assert!(Error::NotFound {
            kind: ResourceKind::ConfigMap,
            name: "cfg".to_string()
        }
        .is_not_found());
        assert!(api_error(404).during("delete", "thing").is_not_found());
    }

    #[test]
    fn test_operation_failed_names_resource() {
        let resource = ResourceRef::namespaced(ResourceKind::DaemonSet, "logs", "collector");
        let err = api_error(500).during("create", &resource);
        let msg = err.to_string();
        assert!(msg.contains("Failed to create DaemonSet 'collector' in namespace 'logs'"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_orphaned_resources_reported() {
        let orphan = OrphanedResource {
            resource: ResourceRef::cluster_scoped(ResourceKind::ClusterRole, "reader"),
            cause: "forbidden".to_string(),
        };
        let err = Error::ProvisionAborted {
            cause: Box::new(Error::ConfigError("bad".to_string())),
            orphaned: vec![orphan.clone()],
        };
        assert_eq!(err.orphaned_resources(), &[orphan.clone()]);
        assert!(err.to_string().contains("1 resource(s) require manual removal"));
        assert!(orphan.to_string().starts_with("ACTION REQUIRED"));
        assert!(orphan.to_string().contains("ClusterRole 'reader'"));
    }
}
