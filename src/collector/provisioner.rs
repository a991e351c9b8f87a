//! Logs collector provisioning
//!
//! Creates the namespace, service account, RBAC, config map and daemon set of
//! one collector deployment in dependency order, then waits for a ready pod.
//! Either every resource is committed or everything created so far is
//! removed again before the call returns.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::ContainerPort;
use kube::ResourceExt;
use tracing::{error, info, instrument};

use crate::backend::ClusterBackend;
use crate::collector::cancel::CancelSignal;
use crate::collector::naming::{
    DefaultAttributesProvider, IdentitySource, ObjectAttributesProvider, UuidIdentitySource,
};
use crate::collector::readiness::{wait_until_ready, DaemonHealth, PollPolicy};
use crate::collector::render::{
    ConfigRenderer, FluentBitRenderer, MAIN_CONFIG_KEY, PARSER_CONFIG_KEY,
};
use crate::collector::resources::{
    build_cluster_role, build_cluster_role_binding, build_config_map, build_daemon_set,
    build_namespace, build_service_account, to_container_ports, DEFAULT_COLLECTOR_IMAGE,
};
use crate::collector::rollback::{RollbackStack, Teardown};
use crate::collector::types::{
    check_config_value, CollectorGuid, Filter, Parser, PortSpec, ResourceKind, ResourceRef, ResourceSet,
    TransportProtocol,
};
use crate::error::{Error, Result};

pub const DEFAULT_HTTP_PORT: u16 = 2020;
pub const DEFAULT_TCP_PORT: u16 = 24224;
pub const DEFAULT_HTTP_PORT_ID: &str = "http";
pub const DEFAULT_TCP_PORT_ID: &str = "tcp";

/// Inputs of one provisioning call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionParams {
    pub aggregator_host: String,
    pub aggregator_port: u16,
    /// Collector HTTP server (health and metrics)
    pub http_port: u16,
    /// Collector forward input
    pub tcp_port: u16,
    pub http_port_id: String,
    pub tcp_port_id: String,
    pub filters: Vec<Filter>,
    pub parsers: Vec<Parser>,
}

impl ProvisionParams {
    /// Default ports and port ids, no filters or parsers
    pub fn new(aggregator_host: impl Into<String>, aggregator_port: u16) -> Self {
        Self {
            aggregator_host: aggregator_host.into(),
            aggregator_port,
            http_port: DEFAULT_HTTP_PORT,
            tcp_port: DEFAULT_TCP_PORT,
            http_port_id: DEFAULT_HTTP_PORT_ID.to_string(),
            tcp_port_id: DEFAULT_TCP_PORT_ID.to_string(),
            filters: Vec::new(),
            parsers: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.aggregator_host.trim().is_empty() {
            return Err(Error::ConfigError(
                "aggregator host must not be empty".to_string(),
            ));
        }
        check_config_value("aggregator host", &self.aggregator_host)?;
        if self.aggregator_port == 0 {
            return Err(Error::ConfigError(
                "aggregator port must be non-zero".to_string(),
            ));
        }
        if self.http_port == self.tcp_port {
            return Err(Error::ConfigError(format!(
                "HTTP and TCP ports must differ (both are {})",
                self.http_port
            )));
        }
        if self.http_port_id == self.tcp_port_id {
            return Err(Error::ConfigError(format!(
                "HTTP and TCP port ids must differ (both are '{}')",
                self.http_port_id
            )));
        }
        for filter in &self.filters {
            filter.validate()?;
        }
        for parser in &self.parsers {
            parser.validate()?;
        }
        Ok(())
    }

    /// The collector's two listening ports, keyed by port id
    fn port_specs(&self) -> Result<BTreeMap<String, PortSpec>> {
        Ok(BTreeMap::from([
            (
                self.http_port_id.clone(),
                PortSpec::new(self.http_port, TransportProtocol::Tcp, None, None)?,
            ),
            (
                self.tcp_port_id.clone(),
                PortSpec::new(self.tcp_port, TransportProtocol::Tcp, None, None)?,
            ),
        ]))
    }
}

/// A committed collector deployment
#[derive(Debug)]
pub struct ProvisionedCollector {
    pub guid: CollectorGuid,
    pub resources: ResourceSet,
    pub health: DaemonHealth,
    teardown: Teardown,
}

impl ProvisionedCollector {
    /// Removes all six resources in reverse dependency order
    pub fn teardown(&self) -> &Teardown {
        &self.teardown
    }

    pub fn into_teardown(self) -> Teardown {
        self.teardown
    }
}

/// Drives collector provisioning against a [`ClusterBackend`]
pub struct LogsCollectorProvisioner {
    backend: Arc<dyn ClusterBackend>,
    attributes: Arc<dyn ObjectAttributesProvider>,
    identities: Arc<dyn IdentitySource>,
    renderer: Arc<dyn ConfigRenderer>,
    readiness: PollPolicy,
    image: String,
}

impl LogsCollectorProvisioner {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Result<Self> {
        Ok(Self {
            backend,
            attributes: Arc::new(DefaultAttributesProvider::default()),
            identities: Arc::new(UuidIdentitySource),
            renderer: Arc::new(FluentBitRenderer::new()?),
            readiness: PollPolicy::default(),
            image: DEFAULT_COLLECTOR_IMAGE.to_string(),
        })
    }

    pub fn with_attributes(mut self, attributes: Arc<dyn ObjectAttributesProvider>) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn with_identities(mut self, identities: Arc<dyn IdentitySource>) -> Self {
        self.identities = identities;
        self
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn ConfigRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn with_readiness(mut self, readiness: PollPolicy) -> Self {
        self.readiness = readiness;
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    /// Provision a fresh collector deployment
    ///
    /// On failure every resource created by this call has been removed by the
    /// time the error is returned; resources that could not be removed are
    /// listed in [`Error::orphaned_resources`].
    #[instrument(skip(self, params, cancel), fields(aggregator = %params.aggregator_host))]
    pub async fn provision(
        &self,
        params: &ProvisionParams,
        cancel: &CancelSignal,
    ) -> Result<ProvisionedCollector> {
        params.validate()?;
        let guid = self.identities.next_guid()?;
        info!("Provisioning logs collector {}", guid);

        let mut rollback = RollbackStack::new(self.backend.clone());
        let outcome = match self.create_resources(&guid, params, &mut rollback).await {
            Ok(resources) => {
                let ready = wait_until_ready(
                    self.backend.as_ref(),
                    &resources.daemon_set,
                    self.readiness,
                    cancel,
                )
                .await;
                ready.map(|health| (resources, health))
            }
            Err(e) => Err(e),
        };

        match outcome {
            Ok((resources, health)) => {
                let teardown = rollback.disarm();
                info!(
                    "Logs collector {} is ready ({} of {} pod(s) ready)",
                    guid, health.ready_pods, health.pods
                );
                Ok(ProvisionedCollector {
                    guid,
                    resources,
                    health,
                    teardown,
                })
            }
            Err(cause) => {
                error!("Provisioning logs collector {} failed: {}", guid, cause);
                let report = rollback.unwind().await;
                Err(Error::ProvisionAborted {
                    cause: Box::new(cause),
                    orphaned: report.orphaned,
                })
            }
        }
    }

    async fn create_resources(
        &self,
        guid: &CollectorGuid,
        params: &ProvisionParams,
        rollback: &mut RollbackStack,
    ) -> Result<ResourceSet> {
        let ports = to_container_ports(&params.port_specs()?)?;
        let config_data = self.render_config(params)?;

        let attrs = self.attributes.attributes(ResourceKind::Namespace, guid)?;
        let desired = build_namespace(&attrs);
        let created = self.backend.create_namespace(&desired).await;
        let namespace = track(rollback, ResourceKind::Namespace, &desired, created)?;
        let ns_name = namespace.name_any();

        let attrs = self.attributes.attributes(ResourceKind::ServiceAccount, guid)?;
        let desired = build_service_account(&attrs, &ns_name);
        let created = self.backend.create_service_account(&desired).await;
        let service_account = track(rollback, ResourceKind::ServiceAccount, &desired, created)?;

        let attrs = self.attributes.attributes(ResourceKind::ClusterRole, guid)?;
        let desired = build_cluster_role(&attrs);
        let created = self.backend.create_cluster_role(&desired).await;
        let cluster_role = track(rollback, ResourceKind::ClusterRole, &desired, created)?;

        let attrs = self
            .attributes
            .attributes(ResourceKind::ClusterRoleBinding, guid)?;
        let desired = build_cluster_role_binding(&attrs, &service_account, &cluster_role);
        let created = self.backend.create_cluster_role_binding(&desired).await;
        let cluster_role_binding =
            track(rollback, ResourceKind::ClusterRoleBinding, &desired, created)?;

        let attrs = self.attributes.attributes(ResourceKind::ConfigMap, guid)?;
        let desired = build_config_map(&attrs, &ns_name, config_data);
        let created = self.backend.create_config_map(&desired).await;
        let config_map = track(rollback, ResourceKind::ConfigMap, &desired, created)?;

        let daemon_set = self
            .create_daemon_set(
                guid,
                &ns_name,
                &service_account.name_any(),
                &config_map.name_any(),
                ports,
                &params.http_port_id,
                rollback,
            )
            .await?;

        Ok(ResourceSet {
            namespace,
            service_account,
            cluster_role,
            cluster_role_binding,
            config_map,
            daemon_set,
        })
    }

    async fn create_daemon_set(
        &self,
        guid: &CollectorGuid,
        namespace: &str,
        service_account: &str,
        config_map: &str,
        ports: Vec<ContainerPort>,
        http_port_id: &str,
        rollback: &mut RollbackStack,
    ) -> Result<DaemonSet> {
        let attrs = self.attributes.attributes(ResourceKind::DaemonSet, guid)?;
        let desired = build_daemon_set(
            &attrs,
            namespace,
            service_account,
            config_map,
            ports,
            http_port_id,
            &self.image,
        );
        let created = self.backend.create_daemon_set(&desired).await;
        track(rollback, ResourceKind::DaemonSet, &desired, created)
    }

    /// Render both config blobs, keyed the way the pod template expects
    fn render_config(&self, params: &ProvisionParams) -> Result<BTreeMap<String, String>> {
        let main = self.renderer.render_main_config(
            params.http_port,
            &params.aggregator_host,
            params.aggregator_port,
            &params.filters,
        )?;
        let parsers = self.renderer.render_parser_config(&params.parsers)?;

        Ok(BTreeMap::from([
            (MAIN_CONFIG_KEY.to_string(), main),
            (PARSER_CONFIG_KEY.to_string(), parsers),
        ]))
    }
}

/// Record a successful create on the rollback stack, or name the failed one
fn track<K: ResourceExt>(
    rollback: &mut RollbackStack,
    kind: ResourceKind,
    desired: &K,
    created: Result<K>,
) -> Result<K> {
    let resource = ResourceRef::of(kind, desired);
    let created = created.map_err(|e| e.during("create", &resource))?;
    info!("Created {}", resource);
    rollback.push(resource);
    Ok(created)
}
