//! Logs collector provisioning and maintenance
//!
//! [`LogsCollectorProvisioner`] creates a collector deployment as an
//! all-or-nothing unit; [`CheckpointCleaner`] later wipes the collector's
//! on-node checkpoint database without leaving it unscheduled on success.

pub mod cancel;
pub mod cleanup;
pub mod naming;
pub mod provisioner;
pub mod readiness;
pub mod render;
pub mod resources;
pub mod rollback;
pub mod types;

pub use cancel::{CancelHandle, CancelSignal};
pub use cleanup::{CheckpointCleaner, CleanupOptions, CleanupReport, CleanupSession};
pub use naming::{
    collector_selector, DefaultAttributesProvider, IdentitySource, ObjectAttributes,
    ObjectAttributesProvider, UuidIdentitySource,
};
pub use provisioner::{LogsCollectorProvisioner, ProvisionParams, ProvisionedCollector};
pub use readiness::{wait_until_ready, DaemonHealth, PollPolicy};
pub use render::{ConfigRenderer, FluentBitRenderer};
pub use rollback::{find_collector_resources, RollbackReport, RollbackStack, Teardown};
pub use types::{
    CollectorGuid, Filter, FilterParam, Parser, ParserParam, PortSpec, ResourceKind, ResourceRef,
    ResourceSet, TransportProtocol,
};
