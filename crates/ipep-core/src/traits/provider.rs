// # Management Provider Trait
//
// The entry surface the management framework calls, and the capability set
// a resource type plugs into it.
//
// A resource type is added by supplying a `Capabilities` set:
//
// - Snapshot: an `EndpointSource` that reads the host inventory
// - StateChange: a `StateChanger` that drives administrative status
// - Mutate: provided by the core (repository + mutation handler)
//
// Framework requests identify instances the way the framework does: by an
// instance whose key properties are set. Results are returned directly
// (or as a job handle) instead of through callback continuations.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::JobHandle;
use crate::mutation::MutationOutcome;
use crate::properties::{ExternalInstance, InstanceFilter, PropertySet};
use crate::traits::{EndpointSource, StateChanger};

/// Host capabilities a provider is built from
#[derive(Clone)]
pub struct Capabilities {
    /// Snapshot capability
    pub source: Arc<dyn EndpointSource>,
    /// State-change capability
    pub changer: Arc<dyn StateChanger>,
}

impl Capabilities {
    pub fn new(source: Arc<dyn EndpointSource>, changer: Arc<dyn StateChanger>) -> Self {
        Self { source, changer }
    }

    /// Build from one object implementing both host capabilities
    pub fn from_host<H>(host: Arc<H>) -> Self
    where
        H: EndpointSource + StateChanger + 'static,
    {
        Self {
            source: host.clone(),
            changer: host,
        }
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("source", &self.source.source_name())
            .field("changer", &self.changer.changer_name())
            .finish()
    }
}

/// Helper trait for constructing capabilities from configuration
pub trait BackendFactory: Send + Sync {
    /// Create a capability set from configuration
    ///
    /// # Parameters
    ///
    /// - `config`: Configuration specific to this backend
    fn create(&self, config: &crate::config::BackendConfig) -> Result<Capabilities, crate::Error>;
}

/// Entry points invoked by the management framework
///
/// Lifecycle: an implementation is created by its type's `load`
/// constructor and torn down by [`unload()`](ManagementProvider::unload).
/// All methods may be called concurrently.
#[async_trait]
pub trait ManagementProvider: Send + Sync {
    /// Class name of the managed resource
    fn class_name(&self) -> &'static str;

    /// Enumerate instances
    ///
    /// `filter` is applied after projection.
    async fn enumerate_instances(
        &self,
        property_set: &PropertySet,
        keys_only: bool,
        filter: Option<&InstanceFilter>,
    ) -> Result<Vec<ExternalInstance>, crate::Error>;

    /// Get one instance identified by its key properties
    async fn get_instance(
        &self,
        instance_name: &ExternalInstance,
        property_set: &PropertySet,
    ) -> Result<ExternalInstance, crate::Error>;

    /// Create an instance
    async fn create_instance(&self, new_instance: &ExternalInstance) -> Result<MutationOutcome, crate::Error>;

    /// Modify the properties of `instance_name` selected by `property_set`
    async fn modify_instance(
        &self,
        instance_name: &ExternalInstance,
        property_set: &PropertySet,
        values: &ExternalInstance,
    ) -> Result<MutationOutcome, crate::Error>;

    /// Delete an instance
    async fn delete_instance(&self, instance_name: &ExternalInstance) -> Result<MutationOutcome, crate::Error>;

    /// Start an administrative state change
    ///
    /// `requested_state` uses CIM `RequestedState` codes (2 Enabled,
    /// 3 Disabled, 7 Test).
    async fn invoke_request_state_change(
        &self,
        instance_name: &ExternalInstance,
        requested_state: u16,
        deadline: Option<Duration>,
    ) -> Result<JobHandle, crate::Error>;

    /// Tear down the provider, draining or cancelling in-flight jobs
    async fn unload(&self) -> Result<(), crate::Error>;
}
