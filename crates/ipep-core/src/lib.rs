// # ipep-core
//
// Core library for the IP protocol endpoint management provider.
//
// ## Architecture Overview
//
// The provider exposes host network-protocol endpoints (one per interface
// and IP protocol) as `SCX_IPProtocolEndpoint` instances:
// - **EndpointSource**: Trait for reading the host's current endpoints
// - **StateChanger**: Trait for enabling/disabling/testing an endpoint
// - **InstanceRepository**: Last-known instances with staleness tracking
// - **MutationHandler**: Create/modify/delete with idempotent retries
// - **StateChangeEngine**: `RequestStateChange` as tracked async jobs
// - **EndpointProvider**: The facade the management framework calls
// - **BackendRegistry**: Plugin-based registry for host backends
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Core logic is separate from host access
// 2. **Confirmed State**: A state change completes only once a fresh scan shows it
// 3. **Plugin-Based**: Backends are registered dynamically, no hard-coded if-else
// 4. **Library-First**: All core functionality can be used as a library
// 5. **Idempotency**: Retried mutations return the prior result

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod mapper;
pub mod model;
pub mod mutation;
pub mod properties;
pub mod provider;
pub mod reconciler;
pub mod registry;
pub mod repository;
pub mod traits;

// Re-export core types for convenience
pub use backend::{FileHost, MemoryHost};
pub use config::{BackendConfig, ProviderConfig};
pub use engine::{JobHandle, JobId, JobState, JobStatus, StateChangeEngine};
pub use error::{Error, Result};
pub use events::ProviderEvent;
pub use model::{AdminStatus, EndpointInstance, EndpointKey, OperationalStatus, ProtocolType};
pub use mutation::{MutationHandler, MutationOutcome};
pub use properties::{ExternalInstance, PropertySet};
pub use provider::EndpointProvider;
pub use registry::BackendRegistry;
pub use repository::InstanceRepository;
pub use traits::{Capabilities, EndpointSource, ManagementProvider, StateChanger};
