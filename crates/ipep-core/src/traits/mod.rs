//! Core traits for the endpoint provider
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`EndpointSource`]: Read the host's current endpoints
//! - [`StateChanger`]: Enable/disable/test an endpoint on the host
//! - [`ManagementProvider`]: The entry surface the management framework calls

pub mod endpoint_source;
pub mod provider;
pub mod state_changer;

pub use endpoint_source::{EndpointFact, EndpointSource, ScanReport};
pub use provider::{BackendFactory, Capabilities, ManagementProvider};
pub use state_changer::StateChanger;
