// # Endpoint Source Trait
//
// Defines the interface for reading the host's current IP protocol endpoints.
//
// ## Implementations
//
// - In-memory host model: `backend::MemoryHost`
// - JSON inventory file: `backend::FileHost`
// - iproute2 (Linux): `ipep-host-linux` crate
//
// ## Usage
//
// ```rust,ignore
// use ipep_core::EndpointSource;
//
// #[tokio::main]
// async fn main() -> anyhow::Result<()> {
//     let source = /* EndpointSource implementation */;
//
//     let report = source.scan().await?;
//     for fact in &report.facts {
//         println!("{} {:?}", fact.key()?, fact.admin_status);
//     }
//     if report.skipped > 0 {
//         println!("{} entries could not be read", report.skipped);
//     }
//
//     Ok(())
// }
// ```

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::model::{AdminStatus, EndpointInstance, EndpointKey, OperationalStatus, ProtocolType};

/// One raw observation of a host endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointFact {
    /// Interface name (e.g. "eth0")
    pub interface: String,
    /// Protocol carried on the interface
    pub protocol: ProtocolType,
    /// Primary address for this protocol, if any
    #[serde(default)]
    pub address: Option<IpAddr>,
    /// Prefix length of `address`
    #[serde(default)]
    pub prefix_length: Option<u8>,
    /// Administrative (configured) status
    pub admin_status: AdminStatus,
    /// Operational (link) status
    #[serde(default = "default_operational_status")]
    pub operational_status: OperationalStatus,
}

fn default_operational_status() -> OperationalStatus {
    OperationalStatus::Unknown
}

impl EndpointFact {
    /// Create a fact with no address and unknown operational status
    pub fn new(interface: impl Into<String>, protocol: ProtocolType, admin_status: AdminStatus) -> Self {
        Self {
            interface: interface.into(),
            protocol,
            address: None,
            prefix_length: None,
            admin_status,
            operational_status: OperationalStatus::Unknown,
        }
    }

    pub fn with_address(mut self, address: IpAddr, prefix_length: u8) -> Self {
        self.address = Some(address);
        self.prefix_length = Some(prefix_length);
        self
    }

    pub fn with_operational_status(mut self, status: OperationalStatus) -> Self {
        self.operational_status = status;
        self
    }

    /// Key identifying the endpoint this fact describes
    pub fn key(&self) -> crate::Result<EndpointKey> {
        EndpointKey::new(self.interface.clone(), self.protocol)
    }

    /// Build a fresh instance (revision 0) from this fact
    ///
    /// The description is not host-reported, so it stays empty. A fact
    /// whose address or prefix does not fit its protocol is rejected with
    /// `InvalidProperty`.
    pub fn to_instance(&self) -> crate::Result<EndpointInstance> {
        let mut instance = EndpointInstance::new(self.key()?)
            .with_admin_status(self.admin_status)
            .with_operational_status(self.operational_status);
        instance.address = self.address;
        instance.prefix_length = self.prefix_length;
        instance.validate()?;
        Ok(instance)
    }
}

/// Result of one scan of the host
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Endpoints that were read successfully
    pub facts: Vec<EndpointFact>,
    /// Number of entries that could not be read
    pub skipped: usize,
}

impl ScanReport {
    pub fn new(facts: Vec<EndpointFact>) -> Self {
        Self { facts, skipped: 0 }
    }

    /// Whether some host entries were unreadable
    pub fn is_partial(&self) -> bool {
        self.skipped > 0
    }
}

/// Trait for host endpoint inventory implementations
///
/// # Contract
///
/// - Every call to [`scan()`](EndpointSource::scan) performs a fresh read.
///   Implementations MUST NOT cache results between calls.
/// - A scan that cannot read the host at all fails with
///   [`Error::SourceUnavailable`](crate::Error::SourceUnavailable).
/// - A scan where only some entries are unreadable succeeds, returning the
///   readable subset and counting the rest in [`ScanReport::skipped`].
///   The caller decides whether a partial scan is acceptable.
///
/// # Trust Level: Semi-Trusted
///
/// Sources perform platform I/O (processes, files, sockets) but never
/// touch the instance repository, never decide when to scan and never
/// retry on their own.
#[async_trait]
pub trait EndpointSource: Send + Sync {
    /// Read the host's current endpoints
    async fn scan(&self) -> Result<ScanReport, crate::Error>;

    /// Get the source name (for logging/debugging)
    fn source_name(&self) -> &'static str;
}
