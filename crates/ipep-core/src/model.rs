//! Endpoint data model
//!
//! An endpoint is one host interface paired with one IP protocol
//! (`eth0` over IPv4, `eth0` over IPv6, ...). The repository stores one
//! [`EndpointInstance`] per [`EndpointKey`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// IP protocol carried by an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ProtocolType {
    #[serde(rename = "IPv4")]
    Ipv4,
    #[serde(rename = "IPv6")]
    Ipv6,
}

impl ProtocolType {
    /// Canonical textual form (`"IPv4"` / `"IPv6"`)
    pub fn as_str(&self) -> &'static str {
        match self {
            ProtocolType::Ipv4 => "IPv4",
            ProtocolType::Ipv6 => "IPv6",
        }
    }

    /// Address family implied by this protocol
    pub fn address_family(&self) -> AddressFamily {
        match self {
            ProtocolType::Ipv4 => AddressFamily::Ipv4,
            ProtocolType::Ipv6 => AddressFamily::Ipv6,
        }
    }

    /// Largest valid prefix length for this protocol
    pub fn max_prefix_length(&self) -> u8 {
        match self {
            ProtocolType::Ipv4 => 32,
            ProtocolType::Ipv6 => 128,
        }
    }

    /// Whether `addr` belongs to this protocol
    pub fn matches(&self, addr: &IpAddr) -> bool {
        matches!(
            (self, addr),
            (ProtocolType::Ipv4, IpAddr::V4(_)) | (ProtocolType::Ipv6, IpAddr::V6(_))
        )
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ipv4" | "inet" | "4" => Ok(ProtocolType::Ipv4),
            "ipv6" | "inet6" | "6" => Ok(ProtocolType::Ipv6),
            other => Err(crate::Error::invalid_key(format!(
                "unknown protocol type '{}'",
                other
            ))),
        }
    }
}

/// Address family of an endpoint's address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    #[serde(rename = "IPv4")]
    Ipv4,
    #[serde(rename = "IPv6")]
    Ipv6,
}

impl AddressFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressFamily::Ipv4 => "IPv4",
            AddressFamily::Ipv6 => "IPv6",
        }
    }
}

/// Stable identity of an endpoint: (interface name, protocol type)
///
/// Ordered by interface name, then protocol, which gives `List` its
/// deterministic order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EndpointKey {
    pub interface: String,
    pub protocol: ProtocolType,
}

impl EndpointKey {
    /// Create a key, rejecting empty or whitespace-bearing interface names
    pub fn new(interface: impl Into<String>, protocol: ProtocolType) -> crate::Result<Self> {
        let interface = interface.into();
        if interface.is_empty() {
            return Err(crate::Error::invalid_key("interface name is empty"));
        }
        if interface.chars().any(char::is_whitespace) {
            return Err(crate::Error::invalid_key(format!(
                "interface name '{}' contains whitespace",
                interface
            )));
        }
        Ok(Self {
            interface,
            protocol,
        })
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.interface, self.protocol)
    }
}

/// Administrative status of an endpoint
///
/// Numeric codes follow the CIM `EnabledState` convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdminStatus {
    Enabled,
    Disabled,
    Testing,
    Unknown,
}

impl AdminStatus {
    /// CIM `EnabledState` value
    pub fn code(&self) -> u16 {
        match self {
            AdminStatus::Unknown => 0,
            AdminStatus::Enabled => 2,
            AdminStatus::Disabled => 3,
            AdminStatus::Testing => 7,
        }
    }

    /// Parse a CIM `EnabledState`/`RequestedState` value
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(AdminStatus::Unknown),
            2 => Some(AdminStatus::Enabled),
            3 => Some(AdminStatus::Disabled),
            7 => Some(AdminStatus::Testing),
            _ => None,
        }
    }

    /// Whether a state-change job may move an endpoint from `self` to `target`
    pub fn can_transition_to(&self, target: AdminStatus) -> bool {
        use AdminStatus::*;
        matches!(
            (self, target),
            (Disabled, Enabled)
                | (Enabled, Disabled)
                | (Enabled, Testing)
                | (Testing, Enabled)
                | (Testing, Disabled)
        )
    }
}

impl fmt::Display for AdminStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdminStatus::Enabled => "Enabled",
            AdminStatus::Disabled => "Disabled",
            AdminStatus::Testing => "Testing",
            AdminStatus::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Operational (link-level) status as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationalStatus {
    Up,
    Down,
    Dormant,
    LowerLayerDown,
    Unknown,
}

impl OperationalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationalStatus::Up => "Up",
            OperationalStatus::Down => "Down",
            OperationalStatus::Dormant => "Dormant",
            OperationalStatus::LowerLayerDown => "LowerLayerDown",
            OperationalStatus::Unknown => "Unknown",
        }
    }
}

/// Last-known data for one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInstance {
    pub key: EndpointKey,
    pub address_family: AddressFamily,
    pub address: Option<IpAddr>,
    pub prefix_length: Option<u8>,
    pub description: Option<String>,
    pub admin_status: AdminStatus,
    pub operational_status: OperationalStatus,
    /// Bumped once per accepted mutation
    pub revision: u64,
}

impl EndpointInstance {
    /// Create an instance with unknown status and no address
    pub fn new(key: EndpointKey) -> Self {
        Self {
            address_family: key.protocol.address_family(),
            key,
            address: None,
            prefix_length: None,
            description: None,
            admin_status: AdminStatus::Unknown,
            operational_status: OperationalStatus::Unknown,
            revision: 0,
        }
    }

    pub fn with_address(mut self, address: IpAddr, prefix_length: u8) -> Self {
        self.address = Some(address);
        self.prefix_length = Some(prefix_length);
        self
    }

    pub fn with_admin_status(mut self, status: AdminStatus) -> Self {
        self.admin_status = status;
        self
    }

    pub fn with_operational_status(mut self, status: OperationalStatus) -> Self {
        self.operational_status = status;
        self
    }

    /// Whether any non-key, non-revision field differs from `other`
    pub fn differs_from(&self, other: &EndpointInstance) -> bool {
        self.address_family != other.address_family
            || self.address != other.address
            || self.prefix_length != other.prefix_length
            || self.description != other.description
            || self.admin_status != other.admin_status
            || self.operational_status != other.operational_status
    }

    /// Check address/prefix consistency against the key's protocol
    pub fn validate(&self) -> crate::Result<()> {
        if let Some(addr) = &self.address {
            if !self.key.protocol.matches(addr) {
                return Err(crate::Error::invalid_property(format!(
                    "address {} does not belong to protocol {}",
                    addr, self.key.protocol
                )));
            }
        }
        if let Some(prefix) = self.prefix_length {
            if prefix > self.key.protocol.max_prefix_length() {
                return Err(crate::Error::invalid_property(format!(
                    "prefix length {} exceeds {} for {}",
                    prefix,
                    self.key.protocol.max_prefix_length(),
                    self.key.protocol
                )));
            }
        }
        Ok(())
    }
}
