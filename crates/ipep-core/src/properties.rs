//! Externally visible instance representation
//!
//! The management framework sees endpoints as property bags
//! ([`ExternalInstance`]) and selects properties with a [`PropertySet`].
//! Property names are matched case-insensitively.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Class name reported on every instance
pub const CLASS_NAME: &str = "SCX_IPProtocolEndpoint";

/// Key: interface name
pub const NAME: &str = "Name";
/// Key: protocol type ("IPv4" / "IPv6")
pub const PROTOCOL_IF_TYPE: &str = "ProtocolIFType";
pub const ADDRESS_FAMILY: &str = "AddressFamily";
pub const IP_ADDRESS: &str = "IPAddress";
pub const PREFIX_LENGTH: &str = "PrefixLength";
pub const DESCRIPTION: &str = "Description";
/// Numeric administrative status (CIM `EnabledState`)
pub const ENABLED_STATE: &str = "EnabledState";
pub const OPERATIONAL_STATUS: &str = "OperationalStatus";
/// Revision counter, doubles as optimistic-concurrency token on modify
pub const REVISION: &str = "Revision";

/// Key properties, in canonical order
pub const KEY_PROPERTIES: [&str; 2] = [NAME, PROTOCOL_IF_TYPE];

/// Every property the provider knows about, in output order
pub const ALL_PROPERTIES: [&str; 9] = [
    NAME,
    PROTOCOL_IF_TYPE,
    ADDRESS_FAMILY,
    IP_ADDRESS,
    PREFIX_LENGTH,
    DESCRIPTION,
    ENABLED_STATE,
    OPERATIONAL_STATUS,
    REVISION,
];

/// Properties a client may change through modify/create
pub const WRITABLE_PROPERTIES: [&str; 3] = [IP_ADDRESS, PREFIX_LENGTH, DESCRIPTION];

/// Whether `name` is one of the key properties
pub fn is_key_property(name: &str) -> bool {
    KEY_PROPERTIES.iter().any(|k| k.eq_ignore_ascii_case(name))
}

/// Set of requested property names
///
/// An empty set means "all properties".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySet {
    names: BTreeSet<String>,
}

impl PropertySet {
    /// The empty set, selecting every property
    pub fn all() -> Self {
        Self::default()
    }

    /// A set selecting exactly `names`
    pub fn of<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .map(|n| n.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Whether the set selects `name` (always true for the empty set)
    pub fn selects(&self, name: &str) -> bool {
        self.names.is_empty() || self.names.contains(&name.to_ascii_lowercase())
    }
}

/// Opaque predicate supplied by the framework, applied after projection
pub type InstanceFilter = dyn Fn(&ExternalInstance) -> bool + Send + Sync;

/// Externally visible instance: class name plus ordered property bag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalInstance {
    pub class_name: String,
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl Default for ExternalInstance {
    fn default() -> Self {
        Self::new()
    }
}

impl ExternalInstance {
    pub fn new() -> Self {
        Self {
            class_name: CLASS_NAME.to_string(),
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style property setter
    pub fn with(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Set a property, replacing any existing one with the same name
    /// regardless of case
    pub fn set(&mut self, name: &str, value: impl Into<serde_json::Value>) {
        self.properties.retain(|k, _| !k.eq_ignore_ascii_case(name));
        self.properties.insert(name.to_string(), value.into());
    }

    /// Case-insensitive property lookup
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.properties
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// String property, `None` when absent or not a string
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Iterate properties as (name, value)
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.properties.iter()
    }

    pub fn len(&self) -> usize {
        self.properties.len()
    }

    pub fn is_empty(&self) -> bool {
        self.properties.is_empty()
    }
}
