//! Instance mapper
//!
//! Converts between repository instances and the framework's property-bag
//! representation. [`project`] is the read direction; the `*_from_external`
//! helpers parse framework input for the mutation handler.

use serde_json::Value;
use std::net::IpAddr;

use crate::error::{Error, Result};
use crate::model::{AdminStatus, EndpointInstance, EndpointKey, ProtocolType};
use crate::properties::{self as props, ExternalInstance, PropertySet};

/// CIM `ProtocolIFType` value for IPv4
const IF_TYPE_IPV4: u64 = 4096;
/// CIM `ProtocolIFType` value for IPv6
const IF_TYPE_IPV6: u64 = 4097;

/// Project an instance into its external representation
///
/// `keys_only` wins over `property_set`; an empty `property_set` selects
/// every property; names the provider does not know are ignored.
pub fn project(instance: &EndpointInstance, property_set: &PropertySet, keys_only: bool) -> ExternalInstance {
    let mut out = ExternalInstance::new();

    for name in props::ALL_PROPERTIES {
        let wanted = if keys_only {
            props::is_key_property(name)
        } else {
            property_set.selects(name)
        };
        if wanted {
            out.set(name, property_value(instance, name));
        }
    }

    out
}

/// Current value of one known property
fn property_value(instance: &EndpointInstance, name: &str) -> Value {
    match name {
        props::NAME => Value::from(instance.key.interface.clone()),
        props::PROTOCOL_IF_TYPE => Value::from(instance.key.protocol.as_str()),
        props::ADDRESS_FAMILY => Value::from(instance.address_family.as_str()),
        props::IP_ADDRESS => instance
            .address
            .map(|a| Value::from(a.to_string()))
            .unwrap_or(Value::Null),
        props::PREFIX_LENGTH => instance.prefix_length.map(Value::from).unwrap_or(Value::Null),
        props::DESCRIPTION => instance
            .description
            .clone()
            .map(Value::from)
            .unwrap_or(Value::Null),
        props::ENABLED_STATE => Value::from(instance.admin_status.code()),
        props::OPERATIONAL_STATUS => Value::from(instance.operational_status.as_str()),
        props::REVISION => Value::from(instance.revision),
        _ => Value::Null,
    }
}

/// Extract the endpoint key from an instance's key properties
pub fn key_from_external(instance: &ExternalInstance) -> Result<EndpointKey> {
    let name = match instance.get(props::NAME) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(Error::invalid_key(format!("{} must be a string, got {}", props::NAME, other)));
        }
        None => return Err(Error::invalid_key(format!("missing key property {}", props::NAME))),
    };

    let protocol = match instance.get(props::PROTOCOL_IF_TYPE) {
        Some(value) => protocol_from_value(value)?,
        None => {
            return Err(Error::invalid_key(format!(
                "missing key property {}",
                props::PROTOCOL_IF_TYPE
            )));
        }
    };

    EndpointKey::new(name, protocol)
}

/// Parse a `ProtocolIFType` value, textual ("IPv4") or numeric (4096)
pub fn protocol_from_value(value: &Value) -> Result<ProtocolType> {
    match value {
        Value::String(s) => s.parse::<ProtocolType>(),
        Value::Number(n) => match n.as_u64() {
            Some(IF_TYPE_IPV4) => Ok(ProtocolType::Ipv4),
            Some(IF_TYPE_IPV6) => Ok(ProtocolType::Ipv6),
            _ => Err(Error::invalid_key(format!(
                "unsupported {} value {}",
                props::PROTOCOL_IF_TYPE,
                n
            ))),
        },
        other => Err(Error::invalid_key(format!(
            "{} must be a string or number, got {}",
            props::PROTOCOL_IF_TYPE,
            other
        ))),
    }
}

/// Requested changes to writable properties
///
/// The outer `Option` says whether the property was supplied, the inner one
/// whether it was set to null.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WritableChanges {
    pub address: Option<Option<IpAddr>>,
    pub prefix_length: Option<Option<u8>>,
    pub description: Option<Option<String>>,
}

impl WritableChanges {
    pub fn is_empty(&self) -> bool {
        self.address.is_none() && self.prefix_length.is_none() && self.description.is_none()
    }

    /// Apply onto a copy of `current` and validate the result
    pub fn applied_to(&self, current: &EndpointInstance) -> Result<EndpointInstance> {
        let mut next = current.clone();
        if let Some(address) = &self.address {
            next.address = *address;
        }
        if let Some(prefix) = &self.prefix_length {
            next.prefix_length = *prefix;
        }
        if let Some(description) = &self.description {
            next.description = description.clone();
        }
        next.validate()?;
        Ok(next)
    }
}

/// Parse the writable properties of `values` selected by `property_set`
///
/// Read-only properties are accepted only when they carry the current value;
/// key properties and `Revision` are checked by the caller.
pub fn changes_from_external(
    values: &ExternalInstance,
    property_set: &PropertySet,
    current: &EndpointInstance,
) -> Result<WritableChanges> {
    let mut changes = WritableChanges::default();

    for (name, value) in values.iter() {
        if props::is_key_property(name)
            || name.eq_ignore_ascii_case(props::REVISION)
            || !property_set.selects(name)
        {
            continue;
        }

        if name.eq_ignore_ascii_case(props::IP_ADDRESS) {
            changes.address = Some(parse_address(value)?);
        } else if name.eq_ignore_ascii_case(props::PREFIX_LENGTH) {
            changes.prefix_length = Some(parse_prefix(value)?);
        } else if name.eq_ignore_ascii_case(props::DESCRIPTION) {
            changes.description = Some(parse_description(value)?);
        } else if let Some(read_only) = [
            props::ADDRESS_FAMILY,
            props::ENABLED_STATE,
            props::OPERATIONAL_STATUS,
        ]
        .into_iter()
        .find(|p| p.eq_ignore_ascii_case(name))
        {
            if *value != property_value(current, read_only) {
                return Err(Error::invalid_property(format!(
                    "{} is read-only{}",
                    read_only,
                    if read_only == props::ENABLED_STATE {
                        "; use RequestStateChange"
                    } else {
                        ""
                    }
                )));
            }
        }
    }

    Ok(changes)
}

/// Build a new instance (revision 0) from a create request
pub fn instance_from_external(values: &ExternalInstance) -> Result<EndpointInstance> {
    let key = key_from_external(values)?;
    let mut instance = EndpointInstance::new(key);

    if let Some(value) = values.get(props::ADDRESS_FAMILY) {
        if *value != Value::from(instance.address_family.as_str()) {
            return Err(Error::invalid_property(format!(
                "{} {} does not match protocol {}",
                props::ADDRESS_FAMILY,
                value,
                instance.key.protocol
            )));
        }
    }

    if let Some(value) = values.get(props::ENABLED_STATE) {
        instance.admin_status = parse_enabled_state(value)?;
    }

    let changes = changes_from_external(
        &without(values, &[props::ADDRESS_FAMILY, props::ENABLED_STATE, props::OPERATIONAL_STATUS]),
        &PropertySet::all(),
        &instance,
    )?;
    changes.applied_to(&instance)
}

fn without(values: &ExternalInstance, names: &[&str]) -> ExternalInstance {
    let mut out = values.clone();
    out.properties
        .retain(|k, _| !names.iter().any(|n| n.eq_ignore_ascii_case(k)));
    out
}

fn parse_address(value: &Value) -> Result<Option<IpAddr>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => s
            .parse::<IpAddr>()
            .map(Some)
            .map_err(|e| Error::invalid_property(format!("{} '{}': {}", props::IP_ADDRESS, s, e))),
        other => Err(Error::invalid_property(format!(
            "{} must be a string, got {}",
            props::IP_ADDRESS,
            other
        ))),
    }
}

fn parse_prefix(value: &Value) -> Result<Option<u8>> {
    match value {
        Value::Null => Ok(None),
        Value::Number(n) => n
            .as_u64()
            .and_then(|v| u8::try_from(v).ok())
            .map(Some)
            .ok_or_else(|| Error::invalid_property(format!("{} {} out of range", props::PREFIX_LENGTH, n))),
        other => Err(Error::invalid_property(format!(
            "{} must be a number, got {}",
            props::PREFIX_LENGTH,
            other
        ))),
    }
}

fn parse_description(value: &Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        other => Err(Error::invalid_property(format!(
            "{} must be a string, got {}",
            props::DESCRIPTION,
            other
        ))),
    }
}

fn parse_enabled_state(value: &Value) -> Result<AdminStatus> {
    value
        .as_u64()
        .and_then(|v| u16::try_from(v).ok())
        .and_then(AdminStatus::from_code)
        .ok_or_else(|| Error::invalid_property(format!("unsupported {} {}", props::ENABLED_STATE, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OperationalStatus;

    fn eth0() -> EndpointInstance {
        EndpointInstance::new(EndpointKey::new("eth0", ProtocolType::Ipv4).unwrap())
            .with_address("192.168.1.10".parse().unwrap(), 24)
            .with_admin_status(AdminStatus::Enabled)
            .with_operational_status(OperationalStatus::Up)
    }

    #[test]
    fn test_project_all_properties() {
        let out = project(&eth0(), &PropertySet::all(), false);
        assert_eq!(out.len(), props::ALL_PROPERTIES.len());
        assert_eq!(out.get_str(props::IP_ADDRESS), Some("192.168.1.10"));
        assert_eq!(out.get(props::ENABLED_STATE), Some(&Value::from(2)));
        assert_eq!(out.get(props::DESCRIPTION), Some(&Value::Null));
    }

    #[test]
    fn test_project_keys_only_ignores_property_set() {
        let out = project(&eth0(), &PropertySet::of([props::IP_ADDRESS]), true);
        assert_eq!(out.len(), 2);
        assert_eq!(out.get_str(props::NAME), Some("eth0"));
        assert_eq!(out.get_str(props::PROTOCOL_IF_TYPE), Some("IPv4"));
    }

    #[test]
    fn test_project_ignores_unknown_names() {
        let out = project(&eth0(), &PropertySet::of(["PrefixLength", "NoSuchProperty"]), false);
        assert_eq!(out.len(), 1);
        assert_eq!(out.get(props::PREFIX_LENGTH), Some(&Value::from(24)));
    }

    #[test]
    fn test_key_from_external_accepts_numeric_if_type() {
        let instance = ExternalInstance::new().with(props::NAME, "eth1").with(props::PROTOCOL_IF_TYPE, 4097);
        let key = key_from_external(&instance).unwrap();
        assert_eq!(key.protocol, ProtocolType::Ipv6);

        let missing = ExternalInstance::new().with(props::NAME, "eth1");
        assert!(matches!(key_from_external(&missing), Err(Error::InvalidKey(_))));
    }

    #[test]
    fn test_changes_reject_read_only_change() {
        let current = eth0();
        let values = ExternalInstance::new().with(props::ENABLED_STATE, 3);
        let err = changes_from_external(&values, &PropertySet::all(), &current).unwrap_err();
        assert!(matches!(err, Error::InvalidProperty(_)));

        // Echoing the current value back is fine
        let echoed = ExternalInstance::new().with(props::ENABLED_STATE, 2);
        assert!(changes_from_external(&echoed, &PropertySet::all(), &current).unwrap().is_empty());
    }

    #[test]
    fn test_instance_from_external() {
        let values = ExternalInstance::new()
            .with(props::NAME, "br0")
            .with(props::PROTOCOL_IF_TYPE, "IPv4")
            .with(props::IP_ADDRESS, "10.1.0.1")
            .with(props::PREFIX_LENGTH, 16)
            .with(props::ENABLED_STATE, 3);

        let instance = instance_from_external(&values).unwrap();
        assert_eq!(instance.revision, 0);
        assert_eq!(instance.admin_status, AdminStatus::Disabled);
        assert_eq!(instance.prefix_length, Some(16));

        let bad = values.clone().with(props::IP_ADDRESS, "fe80::1");
        assert!(matches!(instance_from_external(&bad), Err(Error::InvalidProperty(_))));
    }
}
