// # Memory Host
//
// In-process host model implementing both host capabilities.
//
// ## When to Use
//
// - Tests and demos
// - Containers without access to the host network stack
// - Embedding the provider in front of an inventory kept elsewhere
//
// State changes take effect immediately and are visible to the next scan.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

use crate::Error;
use crate::config::BackendConfig;
use crate::model::{AdminStatus, EndpointKey, ProtocolType};
use crate::traits::{BackendFactory, Capabilities, EndpointFact, EndpointSource, ScanReport, StateChanger};

type Slot = (String, ProtocolType);

/// In-memory host model
///
/// # Example
///
/// ```rust,no_run
/// use ipep_core::backend::MemoryHost;
/// use ipep_core::model::{AdminStatus, ProtocolType};
/// use ipep_core::traits::{EndpointFact, EndpointSource};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let host = MemoryHost::new(vec![EndpointFact::new(
///         "eth0",
///         ProtocolType::Ipv4,
///         AdminStatus::Enabled,
///     )]);
///
///     let report = host.scan().await?;
///     assert_eq!(report.facts.len(), 1);
///
///     Ok(())
/// }
/// ```
#[derive(Debug)]
pub struct MemoryHost {
    endpoints: RwLock<BTreeMap<Slot, EndpointFact>>,
    available: AtomicBool,
    scans: AtomicUsize,
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MemoryHost {
    /// Create a host model holding `facts`
    ///
    /// A later fact replaces an earlier one with the same interface and
    /// protocol.
    pub fn new(facts: Vec<EndpointFact>) -> Self {
        let endpoints = facts
            .into_iter()
            .map(|f| ((f.interface.clone(), f.protocol), f))
            .collect();
        Self {
            endpoints: RwLock::new(endpoints),
            available: AtomicBool::new(true),
            scans: AtomicUsize::new(0),
        }
    }

    /// Add or replace an endpoint
    pub async fn insert(&self, fact: EndpointFact) {
        self.endpoints
            .write()
            .await
            .insert((fact.interface.clone(), fact.protocol), fact);
    }

    /// Remove an endpoint from the host
    pub async fn remove(&self, interface: &str, protocol: ProtocolType) -> Option<EndpointFact> {
        self.endpoints
            .write()
            .await
            .remove(&(interface.to_string(), protocol))
    }

    /// Current host view of one endpoint
    pub async fn fact(&self, interface: &str, protocol: ProtocolType) -> Option<EndpointFact> {
        self.endpoints
            .read()
            .await
            .get(&(interface.to_string(), protocol))
            .cloned()
    }

    /// Make scans fail with `SourceUnavailable` while `false`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of scans served so far
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointSource for MemoryHost {
    async fn scan(&self) -> Result<ScanReport, Error> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::source_unavailable("memory host is offline"));
        }
        let facts = self.endpoints.read().await.values().cloned().collect();
        Ok(ScanReport::new(facts))
    }

    fn source_name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl StateChanger for MemoryHost {
    async fn apply_state(&self, key: &EndpointKey, target: AdminStatus) -> Result<(), Error> {
        let mut endpoints = self.endpoints.write().await;
        let fact = endpoints
            .get_mut(&(key.interface.clone(), key.protocol))
            .ok_or_else(|| Error::not_found(format!("{} is not present on the host", key)))?;
        debug!("Memory host: {} {} -> {}", key, fact.admin_status, target);
        fact.admin_status = target;
        Ok(())
    }

    fn supports_abort(&self) -> bool {
        true
    }

    fn changer_name(&self) -> &'static str {
        "memory"
    }
}

/// Factory for [`MemoryHost`]
pub struct MemoryFactory;

impl BackendFactory for MemoryFactory {
    fn create(&self, config: &BackendConfig) -> Result<Capabilities, Error> {
        match config {
            BackendConfig::Memory { endpoints } => Ok(Capabilities::from_host(std::sync::Arc::new(
                MemoryHost::new(endpoints.clone()),
            ))),
            other => Err(Error::config(format!(
                "memory backend cannot be built from '{}' configuration",
                other.type_name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eth0() -> EndpointKey {
        EndpointKey::new("eth0", ProtocolType::Ipv4).unwrap()
    }

    #[tokio::test]
    async fn test_apply_state_is_visible_to_next_scan() {
        let host = MemoryHost::new(vec![EndpointFact::new(
            "eth0",
            ProtocolType::Ipv4,
            AdminStatus::Disabled,
        )]);

        host.apply_state(&eth0(), AdminStatus::Enabled).await.unwrap();

        let report = host.scan().await.unwrap();
        assert_eq!(report.facts[0].admin_status, AdminStatus::Enabled);
        assert_eq!(host.scan_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_and_offline_host() {
        let host = MemoryHost::new(Vec::new());
        assert!(matches!(
            host.apply_state(&eth0(), AdminStatus::Enabled).await,
            Err(Error::NotFound(_))
        ));

        host.set_available(false);
        assert!(matches!(host.scan().await, Err(Error::SourceUnavailable(_))));
    }
}
