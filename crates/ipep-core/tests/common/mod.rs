//! Test doubles and common utilities for architecture contract tests
//!
//! `ControlledHost` stands in for the operating system: tests seed its
//! endpoints, slow down or fail its state changes, and count how often the
//! provider touches it.

#![allow(dead_code)]

use ipep_core::config::{BackendConfig, ProviderConfig};
use ipep_core::error::{Error, Result};
use ipep_core::model::{AdminStatus, EndpointKey, ProtocolType};
use ipep_core::properties::{self as props, ExternalInstance};
use ipep_core::traits::{Capabilities, EndpointFact, EndpointSource, ScanReport, StateChanger};
use ipep_core::{EndpointProvider, ProviderEvent};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// A host whose endpoints and state-change behaviour are driven by the test
pub struct ControlledHost {
    facts: Mutex<BTreeMap<(String, ProtocolType), EndpointFact>>,
    /// How long apply_state takes (in milliseconds)
    apply_delay_ms: AtomicU64,
    /// Error message returned by every apply_state call while set
    failure: Mutex<Option<String>>,
    /// When set, apply_state reports success without changing anything
    ignore_changes: AtomicBool,
    abortable: AtomicBool,
    available: AtomicBool,
    /// Entries each scan reports as skipped
    skipped: AtomicUsize,
    scan_calls: Arc<AtomicUsize>,
    apply_calls: Arc<AtomicUsize>,
    completed_applies: Arc<AtomicUsize>,
}

impl ControlledHost {
    /// Create a host reporting `facts`
    pub fn new(facts: Vec<EndpointFact>) -> Arc<Self> {
        let host = Self {
            facts: Mutex::new(BTreeMap::new()),
            apply_delay_ms: AtomicU64::new(0),
            failure: Mutex::new(None),
            ignore_changes: AtomicBool::new(false),
            abortable: AtomicBool::new(true),
            available: AtomicBool::new(true),
            skipped: AtomicUsize::new(0),
            scan_calls: Arc::new(AtomicUsize::new(0)),
            apply_calls: Arc::new(AtomicUsize::new(0)),
            completed_applies: Arc::new(AtomicUsize::new(0)),
        };
        for fact in facts {
            host.insert(fact);
        }
        Arc::new(host)
    }

    pub fn insert(&self, fact: EndpointFact) {
        self.facts
            .lock()
            .unwrap()
            .insert((fact.interface.clone(), fact.protocol), fact);
    }

    pub fn remove(&self, interface: &str, protocol: ProtocolType) {
        self.facts
            .lock()
            .unwrap()
            .remove(&(interface.to_string(), protocol));
    }

    /// Administrative status the host currently holds for an endpoint
    pub fn admin_status(&self, interface: &str, protocol: ProtocolType) -> Option<AdminStatus> {
        self.facts
            .lock()
            .unwrap()
            .get(&(interface.to_string(), protocol))
            .map(|f| f.admin_status)
    }

    pub fn set_apply_delay(&self, delay: Duration) {
        self.apply_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_applies_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn set_ignore_changes(&self, ignore: bool) {
        self.ignore_changes.store(ignore, Ordering::SeqCst);
    }

    pub fn set_abortable(&self, abortable: bool) {
        self.abortable.store(abortable, Ordering::SeqCst);
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn set_skipped(&self, skipped: usize) {
        self.skipped.store(skipped, Ordering::SeqCst);
    }

    /// Get the number of times scan() was called
    pub fn scan_call_count(&self) -> usize {
        self.scan_calls.load(Ordering::SeqCst)
    }

    /// Get the number of times apply_state() was called
    pub fn apply_call_count(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    /// Get the number of apply_state() calls that ran to the end
    pub fn completed_apply_count(&self) -> usize {
        self.completed_applies.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl EndpointSource for ControlledHost {
    async fn scan(&self) -> Result<ScanReport> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::source_unavailable("controlled host is offline"));
        }
        let facts = self.facts.lock().unwrap().values().cloned().collect();
        let mut report = ScanReport::new(facts);
        report.skipped = self.skipped.load(Ordering::SeqCst);
        Ok(report)
    }

    fn source_name(&self) -> &'static str {
        "controlled"
    }
}

#[async_trait::async_trait]
impl StateChanger for ControlledHost {
    async fn apply_state(&self, key: &EndpointKey, target: AdminStatus) -> Result<()> {
        self.apply_calls.fetch_add(1, Ordering::SeqCst);

        let delay = self.apply_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if let Some(message) = self.failure.lock().unwrap().clone() {
            return Err(Error::internal(message));
        }

        if !self.ignore_changes.load(Ordering::SeqCst) {
            let mut facts = self.facts.lock().unwrap();
            let fact = facts
                .get_mut(&(key.interface.clone(), key.protocol))
                .ok_or_else(|| Error::not_found(key.to_string()))?;
            fact.admin_status = target;
        }

        self.completed_applies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn supports_abort(&self) -> bool {
        self.abortable.load(Ordering::SeqCst)
    }

    fn changer_name(&self) -> &'static str {
        "controlled"
    }
}

/// An IPv4 endpoint fact with an address
pub fn ipv4_fact(interface: &str, status: AdminStatus) -> EndpointFact {
    EndpointFact::new(interface, ProtocolType::Ipv4, status)
        .with_address("192.168.1.10".parse().unwrap(), 24)
}

/// Key of the IPv4 endpoint on `interface`
pub fn key(interface: &str) -> EndpointKey {
    EndpointKey::new(interface, ProtocolType::Ipv4).unwrap()
}

/// Key properties of the IPv4 endpoint on `interface`
pub fn instance_name(interface: &str) -> ExternalInstance {
    ExternalInstance::new()
        .with(props::NAME, interface)
        .with(props::PROTOCOL_IF_TYPE, "IPv4")
}

/// Configuration with fast job polling and no background reconciles
/// during a test
pub fn test_config() -> ProviderConfig {
    let mut config = ProviderConfig::new(BackendConfig::Custom {
        factory: "controlled".to_string(),
        config: serde_json::json!({}),
    });
    config.reconcile.interval_secs = 3600;
    config.jobs.default_deadline_ms = 2_000;
    config.jobs.confirm_poll_interval_ms = 5;
    config.jobs.unload_drain_timeout_ms = 200;
    config
}

/// Load a provider on top of `host`
pub async fn load_provider(
    host: &Arc<ControlledHost>,
    config: ProviderConfig,
) -> (EndpointProvider, mpsc::Receiver<ProviderEvent>) {
    EndpointProvider::load(Capabilities::from_host(host.clone()), config)
        .await
        .expect("provider loads")
}

/// Events currently queued on `rx`
pub fn drain_events(rx: &mut mpsc::Receiver<ProviderEvent>) -> Vec<ProviderEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
