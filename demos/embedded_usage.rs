//! Minimal embedding example for ipep-core
//!
//! This example demonstrates hosting the endpoint provider inside a custom
//! application with its own host implementation. The provider lifecycle is
//! fully managed by the application.

use ipep_core::config::{BackendConfig, ProviderConfig};
use ipep_core::model::{AdminStatus, EndpointKey, ProtocolType};
use ipep_core::properties::{self as props, ExternalInstance, PropertySet};
use ipep_core::traits::{Capabilities, EndpointFact, EndpointSource, ManagementProvider, ScanReport, StateChanger};
use ipep_core::{EndpointProvider, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Host whose links take a few scans to converge after a state change
struct LaggingHost {
    links: Mutex<HashMap<String, (AdminStatus, u32)>>,
}

impl LaggingHost {
    fn new() -> Self {
        let mut links = HashMap::new();
        links.insert("eth0".to_string(), (AdminStatus::Disabled, 0));
        links.insert("wlan0".to_string(), (AdminStatus::Enabled, 0));
        Self {
            links: Mutex::new(links),
        }
    }
}

#[async_trait::async_trait]
impl EndpointSource for LaggingHost {
    async fn scan(&self) -> Result<ScanReport> {
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        let mut facts = Vec::new();
        for (name, (status, lag)) in links.iter_mut() {
            // Report the old status until the lag has elapsed
            let reported = if *lag > 0 {
                *lag -= 1;
                match status {
                    AdminStatus::Enabled => AdminStatus::Disabled,
                    _ => AdminStatus::Enabled,
                }
            } else {
                *status
            };
            facts.push(EndpointFact::new(name.clone(), ProtocolType::Ipv4, reported));
        }
        Ok(ScanReport::new(facts))
    }

    fn source_name(&self) -> &'static str {
        "lagging"
    }
}

#[async_trait::async_trait]
impl StateChanger for LaggingHost {
    async fn apply_state(&self, key: &EndpointKey, target: AdminStatus) -> Result<()> {
        println!("[Host] {} -> {} (converges after 2 scans)", key, target);
        let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
        links.insert(key.interface.clone(), (target, 2));
        Ok(())
    }

    fn changer_name(&self) -> &'static str {
        "lagging"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Embedded ipep-core Example ===\n");

    let host = std::sync::Arc::new(LaggingHost::new());
    let mut config = ProviderConfig::new(BackendConfig::Custom {
        factory: "lagging".to_string(),
        config: serde_json::json!({}),
    });
    config.jobs.confirm_poll_interval_ms = 50;

    println!("1. Loading provider...");
    let (provider, mut event_rx) =
        EndpointProvider::load(Capabilities::from_host(host), config).await?;

    let event_listener = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            println!("[Event] {:?}", event);
        }
    });

    println!("\n2. Enumerating endpoints (keys only)...");
    for instance in provider
        .enumerate_instances(&PropertySet::all(), true, None)
        .await?
    {
        println!("   {:?}", instance.properties);
    }

    println!("\n3. Describing eth0...");
    let eth0 = ExternalInstance::new()
        .with(props::NAME, "eth0")
        .with(props::PROTOCOL_IF_TYPE, "IPv4");
    let outcome = provider
        .modify_instance(
            &eth0,
            &PropertySet::of([props::DESCRIPTION]),
            &ExternalInstance::new().with(props::DESCRIPTION, "uplink"),
        )
        .await?;
    println!("   revision now {}", outcome.revision);

    println!("\n4. Enabling eth0 (RequestedState 2)...");
    let job = provider
        .invoke_request_state_change(&eth0, AdminStatus::Enabled.code(), Some(Duration::from_secs(5)))
        .await?;
    job.outcome().await?;
    println!("   job {} completed", job.id());

    let current = provider
        .get_instance(&eth0, &PropertySet::of([props::ENABLED_STATE, props::DESCRIPTION]))
        .await?;
    println!("   {:?}", current.properties);

    println!("\n5. Unloading provider...");
    provider.unload().await?;
    drop(provider);
    let _ = tokio::time::timeout(Duration::from_millis(100), event_listener).await;

    println!("\n=== Embedding Successful ===");
    println!("Key Points:");
    println!("- Provider lifecycle is fully controlled by the application");
    println!("- The host only issues operations; completion is confirmed by re-scanning");
    println!("- All host access is custom (not ipepd defaults)");

    Ok(())
}
