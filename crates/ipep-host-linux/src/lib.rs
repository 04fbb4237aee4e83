// # Linux Host Backend
//
// iproute2-based host access for Linux systems.
//
// ## Scanning
//
// Each scan runs `ip -json addr show` and turns every link into one
// endpoint per IP family that carries at least one address:
//
// - Admin status: `UP` in the link flags → Enabled, otherwise Disabled
// - Operational status: the link's `operstate`
// - Address: the first non-link-local address of the family, falling back
//   to the first address
//
// Link objects that cannot be parsed are counted as skipped. A failed or
// non-zero `ip` invocation makes the whole scan `SourceUnavailable`.
//
// ## State Changes
//
// `ip link set dev <name> up|down`. Administrative status is a link
// property, so enabling `eth0/IPv4` also enables `eth0/IPv6`. Testing is
// not supported. Child processes are killed when an operation is
// abandoned.
//
// ## Platform Support
//
// The factory refuses to build on anything but Linux.

use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;
use std::process::Output;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, trace};

use ipep_core::config::BackendConfig;
use ipep_core::model::{AdminStatus, EndpointKey, OperationalStatus, ProtocolType};
use ipep_core::registry::BackendRegistry;
use ipep_core::traits::{BackendFactory, Capabilities, EndpointFact, EndpointSource, ScanReport, StateChanger};
use ipep_core::{Error, Result};

/// One link object from `ip -json addr show`
#[derive(Debug, Deserialize)]
struct IpLink {
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    operstate: Option<String>,
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    family: String,
    local: IpAddr,
    prefixlen: u8,
    #[serde(default)]
    scope: Option<String>,
}

fn operational_status(operstate: Option<&str>) -> OperationalStatus {
    match operstate {
        Some("UP") => OperationalStatus::Up,
        Some("DOWN") => OperationalStatus::Down,
        Some("DORMANT") => OperationalStatus::Dormant,
        Some("LOWERLAYERDOWN") => OperationalStatus::LowerLayerDown,
        _ => OperationalStatus::Unknown,
    }
}

fn protocol(family: &str) -> Option<ProtocolType> {
    match family {
        "inet" => Some(ProtocolType::Ipv4),
        "inet6" => Some(ProtocolType::Ipv6),
        _ => None,
    }
}

impl IpLink {
    fn into_facts(self) -> Vec<EndpointFact> {
        let admin_status = if self.flags.iter().any(|f| f == "UP") {
            AdminStatus::Enabled
        } else {
            AdminStatus::Disabled
        };
        let oper = operational_status(self.operstate.as_deref());

        [ProtocolType::Ipv4, ProtocolType::Ipv6]
            .into_iter()
            .filter_map(|proto| {
                let mut addrs = self
                    .addr_info
                    .iter()
                    .filter(|a| protocol(&a.family) == Some(proto));
                let first = addrs.clone().next()?;
                let primary = addrs
                    .find(|a| a.scope.as_deref() != Some("link"))
                    .unwrap_or(first);
                Some(
                    EndpointFact::new(self.ifname.clone(), proto, admin_status)
                        .with_address(primary.local, primary.prefixlen)
                        .with_operational_status(oper),
                )
            })
            .collect()
    }
}

/// Parse the output of `ip -json addr show`
///
/// # Errors
///
/// `SourceUnavailable` if the output is not a JSON array.
pub fn parse_ip_addr_json(output: &str) -> Result<ScanReport> {
    let links: Vec<serde_json::Value> = serde_json::from_str(output)
        .map_err(|e| Error::source_unavailable(format!("unreadable `ip -json` output: {}", e)))?;

    let mut report = ScanReport::default();
    for link in links {
        match serde_json::from_value::<IpLink>(link) {
            Ok(link) => report.facts.extend(link.into_facts()),
            Err(e) => {
                debug!("Skipping link object: {}", e);
                report.skipped += 1;
            }
        }
    }
    Ok(report)
}

/// iproute2-backed host
#[derive(Debug, Clone)]
pub struct LinuxHost {
    ip_binary: String,
}

impl LinuxHost {
    pub fn new(ip_binary: impl Into<String>) -> Self {
        Self {
            ip_binary: ip_binary.into(),
        }
    }

    async fn run(&self, args: &[&str]) -> std::io::Result<Output> {
        trace!("Running {} {}", self.ip_binary, args.join(" "));
        Command::new(&self.ip_binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
    }
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

#[async_trait]
impl EndpointSource for LinuxHost {
    async fn scan(&self) -> Result<ScanReport> {
        let output = self.run(&["-json", "addr", "show"]).await.map_err(|e| {
            Error::source_unavailable(format!("failed to run {}: {}", self.ip_binary, e))
        })?;
        if !output.status.success() {
            return Err(Error::source_unavailable(format!(
                "{} addr show exited with {}: {}",
                self.ip_binary,
                output.status,
                stderr_of(&output)
            )));
        }
        parse_ip_addr_json(&String::from_utf8_lossy(&output.stdout))
    }

    fn source_name(&self) -> &'static str {
        "linux"
    }
}

#[async_trait]
impl StateChanger for LinuxHost {
    async fn apply_state(&self, key: &EndpointKey, target: AdminStatus) -> Result<()> {
        let verb = match target {
            AdminStatus::Enabled => "up",
            AdminStatus::Disabled => "down",
            other => {
                return Err(Error::unsupported(format!(
                    "linux backend cannot move {} to {}",
                    key, other
                )));
            }
        };

        let output = self
            .run(&["link", "set", "dev", &key.interface, verb])
            .await
            .map_err(|e| Error::internal(format!("failed to run {}: {}", self.ip_binary, e)))?;
        if !output.status.success() {
            return Err(Error::internal(format!(
                "ip link set dev {} {} exited with {}: {}",
                key.interface,
                verb,
                output.status,
                stderr_of(&output)
            )));
        }
        debug!("Link {} set {}", key.interface, verb);
        Ok(())
    }

    fn supports_abort(&self) -> bool {
        true
    }

    fn changer_name(&self) -> &'static str {
        "linux"
    }
}

/// Factory for creating [`LinuxHost`] backends
pub struct LinuxFactory;

impl BackendFactory for LinuxFactory {
    fn create(&self, config: &BackendConfig) -> Result<Capabilities> {
        if !cfg!(target_os = "linux") {
            return Err(Error::config("Linux backend is only supported on Linux"));
        }
        match config {
            BackendConfig::Linux { ip_binary } => {
                Ok(Capabilities::from_host(Arc::new(LinuxHost::new(ip_binary.clone()))))
            }
            _ => Err(Error::config("Invalid config for Linux backend")),
        }
    }
}

/// Register the Linux backend with a registry
pub fn register(registry: &BackendRegistry) {
    registry.register_backend("linux", Box::new(LinuxFactory));
}
