// # ipepd - IP Protocol Endpoint Provider Daemon
//
// Thin integration layer hosting an `EndpointProvider`. All provider logic
// lives in ipep-core.
//
// The ipepd daemon is responsible for:
// 1. Reading configuration from environment variables
// 2. Initializing logging and the runtime
// 3. Registering host backends
// 4. Loading the provider and logging its events until shutdown
// 5. Unloading the provider on SIGTERM/SIGINT
//
// ## Configuration
//
// All configuration is done via environment variables:
//
// ### Backend
// - `IPEP_BACKEND`: Host backend (linux, file, memory)
// - `IPEP_FILE_PATH`: Inventory file (for file)
// - `IPEP_IP_BINARY`: iproute2 binary (for linux, default `ip`)
//
// ### Provider
// - `IPEP_RECONCILE_INTERVAL_SECS`: Seconds between background scans
// - `IPEP_STALE_PURGE_AFTER`: Reconciles a stale endpoint survives
// - `IPEP_JOB_DEADLINE_SECS`: Default state-change deadline
//
// ### Logging
// - `IPEP_LOG_LEVEL`: trace, debug, info, warn, error
//
// ## Example
//
// ```bash
// export IPEP_BACKEND=file
// export IPEP_FILE_PATH=/var/lib/ipep/endpoints.json
// export IPEP_RECONCILE_INTERVAL_SECS=15
//
// ipepd
// ```

use anyhow::{Context, Result};
use std::env;
use std::process::ExitCode;
use std::str::FromStr;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{Level, debug, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use ipep_core::config::{BackendConfig, ProviderConfig};
use ipep_core::{BackendRegistry, EndpointProvider, JobState, ProviderEvent};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy)]
enum IpepExitCode {
    CleanShutdown = 0,
    ConfigError = 1,
    RuntimeError = 2,
}

impl From<IpepExitCode> for ExitCode {
    fn from(code: IpepExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Application configuration
struct Config {
    backend: String,
    file_path: Option<String>,
    ip_binary: String,
    reconcile_interval_secs: Option<u64>,
    stale_purge_after: Option<u32>,
    job_deadline_secs: Option<u64>,
    log_level: String,
}

/// Read an optional numeric variable, rejecting unparsable values
fn env_number<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env::var(name)
        .ok()
        .map(|s| s.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{} must be a number", name))
}

impl Config {
    /// Load configuration from environment variables
    fn from_env() -> Result<Self> {
        Ok(Self {
            backend: env::var("IPEP_BACKEND").unwrap_or_else(|_| "linux".to_string()),
            file_path: env::var("IPEP_FILE_PATH").ok(),
            ip_binary: env::var("IPEP_IP_BINARY").unwrap_or_else(|_| "ip".to_string()),
            reconcile_interval_secs: env_number("IPEP_RECONCILE_INTERVAL_SECS")?,
            stale_purge_after: env_number("IPEP_STALE_PURGE_AFTER")?,
            job_deadline_secs: env_number("IPEP_JOB_DEADLINE_SECS")?,
            log_level: env::var("IPEP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    /// Validate the configuration
    fn validate(&self) -> Result<()> {
        match self.backend.as_str() {
            "linux" | "file" | "memory" => {}
            _ => anyhow::bail!(
                "IPEP_BACKEND '{}' is not supported. \
                Supported backends: linux, file, memory",
                self.backend
            ),
        }

        if self.backend == "file" {
            match self.file_path.as_deref() {
                None | Some("") => anyhow::bail!(
                    "IPEP_FILE_PATH is required when IPEP_BACKEND=file. \
                    Set it via: export IPEP_FILE_PATH=/var/lib/ipep/endpoints.json"
                ),
                Some(path) => {
                    if let Some(parent) = std::path::Path::new(path).parent()
                        && !parent.as_os_str().is_empty()
                        && !parent.exists()
                    {
                        anyhow::bail!(
                            "IPEP_FILE_PATH parent directory does not exist: {}",
                            parent.display()
                        );
                    }
                }
            }
        }

        if self.backend == "linux" && self.ip_binary.trim().is_empty() {
            anyhow::bail!("IPEP_IP_BINARY cannot be empty");
        }

        if let Some(interval) = self.reconcile_interval_secs
            && !(1..=3600).contains(&interval)
        {
            anyhow::bail!(
                "IPEP_RECONCILE_INTERVAL_SECS must be between 1 and 3600 seconds. Got: {}",
                interval
            );
        }

        if let Some(purge_after) = self.stale_purge_after
            && !(1..=100).contains(&purge_after)
        {
            anyhow::bail!(
                "IPEP_STALE_PURGE_AFTER must be between 1 and 100. Got: {}",
                purge_after
            );
        }

        if let Some(deadline) = self.job_deadline_secs
            && !(1..=3600).contains(&deadline)
        {
            anyhow::bail!(
                "IPEP_JOB_DEADLINE_SECS must be between 1 and 3600 seconds. Got: {}",
                deadline
            );
        }

        match self.log_level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => anyhow::bail!(
                "IPEP_LOG_LEVEL '{}' is not valid. \
                Valid levels: trace, debug, info, warn, error",
                self.log_level
            ),
        }

        Ok(())
    }

    /// Build the provider configuration
    fn provider_config(&self) -> ProviderConfig {
        let backend = match self.backend.as_str() {
            "file" => BackendConfig::File {
                path: self.file_path.clone().unwrap_or_default(),
            },
            "memory" => BackendConfig::default(),
            _ => BackendConfig::Linux {
                ip_binary: self.ip_binary.clone(),
            },
        };

        let mut config = ProviderConfig::new(backend);
        if let Some(interval) = self.reconcile_interval_secs {
            config.reconcile.interval_secs = interval;
        }
        if let Some(purge_after) = self.stale_purge_after {
            config.reconcile.purge_after = purge_after;
        }
        if let Some(deadline) = self.job_deadline_secs {
            config.jobs.default_deadline_ms = deadline * 1000;
        }
        config
    }
}

fn main() -> ExitCode {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            return IpepExitCode::ConfigError.into();
        }
    };

    if let Err(e) = config.validate() {
        eprintln!("Configuration validation error: {}", e);
        return IpepExitCode::ConfigError.into();
    }

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
        return IpepExitCode::ConfigError.into();
    }

    info!("Starting ipepd daemon (backend {})", config.backend);

    let rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return IpepExitCode::RuntimeError.into();
        }
    };

    let result = rt.block_on(async {
        if let Err(e) = run_daemon(config).await {
            error!("Daemon error: {:#}", e);
            IpepExitCode::RuntimeError
        } else {
            IpepExitCode::CleanShutdown
        }
    });

    result.into()
}

/// Run the daemon
async fn run_daemon(config: Config) -> Result<()> {
    let registry = BackendRegistry::with_builtin();

    #[cfg(feature = "linux")]
    {
        info!("Registering Linux backend");
        ipep_host_linux::register(&registry);
    }

    debug!("Registered backends: {:?}", registry.list_backends());

    let provider_config = config.provider_config();
    let capabilities = registry
        .create_capabilities(&provider_config.backend)
        .with_context(|| format!("cannot create backend '{}'", config.backend))?;

    let (provider, events) = EndpointProvider::load(capabilities, provider_config)
        .await
        .context("provider failed to load")?;

    let logger = tokio::spawn(log_events(events));

    info!("Provider loaded, waiting for shutdown signal");
    let signal = wait_for_shutdown().await?;
    info!("Received shutdown signal: {}", signal);

    provider.unload().await.context("provider failed to unload")?;
    drop(provider);

    if let Err(e) = logger.await {
        warn!("Event logger ended abnormally: {}", e);
    }

    info!("Daemon stopped");
    Ok(())
}

/// Log provider events until the provider is dropped
async fn log_events(events: tokio::sync::mpsc::Receiver<ProviderEvent>) {
    let mut events = ReceiverStream::new(events);
    while let Some(event) = events.next().await {
        match event {
            ProviderEvent::Loaded { backend, endpoints } => {
                info!("Loaded: backend {}, {} endpoints", backend, endpoints)
            }
            ProviderEvent::Reconciled { summary } => debug!("Reconciled: {:?}", summary),
            ProviderEvent::ScanFailed { error } => warn!("Scan failed: {}", error),
            ProviderEvent::ScanRejected { skipped } => {
                warn!("Partial scan discarded ({} unreadable)", skipped)
            }
            ProviderEvent::JobStateChanged { job, key, state } => match state {
                JobState::Failed(reason) => warn!("Job {} on {} failed: {}", job, key, reason),
                state => info!("Job {} on {}: {}", job, key, state),
            },
            ProviderEvent::Unloaded { aborted_jobs } => {
                info!("Unloaded ({} jobs aborted)", aborted_jobs)
            }
        }
    }
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
///
/// Returns the name of the signal received.
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGTERM handler: {}", e))?;
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow::anyhow!("Failed to setup SIGINT handler: {}", e))?;

    let received = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(received)
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to wait for CTRL-C: {}", e))?;
    Ok("SIGINT")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(backend: &str) -> Config {
        Config {
            backend: backend.to_string(),
            file_path: None,
            ip_binary: "ip".to_string(),
            reconcile_interval_secs: None,
            stale_purge_after: None,
            job_deadline_secs: None,
            log_level: "info".to_string(),
        }
    }

    #[test]
    fn test_file_backend_requires_path() {
        assert!(config("file").validate().is_err());

        let mut cfg = config("file");
        cfg.file_path = Some("endpoints.json".to_string());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_numeric_ranges() {
        let mut cfg = config("memory");
        cfg.reconcile_interval_secs = Some(0);
        assert!(cfg.validate().is_err());

        cfg.reconcile_interval_secs = Some(10);
        cfg.job_deadline_secs = Some(7200);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_provider_config_overrides() {
        let mut cfg = config("linux");
        cfg.stale_purge_after = Some(5);
        cfg.job_deadline_secs = Some(12);

        let provider = cfg.provider_config();
        assert_eq!(provider.backend.type_name(), "linux");
        assert_eq!(provider.reconcile.purge_after, 5);
        assert_eq!(provider.jobs.default_deadline_ms, 12_000);
        assert!(provider.validate().is_ok());
    }

    #[test]
    fn test_unknown_backend_and_log_level() {
        assert!(config("netlink").validate().is_err());

        let mut cfg = config("memory");
        cfg.log_level = "verbose".to_string();
        assert!(cfg.validate().is_err());
    }
}
