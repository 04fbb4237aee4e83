//! Configuration types for the endpoint provider
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};

use crate::traits::EndpointFact;

/// Main provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Host backend configuration
    pub backend: BackendConfig,

    /// Background reconciliation settings
    #[serde(default)]
    pub reconcile: ReconcileConfig,

    /// State-change job settings
    #[serde(default)]
    pub jobs: JobConfig,

    /// Mutation handler settings
    #[serde(default)]
    pub mutations: MutationConfig,

    /// Capacity of the provider event channel
    ///
    /// When full, new events are dropped (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl ProviderConfig {
    /// Create a new configuration with defaults
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            reconcile: ReconcileConfig::default(),
            jobs: JobConfig::default(),
            mutations: MutationConfig::default(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.backend.validate()?;
        self.reconcile.validate()?;
        self.jobs.validate()?;

        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }

        Ok(())
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::new(BackendConfig::default())
    }
}

/// Host backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    /// In-process host model (tests, demos, containers without host access)
    Memory {
        /// Endpoints the model starts with
        #[serde(default)]
        endpoints: Vec<EndpointFact>,
    },

    /// JSON inventory file, re-read on every scan
    File {
        /// Path to the inventory file
        path: String,
    },

    /// iproute2-based host access (Linux)
    Linux {
        /// Path or name of the `ip` binary
        #[serde(default = "default_ip_binary")]
        ip_binary: String,
    },

    /// Custom backend
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl BackendConfig {
    /// Validate the backend configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            BackendConfig::File { path } => {
                if path.is_empty() {
                    return Err(crate::Error::config("File backend path cannot be empty"));
                }
                Ok(())
            }
            BackendConfig::Linux { ip_binary } => {
                if ip_binary.is_empty() {
                    return Err(crate::Error::config("Linux backend ip binary cannot be empty"));
                }
                Ok(())
            }
            BackendConfig::Custom { factory, config } => {
                if factory.is_empty() {
                    return Err(crate::Error::config("Custom backend factory cannot be empty"));
                }
                if config.is_null() {
                    return Err(crate::Error::config("Custom backend config cannot be null"));
                }
                Ok(())
            }
            BackendConfig::Memory { .. } => Ok(()),
        }
    }

    /// Get the backend type name used for registry lookup
    pub fn type_name(&self) -> &str {
        match self {
            BackendConfig::Memory { .. } => "memory",
            BackendConfig::File { .. } => "file",
            BackendConfig::Linux { .. } => "linux",
            BackendConfig::Custom { factory, .. } => factory,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Memory {
            endpoints: Vec::new(),
        }
    }
}

/// Background reconciliation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Interval between background scans (in seconds)
    #[serde(default = "default_reconcile_interval_secs")]
    pub interval_secs: u64,

    /// Reconciliations a stale entry survives before it is purged
    #[serde(default = "default_purge_after")]
    pub purge_after: u32,

    /// Whether a scan that skipped unreadable entries is merged
    ///
    /// When `false`, partial scans are discarded and the repository keeps
    /// the last complete snapshot.
    #[serde(default = "default_accept_partial_scans")]
    pub accept_partial_scans: bool,
}

impl ReconcileConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.interval_secs == 0 {
            return Err(crate::Error::config("Reconcile interval must be > 0"));
        }
        if self.purge_after == 0 {
            return Err(crate::Error::config("Reconcile purge_after must be > 0"));
        }
        Ok(())
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval_secs(),
            purge_after: default_purge_after(),
            accept_partial_scans: default_accept_partial_scans(),
        }
    }
}

/// State-change job configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Deadline applied when a request does not carry one (in milliseconds)
    #[serde(default = "default_deadline_ms")]
    pub default_deadline_ms: u64,

    /// Delay between confirmation re-reads (in milliseconds)
    #[serde(default = "default_confirm_poll_interval_ms")]
    pub confirm_poll_interval_ms: u64,

    /// How long finished jobs stay queryable (in seconds)
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// How long unload waits for in-flight jobs before aborting them
    /// (in milliseconds)
    #[serde(default = "default_unload_drain_timeout_ms")]
    pub unload_drain_timeout_ms: u64,
}

impl JobConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.default_deadline_ms == 0 {
            return Err(crate::Error::config("Job default deadline must be > 0"));
        }
        if self.confirm_poll_interval_ms == 0 {
            return Err(crate::Error::config("Job confirm poll interval must be > 0"));
        }
        Ok(())
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            default_deadline_ms: default_deadline_ms(),
            confirm_poll_interval_ms: default_confirm_poll_interval_ms(),
            retention_secs: default_retention_secs(),
            unload_drain_timeout_ms: default_unload_drain_timeout_ms(),
        }
    }
}

/// Mutation handler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationConfig {
    /// How long a retried request is answered from the idempotency cache
    /// (in seconds)
    #[serde(default = "default_idempotency_window_secs")]
    pub idempotency_window_secs: u64,
}

impl Default for MutationConfig {
    fn default() -> Self {
        Self {
            idempotency_window_secs: default_idempotency_window_secs(),
        }
    }
}

fn default_ip_binary() -> String {
    "ip".to_string()
}

fn default_event_channel_capacity() -> usize {
    1000
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_purge_after() -> u32 {
    crate::repository::DEFAULT_PURGE_AFTER
}

fn default_accept_partial_scans() -> bool {
    true
}

fn default_deadline_ms() -> u64 {
    30_000
}

fn default_confirm_poll_interval_ms() -> u64 {
    250
}

fn default_retention_secs() -> u64 {
    300
}

fn default_unload_drain_timeout_ms() -> u64 {
    5_000
}

fn default_idempotency_window_secs() -> u64 {
    300
}
