//! Plugin-based backend registry
//!
//! The registry maps backend type names to factories, so host backends can
//! be added at runtime without hardcoded if-else chains.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ipep_core::registry::BackendRegistry;
//! use ipep_core::config::BackendConfig;
//!
//! // Built-in backends (memory, file) are registered up front
//! let registry = BackendRegistry::with_builtin();
//!
//! // Platform backends register themselves
//! ipep_host_linux::register(&registry);
//!
//! let capabilities = registry.create_capabilities(&BackendConfig::Linux {
//!     ip_binary: "ip".to_string(),
//! })?;
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

use crate::backend::{FileFactory, MemoryFactory};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::traits::{BackendFactory, Capabilities};

/// Registry of host backend factories
///
/// ## Thread Safety
///
/// Interior mutability with `RwLock`: concurrent lookups, exclusive
/// registration.
#[derive(Default)]
pub struct BackendRegistry {
    backends: RwLock<HashMap<String, Arc<dyn BackendFactory>>>,
}

impl BackendRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in backends registered
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register_builtin();
        registry
    }

    /// Register the `memory` and `file` backends
    pub fn register_builtin(&self) {
        self.register_backend("memory", Box::new(MemoryFactory));
        self.register_backend("file", Box::new(FileFactory));
    }

    /// Register a backend factory, replacing any previous one of that name
    pub fn register_backend(&self, name: impl Into<String>, factory: Box<dyn BackendFactory>) {
        let name = name.into();
        debug!("Registering backend '{}'", name);
        self.backends
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::from(factory));
    }

    /// Build host capabilities from configuration
    ///
    /// # Errors
    ///
    /// `Config` if no factory is registered for the backend type, or
    /// whatever the factory reports.
    pub fn create_capabilities(&self, config: &BackendConfig) -> Result<Capabilities> {
        let backend_type = config.type_name();
        let factory = self
            .backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(backend_type)
            .cloned()
            .ok_or_else(|| Error::config(format!("Unknown backend type: {}", backend_type)))?;

        factory.create(config)
    }

    /// Registered backend type names, sorted
    pub fn list_backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn has_backend(&self, name: &str) -> bool {
        self.backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}
