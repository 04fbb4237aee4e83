// # File Host
//
// Host model backed by a JSON inventory file.
//
// ## Purpose
//
// Lets an external agent (configuration management, a test harness, a
// sidecar that owns the real network stack) publish endpoints for the
// provider to manage. The file is re-read on every scan.
//
// ## Writes
//
// State changes rewrite the inventory:
//
// - Atomic writes: the new document goes to a `.tmp` file, then is renamed
// - Backup: the previous document is kept as `.backup`
// - Entries the provider cannot parse are written back untouched
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "endpoints": [
//     {
//       "interface": "eth0",
//       "protocol": "IPv4",
//       "address": "192.0.2.10",
//       "prefix_length": 24,
//       "admin_status": "Enabled",
//       "operational_status": "Up"
//     }
//   ]
// }
// ```

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::Error;
use crate::config::BackendConfig;
use crate::model::{AdminStatus, EndpointKey};
use crate::traits::{BackendFactory, Capabilities, EndpointFact, EndpointSource, ScanReport, StateChanger};

/// Inventory format version
const INVENTORY_VERSION: &str = "1.0";

/// File-backed host model
#[derive(Debug)]
pub struct FileHost {
    path: PathBuf,
    /// Serialises read-modify-write cycles
    write_lock: Mutex<()>,
}

impl FileHost {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the whole inventory with `facts`
    pub async fn write_inventory(&self, facts: &[EndpointFact]) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let document = serde_json::json!({
            "version": INVENTORY_VERSION,
            "endpoints": serde_json::to_value(facts)?,
        });
        self.write_document(&document).await
    }

    async fn read_document(&self) -> Result<Value, Error> {
        let content = fs::read_to_string(&self.path).await.map_err(|e| {
            Error::source_unavailable(format!(
                "Failed to read inventory {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let document: Value = serde_json::from_str(&content).map_err(|e| {
            Error::source_unavailable(format!(
                "Failed to parse inventory {}: {}",
                self.path.display(),
                e
            ))
        })?;

        match document.get("version").and_then(Value::as_str) {
            Some(INVENTORY_VERSION) => {}
            other => warn!(
                "Inventory version mismatch: expected {}, got {:?}. Reading anyway.",
                INVENTORY_VERSION, other
            ),
        }

        Ok(document)
    }

    /// Write `document` atomically, keeping the previous file as backup
    async fn write_document(&self, document: &Value) -> Result<(), Error> {
        let json = serde_json::to_string_pretty(document)?;

        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::internal(format!(
                    "Failed to create temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.write_all(json.as_bytes()).await.map_err(|e| {
                Error::internal(format!(
                    "Failed to write temp file {}: {}",
                    temp_path.display(),
                    e
                ))
            })?;
            file.flush().await?;
        }

        if fs::try_exists(&self.path).await.unwrap_or(false) {
            if let Err(e) = fs::copy(&self.path, self.backup_path()).await {
                warn!("Failed to create inventory backup: {}", e);
            }
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::internal(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        trace!("Inventory written to {}", self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(&self) -> PathBuf {
        let mut backup = self.path.clone();
        backup.set_extension("backup");
        backup
    }
}

/// Parse an inventory document
///
/// Entries that do not parse are counted as skipped.
fn parse_inventory(document: &Value) -> Result<ScanReport, Error> {
    let entries = document
        .get("endpoints")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::source_unavailable("inventory has no 'endpoints' array"))?;

    let mut report = ScanReport::default();
    for (index, entry) in entries.iter().enumerate() {
        match serde_json::from_value::<EndpointFact>(entry.clone()) {
            Ok(fact) => report.facts.push(fact),
            Err(e) => {
                debug!("Skipping inventory entry {}: {}", index, e);
                report.skipped += 1;
            }
        }
    }
    Ok(report)
}

fn describes(entry: &Value, key: &EndpointKey) -> bool {
    serde_json::from_value::<EndpointFact>(entry.clone())
        .map(|f| f.interface == key.interface && f.protocol == key.protocol)
        .unwrap_or(false)
}

#[async_trait]
impl EndpointSource for FileHost {
    async fn scan(&self) -> Result<ScanReport, Error> {
        let document = self.read_document().await?;
        parse_inventory(&document)
    }

    fn source_name(&self) -> &'static str {
        "file"
    }
}

#[async_trait]
impl StateChanger for FileHost {
    async fn apply_state(&self, key: &EndpointKey, target: AdminStatus) -> Result<(), Error> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.read_document().await?;

        let entry = document
            .get_mut("endpoints")
            .and_then(Value::as_array_mut)
            .and_then(|entries| entries.iter_mut().find(|e| describes(e, key)))
            .ok_or_else(|| Error::not_found(format!("{} is not in the inventory", key)))?;
        entry["admin_status"] = serde_json::to_value(target)?;

        self.write_document(&document).await?;
        debug!("Inventory: {} set to {}", key, target);
        Ok(())
    }

    fn changer_name(&self) -> &'static str {
        "file"
    }
}

/// Factory for [`FileHost`]
pub struct FileFactory;

impl BackendFactory for FileFactory {
    fn create(&self, config: &BackendConfig) -> Result<Capabilities, Error> {
        match config {
            BackendConfig::File { path } => Ok(Capabilities::from_host(Arc::new(FileHost::new(path)))),
            other => Err(Error::config(format!(
                "file backend cannot be built from '{}' configuration",
                other.type_name()
            ))),
        }
    }
}
