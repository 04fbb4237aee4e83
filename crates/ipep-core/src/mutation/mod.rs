//! Mutation handler
//!
//! Validates create/modify/delete requests from the framework and applies
//! them to the [`InstanceRepository`].
//!
//! ## Idempotency
//!
//! The framework may deliver a request more than once. Every accepted
//! mutation records a SHA-256 fingerprint of (operation, key, payload) for
//! its key. A request whose fingerprint equals the last accepted one on
//! the same key, within the idempotency window, returns the recorded
//! outcome without touching the repository. Any other accepted mutation on
//! the key replaces the record, so create → delete → create re-executes.
//! Requests on one key hold that key's record from the replay check until
//! the outcome is recorded, so concurrent duplicates execute once.
//!
//! ## Host-managed properties
//!
//! `IPAddress` and `PrefixLength` of an endpoint the host has reported are
//! owned by the host: the next scan would overwrite them. Modifying them on
//! a discovered endpoint is `InvalidProperty`; only endpoints created by a
//! client and not yet reported by a scan accept new values.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::mapper;
use crate::model::{EndpointInstance, EndpointKey};
use crate::properties::{self as props, ExternalInstance, PropertySet};
use crate::repository::{InstanceRepository, Mutation, MutationKind, Origin};

/// Kind of accepted mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Create,
    Modify,
    Delete,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "create",
            Operation::Modify => "modify",
            Operation::Delete => "delete",
        }
    }
}

/// Result of an accepted mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationOutcome {
    pub key: EndpointKey,
    pub operation: Operation,
    /// Revision of the instance after the mutation
    pub revision: u64,
}

type Fingerprint = [u8; 32];

#[derive(Debug, Clone)]
struct Recorded {
    fingerprint: Fingerprint,
    outcome: MutationOutcome,
    at: Instant,
}

/// Last accepted mutation on one key; locked for the whole request
type RecordSlot = Arc<Mutex<Option<Recorded>>>;

/// Validates and applies client mutations
#[derive(Debug)]
pub struct MutationHandler {
    repository: Arc<InstanceRepository>,
    recent: Mutex<HashMap<EndpointKey, RecordSlot>>,
    window: Duration,
}

impl MutationHandler {
    pub fn new(repository: Arc<InstanceRepository>, idempotency_window: Duration) -> Self {
        Self {
            repository,
            recent: Mutex::new(HashMap::new()),
            window: idempotency_window,
        }
    }

    /// Create an instance
    ///
    /// # Errors
    ///
    /// - `InvalidKey`: key properties missing or malformed
    /// - `InvalidProperty`: a value is malformed
    /// - `AlreadyExists`: a live instance has the same key
    pub async fn create(&self, values: &ExternalInstance) -> Result<MutationOutcome> {
        let instance = mapper::instance_from_external(values)?;
        let key = instance.key.clone();
        let fingerprint = fingerprint(Operation::Create, &key, &serde_json::to_value(values)?);

        let slot = self.record_slot(&key).await;
        let mut record = slot.lock().await;
        if let Some(outcome) = self.replay(&record, &key, &fingerprint) {
            return Ok(outcome);
        }

        let revision = self
            .repository
            .apply(Mutation::new(key.clone(), MutationKind::Create(instance)))
            .await?;

        info!("Created endpoint {} (revision {})", key, revision);
        Ok(record_outcome(&mut record, key, Operation::Create, revision, fingerprint))
    }

    /// Modify the properties of `key` named in `property_set`
    ///
    /// The request is all-or-nothing: any invalid value, key change or
    /// read-only change rejects the whole request.
    ///
    /// # Errors
    ///
    /// - `KeyImmutable`: `values` carries a key property different from `key`
    /// - `NotFound`: no visible instance for `key`
    /// - `InvalidProperty`: malformed value, change to a read-only property,
    ///   or change to the address or prefix of a discovered endpoint
    /// - `Conflict`: supplied `Revision` is not current, or a concurrent
    ///   mutation won the race
    pub async fn modify(
        &self,
        key: &EndpointKey,
        property_set: &PropertySet,
        values: &ExternalInstance,
    ) -> Result<MutationOutcome> {
        check_key_unchanged(key, values)?;

        let payload = serde_json::json!({ "property_set": property_set, "values": values });
        let fingerprint = fingerprint(Operation::Modify, key, &payload);
        let slot = self.record_slot(key).await;
        let mut record = slot.lock().await;
        if let Some(outcome) = self.replay(&record, key, &fingerprint) {
            return Ok(outcome);
        }

        let entry = self.repository.get(key).await?;
        if entry.is_deleted() {
            return Err(Error::not_found(key.to_string()));
        }
        let current = entry.instance;

        if let Some(token) = values.get(props::REVISION) {
            let expected = token.as_u64().ok_or_else(|| {
                Error::invalid_property(format!("{} must be an unsigned integer", props::REVISION))
            })?;
            if expected != current.revision {
                return Err(Error::conflict(format!(
                    "{} is at revision {}, request expected {}",
                    key, current.revision, expected
                )));
            }
        }

        let changes = mapper::changes_from_external(values, property_set, &current)?;
        if entry.origin == Origin::Discovered {
            check_host_managed(key, &changes, &current)?;
        }
        let next = changes.applied_to(&current)?;
        if changes.is_empty() || !next.differs_from(&current) {
            debug!("Modify on {} changes nothing", key);
            return Ok(MutationOutcome {
                key: key.clone(),
                operation: Operation::Modify,
                revision: current.revision,
            });
        }

        let revision = self
            .repository
            .apply(Mutation::new(key.clone(), MutationKind::Replace(next)).expecting(current.revision))
            .await?;

        info!("Modified endpoint {} (revision {})", key, revision);
        Ok(record_outcome(&mut record, key.clone(), Operation::Modify, revision, fingerprint))
    }

    /// Logically delete `key`
    ///
    /// The instance becomes invisible immediately and is physically purged
    /// by the repository's staleness policy.
    pub async fn delete(&self, key: &EndpointKey) -> Result<MutationOutcome> {
        let fingerprint = fingerprint(Operation::Delete, key, &serde_json::Value::Null);
        let slot = self.record_slot(key).await;
        let mut record = slot.lock().await;
        if let Some(outcome) = self.replay(&record, key, &fingerprint) {
            return Ok(outcome);
        }

        let revision = self
            .repository
            .apply(Mutation::new(key.clone(), MutationKind::Tombstone))
            .await?;

        info!("Deleted endpoint {} (revision {})", key, revision);
        Ok(record_outcome(&mut record, key.clone(), Operation::Delete, revision, fingerprint))
    }

    /// Forget fingerprints older than the idempotency window
    ///
    /// Records held by an in-flight request are kept.
    pub async fn prune(&self) -> usize {
        let mut recent = self.recent.lock().await;
        let before = recent.len();
        let window = self.window;
        recent.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(record) => record.as_ref().is_some_and(|r| r.at.elapsed() < window),
                Err(_) => true,
            }
        });
        before - recent.len()
    }

    async fn record_slot(&self, key: &EndpointKey) -> RecordSlot {
        self.recent
            .lock()
            .await
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    fn replay(
        &self,
        record: &Option<Recorded>,
        key: &EndpointKey,
        fingerprint: &Fingerprint,
    ) -> Option<MutationOutcome> {
        let recorded = record.as_ref()?;
        if recorded.fingerprint == *fingerprint && recorded.at.elapsed() < self.window {
            debug!(
                "Replaying {} on {} from idempotency record",
                recorded.outcome.operation.as_str(),
                key
            );
            Some(recorded.outcome.clone())
        } else {
            None
        }
    }
}

fn record_outcome(
    record: &mut Option<Recorded>,
    key: EndpointKey,
    operation: Operation,
    revision: u64,
    fingerprint: Fingerprint,
) -> MutationOutcome {
    let outcome = MutationOutcome {
        key,
        operation,
        revision,
    };
    *record = Some(Recorded {
        fingerprint,
        outcome: outcome.clone(),
        at: Instant::now(),
    });
    outcome
}

/// Reject new address or prefix values on an endpoint the host reports
fn check_host_managed(
    key: &EndpointKey,
    changes: &mapper::WritableChanges,
    current: &EndpointInstance,
) -> Result<()> {
    if changes.address.is_some_and(|a| a != current.address) {
        return Err(Error::invalid_property(format!(
            "{} of {} is managed by the host",
            props::IP_ADDRESS,
            key
        )));
    }
    if changes.prefix_length.is_some_and(|p| p != current.prefix_length) {
        return Err(Error::invalid_property(format!(
            "{} of {} is managed by the host",
            props::PREFIX_LENGTH,
            key
        )));
    }
    Ok(())
}

/// Reject values whose key properties differ from `key`
fn check_key_unchanged(key: &EndpointKey, values: &ExternalInstance) -> Result<()> {
    if let Some(name) = values.get(props::NAME) {
        if name.as_str() != Some(key.interface.as_str()) {
            return Err(Error::key_immutable(format!(
                "{} of {} cannot change to {}",
                props::NAME,
                key,
                name
            )));
        }
    }
    if let Some(value) = values.get(props::PROTOCOL_IF_TYPE) {
        let same = mapper::protocol_from_value(value)
            .map(|p| p == key.protocol)
            .unwrap_or(false);
        if !same {
            return Err(Error::key_immutable(format!(
                "{} of {} cannot change to {}",
                props::PROTOCOL_IF_TYPE,
                key,
                value
            )));
        }
    }
    Ok(())
}

fn fingerprint(operation: Operation, key: &EndpointKey, payload: &serde_json::Value) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(operation.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(key.to_string().as_bytes());
    hasher.update([0u8]);
    hasher.update(payload.to_string().as_bytes());
    hasher.finalize().into()
}
