//! Instance repository
//!
//! In-memory map from [`EndpointKey`] to the last-known instance data.
//!
//! ## Locking
//!
//! Each key owns its own slot mutex. The outer map lock is held only long
//! enough to find or insert a slot, so operations on different keys never
//! wait on each other. Reconciles are serialised against each other (so
//! staleness ages exactly once per reconcile) but not against reads or
//! mutations.
//!
//! ## Staleness
//!
//! ```text
//!            missing from scan                 N more scans
//!   live ─────────────────────▶ Stale(Missing) ─────────────▶ purged
//!     ▲                             │
//!     └──────── reappears ──────────┘
//!
//!            delete                            N scans
//!   live ─────────────────────▶ Stale(Deleted) ─────────────▶ purged
//! ```
//!
//! `Stale(Missing)` entries stay visible so a single missed scan does not
//! flap an endpoint. `Stale(Deleted)` entries are invisible to the
//! framework and are not revived by scans, only by an explicit create.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{EndpointInstance, EndpointKey};
use crate::traits::ScanReport;

/// Default number of reconciliations a stale entry survives before purge
pub const DEFAULT_PURGE_AFTER: u32 = 3;

/// Why an entry is stale
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleReason {
    /// Absent from the most recent scan(s)
    Missing,
    /// Logically deleted by a client
    Deleted,
}

/// Stale marker on a repository entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Staleness {
    pub reason: StaleReason,
    /// Reconciliations survived since the entry became stale
    pub reconciles: u32,
}

impl Staleness {
    fn new(reason: StaleReason) -> Self {
        Self {
            reason,
            reconciles: 0,
        }
    }
}

/// How an entry came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Reported by a host scan at least once
    Discovered,
    /// Created by a client and never seen by a scan; exempt from
    /// missing-from-scan staleness
    Created,
}

/// One repository entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryEntry {
    pub instance: EndpointInstance,
    pub staleness: Option<Staleness>,
    pub origin: Origin,
}

impl RepositoryEntry {
    fn new(instance: EndpointInstance, origin: Origin) -> Self {
        Self {
            instance,
            staleness: None,
            origin,
        }
    }

    /// Whether the entry is logically deleted
    pub fn is_deleted(&self) -> bool {
        matches!(
            self.staleness,
            Some(Staleness {
                reason: StaleReason::Deleted,
                ..
            })
        )
    }

    pub fn is_stale(&self) -> bool {
        self.staleness.is_some()
    }
}

/// Kind of change applied through [`InstanceRepository::apply`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationKind {
    /// Insert a new instance, or revive a stale one
    Create(EndpointInstance),
    /// Replace the non-key fields of a visible instance
    Replace(EndpointInstance),
    /// Logically delete a visible instance
    Tombstone,
}

/// A change with an optional optimistic-concurrency precondition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub key: EndpointKey,
    /// Revision the caller based the change on; `None` skips the check
    pub expected_revision: Option<u64>,
    pub kind: MutationKind,
}

impl Mutation {
    pub fn new(key: EndpointKey, kind: MutationKind) -> Self {
        Self {
            key,
            expected_revision: None,
            kind,
        }
    }

    pub fn expecting(mut self, revision: u64) -> Self {
        self.expected_revision = Some(revision);
        self
    }
}

/// What one reconciliation did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub added: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub revived: usize,
    pub marked_stale: usize,
    pub purged: usize,
    /// Facts dropped because their key was invalid or duplicated
    pub rejected: usize,
}

type Slot = Arc<Mutex<Option<RepositoryEntry>>>;

/// In-memory instance repository with per-key locking
#[derive(Debug)]
pub struct InstanceRepository {
    slots: RwLock<BTreeMap<EndpointKey, Slot>>,
    reconcile_lock: Mutex<()>,
    purge_after: u32,
}

impl Default for InstanceRepository {
    fn default() -> Self {
        Self::new(DEFAULT_PURGE_AFTER)
    }
}

impl InstanceRepository {
    /// Create an empty repository purging stale entries after `purge_after`
    /// reconciliations
    pub fn new(purge_after: u32) -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
            reconcile_lock: Mutex::new(()),
            purge_after: purge_after.max(1),
        }
    }

    async fn slot(&self, key: &EndpointKey) -> Option<Slot> {
        self.slots.read().await.get(key).cloned()
    }

    async fn slot_or_insert(&self, key: &EndpointKey) -> Slot {
        if let Some(slot) = self.slot(key).await {
            return slot;
        }
        let mut slots = self.slots.write().await;
        slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Get the entry for `key`, stale or not
    pub async fn get(&self, key: &EndpointKey) -> Result<RepositoryEntry> {
        let slot = self
            .slot(key)
            .await
            .ok_or_else(|| Error::not_found(key.to_string()))?;
        let guard = slot.lock().await;
        guard.clone().ok_or_else(|| Error::not_found(key.to_string()))
    }

    /// Get the instance for `key`, treating deleted entries as absent
    pub async fn get_visible(&self, key: &EndpointKey) -> Result<EndpointInstance> {
        let entry = self.get(key).await?;
        if entry.is_deleted() {
            return Err(Error::not_found(key.to_string()));
        }
        Ok(entry.instance)
    }

    /// All non-purged entries, ordered by key
    ///
    /// Each entry is read under its own lock; the list as a whole is not a
    /// point-in-time snapshot against a concurrent reconcile.
    pub async fn list(&self) -> Vec<RepositoryEntry> {
        let slots: Vec<Slot> = self.slots.read().await.values().cloned().collect();

        let mut entries = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(entry) = slot.lock().await.clone() {
                entries.push(entry);
            }
        }
        entries
    }

    /// Number of non-purged entries
    pub async fn len(&self) -> usize {
        self.list().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Drop every entry
    pub async fn clear(&self) {
        self.slots.write().await.clear();
    }

    /// Apply a mutation atomically with respect to its key
    ///
    /// # Returns
    ///
    /// - `Ok(revision)`: the instance's revision after the mutation
    /// - `Err(Conflict)`: `expected_revision` did not match
    /// - `Err(AlreadyExists)`: create on a live entry
    /// - `Err(NotFound)`: replace/tombstone on an absent or deleted entry
    pub async fn apply(&self, mutation: Mutation) -> Result<u64> {
        let Mutation {
            key,
            expected_revision,
            kind,
        } = mutation;

        let slot = match &kind {
            MutationKind::Create(_) => self.slot_or_insert(&key).await,
            _ => self
                .slot(&key)
                .await
                .ok_or_else(|| Error::not_found(key.to_string()))?,
        };
        let mut guard = slot.lock().await;

        if guard.is_none() {
            return match kind {
                MutationKind::Create(mut instance) => {
                    instance.key = key;
                    instance.revision = 0;
                    *guard = Some(RepositoryEntry::new(instance, Origin::Created));
                    Ok(0)
                }
                _ => Err(Error::not_found(key.to_string())),
            };
        }
        let Some(entry) = guard.as_mut() else {
            return Err(Error::not_found(key.to_string()));
        };

        match kind {
            MutationKind::Create(_) if !entry.is_stale() => Err(Error::already_exists(key.to_string())),
            MutationKind::Create(mut instance) => {
                check_revision(&key, expected_revision, entry.instance.revision)?;
                instance.key = key;
                instance.revision = entry.instance.revision + 1;
                entry.instance = instance;
                entry.staleness = None;
                Ok(entry.instance.revision)
            }
            _ if entry.is_deleted() => Err(Error::not_found(key.to_string())),
            MutationKind::Replace(mut instance) => {
                check_revision(&key, expected_revision, entry.instance.revision)?;
                instance.key = key;
                instance.revision = entry.instance.revision + 1;
                entry.instance = instance;
                Ok(entry.instance.revision)
            }
            MutationKind::Tombstone => {
                check_revision(&key, expected_revision, entry.instance.revision)?;
                entry.instance.revision += 1;
                entry.staleness = Some(Staleness::new(StaleReason::Deleted));
                Ok(entry.instance.revision)
            }
        }
    }

    /// Merge a scan into the repository
    pub async fn reconcile(&self, report: &ScanReport) -> ReconcileSummary {
        let _serial = self.reconcile_lock.lock().await;
        let mut summary = ReconcileSummary::default();
        let mut seen = HashSet::new();

        for fact in &report.facts {
            let fresh = match fact.to_instance() {
                Ok(instance) => instance,
                Err(e) => {
                    warn!("Dropping endpoint fact for '{}': {}", fact.interface, e);
                    summary.rejected += 1;
                    continue;
                }
            };
            if !seen.insert(fresh.key.clone()) {
                debug!("Duplicate fact for {} in scan, keeping the first", fresh.key);
                summary.rejected += 1;
                continue;
            }

            let slot = self.slot_or_insert(&fresh.key).await;
            let mut guard = slot.lock().await;

            if guard.is_none() {
                *guard = Some(RepositoryEntry::new(fresh, Origin::Discovered));
                summary.added += 1;
                continue;
            }
            let Some(entry) = guard.as_mut() else {
                continue;
            };

            if entry.is_deleted() {
                if self.age(entry) {
                    *guard = None;
                    summary.purged += 1;
                }
                continue;
            }

            entry.origin = Origin::Discovered;
            let revived = entry.staleness.take().is_some();
            if revived {
                summary.revived += 1;
            }

            let mut next = fresh;
            next.description = entry.instance.description.clone();
            if next.differs_from(&entry.instance) {
                next.revision = entry.instance.revision + 1;
                entry.instance = next;
                summary.updated += 1;
            } else if !revived {
                summary.unchanged += 1;
            }
        }

        let known: Vec<(EndpointKey, Slot)> = self
            .slots
            .read()
            .await
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect();

        for (key, slot) in known {
            if seen.contains(&key) {
                continue;
            }
            let mut guard = slot.lock().await;
            let Some(entry) = guard.as_mut() else {
                continue;
            };

            if entry.staleness.is_none() {
                if entry.origin == Origin::Discovered {
                    entry.staleness = Some(Staleness::new(StaleReason::Missing));
                    summary.marked_stale += 1;
                    debug!("Endpoint {} missing from scan, marked stale", key);
                }
                continue;
            }

            if self.age(entry) {
                debug!("Purging stale endpoint {}", key);
                *guard = None;
                summary.purged += 1;
            }
        }

        self.sweep_vacant().await;

        debug!(
            "Reconciled {} fact(s): {} added, {} updated, {} stale, {} purged",
            report.facts.len(),
            summary.added,
            summary.updated,
            summary.marked_stale,
            summary.purged
        );
        summary
    }

    /// Age a stale entry by one reconciliation; true when it should be purged
    fn age(&self, entry: &mut RepositoryEntry) -> bool {
        match entry.staleness.as_mut() {
            Some(staleness) => {
                staleness.reconciles += 1;
                staleness.reconciles >= self.purge_after
            }
            None => false,
        }
    }

    /// Remove empty slots nobody else is holding
    async fn sweep_vacant(&self) {
        let mut slots = self.slots.write().await;
        slots.retain(|_, slot| {
            let vacant = Arc::strong_count(slot) == 1
                && slot.try_lock().map(|guard| guard.is_none()).unwrap_or(false);
            !vacant
        });
    }
}

fn check_revision(key: &EndpointKey, expected: Option<u64>, current: u64) -> Result<()> {
    match expected {
        Some(expected) if expected != current => Err(Error::conflict(format!(
            "{} is at revision {}, request expected {}",
            key, current, expected
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AdminStatus, ProtocolType};
    use crate::traits::EndpointFact;

    fn fact(interface: &str, status: AdminStatus) -> EndpointFact {
        EndpointFact::new(interface, ProtocolType::Ipv4, status)
    }

    fn key(interface: &str) -> EndpointKey {
        EndpointKey::new(interface, ProtocolType::Ipv4).unwrap()
    }

    #[tokio::test]
    async fn test_reconcile_adds_at_revision_zero() {
        let repo = InstanceRepository::default();
        let summary = repo
            .reconcile(&ScanReport::new(vec![
                fact("eth1", AdminStatus::Enabled),
                fact("eth0", AdminStatus::Disabled),
            ]))
            .await;

        assert_eq!(summary.added, 2);
        let entries = repo.list().await;
        assert_eq!(entries[0].instance.key, key("eth0"));
        assert_eq!(entries[1].instance.key, key("eth1"));
        assert!(entries.iter().all(|e| e.instance.revision == 0));
    }

    #[tokio::test]
    async fn test_reconcile_bumps_revision_only_on_change() {
        let repo = InstanceRepository::default();
        let scan = ScanReport::new(vec![fact("eth0", AdminStatus::Disabled)]);

        repo.reconcile(&scan).await;
        let summary = repo.reconcile(&scan).await;
        assert_eq!(summary.unchanged, 1);
        assert_eq!(repo.get(&key("eth0")).await.unwrap().instance.revision, 0);

        repo.reconcile(&ScanReport::new(vec![fact("eth0", AdminStatus::Enabled)]))
            .await;
        let entry = repo.get(&key("eth0")).await.unwrap();
        assert_eq!(entry.instance.revision, 1);
        assert_eq!(entry.instance.admin_status, AdminStatus::Enabled);
    }

    #[tokio::test]
    async fn test_reconcile_rejects_fact_with_foreign_address() {
        let repo = InstanceRepository::default();
        let bad = fact("eth1", AdminStatus::Enabled).with_address("2001:db8::1".parse().unwrap(), 64);

        let summary = repo
            .reconcile(&ScanReport::new(vec![fact("eth0", AdminStatus::Enabled), bad]))
            .await;

        assert_eq!(summary.added, 1);
        assert_eq!(summary.rejected, 1);
        assert!(matches!(repo.get(&key("eth1")).await, Err(Error::NotFound(_))));
        assert_eq!(repo.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_entry_goes_stale_then_purges() {
        let repo = InstanceRepository::new(2);
        repo.reconcile(&ScanReport::new(vec![fact("eth0", AdminStatus::Enabled)]))
            .await;

        let empty = ScanReport::default();
        assert_eq!(repo.reconcile(&empty).await.marked_stale, 1);
        let entry = repo.get(&key("eth0")).await.unwrap();
        assert_eq!(entry.staleness.map(|s| s.reason), Some(StaleReason::Missing));
        assert!(repo.get_visible(&key("eth0")).await.is_ok());

        assert_eq!(repo.reconcile(&empty).await.purged, 0);
        assert_eq!(repo.reconcile(&empty).await.purged, 1);
        assert!(matches!(repo.get(&key("eth0")).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_missing_entry_revives_when_seen_again() {
        let repo = InstanceRepository::default();
        let scan = ScanReport::new(vec![fact("eth0", AdminStatus::Enabled)]);

        repo.reconcile(&scan).await;
        repo.reconcile(&ScanReport::default()).await;
        let summary = repo.reconcile(&scan).await;

        assert_eq!(summary.revived, 1);
        assert!(!repo.get(&key("eth0")).await.unwrap().is_stale());
    }

    #[tokio::test]
    async fn test_apply_optimistic_concurrency() {
        let repo = InstanceRepository::default();
        repo.reconcile(&ScanReport::new(vec![fact("eth0", AdminStatus::Enabled)]))
            .await;

        let current = repo.get_visible(&key("eth0")).await.unwrap();
        let mut next = current.clone();
        next.description = Some("uplink".to_string());

        let revision = repo
            .apply(Mutation::new(key("eth0"), MutationKind::Replace(next.clone())).expecting(0))
            .await
            .unwrap();
        assert_eq!(revision, 1);

        let stale_write = repo
            .apply(Mutation::new(key("eth0"), MutationKind::Replace(next)).expecting(0))
            .await;
        assert!(matches!(stale_write, Err(Error::Conflict(_))));
    }

    #[tokio::test]
    async fn test_tombstone_hides_entry_until_recreated() {
        let repo = InstanceRepository::default();
        let instance = EndpointInstance::new(key("dummy0"));

        assert_eq!(
            repo.apply(Mutation::new(key("dummy0"), MutationKind::Create(instance.clone())))
                .await
                .unwrap(),
            0
        );
        assert_eq!(
            repo.apply(Mutation::new(key("dummy0"), MutationKind::Tombstone))
                .await
                .unwrap(),
            1
        );
        assert!(matches!(repo.get_visible(&key("dummy0")).await, Err(Error::NotFound(_))));
        assert!(repo.get(&key("dummy0")).await.unwrap().is_deleted());

        let revision = repo
            .apply(Mutation::new(key("dummy0"), MutationKind::Create(instance)))
            .await
            .unwrap();
        assert_eq!(revision, 2);
        assert!(repo.get_visible(&key("dummy0")).await.is_ok());
    }

    #[tokio::test]
    async fn test_created_entries_survive_scans_that_miss_them() {
        let repo = InstanceRepository::new(1);
        repo.apply(Mutation::new(key("dummy0"), MutationKind::Create(EndpointInstance::new(key("dummy0")))))
            .await
            .unwrap();

        repo.reconcile(&ScanReport::default()).await;
        repo.reconcile(&ScanReport::default()).await;
        assert!(!repo.get(&key("dummy0")).await.unwrap().is_stale());
    }
}
