//! Endpoint provider facade
//!
//! [`EndpointProvider`] wires the repository, mutation handler and
//! state-change engine to a set of host [`Capabilities`], runs background
//! reconciliation, and answers the framework's entry points.
//!
//! ## Lifecycle
//!
//! 1. [`EndpointProvider::load()`] validates configuration, performs the
//!    initial scan and starts the reconcile loop
//! 2. Entry points may be called concurrently from any task
//! 3. [`EndpointProvider::unload()`] stops the loop, cancels and drains
//!    jobs, then clears the repository
//!
//! ## Background work
//!
//! Every `reconcile.interval_secs` the loop scans the host, merges the
//! result and prunes finished jobs and expired idempotency records. A
//! failed scan leaves the repository as it was.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::ProviderConfig;
use crate::engine::{JobHandle, JobId, JobState, JobStatus, StateChangeEngine};
use crate::error::{Error, Result};
use crate::events::{EventSink, ProviderEvent};
use crate::mapper;
use crate::model::{AdminStatus, EndpointKey};
use crate::mutation::{MutationHandler, MutationOutcome};
use crate::properties::{self as props, ExternalInstance, InstanceFilter, PropertySet};
use crate::reconciler::Reconciler;
use crate::repository::{InstanceRepository, ReconcileSummary};
use crate::traits::{Capabilities, ManagementProvider};

/// Provider for `SCX_IPProtocolEndpoint` instances
pub struct EndpointProvider {
    backend: String,
    repository: Arc<InstanceRepository>,
    reconciler: Arc<Reconciler>,
    mutations: Arc<MutationHandler>,
    engine: StateChangeEngine,
    events: EventSink,
    drain_timeout: Duration,
    shutdown_tx: watch::Sender<bool>,
    background: Mutex<Option<JoinHandle<()>>>,
    unloaded: AtomicBool,
}

impl EndpointProvider {
    /// Load the provider
    ///
    /// # Returns
    ///
    /// A tuple of (provider, event_receiver) where event_receiver yields
    /// provider events.
    ///
    /// # Errors
    ///
    /// - `Config`: invalid configuration
    /// - any non-`SourceUnavailable` failure of the initial scan
    ///
    /// An unavailable host does not fail loading: the provider starts with
    /// an empty repository and picks endpoints up on a later reconcile.
    pub async fn load(
        capabilities: Capabilities,
        config: ProviderConfig,
    ) -> Result<(Self, mpsc::Receiver<ProviderEvent>)> {
        config.validate()?;

        let (events, rx) = EventSink::channel(config.event_channel_capacity);
        let repository = Arc::new(InstanceRepository::new(config.reconcile.purge_after));
        let reconciler = Arc::new(Reconciler::new(
            capabilities.source.clone(),
            repository.clone(),
            config.reconcile.accept_partial_scans,
            events.clone(),
        ));

        match reconciler.run_once().await {
            Ok(summary) => debug!("Initial scan: {:?}", summary),
            Err(Error::SourceUnavailable(e)) => {
                warn!("Initial scan failed, starting with an empty repository: {}", e)
            }
            Err(e) => return Err(e),
        }

        let mutations = Arc::new(MutationHandler::new(
            repository.clone(),
            Duration::from_secs(config.mutations.idempotency_window_secs),
        ));
        let engine = StateChangeEngine::new(
            repository.clone(),
            reconciler.clone(),
            capabilities.changer.clone(),
            config.jobs.clone(),
            events.clone(),
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let background = tokio::spawn(reconcile_loop(
            reconciler.clone(),
            engine.clone(),
            mutations.clone(),
            Duration::from_secs(config.reconcile.interval_secs),
            shutdown_rx,
        ));

        let backend = config.backend.type_name().to_string();
        let endpoints = repository.len().await;
        info!(
            "Loaded {} provider: backend {}, {} endpoints",
            props::CLASS_NAME,
            backend,
            endpoints
        );
        events.emit(ProviderEvent::Loaded {
            backend: backend.clone(),
            endpoints,
        });

        let provider = Self {
            backend,
            repository,
            reconciler,
            mutations,
            engine,
            events,
            drain_timeout: Duration::from_millis(config.jobs.unload_drain_timeout_ms),
            shutdown_tx,
            background: Mutex::new(Some(background)),
            unloaded: AtomicBool::new(false),
        };
        Ok((provider, rx))
    }

    /// Backend type the provider was loaded with
    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// The underlying repository
    pub fn repository(&self) -> &Arc<InstanceRepository> {
        &self.repository
    }

    /// Visible instances, projected and filtered, ordered by key
    pub async fn enumerate(
        &self,
        property_set: &PropertySet,
        keys_only: bool,
        filter: Option<&InstanceFilter>,
    ) -> Result<Vec<ExternalInstance>> {
        self.ensure_loaded()?;
        let instances = self
            .repository
            .list()
            .await
            .into_iter()
            .filter(|entry| !entry.is_deleted())
            .map(|entry| mapper::project(&entry.instance, property_set, keys_only))
            .filter(|external| filter.is_none_or(|f| f(external)))
            .collect();
        Ok(instances)
    }

    /// One visible instance
    pub async fn get(&self, key: &EndpointKey, property_set: &PropertySet) -> Result<ExternalInstance> {
        self.ensure_loaded()?;
        let instance = self.repository.get_visible(key).await?;
        Ok(mapper::project(&instance, property_set, false))
    }

    pub async fn create(&self, values: &ExternalInstance) -> Result<MutationOutcome> {
        self.ensure_loaded()?;
        self.mutations.create(values).await
    }

    pub async fn modify(
        &self,
        key: &EndpointKey,
        property_set: &PropertySet,
        values: &ExternalInstance,
    ) -> Result<MutationOutcome> {
        self.ensure_loaded()?;
        self.mutations.modify(key, property_set, values).await
    }

    pub async fn delete(&self, key: &EndpointKey) -> Result<MutationOutcome> {
        self.ensure_loaded()?;
        self.mutations.delete(key).await
    }

    /// Start a state-change job
    pub async fn request_state_change(
        &self,
        key: &EndpointKey,
        target: AdminStatus,
        deadline: Option<Duration>,
    ) -> Result<JobHandle> {
        self.ensure_loaded()?;
        self.engine.request_state_change(key, target, deadline).await
    }

    pub fn job_status(&self, id: JobId) -> Result<JobStatus> {
        self.engine.job_status(id)
    }

    pub fn jobs(&self) -> Vec<JobStatus> {
        self.engine.jobs()
    }

    pub fn cancel_job(&self, id: JobId) -> Result<JobState> {
        self.engine.cancel(id)
    }

    /// Scan and reconcile now, outside the background schedule
    pub async fn refresh(&self) -> Result<ReconcileSummary> {
        self.ensure_loaded()?;
        self.reconciler.run_once().await
    }

    /// Tear down the provider
    ///
    /// Calling it again is a no-op.
    pub async fn unload(&self) -> Result<()> {
        if self.unloaded.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Unloading {} provider", props::CLASS_NAME);

        self.shutdown_tx.send_replace(true);
        let background = self
            .background
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = background {
            if let Err(e) = task.await {
                warn!("Reconcile loop ended abnormally: {}", e);
            }
        }

        let aborted_jobs = self.engine.shutdown(self.drain_timeout).await;
        self.repository.clear().await;

        info!("Provider unloaded ({} jobs aborted)", aborted_jobs);
        self.events.emit(ProviderEvent::Unloaded { aborted_jobs });
        Ok(())
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.unloaded.load(Ordering::SeqCst) {
            return Err(Error::Other("provider has been unloaded".to_string()));
        }
        Ok(())
    }
}

impl Drop for EndpointProvider {
    fn drop(&mut self) {
        // Stop the loop even when unload() was never called
        self.shutdown_tx.send_replace(true);
    }
}

impl std::fmt::Debug for EndpointProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointProvider")
            .field("backend", &self.backend)
            .field("engine", &self.engine)
            .field("unloaded", &self.unloaded.load(Ordering::SeqCst))
            .finish()
    }
}

async fn reconcile_loop(
    reconciler: Arc<Reconciler>,
    engine: StateChangeEngine,
    mutations: Arc<MutationHandler>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                // Failures are logged and reported by the reconciler
                let _ = reconciler.run_once().await;

                let jobs = engine.prune_finished();
                let records = mutations.prune().await;
                if jobs + records > 0 {
                    debug!("Pruned {} finished jobs and {} idempotency records", jobs, records);
                }
            }
        }
    }
    debug!("Reconcile loop stopped");
}

#[async_trait]
impl ManagementProvider for EndpointProvider {
    fn class_name(&self) -> &'static str {
        props::CLASS_NAME
    }

    async fn enumerate_instances(
        &self,
        property_set: &PropertySet,
        keys_only: bool,
        filter: Option<&InstanceFilter>,
    ) -> Result<Vec<ExternalInstance>> {
        self.enumerate(property_set, keys_only, filter).await
    }

    async fn get_instance(
        &self,
        instance_name: &ExternalInstance,
        property_set: &PropertySet,
    ) -> Result<ExternalInstance> {
        let key = mapper::key_from_external(instance_name)?;
        self.get(&key, property_set).await
    }

    async fn create_instance(&self, new_instance: &ExternalInstance) -> Result<MutationOutcome> {
        self.create(new_instance).await
    }

    async fn modify_instance(
        &self,
        instance_name: &ExternalInstance,
        property_set: &PropertySet,
        values: &ExternalInstance,
    ) -> Result<MutationOutcome> {
        let key = mapper::key_from_external(instance_name)?;
        self.modify(&key, property_set, values).await
    }

    async fn delete_instance(&self, instance_name: &ExternalInstance) -> Result<MutationOutcome> {
        let key = mapper::key_from_external(instance_name)?;
        self.delete(&key).await
    }

    async fn invoke_request_state_change(
        &self,
        instance_name: &ExternalInstance,
        requested_state: u16,
        deadline: Option<Duration>,
    ) -> Result<JobHandle> {
        let key = mapper::key_from_external(instance_name)?;
        let target = AdminStatus::from_code(requested_state).ok_or_else(|| {
            Error::invalid_property(format!("unsupported RequestedState {}", requested_state))
        })?;
        self.request_state_change(&key, target, deadline).await
    }

    async fn unload(&self) -> Result<()> {
        EndpointProvider::unload(self).await
    }
}
