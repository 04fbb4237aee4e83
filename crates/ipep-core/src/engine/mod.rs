//! State-change engine
//!
//! Executes `RequestStateChange` as tracked asynchronous jobs.
//!
//! ## Job lifecycle
//!
//! ```text
//!                ┌──────────────────────────────────────────┐
//!                │                                          ▼
//! Pending ──▶ Running ──▶ host op ──▶ confirm ──▶ Completed
//!                │           │           │
//!                │           ├──▶ Failed │
//!                ▼           ▼           ▼
//!            Cancelled / TimedOut (cancel flag or deadline, at any
//!                                  suspension point)
//! ```
//!
//! ## Guarantees
//!
//! - Unknown keys and invalid transitions are rejected before a job exists
//! - At most one job per key is in flight; a second request gets `Conflict`
//! - The deadline is measured from acceptance and covers the host operation
//!   and confirmation together
//! - Completion requires a fresh scan, merged into the repository, showing
//!   the target status
//! - An abandoned host operation keeps its key reserved until it finishes,
//!   for at most the job's deadline again; its result is discarded

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, sleep, sleep_until};
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::JobConfig;
use crate::error::{Error, Result};
use crate::events::{EventSink, ProviderEvent};
use crate::model::{AdminStatus, EndpointKey};
use crate::reconciler::Reconciler;
use crate::repository::InstanceRepository;
use crate::traits::StateChanger;

/// Identifier of a state-change job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// State of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    /// The host operation (or confirmation read) failed
    Failed(String),
    TimedOut,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Pending | JobState::Running)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => f.write_str("Pending"),
            JobState::Running => f.write_str("Running"),
            JobState::Completed => f.write_str("Completed"),
            JobState::Failed(reason) => write!(f, "Failed ({})", reason),
            JobState::TimedOut => f.write_str("TimedOut"),
            JobState::Cancelled => f.write_str("Cancelled"),
        }
    }
}

/// Point-in-time view of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub key: EndpointKey,
    pub target: AdminStatus,
    pub state: JobState,
    pub accepted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Caller's handle on an accepted job
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    key: EndpointKey,
    target: AdminStatus,
    state: watch::Receiver<JobState>,
}

impl JobHandle {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    pub fn target(&self) -> AdminStatus {
        self.target
    }

    /// Current state
    pub fn state(&self) -> JobState {
        self.state.borrow().clone()
    }

    /// Wait until the job reaches a terminal state
    pub async fn wait(&self) -> JobState {
        let mut rx = self.state.clone();
        let result = rx.wait_for(JobState::is_terminal).await.map(|s| s.clone());
        match result {
            Ok(state) => state,
            // Engine gone: report the last state seen
            Err(_) => rx.borrow().clone(),
        }
    }

    /// Wait for the job and convert its final state into a `Result`
    ///
    /// # Errors
    ///
    /// - `TimedOut`: the deadline elapsed before the host confirmed
    /// - `Cancelled`: the job was cancelled or the provider unloaded
    /// - `Internal`: the host operation failed or the instance vanished
    pub async fn outcome(&self) -> Result<()> {
        match self.wait().await {
            JobState::Completed => Ok(()),
            JobState::TimedOut => Err(Error::TimedOut(format!("job {} on {}", self.id, self.key))),
            JobState::Failed(reason) => Err(Error::internal(format!(
                "job {} on {} failed: {}",
                self.id, self.key, reason
            ))),
            JobState::Cancelled => Err(Error::Cancelled(format!("job {} on {}", self.id, self.key))),
            // wait() only returns a non-terminal state once the engine is gone
            JobState::Pending | JobState::Running => Err(Error::Cancelled(format!(
                "job {} on {} was dropped with the engine",
                self.id, self.key
            ))),
        }
    }

    /// Stream of state changes, starting with the current state
    pub fn updates(&self) -> WatchStream<JobState> {
        WatchStream::new(self.state.clone())
    }
}

struct JobEntry {
    status: JobStatus,
    state_tx: watch::Sender<JobState>,
    cancel_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    finished: Option<Instant>,
}

/// What a job task needs to run
struct Job {
    id: JobId,
    key: EndpointKey,
    target: AdminStatus,
    deadline: Duration,
    deadline_at: Instant,
    cancel: watch::Receiver<bool>,
}

struct EngineInner {
    repository: Arc<InstanceRepository>,
    reconciler: Arc<Reconciler>,
    changer: Arc<dyn StateChanger>,
    settings: JobConfig,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    active: Mutex<HashMap<EndpointKey, JobId>>,
    /// Set by shutdown; no job is accepted afterwards
    closed: AtomicBool,
    events: EventSink,
}

/// Runs state-change jobs
///
/// Cloning is cheap; clones share jobs and reservations.
#[derive(Clone)]
pub struct StateChangeEngine {
    inner: Arc<EngineInner>,
}

impl StateChangeEngine {
    pub fn new(
        repository: Arc<InstanceRepository>,
        reconciler: Arc<Reconciler>,
        changer: Arc<dyn StateChanger>,
        settings: JobConfig,
        events: EventSink,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                repository,
                reconciler,
                changer,
                settings,
                jobs: Mutex::new(HashMap::new()),
                active: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                events,
            }),
        }
    }

    /// Accept a request to move `key` to `target`
    ///
    /// `deadline` defaults to `jobs.default_deadline_ms`.
    ///
    /// # Errors
    ///
    /// Checked in this order, before any job is created:
    ///
    /// - `NotFound`: no visible instance for `key`
    /// - `InvalidTransition`: `target` is not reachable from the current status
    /// - `Conflict`: another job on `key` is still in flight
    pub async fn request_state_change(
        &self,
        key: &EndpointKey,
        target: AdminStatus,
        deadline: Option<Duration>,
    ) -> Result<JobHandle> {
        let current = self.inner.repository.get_visible(key).await?;
        if !current.admin_status.can_transition_to(target) {
            return Err(Error::InvalidTransition {
                from: current.admin_status,
                to: target,
            });
        }

        let deadline =
            deadline.unwrap_or_else(|| Duration::from_millis(self.inner.settings.default_deadline_ms));
        let id = JobId::new();
        {
            let mut active = lock(&self.inner.active);
            if let Some(existing) = active.get(key) {
                return Err(Error::conflict(format!(
                    "{} already has state-change job {} in flight",
                    key, existing
                )));
            }
            active.insert(key.clone(), id);
        }
        let reservation = KeyReservation {
            inner: self.inner.clone(),
            key: key.clone(),
            id,
        };

        let accepted = Instant::now();
        let (state_tx, state_rx) = watch::channel(JobState::Pending);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let job = Job {
            id,
            key: key.clone(),
            target,
            deadline,
            deadline_at: accepted + deadline,
            cancel: cancel_rx,
        };

        // Registered and spawned under the jobs lock so shutdown either sees
        // the job with its task or refuses it
        {
            let mut jobs = lock(&self.inner.jobs);
            if self.inner.closed.load(Ordering::SeqCst) {
                return Err(Error::Cancelled(format!(
                    "state-change engine is shut down, {} not changed",
                    key
                )));
            }

            info!(
                "Accepted job {}: {} {} -> {} (deadline {:?})",
                id, key, current.admin_status, target, deadline
            );
            self.inner.events.emit(ProviderEvent::JobStateChanged {
                job: id,
                key: key.clone(),
                state: JobState::Pending,
            });

            let task = tokio::spawn(run_job(self.inner.clone(), job, reservation));
            jobs.insert(
                id,
                JobEntry {
                    status: JobStatus {
                        id,
                        key: key.clone(),
                        target,
                        state: JobState::Pending,
                        accepted_at: Utc::now(),
                        finished_at: None,
                    },
                    state_tx,
                    cancel_tx,
                    task: Some(task),
                    finished: None,
                },
            );
        }

        Ok(JobHandle {
            id,
            key: key.clone(),
            target,
            state: state_rx,
        })
    }

    /// Status of a retained job
    pub fn job_status(&self, id: JobId) -> Result<JobStatus> {
        lock(&self.inner.jobs)
            .get(&id)
            .map(|e| e.status.clone())
            .ok_or_else(|| Error::not_found(format!("job {}", id)))
    }

    /// All retained jobs, oldest first
    pub fn jobs(&self) -> Vec<JobStatus> {
        let mut jobs: Vec<JobStatus> = lock(&self.inner.jobs)
            .values()
            .map(|e| e.status.clone())
            .collect();
        jobs.sort_by_key(|s| s.accepted_at);
        jobs
    }

    /// Whether a job on `key` is in flight (or still draining)
    pub fn is_busy(&self, key: &EndpointKey) -> bool {
        lock(&self.inner.active).contains_key(key)
    }

    /// Request cancellation of a job
    ///
    /// Returns the job's state at the time of the request. Cancelling a
    /// finished job has no effect.
    pub fn cancel(&self, id: JobId) -> Result<JobState> {
        let jobs = lock(&self.inner.jobs);
        let entry = jobs
            .get(&id)
            .ok_or_else(|| Error::not_found(format!("job {}", id)))?;
        if !entry.status.state.is_terminal() {
            entry.cancel_tx.send_replace(true);
            debug!("Cancellation requested for job {}", id);
        }
        Ok(entry.status.state.clone())
    }

    /// Forget finished jobs older than the retention window
    pub fn prune_finished(&self) -> usize {
        let retention = Duration::from_secs(self.inner.settings.retention_secs);
        let mut jobs = lock(&self.inner.jobs);
        let before = jobs.len();
        jobs.retain(|_, e| e.finished.is_none_or(|at| at.elapsed() < retention));
        before - jobs.len()
    }

    /// Cancel every job and wait up to `drain` for their tasks
    ///
    /// Tasks still running afterwards are aborted and their jobs marked
    /// `Cancelled`. Returns the number of aborted tasks. Later requests
    /// fail with `Cancelled`.
    pub async fn shutdown(&self, drain: Duration) -> usize {
        let tasks: Vec<(JobId, JoinHandle<()>)> = {
            let mut jobs = lock(&self.inner.jobs);
            self.inner.closed.store(true, Ordering::SeqCst);
            jobs.iter_mut()
                .filter_map(|(id, entry)| {
                    if !entry.status.state.is_terminal() {
                        entry.cancel_tx.send_replace(true);
                    }
                    entry.task.take().map(|task| (*id, task))
                })
                .collect()
        };

        let drain_until = Instant::now() + drain;
        let mut aborted = 0;
        for (id, mut task) in tasks {
            if tokio::time::timeout_at(drain_until, &mut task).await.is_err() {
                warn!("Job {} did not drain within {:?}, aborting", id, drain);
                task.abort();
                self.inner.transition(id, JobState::Cancelled);
                aborted += 1;
            }
        }
        aborted
    }
}

impl fmt::Debug for StateChangeEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateChangeEngine")
            .field("changer", &self.inner.changer.changer_name())
            .field("jobs", &lock(&self.inner.jobs).len())
            .finish()
    }
}

/// Releases a key's job slot when dropped
struct KeyReservation {
    inner: Arc<EngineInner>,
    key: EndpointKey,
    id: JobId,
}

impl Drop for KeyReservation {
    fn drop(&mut self) {
        let mut active = lock(&self.inner.active);
        if active.get(&self.key) == Some(&self.id) {
            active.remove(&self.key);
        }
    }
}

enum Wake {
    Cancelled,
    Deadline,
    Done(std::result::Result<Result<()>, JoinError>),
}

async fn run_job(inner: Arc<EngineInner>, mut job: Job, reservation: KeyReservation) {
    inner.transition(job.id, JobState::Running);

    let (state, abandoned) = inner.execute(&mut job).await;
    inner.transition(job.id, state);

    if let Some(op) = abandoned {
        // Result discarded; the key is held for at most one more deadline
        debug!("Waiting for abandoned host operation on {} to finish", job.key);
        if tokio::time::timeout(job.deadline, op).await.is_err() {
            warn!(
                "Abandoned host operation on {} still running after {:?}, releasing key",
                job.key, job.deadline
            );
        }
    }
    drop(reservation);
}

impl EngineInner {
    async fn execute(&self, job: &mut Job) -> (JobState, Option<JoinHandle<Result<()>>>) {
        let changer = self.changer.clone();
        let key = job.key.clone();
        let target = job.target;
        let mut op = tokio::spawn(async move { changer.apply_state(&key, target).await });

        let wake = tokio::select! {
            biased;
            _ = cancelled(&mut job.cancel) => Wake::Cancelled,
            _ = sleep_until(job.deadline_at) => Wake::Deadline,
            result = &mut op => Wake::Done(result),
        };

        let result = match wake {
            Wake::Cancelled => return (JobState::Cancelled, Some(self.abandon(op))),
            Wake::Deadline => return (JobState::TimedOut, Some(self.abandon(op))),
            Wake::Done(result) => result,
        };

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if matches!(e, Error::Internal(_)) {
                    error!(
                        "Host operation {} on {} (target {}) failed: {}",
                        self.changer.changer_name(),
                        job.key,
                        job.target,
                        e
                    );
                } else {
                    warn!("Host operation on {} failed: {}", job.key, e);
                }
                return (JobState::Failed(e.to_string()), None);
            }
            Err(e) => {
                error!(
                    "Host operation {} on {} did not complete: {}",
                    self.changer.changer_name(),
                    job.key,
                    e
                );
                return (
                    JobState::Failed("host operation did not complete".to_string()),
                    None,
                );
            }
        }

        (self.confirm(job).await, None)
    }

    /// Stop waiting on a host operation, aborting it when possible
    fn abandon(&self, op: JoinHandle<Result<()>>) -> JoinHandle<Result<()>> {
        if self.changer.supports_abort() {
            op.abort();
        }
        op
    }

    /// Re-scan until the repository shows the target status
    async fn confirm(&self, job: &mut Job) -> JobState {
        let poll = Duration::from_millis(self.settings.confirm_poll_interval_ms);
        loop {
            let scan = tokio::select! {
                biased;
                _ = cancelled(&mut job.cancel) => return JobState::Cancelled,
                _ = sleep_until(job.deadline_at) => return JobState::TimedOut,
                scan = self.reconciler.scan() => scan,
            };

            if let Ok(report) = scan {
                self.reconciler.merge(&report).await;
                match self.repository.get_visible(&job.key).await {
                    Ok(current) if current.admin_status == job.target => return JobState::Completed,
                    Ok(current) => debug!(
                        "{} is {}, waiting for {}",
                        job.key, current.admin_status, job.target
                    ),
                    Err(e) => return JobState::Failed(e.to_string()),
                }
            }

            tokio::select! {
                biased;
                _ = cancelled(&mut job.cancel) => return JobState::Cancelled,
                _ = sleep_until(job.deadline_at) => return JobState::TimedOut,
                _ = sleep(poll) => {}
            }
        }
    }

    /// Move a job to `state` unless it already finished
    fn transition(&self, id: JobId, state: JobState) {
        let mut jobs = lock(&self.jobs);
        let Some(entry) = jobs.get_mut(&id) else {
            return;
        };
        if entry.status.state.is_terminal() || entry.status.state == state {
            return;
        }
        entry.status.state = state.clone();
        if state.is_terminal() {
            entry.status.finished_at = Some(Utc::now());
            entry.finished = Some(Instant::now());
        }
        entry.state_tx.send_replace(state.clone());
        let key = entry.status.key.clone();
        drop(jobs);

        match &state {
            JobState::Completed => info!("Job {} on {} completed", id, key),
            JobState::Failed(reason) => warn!("Job {} on {} failed: {}", id, key, reason),
            JobState::TimedOut => warn!("Job {} on {} timed out", id, key),
            JobState::Cancelled => info!("Job {} on {} cancelled", id, key),
            _ => debug!("Job {} on {} is {}", id, key, state),
        }
        self.events.emit(ProviderEvent::JobStateChanged {
            job: id,
            key,
            state,
        });
    }
}

/// Resolves once cancellation is requested
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    let closed = rx.wait_for(|c| *c).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryHost;
    use crate::model::ProtocolType;
    use crate::traits::EndpointFact;

    fn eth0() -> EndpointKey {
        EndpointKey::new("eth0", ProtocolType::Ipv4).unwrap()
    }

    async fn engine_with(status: AdminStatus) -> (StateChangeEngine, Arc<InstanceRepository>) {
        let host = Arc::new(MemoryHost::new(vec![EndpointFact::new(
            "eth0",
            ProtocolType::Ipv4,
            status,
        )]));
        let repository = Arc::new(InstanceRepository::default());
        let (events, _rx) = EventSink::channel(64);
        let reconciler = Arc::new(Reconciler::new(
            host.clone(),
            repository.clone(),
            true,
            events.clone(),
        ));
        reconciler.run_once().await.unwrap();

        let settings = JobConfig {
            confirm_poll_interval_ms: 5,
            ..JobConfig::default()
        };
        let engine = StateChangeEngine::new(repository.clone(), reconciler, host, settings, events);
        (engine, repository)
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Running.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed("x".to_string()).is_terminal());
        assert!(JobState::TimedOut.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[tokio::test]
    async fn test_enable_is_confirmed_by_repository() {
        let (engine, repository) = engine_with(AdminStatus::Disabled).await;

        let handle = engine
            .request_state_change(&eth0(), AdminStatus::Enabled, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(handle.wait().await, JobState::Completed);

        let current = repository.get_visible(&eth0()).await.unwrap();
        assert_eq!(current.admin_status, AdminStatus::Enabled);
        assert_eq!(
            engine.job_status(handle.id()).unwrap().state,
            JobState::Completed
        );
    }

    #[tokio::test]
    async fn test_invalid_transition_creates_no_job() {
        let (engine, repository) = engine_with(AdminStatus::Disabled).await;
        let before = repository.get(&eth0()).await.unwrap();

        let result = engine
            .request_state_change(&eth0(), AdminStatus::Testing, None)
            .await;
        assert!(matches!(
            result,
            Err(Error::InvalidTransition {
                from: AdminStatus::Disabled,
                to: AdminStatus::Testing
            })
        ));
        assert!(engine.jobs().is_empty());
        assert!(!engine.is_busy(&eth0()));
        assert_eq!(repository.get(&eth0()).await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (engine, _) = engine_with(AdminStatus::Enabled).await;
        let id = JobId::new();
        assert!(matches!(engine.cancel(id), Err(Error::NotFound(_))));
        assert!(matches!(engine.job_status(id), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_outcome_maps_terminal_states() {
        let (engine, _) = engine_with(AdminStatus::Disabled).await;
        let handle = engine
            .request_state_change(&eth0(), AdminStatus::Enabled, None)
            .await
            .unwrap();
        assert!(handle.outcome().await.is_ok());

        let handle = engine
            .request_state_change(&eth0(), AdminStatus::Disabled, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        engine.cancel(handle.id()).unwrap();
        let state = handle.wait().await;
        match handle.outcome().await {
            Ok(()) => assert_eq!(state, JobState::Completed),
            Err(e) => {
                assert_eq!(state, JobState::Cancelled);
                assert!(matches!(e, Error::Cancelled(_)));
            }
        }
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_jobs() {
        let (engine, _) = engine_with(AdminStatus::Disabled).await;
        assert_eq!(engine.shutdown(Duration::from_millis(50)).await, 0);

        let result = engine
            .request_state_change(&eth0(), AdminStatus::Enabled, None)
            .await;
        assert!(matches!(result, Err(Error::Cancelled(_))));
        assert!(engine.jobs().is_empty());
        assert!(!engine.is_busy(&eth0()), "refused request must release its key");
    }

    #[tokio::test]
    async fn test_prune_keeps_recent_jobs() {
        let (engine, _) = engine_with(AdminStatus::Enabled).await;
        let handle = engine
            .request_state_change(&eth0(), AdminStatus::Disabled, None)
            .await
            .unwrap();
        handle.wait().await;

        assert_eq!(engine.prune_finished(), 0);
        assert_eq!(engine.jobs().len(), 1);
    }
}
