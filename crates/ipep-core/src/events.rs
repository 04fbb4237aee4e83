//! Provider events
//!
//! Lifecycle, reconciliation and job progress are reported on a bounded
//! channel. Sending never blocks: when the consumer falls behind, events are
//! dropped with a warning.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{trace, warn};

use crate::engine::{JobId, JobState};
use crate::model::EndpointKey;
use crate::repository::ReconcileSummary;

/// Events emitted by an [`EndpointProvider`](crate::EndpointProvider)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    /// Provider finished loading
    Loaded {
        backend: String,
        endpoints: usize,
    },

    /// A scan was merged into the repository
    Reconciled {
        summary: ReconcileSummary,
    },

    /// A scan failed; the repository kept its previous contents
    ScanFailed {
        error: String,
    },

    /// A partial scan was discarded
    ScanRejected {
        skipped: usize,
    },

    /// A state-change job moved to a new state
    JobStateChanged {
        job: JobId,
        key: EndpointKey,
        state: JobState,
    },

    /// Provider was unloaded
    Unloaded {
        /// Jobs that had to be aborted after the drain timeout
        aborted_jobs: usize,
    },
}

/// Non-blocking sender half of the provider event channel
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<ProviderEvent>,
}

impl EventSink {
    /// Create a sink and the matching receiver
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ProviderEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Emit an event, dropping it if the channel is full or closed
    pub fn emit(&self, event: ProviderEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!(
                    "Event channel full, dropping {:?}. Consider increasing event_channel_capacity.",
                    event
                );
            }
            // Nobody is listening
            Err(TrySendError::Closed(_)) => trace!("Event receiver dropped"),
        }
    }
}
