//! Scan-and-merge driver shared by the background loop and job confirmation

use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::{EventSink, ProviderEvent};
use crate::repository::{InstanceRepository, ReconcileSummary};
use crate::traits::{EndpointSource, ScanReport};

/// Reads the host and merges the result into the repository
pub struct Reconciler {
    source: Arc<dyn EndpointSource>,
    repository: Arc<InstanceRepository>,
    accept_partial_scans: bool,
    events: EventSink,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn EndpointSource>,
        repository: Arc<InstanceRepository>,
        accept_partial_scans: bool,
        events: EventSink,
    ) -> Self {
        Self {
            source,
            repository,
            accept_partial_scans,
            events,
        }
    }

    /// Scan the host
    ///
    /// Dropping the returned future leaves the repository untouched.
    ///
    /// # Errors
    ///
    /// `SourceUnavailable` when the scan fails, or when it is partial and
    /// partial scans are not accepted.
    pub async fn scan(&self) -> Result<ScanReport> {
        let report = match self.source.scan().await {
            Ok(report) => report,
            Err(e) => {
                warn!("Scan of {} failed: {}", self.source.source_name(), e);
                self.events.emit(ProviderEvent::ScanFailed {
                    error: e.to_string(),
                });
                return Err(match e {
                    Error::SourceUnavailable(_) => e,
                    other => Error::source_unavailable(other.to_string()),
                });
            }
        };

        if report.is_partial() {
            if !self.accept_partial_scans {
                warn!(
                    "Discarding partial scan from {} ({} entries unreadable)",
                    self.source.source_name(),
                    report.skipped
                );
                self.events.emit(ProviderEvent::ScanRejected {
                    skipped: report.skipped,
                });
                return Err(Error::source_unavailable(format!(
                    "partial scan ({} entries unreadable)",
                    report.skipped
                )));
            }
            warn!(
                "Partial scan from {}: {} entries unreadable",
                self.source.source_name(),
                report.skipped
            );
        }

        Ok(report)
    }

    /// Merge a scan into the repository
    pub async fn merge(&self, report: &ScanReport) -> ReconcileSummary {
        let summary = self.repository.reconcile(report).await;
        debug!("Reconciled {} facts: {:?}", report.facts.len(), summary);
        self.events.emit(ProviderEvent::Reconciled { summary });
        summary
    }

    /// Scan and merge
    pub async fn run_once(&self) -> Result<ReconcileSummary> {
        let report = self.scan().await?;
        Ok(self.merge(&report).await)
    }
}

impl std::fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reconciler")
            .field("source", &self.source.source_name())
            .field("accept_partial_scans", &self.accept_partial_scans)
            .finish()
    }
}
