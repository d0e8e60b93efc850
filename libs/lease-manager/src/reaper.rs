//! Reclamation reaper.
//!
//! Finds leases past their end date and runs the inverse provisioning
//! workflow for each. Reclamation is at-least-once: the ledger row is
//! deleted only after the provider-side instance is gone, so a crash
//! mid-pass leaves the row intact for the next run. Each lease is handled
//! independently; one failure never aborts the pass or the loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::error::LeaseError;
use crate::orchestrator::LeaseManager;
use crate::store::Store;

/// Outcome of one reclamation pass. Per-lease failures are reported here,
/// never raised; the loop retries them on its next tick.
#[derive(Debug, Default)]
pub struct ReapReport {
    pub reclaimed: usize,
    pub failures: Vec<(String, LeaseError)>,
}

impl ReapReport {
    pub fn fully_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Reclaims expired leases.
pub struct Reaper {
    store: Arc<dyn Store>,
    manager: Arc<LeaseManager>,
}

impl Reaper {
    pub fn new(store: Arc<dyn Store>, manager: Arc<LeaseManager>) -> Self {
        Self { store, manager }
    }

    /// Run one reclamation pass for every lease whose end date is strictly
    /// before `today`. Safe to invoke at any frequency; a pass over an
    /// already-clean ledger is a no-op.
    #[instrument(skip(self))]
    pub async fn reap(&self, today: NaiveDate) -> ReapReport {
        let mut report = ReapReport::default();

        let expired = match self.store.expired_leases(today).await {
            Ok(expired) => expired,
            Err(e) => {
                error!(error = %e, "Failed to load expired leases");
                return report;
            }
        };

        if expired.is_empty() {
            return report;
        }
        info!(count = expired.len(), "Reclaiming expired leases");

        for lease in expired {
            match self.manager.reclaim(&lease).await {
                Ok(()) => report.reclaimed += 1,
                Err(e) => {
                    warn!(lease = %lease.name, error = %e, "Failed to reclaim lease");
                    report.failures.push((lease.name, e));
                }
            }
        }

        info!(
            reclaimed = report.reclaimed,
            failed = report.failures.len(),
            "Reclamation pass complete"
        );
        report
    }
}

/// Background worker that runs the reaper on a fixed schedule.
pub struct ReaperWorker {
    reaper: Reaper,
    interval: Duration,
}

impl ReaperWorker {
    pub fn new(reaper: Reaper, interval: Duration) -> Self {
        Self { reaper, interval }
    }

    /// Run the reaper loop until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting reaper worker"
        );

        let mut interval = tokio::time::interval(self.interval);
        // Don't immediately tick on startup - wait for first interval
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.reaper.reap(Utc::now().date_naive()).await;
                }
                changed = shutdown.changed() => {
                    // A dropped sender can never signal again; treat it
                    // the same as an explicit shutdown.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reaper worker shutting down");
                        break;
                    }
                }
            }
        }
    }
}
