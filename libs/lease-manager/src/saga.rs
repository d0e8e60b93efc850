//! Compensation stack for multi-step provisioning.
//!
//! Provisioning crosses two systems (provider and ledger) that share no
//! transaction, so each completed step registers an explicit compensating
//! action. On failure the stack unwinds in reverse order; on success it is
//! disarmed. Compensation failures are logged and never mask the original
//! error.

use futures_util::future::BoxFuture;
use tracing::{info, warn};

/// A compensating action for one completed step.
pub type Compensation = BoxFuture<'static, Result<(), crate::error::LeaseError>>;

/// An ordered stack of named compensations, unwound in reverse.
#[derive(Default)]
pub struct Saga {
    steps: Vec<(&'static str, Compensation)>,
}

impl Saga {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the compensation for a step that just completed.
    pub fn push(&mut self, step: &'static str, undo: Compensation) {
        self.steps.push((step, undo));
    }

    /// Run all registered compensations in reverse order. Failures are
    /// logged and do not stop the unwind.
    pub async fn unwind(self) {
        for (step, undo) in self.steps.into_iter().rev() {
            info!(step, "Compensating completed step");
            if let Err(e) = undo.await {
                warn!(step, error = %e, "Compensation failed");
            }
        }
    }

    /// Success path: drop all compensations without running them.
    pub fn disarm(mut self) {
        self.steps.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.steps.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LeaseError;
    use std::sync::{Arc, Mutex};

    fn recording(
        log: &Arc<Mutex<Vec<&'static str>>>,
        step: &'static str,
        result: Result<(), LeaseError>,
    ) -> Compensation {
        let log = Arc::clone(log);
        Box::pin(async move {
            log.lock().unwrap().push(step);
            result
        })
    }

    #[tokio::test]
    async fn test_unwind_runs_in_reverse_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut saga = Saga::new();
        saga.push("flavor", recording(&log, "flavor", Ok(())));
        saga.push("network", recording(&log, "network", Ok(())));
        saga.push("instance", recording(&log, "instance", Ok(())));

        saga.unwind().await;

        assert_eq!(*log.lock().unwrap(), vec!["instance", "network", "flavor"]);
    }

    #[tokio::test]
    async fn test_unwind_continues_past_failures() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut saga = Saga::new();
        saga.push("flavor", recording(&log, "flavor", Ok(())));
        saga.push(
            "instance",
            recording(&log, "instance", Err(LeaseError::InsufficientCapacity)),
        );

        saga.unwind().await;

        // The failing compensation does not stop the earlier one.
        assert_eq!(*log.lock().unwrap(), vec!["instance", "flavor"]);
    }

    #[tokio::test]
    async fn test_disarm_skips_compensations() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut saga = Saga::new();
        saga.push("instance", recording(&log, "instance", Ok(())));
        assert_eq!(saga.len(), 1);

        saga.disarm();

        assert!(log.lock().unwrap().is_empty());
    }
}
