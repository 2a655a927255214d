//! The [`Runner`] supervises concurrently active observers: it starts them,
//! drives their timeout bookkeeping from a polling loop, and offers
//! wait / wait-any / cancel-all batch operations.
//!
//! Scheduling is cooperative polling with a short sleep, the same
//! busy-wait-with-yield style the rest of the crate uses: the I/O thread
//! only ever feeds data, the runner's context is the only one that fires
//! timeouts.

use crate::error::{Error, Result};
use crate::observer::{Observer, ObserverResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::debug;

/// Poll granularity for completion and timer checks.
const POLL: Duration = Duration::from_millis(1);

/// Session-scoped supervisor. Create one per session, drop it (or call
/// [`shutdown`](Self::shutdown)) at session end.
#[derive(Default)]
pub struct Runner {
    active: Mutex<HashMap<u64, Arc<Observer>>>,
}

impl Runner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start the observer and register it for supervision.
    ///
    /// Timers are driven from `wait`/`wait_any`: a submitted observer that is
    /// never awaited does not time out on its own. `shutdown` (or dropping
    /// the runner) cancels whatever was left unawaited.
    pub fn submit(&self, observer: &Arc<Observer>) -> Result<()> {
        observer.start()?;
        self.active
            .lock()
            .unwrap()
            .insert(observer.id(), observer.clone());
        Ok(())
    }

    /// Block the calling task until the observer finishes, then return its
    /// result or re-raise its captured error. Timeout and the terminating
    /// grace sequence are enforced here, not on the I/O thread.
    pub async fn wait(&self, observer: &Arc<Observer>) -> Result<ObserverResult> {
        if !observer.is_started() {
            return Err(Error::NotStarted(observer.name().to_string()));
        }
        loop {
            observer.check_timers(Instant::now());
            if let Some(outcome) = observer.outcome() {
                self.forget(observer);
                return outcome;
            }
            sleep(POLL).await;
        }
    }

    /// Race several observers: returns once at least one is done, or when
    /// `timeout` elapses, partitioning into `(done, not_done)`.
    ///
    /// Both partitions preserve the input order, so the outcome is
    /// deterministic for a given injected input trace.
    pub async fn wait_any(
        &self,
        observers: &[Arc<Observer>],
        timeout: Duration,
    ) -> (Vec<Arc<Observer>>, Vec<Arc<Observer>>) {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            for obs in observers {
                obs.check_timers(now);
            }
            let any_done = observers.iter().any(|o| o.outcome().is_some());
            if any_done || now >= deadline {
                break;
            }
            sleep(POLL).await;
        }
        let mut done = Vec::new();
        let mut not_done = Vec::new();
        for obs in observers {
            if obs.outcome().is_some() {
                self.forget(obs);
                done.push(obs.clone());
            } else {
                not_done.push(obs.clone());
            }
        }
        debug!(done = done.len(), not_done = not_done.len(), "wait_any resolved");
        (done, not_done)
    }

    /// Best-effort cancellation of a batch; observers already done are left
    /// untouched.
    pub fn cancel_all(&self, observers: &[Arc<Observer>]) {
        for obs in observers {
            if obs.outcome().is_none() {
                obs.cancel();
            }
            self.forget(obs);
        }
    }

    /// Number of observers currently under supervision.
    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }

    /// Session teardown: cancel everything still active.
    pub fn shutdown(&self) {
        let drained: Vec<Arc<Observer>> =
            self.active.lock().unwrap().drain().map(|(_, o)| o).collect();
        for obs in drained {
            if obs.outcome().is_none() {
                obs.cancel();
            }
        }
    }

    fn forget(&self, observer: &Arc<Observer>) {
        self.active.lock().unwrap().remove(&observer.id());
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
