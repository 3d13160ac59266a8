//! Convergence poller
//!
//! Every signal this crate checks is eventually consistent: the controller
//! writes nodes, tracker entries and secrets in whatever order it reconciles
//! them. All waiting goes through [`poll_until`], which evaluates a predicate
//! at a fixed interval until it converges, fails fatally, or the deadline
//! passes.
//!
//! Time is read and slept through a [`Clock`] so tests can run poll loops
//! without real sleeps.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::Error;

/// Outcome of one predicate evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Convergence<T> {
    /// Observed state is consistent with full convergence
    Converged(T),
    /// Not there yet; keep polling
    Pending,
}

/// Source of time for poll loops
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> Instant;

    /// Suspend for `duration`
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by the tokio timer
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Deadline for a wait that scales with fleet size.
///
/// Scaling to zero nodes still gets one full allowance.
pub fn deadline_for(per_node: Duration, expected_nodes: usize) -> Duration {
    let factor = u32::try_from(expected_nodes.max(1)).unwrap_or(u32::MAX);
    per_node.saturating_mul(factor)
}

/// Poll `check` every `interval` until it converges or `timeout` elapses.
///
/// The predicate is always evaluated at least once, even with a zero timeout.
/// `Err(NotFound)` counts as pending since watched objects may not exist
/// before the controller's first reconcile; any other error is returned
/// immediately.
pub async fn poll_until<T, F, Fut>(
    clock: &dyn Clock,
    interval: Duration,
    timeout: Duration,
    what: &str,
    mut check: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Convergence<T>, Error>>,
{
    let start = clock.now();
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        match check().await {
            Ok(Convergence::Converged(value)) => {
                debug!(what = %what, attempts, "converged");
                return Ok(value);
            }
            Ok(Convergence::Pending) => {
                trace!(what = %what, attempts, "not yet converged");
            }
            Err(e) if e.is_not_found() => {
                debug!(what = %what, attempts, error = %e, "watched object not found yet");
            }
            Err(e) => return Err(e),
        }

        let elapsed = clock.now().saturating_duration_since(start);
        if elapsed >= timeout {
            return Err(Error::timeout(what, timeout, attempts));
        }
        clock.sleep(interval.min(timeout - elapsed)).await;
    }
}

/// Poll settings bound to a clock
#[derive(Clone)]
pub struct Poller {
    clock: Arc<dyn Clock>,
    /// Sleep between attempts
    pub interval: Duration,
    /// Per-node (or single-item) allowance
    pub timeout: Duration,
}

impl std::fmt::Debug for Poller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Poller")
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Poller {
    /// Create a poller on the tokio clock
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self::with_clock(Arc::new(TokioClock), interval, timeout)
    }

    /// Create a poller on an explicit clock
    pub fn with_clock(clock: Arc<dyn Clock>, interval: Duration, timeout: Duration) -> Self {
        Self {
            clock,
            interval,
            timeout,
        }
    }

    /// Wait for a single object, using the unscaled timeout
    pub async fn wait_for<T, F, Fut>(&self, what: &str, check: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Convergence<T>, Error>>,
    {
        poll_until(self.clock.as_ref(), self.interval, self.timeout, what, check).await
    }

    /// Wait for fleet-wide state, scaling the timeout by `expected_nodes`
    pub async fn wait_for_fleet<T, F, Fut>(
        &self,
        what: &str,
        expected_nodes: usize,
        check: F,
    ) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Convergence<T>, Error>>,
    {
        let timeout = deadline_for(self.timeout, expected_nodes);
        poll_until(self.clock.as_ref(), self.interval, timeout, what, check).await
    }
}
