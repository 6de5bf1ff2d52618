//! Periodic sweep of expired counters.
//!
//! The sweeper is the only caller of [`RateLimiter::cleanup`] in a running
//! service, which keeps the O(n) scan off the request path. It is owned by the
//! process lifecycle and stops when its cancellation token fires.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::context::RequestContext;
use crate::metrics::Monitor;
use crate::ratelimit::RateLimiter;

/// Handle to a running cleanup task.
#[derive(Debug)]
pub struct CleanupTask {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl CleanupTask {
    /// Start sweeping every `interval` until `token` is cancelled.
    ///
    /// The first sweep runs one full interval after spawning.
    pub fn spawn(
        limiter: Arc<RateLimiter>,
        monitor: Arc<Monitor>,
        interval: Duration,
        token: CancellationToken,
    ) -> Self {
        info!(interval_secs = interval.as_secs(), "Starting counter cleanup task");

        let task_token = token.clone();
        let task_ctx = RequestContext::with_token(token.clone());
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        sweep(&task_ctx.child(), &limiter, &monitor);
                    }
                }
            }

            info!("Counter cleanup task stopped");
        });

        Self { token, handle }
    }

    /// Cancel the task and wait for it to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(e) = self.handle.await {
            error!(error = %e, "Cleanup task ended abnormally");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Run one cleanup pass and record its outcome.
pub fn sweep(ctx: &RequestContext, limiter: &RateLimiter, monitor: &Monitor) {
    let metrics = monitor.collector();
    match limiter.cleanup(ctx) {
        Ok(removed) => {
            let active = limiter.active_keys();
            metrics.set_active_keys(active);
            metrics.set_last_cleanup(Utc::now());
            debug!(removed = removed, active_keys = active, "Swept expired counters");
        }
        Err(e) if e.is_context_error() => {
            debug!(error = %e, "Cleanup skipped");
        }
        Err(e) => {
            metrics.increment_error();
            error!(error = %e, "Counter cleanup failed");
        }
    }
}
