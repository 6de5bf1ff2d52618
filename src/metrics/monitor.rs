//! Decision reporting and offender ranking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{error, info, warn};

use super::collector::{MetricsCollector, MetricsSnapshot};
use crate::context::RequestContext;
use crate::error::TurnstileError;

/// A key and the number of times it was denied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violator {
    pub key: String,
    pub violations: u64,
}

/// Records each admission outcome in the metrics and as a log event.
#[derive(Debug, Clone, Default)]
pub struct Monitor {
    metrics: Arc<MetricsCollector>,
}

impl Monitor {
    pub fn new(metrics: Arc<MetricsCollector>) -> Self {
        Self { metrics }
    }

    /// The collector this monitor writes to.
    pub fn collector(&self) -> &Arc<MetricsCollector> {
        &self.metrics
    }

    /// Record a denied request.
    #[allow(clippy::too_many_arguments)]
    pub fn log_violation(
        &self,
        ctx: &RequestContext,
        key: &str,
        origin: &str,
        identity: &str,
        limit: u64,
        window: Duration,
        count: u64,
    ) {
        self.metrics.increment_blocked(key);

        warn!(
            request_id = ctx.request_id().unwrap_or_default(),
            key = %key,
            origin = %origin,
            identity = %identity,
            limit = limit,
            window_secs = window.as_secs(),
            count = count,
            "Rate limit exceeded"
        );
    }

    /// Record an admitted request.
    #[allow(clippy::too_many_arguments)]
    pub fn log_allowed(
        &self,
        ctx: &RequestContext,
        key: &str,
        origin: &str,
        identity: &str,
        count: u64,
        limit: u64,
        remaining: u64,
    ) {
        self.metrics.increment_allowed();
        self.metrics.increment_key_requests(key);

        info!(
            request_id = ctx.request_id().unwrap_or_default(),
            key = %key,
            origin = %origin,
            identity = %identity,
            count = count,
            limit = limit,
            remaining = remaining,
            "Request allowed"
        );
    }

    /// Record a failed limiter operation.
    pub fn log_error(
        &self,
        ctx: &RequestContext,
        key: &str,
        origin: &str,
        identity: &str,
        err: &TurnstileError,
        operation: &str,
    ) {
        self.metrics.increment_error();

        error!(
            request_id = ctx.request_id().unwrap_or_default(),
            key = %key,
            origin = %origin,
            identity = %identity,
            operation = %operation,
            error = %err,
            "Rate limiter operation failed"
        );
    }

    /// Snapshot the metrics. The query itself is counted as a request.
    pub fn get_metrics(&self, _ctx: &RequestContext) -> MetricsSnapshot {
        self.metrics.increment_total();
        self.metrics.snapshot()
    }

    pub fn reset_metrics(&self, ctx: &RequestContext) {
        self.metrics.reset();
        info!(request_id = ctx.request_id().unwrap_or_default(), "Metrics reset");
    }

    /// The `top_n` keys by violation count, highest first.
    ///
    /// Equal counts are ordered by key so the ranking is stable.
    pub fn top_violators(violations: &HashMap<String, u64>, top_n: usize) -> Vec<Violator> {
        let mut ranked: Vec<Violator> = violations
            .iter()
            .map(|(key, &violations)| Violator {
                key: key.clone(),
                violations,
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.violations
                .cmp(&a.violations)
                .then_with(|| a.key.cmp(&b.key))
        });
        ranked.truncate(top_n);
        ranked
    }

    /// Top violators from the live metrics, without counting as a request.
    pub fn current_top_violators(&self, top_n: usize) -> Vec<Violator> {
        Self::top_violators(&self.metrics.snapshot().violations_by_key, top_n)
    }
}
