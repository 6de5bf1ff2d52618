//! Core rate limiter implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, trace};

use super::backend::RateLimiterBackend;
use super::store::CounterStore;
use crate::context::RequestContext;
use crate::error::Result;

/// Default rate limit used for stats on keys with no recorded limit.
pub const DEFAULT_LIMIT: u64 = 100;

/// Outcome of a single admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request is within the limit
    pub allowed: bool,
    /// Counter value after this request
    pub count: u64,
    /// The limit the request was checked against
    pub limit: u64,
    /// Requests left in the current window
    pub remaining: u64,
    /// Time until the window this request was counted in resets
    pub reset_after: Duration,
}

/// Point-in-time view of a single key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub key: String,
    pub count: u64,
    pub remaining: u64,
    /// Correlation id of the requesting context, empty when absent
    pub request_id: String,
}

/// Translates counter values into allow/deny decisions.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    /// Counter state
    store: Arc<CounterStore>,
    /// Last limit applied to each key, used by [`RateLimiter::get_stats`]
    limits: RwLock<HashMap<String, u64>>,
    /// Limit assumed for keys with no recorded limit
    default_limit: u64,
    /// Whether denied requests still consume a slot
    count_denied: bool,
}

impl RateLimiter {
    /// Create a rate limiter over the given store.
    pub fn new(store: Arc<CounterStore>) -> Self {
        Self {
            store,
            limits: RwLock::new(HashMap::new()),
            default_limit: DEFAULT_LIMIT,
            count_denied: true,
        }
    }

    /// Set the limit reported by stats for keys never checked.
    pub fn with_default_limit(mut self, limit: u64) -> Self {
        self.default_limit = limit;
        self
    }

    /// Choose whether denied requests increment the counter.
    ///
    /// When `false`, a key at its limit is denied without being counted, so
    /// clients retrying through a denial do not extend their own lockout.
    pub fn with_count_denied(mut self, count_denied: bool) -> Self {
        self.count_denied = count_denied;
        self
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<CounterStore> {
        &self.store
    }

    /// Count a request for `key` and decide whether it is within `limit`.
    pub fn check(
        &self,
        ctx: &RequestContext,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Decision> {
        trace!(key = %key, limit = limit, window = ?window, "Checking rate limit");

        let bound = (!self.count_denied).then_some(limit);
        let tally = self.store.record(ctx, key, window, bound)?;
        let count = tally.count;
        let allowed = tally.counted && count <= limit;

        self.remember_limit(key, limit);

        if !allowed {
            debug!(key = %key, count = count, limit = limit, "Rate limit exceeded");
        }

        Ok(Decision {
            allowed,
            count,
            limit,
            remaining: limit.saturating_sub(count),
            reset_after: tally.reset_after,
        })
    }

    /// Count a request for `key` and return whether it is admitted.
    ///
    /// A denied request still consumes a slot unless the limiter was built
    /// with `with_count_denied(false)`.
    pub fn allow(
        &self,
        ctx: &RequestContext,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<bool> {
        self.check(ctx, key, limit, window).map(|decision| decision.allowed)
    }

    /// Requests left for `key` in its current window.
    pub fn get_remaining(&self, ctx: &RequestContext, key: &str, limit: u64) -> Result<u64> {
        let count = self.store.get(ctx, key)?;
        Ok(limit.saturating_sub(count))
    }

    /// Count and remaining quota for `key`.
    pub fn get_stats(&self, ctx: &RequestContext, key: &str) -> Result<Stats> {
        let count = self.store.get(ctx, key)?;
        let limit = self
            .limits
            .read()
            .get(key)
            .copied()
            .unwrap_or(self.default_limit);

        Ok(Stats {
            key: key.to_string(),
            count,
            remaining: limit.saturating_sub(count),
            request_id: ctx.request_id().unwrap_or_default().to_string(),
        })
    }

    /// Time until the window for `key` resets.
    pub fn reset_after(&self, ctx: &RequestContext, key: &str) -> Result<Duration> {
        self.store.reset_after(ctx, key)
    }

    /// Drop the counter for `key`.
    pub fn reset(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        self.store.reset(ctx, key)?;
        self.limits.write().remove(key);
        Ok(())
    }

    /// Sweep expired counters and return how many were removed.
    pub fn cleanup(&self, ctx: &RequestContext) -> Result<usize> {
        let removed = self.store.cleanup_expired(ctx)?;
        if !removed.is_empty() {
            let mut limits = self.limits.write();
            for key in &removed {
                limits.remove(key);
            }
        }
        Ok(removed.len())
    }

    /// Number of keys currently held by the store.
    pub fn active_keys(&self) -> usize {
        self.store.len()
    }

    fn remember_limit(&self, key: &str, limit: u64) {
        if self.limits.read().get(key) == Some(&limit) {
            return;
        }
        self.limits.write().insert(key.to_string(), limit);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Arc::new(CounterStore::new()))
    }
}

#[async_trait]
impl RateLimiterBackend for RateLimiter {
    async fn check(
        &self,
        ctx: &RequestContext,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Decision> {
        RateLimiter::check(self, ctx, key, limit, window)
    }

    async fn allow(
        &self,
        ctx: &RequestContext,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<bool> {
        RateLimiter::allow(self, ctx, key, limit, window)
    }

    async fn get_remaining(&self, ctx: &RequestContext, key: &str, limit: u64) -> Result<u64> {
        RateLimiter::get_remaining(self, ctx, key, limit)
    }

    async fn get_stats(&self, ctx: &RequestContext, key: &str) -> Result<Stats> {
        RateLimiter::get_stats(self, ctx, key)
    }

    async fn reset_after(&self, ctx: &RequestContext, key: &str) -> Result<Duration> {
        RateLimiter::reset_after(self, ctx, key)
    }

    async fn reset(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        RateLimiter::reset(self, ctx, key)
    }

    async fn cleanup(&self, ctx: &RequestContext) -> Result<usize> {
        RateLimiter::cleanup(self, ctx)
    }
}
