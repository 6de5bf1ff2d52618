//! Rate limiter trait consumed by the admission layer.

use std::time::Duration;

use async_trait::async_trait;

use super::limiter::{Decision, Stats};
use crate::context::RequestContext;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// The admission guard only talks to the limiter through this trait, so a
/// different backend can stand in for the in-memory [`super::RateLimiter`].
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Count a request and return the full decision.
    async fn check(
        &self,
        ctx: &RequestContext,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<Decision>;

    /// Count a request and return whether it is admitted.
    async fn allow(
        &self,
        ctx: &RequestContext,
        key: &str,
        limit: u64,
        window: Duration,
    ) -> Result<bool>;

    /// Requests left for `key` under `limit`.
    async fn get_remaining(&self, ctx: &RequestContext, key: &str, limit: u64) -> Result<u64>;

    /// Count and remaining quota for `key`.
    async fn get_stats(&self, ctx: &RequestContext, key: &str) -> Result<Stats>;

    /// Time until the window for `key` resets.
    async fn reset_after(&self, ctx: &RequestContext, key: &str) -> Result<Duration>;

    /// Drop the counter for `key`.
    async fn reset(&self, ctx: &RequestContext, key: &str) -> Result<()>;

    /// Sweep expired counters.
    async fn cleanup(&self, ctx: &RequestContext) -> Result<usize>;
}
