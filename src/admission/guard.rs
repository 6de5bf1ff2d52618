//! Per-request admission decision.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, instrument};

use crate::context::RequestContext;
use crate::error::Result;
use crate::metrics::Monitor;
use crate::ratelimit::{Policy, RateLimiterBackend};

/// The caller attributes an admission decision is made from.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    /// Request path, matched exactly against exemptions
    pub path: &'a str,
    /// Origin address of the caller
    pub origin: &'a str,
    /// Authenticated identity, if any
    pub identity: Option<&'a str>,
}

/// Quota state attached to a counted request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quota {
    pub key: String,
    pub limit: u64,
    pub remaining: u64,
    pub count: u64,
    /// Time until the window resets
    #[serde(with = "duration_secs")]
    pub reset_after: Duration,
}

/// Result of running a request through the guard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum Admission {
    /// The path is exempt; no counter was touched
    Exempt,
    Allowed(Quota),
    Denied(Quota),
}

impl Admission {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Denied(_))
    }

    pub fn quota(&self) -> Option<&Quota> {
        match self {
            Admission::Exempt => None,
            Admission::Allowed(quota) | Admission::Denied(quota) => Some(quota),
        }
    }
}

/// Runs policy selection, the limiter and the monitor for each request.
///
/// This is the transport-independent body of an HTTP rate limit middleware:
/// the caller extracts the request attributes, calls [`AdmissionGuard::check`],
/// and maps the result to its own response types.
pub struct AdmissionGuard<B: RateLimiterBackend> {
    backend: Arc<B>,
    policy: Policy,
    monitor: Arc<Monitor>,
    include_headers: bool,
}

impl<B: RateLimiterBackend> AdmissionGuard<B> {
    pub fn new(backend: Arc<B>, policy: Policy, monitor: Arc<Monitor>) -> Self {
        Self {
            backend,
            policy,
            monitor,
            include_headers: true,
        }
    }

    /// Choose whether allowed requests carry quota headers.
    pub fn with_headers(mut self, include_headers: bool) -> Self {
        self.include_headers = include_headers;
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// Decide whether a request is admitted.
    ///
    /// Limiter errors, including cancellation, are returned unchanged: the
    /// decision is unknown and the caller chooses how to fail.
    #[instrument(skip(self, ctx), fields(path = %req.path, origin = %req.origin))]
    pub async fn check(&self, ctx: &RequestContext, req: &RequestInfo<'_>) -> Result<Admission> {
        self.monitor.collector().increment_total();

        if self.policy.is_exempt(req.path) {
            debug!(path = %req.path, "Path exempt from rate limiting");
            return Ok(Admission::Exempt);
        }

        let identity = req.identity.unwrap_or_default();
        let key = self.policy.key_for(req.origin, req.identity);
        let rule = self.policy.limits_for(req.identity);

        let decision = match self
            .backend
            .check(ctx, &key, rule.requests, rule.window())
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                self.monitor
                    .log_error(ctx, &key, req.origin, identity, &err, "allow");
                return Err(err);
            }
        };

        let quota = Quota {
            key,
            limit: decision.limit,
            remaining: decision.remaining,
            count: decision.count,
            reset_after: decision.reset_after,
        };

        if decision.allowed {
            self.monitor.log_allowed(
                ctx,
                &quota.key,
                req.origin,
                identity,
                quota.count,
                quota.limit,
                quota.remaining,
            );
            Ok(Admission::Allowed(quota))
        } else {
            self.monitor.log_violation(
                ctx,
                &quota.key,
                req.origin,
                identity,
                quota.limit,
                rule.window(),
                quota.count,
            );
            Ok(Admission::Denied(quota))
        }
    }

    /// Header name/value pairs a transport should attach for `admission`.
    ///
    /// Quota headers follow the `include_headers` setting; a denial always
    /// carries `Retry-After`.
    pub fn headers(&self, admission: &Admission) -> Vec<(&'static str, String)> {
        let Some(quota) = admission.quota() else {
            return Vec::new();
        };

        let reset_secs = ceil_secs(quota.reset_after);
        let mut headers = Vec::with_capacity(4);
        if self.include_headers {
            headers.push(("X-RateLimit-Limit", quota.limit.to_string()));
            headers.push(("X-RateLimit-Remaining", quota.remaining.to_string()));
            headers.push(("X-RateLimit-Reset", reset_secs.to_string()));
        }
        if !admission.is_allowed() {
            headers.push(("Retry-After", reset_secs.max(1).to_string()));
        }
        headers
    }
}

fn ceil_secs(duration: Duration) -> u64 {
    let secs = duration.as_secs();
    if duration.subsec_nanos() > 0 {
        secs.saturating_add(1)
    } else {
        secs
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(super::ceil_secs(*duration))
    }
}
