//! Process-lifetime admission counters.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

/// Independent copy of the collector state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub total: u64,
    pub allowed: u64,
    pub blocked: u64,
    pub errors: u64,
    /// Denials per key
    pub violations_by_key: HashMap<String, u64>,
    /// Admitted requests per key
    pub requests_by_key: HashMap<String, u64>,
    pub active_keys: usize,
    pub last_cleanup: Option<DateTime<Utc>>,
}

/// Aggregate counters shared by every request.
///
/// Scalars and per-key tallies live under one lock so a snapshot never sees
/// `blocked` bumped without the matching violation tally.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    state: RwLock<MetricsSnapshot>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_total(&self) {
        self.state.write().total += 1;
    }

    pub fn increment_allowed(&self) {
        self.state.write().allowed += 1;
    }

    /// Count a denial and attribute it to `key`.
    pub fn increment_blocked(&self, key: &str) {
        let mut state = self.state.write();
        state.blocked += 1;
        *state.violations_by_key.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn increment_error(&self) {
        self.state.write().errors += 1;
    }

    pub fn increment_key_requests(&self, key: &str) {
        *self
            .state
            .write()
            .requests_by_key
            .entry(key.to_string())
            .or_insert(0) += 1;
    }

    pub fn set_active_keys(&self, active_keys: usize) {
        self.state.write().active_keys = active_keys;
    }

    pub fn set_last_cleanup(&self, at: DateTime<Utc>) {
        self.state.write().last_cleanup = Some(at);
    }

    /// Copy of the current state, safe to retain.
    pub fn snapshot(&self) -> MetricsSnapshot {
        self.state.read().clone()
    }

    /// Zero every counter and clear both per-key maps.
    pub fn reset(&self) {
        *self.state.write() = MetricsSnapshot::default();
    }
}
