//! Fixed-window counter store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::clock::{Clock, SystemClock};
use crate::context::RequestContext;
use crate::error::Result;

/// Counter state for a single key.
#[derive(Debug, Clone, Copy)]
struct CounterEntry {
    /// Requests counted since `window_start`
    count: u64,
    /// When the current window started
    window_start: Instant,
    /// Window length given by the last writer
    window: Duration,
}

impl CounterEntry {
    fn fresh(now: Instant, window: Duration) -> Self {
        Self {
            count: 0,
            window_start: now,
            window,
        }
    }

    /// End of the current window; `None` when it lies past what `Instant` can represent.
    fn window_end(&self) -> Option<Instant> {
        self.window_start.checked_add(self.window)
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.window_end().is_some_and(|end| now >= end)
    }

    fn reset_after(&self, now: Instant) -> Duration {
        match self.window_end() {
            Some(end) => end.saturating_duration_since(now),
            None => self
                .window
                .saturating_sub(now.saturating_duration_since(self.window_start)),
        }
    }
}

/// Result of counting a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tally {
    /// Counter value after the call
    pub count: u64,
    /// Whether this call incremented the counter
    pub counted: bool,
    /// Time until the window the request was counted in resets
    pub reset_after: Duration,
}

/// Thread-safe, time-windowed counters keyed by string.
///
/// All operations take the same lock, so increments on a key are totally
/// ordered. Every operation checks the request context before it looks at
/// the map and leaves state untouched when the context is done.
#[derive(Debug)]
pub struct CounterStore {
    entries: Mutex<HashMap<String, CounterEntry>>,
    clock: Arc<dyn Clock>,
}

impl CounterStore {
    /// Create a store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store driven by the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Count one request for `key` and return the count after it.
    ///
    /// An absent or expired entry starts a new window at 1.
    pub fn increment(&self, ctx: &RequestContext, key: &str, window: Duration) -> Result<u64> {
        self.record(ctx, key, window, None).map(|tally| tally.count)
    }

    /// Count one request for `key` only while the count is below `limit`.
    ///
    /// Returns the count after the call and whether the request was counted.
    pub fn increment_below(
        &self,
        ctx: &RequestContext,
        key: &str,
        window: Duration,
        limit: u64,
    ) -> Result<(u64, bool)> {
        self.record(ctx, key, window, Some(limit))
            .map(|tally| (tally.count, tally.counted))
    }

    /// Count one request for `key`, stopping at `bound` when one is given.
    ///
    /// The count and the time until reset are read under the same lock as
    /// the increment.
    pub fn record(
        &self,
        ctx: &RequestContext,
        key: &str,
        window: Duration,
        bound: Option<u64>,
    ) -> Result<Tally> {
        ctx.check()?;

        let now = self.clock.now();
        let mut entries = self.entries.lock();
        let entry = Self::live_entry(&mut entries, key, now, window);
        entry.window = window;

        let counted = bound.map_or(true, |limit| entry.count < limit);
        if counted {
            entry.count += 1;
            trace!(key = %key, count = entry.count, "Incremented counter");
        } else {
            trace!(key = %key, count = entry.count, "Counter at limit");
        }

        Ok(Tally {
            count: entry.count,
            counted,
            reset_after: entry.reset_after(now),
        })
    }

    /// Current count for `key`; 0 when absent or expired.
    ///
    /// Expired entries are left in place for [`CounterStore::cleanup`].
    pub fn get(&self, ctx: &RequestContext, key: &str) -> Result<u64> {
        ctx.check()?;

        let now = self.clock.now();
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map_or(0, |entry| entry.count))
    }

    /// Time until the live window for `key` ends; zero when absent or expired.
    pub fn reset_after(&self, ctx: &RequestContext, key: &str) -> Result<Duration> {
        ctx.check()?;

        let now = self.clock.now();
        let entries = self.entries.lock();
        Ok(entries
            .get(key)
            .map_or(Duration::ZERO, |entry| entry.reset_after(now)))
    }

    /// Remove the entry for `key`. Removing an absent key is not an error.
    pub fn reset(&self, ctx: &RequestContext, key: &str) -> Result<()> {
        ctx.check()?;

        if self.entries.lock().remove(key).is_some() {
            debug!(key = %key, "Reset rate limit counter");
        }
        Ok(())
    }

    /// Remove every expired entry and return how many were removed.
    pub fn cleanup(&self, ctx: &RequestContext) -> Result<usize> {
        self.cleanup_expired(ctx).map(|removed| removed.len())
    }

    /// Remove every expired entry and return the removed keys.
    pub fn cleanup_expired(&self, ctx: &RequestContext) -> Result<Vec<String>> {
        ctx.check()?;

        let now = self.clock.now();
        let mut removed = Vec::new();
        self.entries.lock().retain(|key, entry| {
            if entry.is_expired(now) {
                removed.push(key.clone());
                false
            } else {
                true
            }
        });
        Ok(removed)
    }

    /// Whether an entry, live or expired, is stored for `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().contains_key(key)
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Fetch the entry for `key`, starting a new window if it is absent or expired.
    fn live_entry<'a>(
        entries: &'a mut HashMap<String, CounterEntry>,
        key: &str,
        now: Instant,
        window: Duration,
    ) -> &'a mut CounterEntry {
        let entry = entries.entry(key.to_string()).or_insert_with(|| {
            debug!(key = %key, window = ?window, "Creating new rate limit counter");
            CounterEntry::fresh(now, window)
        });
        if entry.is_expired(now) {
            *entry = CounterEntry::fresh(now, window);
        }
        entry
    }
}

impl Default for CounterStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TurnstileError;
    use crate::ratelimit::clock::ManualClock;
    use tokio_test::{assert_err, assert_ok};

    const WINDOW: Duration = Duration::from_secs(60);

    fn manual_store() -> (Arc<ManualClock>, CounterStore) {
        let clock = Arc::new(ManualClock::new());
        let store = CounterStore::with_clock(clock.clone());
        (clock, store)
    }

    #[test]
    fn test_increment_counts_up() {
        let (_, store) = manual_store();
        let ctx = RequestContext::background();

        assert_eq!(store.increment(&ctx, "a", WINDOW).unwrap(), 1);
        assert_eq!(store.increment(&ctx, "a", WINDOW).unwrap(), 2);
        assert_eq!(store.increment(&ctx, "b", WINDOW).unwrap(), 1);
        assert_eq!(store.get(&ctx, "a").unwrap(), 2);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_increment_resets_expired_window() {
        let (clock, store) = manual_store();
        let ctx = RequestContext::background();

        for _ in 0..5 {
            store.increment(&ctx, "a", WINDOW).unwrap();
        }
        clock.advance(WINDOW);

        assert_eq!(store.increment(&ctx, "a", WINDOW).unwrap(), 1);
    }

    #[test]
    fn test_get_absent_and_expired() {
        let (clock, store) = manual_store();
        let ctx = RequestContext::background();

        assert_eq!(store.get(&ctx, "missing").unwrap(), 0);

        store.increment(&ctx, "a", WINDOW).unwrap();
        clock.advance(WINDOW + Duration::from_millis(1));

        assert_eq!(store.get(&ctx, "a").unwrap(), 0);
        // Reads never delete
        assert!(store.contains("a"));
    }

    #[test]
    fn test_last_writer_window_governs_expiry() {
        let (clock, store) = manual_store();
        let ctx = RequestContext::background();

        store.increment(&ctx, "a", Duration::from_secs(10)).unwrap();
        store.increment(&ctx, "a", Duration::from_secs(1)).unwrap();
        clock.advance(Duration::from_secs(2));

        assert_eq!(store.get(&ctx, "a").unwrap(), 0);
    }

    #[test]
    fn test_reset_then_get_is_zero() {
        let (_, store) = manual_store();
        let ctx = RequestContext::background();

        store.increment(&ctx, "a", WINDOW).unwrap();
        assert_ok!(store.reset(&ctx, "a"));
        assert_eq!(store.get(&ctx, "a").unwrap(), 0);
        assert!(!store.contains("a"));

        // Idempotent
        assert_ok!(store.reset(&ctx, "a"));
    }

    #[test]
    fn test_cleanup_removes_only_expired() {
        let (clock, store) = manual_store();
        let ctx = RequestContext::background();

        store.increment(&ctx, "old", Duration::from_secs(1)).unwrap();
        for _ in 0..3 {
            store.increment(&ctx, "live", WINDOW).unwrap();
        }
        clock.advance(Duration::from_secs(2));

        assert_eq!(store.cleanup(&ctx).unwrap(), 1);
        assert!(!store.contains("old"));
        assert_eq!(store.get(&ctx, "live").unwrap(), 3);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_increment_below_stops_at_limit() {
        let (_, store) = manual_store();
        let ctx = RequestContext::background();

        assert_eq!(store.increment_below(&ctx, "a", WINDOW, 2).unwrap(), (1, true));
        assert_eq!(store.increment_below(&ctx, "a", WINDOW, 2).unwrap(), (2, true));
        assert_eq!(store.increment_below(&ctx, "a", WINDOW, 2).unwrap(), (2, false));
        assert_eq!(store.get(&ctx, "a").unwrap(), 2);
    }

    #[test]
    fn test_reset_after() {
        let (clock, store) = manual_store();
        let ctx = RequestContext::background();

        assert_eq!(store.reset_after(&ctx, "a").unwrap(), Duration::ZERO);

        store.increment(&ctx, "a", WINDOW).unwrap();
        clock.advance(Duration::from_secs(20));
        assert_eq!(store.reset_after(&ctx, "a").unwrap(), Duration::from_secs(40));

        clock.advance(WINDOW);
        assert_eq!(store.reset_after(&ctx, "a").unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_record_reports_reset_in_same_call() {
        let (clock, store) = manual_store();
        let ctx = RequestContext::background();

        let tally = store.record(&ctx, "a", WINDOW, None).unwrap();
        assert_eq!(
            tally,
            Tally {
                count: 1,
                counted: true,
                reset_after: WINDOW,
            }
        );

        clock.advance(Duration::from_secs(45));
        let tally = store.record(&ctx, "a", WINDOW, Some(1)).unwrap();
        assert_eq!(tally.count, 1);
        assert!(!tally.counted);
        assert_eq!(tally.reset_after, Duration::from_secs(15));
    }

    #[test]
    fn test_cleanup_expired_returns_removed_keys() {
        let (clock, store) = manual_store();
        let ctx = RequestContext::background();

        store.increment(&ctx, "old", Duration::from_secs(1)).unwrap();
        store.increment(&ctx, "live", WINDOW).unwrap();
        clock.advance(Duration::from_secs(2));

        assert_eq!(store.cleanup_expired(&ctx).unwrap(), vec!["old".to_string()]);
        assert!(store.cleanup_expired(&ctx).unwrap().is_empty());
    }

    #[test]
    fn test_unrepresentable_window_never_expires() {
        let (clock, store) = manual_store();
        let ctx = RequestContext::background();
        let huge = Duration::from_secs(u64::MAX);

        assert_eq!(store.increment(&ctx, "a", huge).unwrap(), 1);
        assert_eq!(store.increment(&ctx, "a", Duration::MAX).unwrap(), 2);

        clock.advance(Duration::from_secs(86_400));
        assert_eq!(store.get(&ctx, "a").unwrap(), 2);
        assert_eq!(store.cleanup(&ctx).unwrap(), 0);
        assert_eq!(
            store.reset_after(&ctx, "a").unwrap(),
            Duration::MAX - Duration::from_secs(86_400)
        );
    }

    #[test]
    fn test_cancelled_context_leaves_state_untouched() {
        let (clock, store) = manual_store();
        let live = RequestContext::background();
        store.increment(&live, "a", Duration::from_secs(1)).unwrap();

        let cancelled = RequestContext::background();
        cancelled.cancel();

        assert!(matches!(
            store.increment(&cancelled, "a", WINDOW),
            Err(TurnstileError::Cancelled)
        ));
        assert_err!(store.increment_below(&cancelled, "a", WINDOW, 10));
        assert_err!(store.get(&cancelled, "a"));
        assert_err!(store.reset(&cancelled, "a"));
        assert_eq!(store.get(&live, "a").unwrap(), 1);

        clock.advance(Duration::from_secs(2));
        assert_err!(store.cleanup(&cancelled));
        assert!(store.contains("a"));
    }

    #[test]
    fn test_expired_deadline_is_rejected() {
        let (_, store) = manual_store();
        let ctx = RequestContext::background().with_timeout(Duration::ZERO);

        assert!(matches!(
            store.increment(&ctx, "a", WINDOW),
            Err(TurnstileError::DeadlineExceeded)
        ));
        assert!(store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments_are_not_lost() {
        let store = Arc::new(CounterStore::new());
        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move {
                    let ctx = RequestContext::background();
                    store.increment(&ctx, "shared", WINDOW).unwrap();
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            result.unwrap();
        }

        let ctx = RequestContext::background();
        assert_eq!(store.get(&ctx, "shared").unwrap(), 200);
    }

    #[test]
    fn test_concurrent_increments_across_threads() {
        let store = Arc::new(CounterStore::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let ctx = RequestContext::background();
                    for _ in 0..250 {
                        store.increment(&ctx, "shared", WINDOW).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let ctx = RequestContext::background();
        assert_eq!(store.get(&ctx, "shared").unwrap(), 2000);
    }
}
