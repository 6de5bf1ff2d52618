//! Rate limiting logic and state management.

mod backend;
mod clock;
mod key;
mod limiter;
mod policy;
mod store;

pub use backend::RateLimiterBackend;
pub use clock::{Clock, ManualClock, SystemClock};
pub use key::KeyStrategy;
pub use limiter::{Decision, RateLimiter, Stats, DEFAULT_LIMIT};
pub use policy::{LimitRule, Policy};
pub use store::{CounterStore, Tally};
