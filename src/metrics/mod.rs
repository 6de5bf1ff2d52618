//! Admission metrics and structured decision logging.

mod collector;
mod monitor;

pub use collector::{MetricsCollector, MetricsSnapshot};
pub use monitor::{Monitor, Violator};
