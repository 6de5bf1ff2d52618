//! Turnstile - In-Memory Request Admission Control
//!
//! This crate decides, per caller-supplied key, whether to admit or reject a
//! unit of work under a fixed-window rate limit. Counters live in process
//! memory; a background sweeper reclaims expired windows, and every decision
//! is reported to an in-process metrics collector and the tracing log.

pub mod admission;
pub mod config;
pub mod context;
pub mod error;
pub mod metrics;
pub mod ratelimit;
pub mod sweeper;
