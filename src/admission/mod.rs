//! Admission layer consumed by transport middleware.

mod guard;

pub use guard::{Admission, AdmissionGuard, Quota, RequestInfo};
