//! Declarative admission policies and the interceptor that enforces them.

mod interceptor;
mod policy;

pub use interceptor::{Admission, Interceptor};
pub use policy::{DuplicatePolicy, PolicySet, RateLimitPolicy};
