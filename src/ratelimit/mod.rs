//! Rate limiting algorithms and the engine that drives them.

mod context;
mod fixed_window;
mod limiter;
mod registry;
mod sliding_window;
mod strategy;
mod token_bucket;

pub use context::{AdmissionContext, AdmissionResult, Algorithm, Scope};
pub use fixed_window::FixedWindow;
pub use limiter::RateLimiter;
pub use registry::StrategyRegistry;
pub use sliding_window::SlidingWindow;
pub use strategy::RateLimitStrategy;
pub use token_bucket::TokenBucket;

/// Every script the strategies run.
#[cfg(test)]
pub(crate) fn scripts() -> Vec<&'static crate::store::Script> {
    [
        fixed_window::scripts(),
        sliding_window::scripts(),
        token_bucket::scripts(),
    ]
    .concat()
}
