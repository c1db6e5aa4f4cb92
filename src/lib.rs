//! Floodgate - Distributed Admission Control
//!
//! This crate decides whether a guarded call may proceed. It implements
//! fixed window, sliding window and token bucket rate limiting plus a
//! duplicate-submission lock, all evaluated as single atomic scripts against
//! a shared key-value store (Redis, Dragonfly or an in-process store), so
//! every instance of a service enforces the same limits.

pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod duplicate;
pub mod error;
pub mod intercept;
pub mod keys;
pub mod ratelimit;
pub mod store;
