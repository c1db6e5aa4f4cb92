//! Duplicate-submission protection.

mod guard;

pub use guard::DuplicateGuard;

#[cfg(test)]
pub(crate) use guard::scripts;
