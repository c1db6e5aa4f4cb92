//! Strategy lookup.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::context::Algorithm;
use super::fixed_window::FixedWindow;
use super::sliding_window::SlidingWindow;
use super::strategy::RateLimitStrategy;
use super::token_bucket::TokenBucket;
use crate::error::{FloodgateError, Result};

/// Maps an [`Algorithm`] to its strategy.
///
/// Populated once at startup and then shared read-only by the engine.
pub struct StrategyRegistry {
    strategies: HashMap<Algorithm, Arc<dyn RateLimitStrategy>>,
}

impl StrategyRegistry {
    /// An empty registry. Every lookup fails until strategies are registered.
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// A registry holding the three built-in strategies.
    pub fn standard() -> Self {
        let builtin: [Arc<dyn RateLimitStrategy>; 3] = [
            Arc::new(FixedWindow),
            Arc::new(SlidingWindow),
            Arc::new(TokenBucket),
        ];
        let mut registry = Self::empty();
        for strategy in builtin {
            registry.register(strategy);
        }
        registry
    }

    /// Register `strategy` under its own algorithm, replacing any previous one.
    pub fn register(&mut self, strategy: Arc<dyn RateLimitStrategy>) {
        debug!(algorithm = %strategy.algorithm(), "Registering rate limit strategy");
        self.strategies.insert(strategy.algorithm(), strategy);
    }

    /// Resolve an algorithm; `None` selects the default sliding window.
    pub fn resolve(&self, algorithm: Option<Algorithm>) -> Result<Arc<dyn RateLimitStrategy>> {
        let algorithm = algorithm.unwrap_or_default();
        self.strategies.get(&algorithm).cloned().ok_or_else(|| {
            FloodgateError::Config(format!("no strategy registered for '{}'", algorithm))
        })
    }

    /// Resolve by name. A missing or blank name selects the default.
    pub fn resolve_name(&self, name: Option<&str>) -> Result<Arc<dyn RateLimitStrategy>> {
        match name.map(str::trim).filter(|n| !n.is_empty()) {
            None => self.resolve(None),
            Some(name) => self.resolve(Some(name.parse()?)),
        }
    }

    pub fn algorithms(&self) -> Vec<Algorithm> {
        let mut algorithms: Vec<Algorithm> = self.strategies.keys().copied().collect();
        algorithms.sort_by_key(|a| a.as_str());
        algorithms
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_registry_resolves_every_algorithm() {
        let registry = StrategyRegistry::standard();
        for algorithm in Algorithm::ALL {
            assert_eq!(registry.resolve(Some(algorithm)).unwrap().algorithm(), algorithm);
        }
        assert_eq!(registry.algorithms().len(), 3);
    }

    #[test]
    fn test_unspecified_resolves_to_sliding_window() {
        let registry = StrategyRegistry::standard();
        assert_eq!(registry.resolve(None).unwrap().algorithm(), Algorithm::SlidingWindow);
        assert_eq!(
            registry.resolve_name(Some("  ")).unwrap().algorithm(),
            Algorithm::SlidingWindow
        );
        assert_eq!(registry.resolve_name(None).unwrap().algorithm(), Algorithm::SlidingWindow);
    }

    #[test]
    fn test_resolve_by_name() {
        let registry = StrategyRegistry::standard();
        assert_eq!(
            registry.resolve_name(Some("token-bucket")).unwrap().algorithm(),
            Algorithm::TokenBucket
        );
        assert!(matches!(
            registry.resolve_name(Some("leaky_bucket")),
            Err(FloodgateError::Config(_))
        ));
    }

    #[test]
    fn test_unregistered_algorithm_is_config_error() {
        let mut registry = StrategyRegistry::empty();
        registry.register(Arc::new(FixedWindow));

        assert!(registry.resolve(Some(Algorithm::FixedWindow)).is_ok());
        assert!(matches!(
            registry.resolve(Some(Algorithm::TokenBucket)),
            Err(FloodgateError::Config(_))
        ));
        assert!(registry.resolve(None).is_err());
    }
}
