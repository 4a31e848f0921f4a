//! Process-wide registry holding one circuit breaker per upstream dependency.

use super::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;

/// Registry of circuit breakers keyed by dependency name.
///
/// Breakers are created lazily and live as long as the registry. Clones share
/// the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerRegistry {
    breakers: Arc<DashMap<String, Arc<CircuitBreaker>>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    /// Creates a registry whose breakers use the given config.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Returns the breaker for `name`, creating it with the registry's
    /// default config on first use.
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, &self.config)
    }

    /// Returns the breaker for `name`, creating it with `config` on first use.
    ///
    /// An existing breaker keeps the config it was created with.
    pub fn get_or_create_with(
        &self,
        name: &str,
        config: &CircuitBreakerConfig,
    ) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            if existing.config() != config {
                warn!(
                    service = name,
                    "Circuit breaker already registered with a different config"
                );
            }
            return Arc::clone(existing.value());
        }

        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config.clone())))
            .value()
            .clone()
    }

    /// Returns the breaker for `name` if one exists.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| Arc::clone(b.value()))
    }

    /// Resets the named breaker. Returns false if it does not exist.
    pub fn reset(&self, name: &str) -> bool {
        self.get(name).map_or(false, |b| {
            b.reset();
            true
        })
    }

    /// Returns snapshots of every breaker, sorted by name.
    #[must_use]
    pub fn snapshot(&self) -> Vec<CircuitSnapshot> {
        let mut snapshots: Vec<_> = self.breakers.iter().map(|b| b.value().snapshot()).collect();
        snapshots.sort_by(|a, b| a.service.cmp(&b.service));
        snapshots
    }

    /// Returns the number of registered breakers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns true if no breaker has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::CircuitState;

    #[test]
    fn test_get_or_create_returns_shared_instance() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get_or_create("analyze");
        let b = registry.get_or_create("analyze");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_get_or_create_with_uses_given_config() {
        let registry = CircuitBreakerRegistry::default();
        let config = CircuitBreakerConfig::new().with_failure_threshold(1);

        let breaker = registry.get_or_create_with("analyze", &config);
        assert_eq!(breaker.config().failure_threshold, 1);

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        // First registration wins.
        let again = registry.get_or_create_with("analyze", &CircuitBreakerConfig::default());
        assert!(Arc::ptr_eq(&breaker, &again));
        assert_eq!(again.config().failure_threshold, 1);
    }

    #[test]
    fn test_clones_share_breakers() {
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerConfig::new().with_failure_threshold(1),
        );
        let clone = registry.clone();

        registry.get_or_create("process").record_failure();
        assert_eq!(
            clone.get("process").map(|b| b.state()),
            Some(CircuitState::Open)
        );
    }

    #[test]
    fn test_snapshot_sorted() {
        let registry = CircuitBreakerRegistry::default();
        registry.get_or_create("synthesize");
        registry.get_or_create("analyze");
        registry.get_or_create("process");

        let names: Vec<_> = registry.snapshot().into_iter().map(|s| s.service).collect();
        assert_eq!(names, vec!["analyze", "process", "synthesize"]);
    }

    #[test]
    fn test_reset_unknown() {
        let registry = CircuitBreakerRegistry::default();
        assert!(!registry.reset("missing"));
        assert!(registry.is_empty());
    }
}
