//! Provider-name to circuit-breaker mapping.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::info;

use crate::circuit_breaker::{BreakerStats, CircuitBreaker, CircuitBreakerConfig};
use crate::ProviderId;

/// Holds one breaker per provider, created lazily on first use.
///
/// Creation goes through the map's entry API, so two callers racing on the
/// first access for a provider observe the same instance.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<ProviderId, Arc<CircuitBreaker>>,
    defaults: HashMap<ProviderId, CircuitBreakerConfig>,
    fallback: CircuitBreakerConfig,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(fallback: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults: HashMap::new(),
            fallback,
        }
    }

    /// Registers the configuration used when `provider`'s breaker is first created.
    pub fn with_default(mut self, provider: ProviderId, config: CircuitBreakerConfig) -> Self {
        self.defaults.insert(provider, config);
        self
    }

    pub fn get(&self, provider: &ProviderId) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(provider) {
            return Arc::clone(existing.value());
        }

        self.breakers
            .entry(provider.clone())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    provider.clone(),
                    self.default_config(provider),
                ))
            })
            .value()
            .clone()
    }

    /// Installs a fresh breaker with `config`; the previous instance's state is discarded.
    pub fn update_config(&self, provider: &ProviderId, config: CircuitBreakerConfig) {
        self.breakers.insert(
            provider.clone(),
            Arc::new(CircuitBreaker::new(provider.clone(), config)),
        );
        info!(
            provider = %provider,
            failure_threshold = config.failure_threshold,
            recovery_timeout_ms = config.recovery_timeout.as_millis() as u64,
            "circuit breaker configuration replaced"
        );
    }

    pub fn config_for(&self, provider: &ProviderId) -> CircuitBreakerConfig {
        self.breakers
            .get(provider)
            .map(|breaker| breaker.config())
            .unwrap_or_else(|| self.default_config(provider))
    }

    pub fn reset(&self, provider: &ProviderId) {
        if let Some(breaker) = self.breakers.get(provider) {
            breaker.reset();
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
    }

    /// Stats for every breaker created so far, sorted by provider name.
    pub fn snapshot(&self) -> Vec<(ProviderId, BreakerStats)> {
        let mut stats = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().stats()))
            .collect::<Vec<_>>();
        stats.sort_by(|left, right| left.0.cmp(&right.0));
        stats
    }

    fn default_config(&self, provider: &ProviderId) -> CircuitBreakerConfig {
        self.defaults
            .get(provider)
            .copied()
            .unwrap_or(self.fallback)
    }
}
