//! One circuit breaker per remote dependency, created once at startup.

use std::sync::Arc;

use ballast_core::{system_clock, Dependency, SharedClock};

use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};

/// Owns the breaker for every [`Dependency`].
#[derive(Debug)]
pub struct BreakerRegistry {
    // Indexed by `Dependency as usize`, in `Dependency::ALL` order
    breakers: [Arc<CircuitBreaker>; Dependency::ALL.len()],
}

impl BreakerRegistry {
    /// Build breakers for every dependency using `config_for`.
    pub fn new<F>(config_for: F) -> Self
    where
        F: Fn(Dependency) -> CircuitBreakerConfig,
    {
        Self::with_clock(config_for, system_clock())
    }

    pub fn with_clock<F>(config_for: F, clock: SharedClock) -> Self
    where
        F: Fn(Dependency) -> CircuitBreakerConfig,
    {
        let breakers = std::array::from_fn(|i| {
            let dep = Dependency::ALL[i];
            Arc::new(CircuitBreaker::with_clock(
                dep.as_str(),
                config_for(dep),
                clock.clone(),
            ))
        });
        Self { breakers }
    }

    /// Breakers configured from `BALLAST_CIRCUIT_*` variables.
    pub fn from_env() -> Self {
        Self::new(CircuitBreakerConfig::for_dependency)
    }

    /// The breaker guarding `dependency`.
    pub fn get(&self, dependency: Dependency) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breakers[dependency as usize])
    }

    pub fn iter(&self) -> impl Iterator<Item = (Dependency, &Arc<CircuitBreaker>)> {
        Dependency::ALL.into_iter().zip(self.breakers.iter())
    }

    /// Force one breaker closed.
    pub fn reset(&self, dependency: Dependency) {
        self.breakers[dependency as usize].reset();
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.iter().map(|b| b.snapshot()).collect()
    }
}
