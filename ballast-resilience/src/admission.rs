//! Request admission: per-client buckets under a global ceiling.

use ballast_core::constants::GLOBAL_ADMISSION_KEY;
use ballast_core::{system_clock, AdmissionError, SharedClock};
use serde::Serialize;

use crate::rate_limiter::{RateLimitDecision, RateLimiter, RateLimiterConfig, RateLimiterStats};

/// Configuration for [`AdmissionControl`].
#[derive(Debug, Clone, PartialEq)]
pub struct AdmissionConfig {
    /// When false every request is admitted
    pub enabled: bool,
    pub per_client: RateLimiterConfig,
    pub global: RateLimiterConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_client: RateLimiterConfig::default(),
            global: RateLimiterConfig::global(),
        }
    }
}

impl AdmissionConfig {
    /// # Environment Variables
    /// - `BALLAST_RATE_LIMIT_ENABLED`: Enable admission control (default: true)
    /// - plus those read by [`RateLimiterConfig::from_env`] and
    ///   [`RateLimiterConfig::global_from_env`]
    pub fn from_env() -> Self {
        let enabled = std::env::var("BALLAST_RATE_LIMIT_ENABLED")
            .ok()
            .map(|s| s.to_lowercase() != "false")
            .unwrap_or(true);

        Self {
            enabled,
            per_client: RateLimiterConfig::from_env(),
            global: RateLimiterConfig::global_from_env(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AdmissionStats {
    pub enabled: bool,
    pub per_client: RateLimiterStats,
    pub global: RateLimiterStats,
}

/// Two-level admission check.
///
/// The per-client bucket is consulted first; the global bucket is charged
/// only for requests the client bucket admitted.
#[derive(Debug)]
pub struct AdmissionControl {
    enabled: bool,
    per_client: RateLimiter,
    global: RateLimiter,
}

impl AdmissionControl {
    pub fn new(config: AdmissionConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    pub fn with_clock(config: AdmissionConfig, clock: SharedClock) -> Self {
        Self {
            enabled: config.enabled,
            per_client: RateLimiter::with_clock("per_client", config.per_client, clock.clone()),
            global: RateLimiter::with_clock("global", config.global.with_max_clients(1), clock),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Admit or reject one request from `client_key`.
    ///
    /// On success returns the client's bucket decision (for
    /// `x-ratelimit-remaining`).
    pub fn check(&self, client_key: &str) -> Result<RateLimitDecision, AdmissionError> {
        if !self.enabled {
            return Ok(RateLimitDecision {
                allowed: true,
                remaining: self.per_client.config().max_tokens,
                retry_after_ms: 0,
            });
        }

        let client = self.per_client.consume(client_key);
        if !client.allowed {
            tracing::debug!(
                client = client_key,
                retry_after_ms = client.retry_after_ms,
                "Client rate limit exceeded"
            );
            return Err(AdmissionError::RateLimited {
                key: client_key.to_string(),
                retry_after_ms: client.retry_after_ms,
            });
        }

        let global = self.global.consume(GLOBAL_ADMISSION_KEY);
        if !global.allowed {
            tracing::warn!(
                retry_after_ms = global.retry_after_ms,
                "Global admission ceiling reached"
            );
            return Err(AdmissionError::RateLimited {
                key: GLOBAL_ADMISSION_KEY.to_string(),
                retry_after_ms: global.retry_after_ms,
            });
        }

        Ok(client)
    }

    pub fn per_client(&self) -> &RateLimiter {
        &self.per_client
    }

    pub fn global(&self) -> &RateLimiter {
        &self.global
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            enabled: self.enabled,
            per_client: self.per_client.stats(),
            global: self.global.stats(),
        }
    }
}
