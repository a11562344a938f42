//! Layer Configuration Module
//!
//! Aggregates every component's configuration plus the server settings.
//! Each section is loaded from `BALLAST_*` environment variables with
//! defaults suitable for development.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use ballast_cache::CacheConfig;
use ballast_core::constants::DEFAULT_SHUTDOWN_TIMEOUT_SECS;
use ballast_core::{ConfigError, Dependency};
use ballast_geo::{SpatialConfig, MAX_PRECISION};
use ballast_resilience::{AdmissionConfig, CircuitBreakerConfig, RateLimiterConfig};
use ballast_writes::{BatchWriterConfig, CoalescerConfig, WriteQueueConfig};

/// TTL of cached nearby-supplier results.
pub const NEARBY_CACHE_TTL: Duration = Duration::from_secs(10);

/// Supplier positions older than this are pruned from the index.
pub const DEFAULT_SPATIAL_STALE_AFTER_SECS: u64 = 300;

// ============================================================================
// SERVER CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Allowed CORS origins. Empty means allow all origins (dev mode).
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3000,
            cors_origins: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// # Environment Variables
    /// - `BALLAST_API_BIND`: Bind address (default: 0.0.0.0)
    /// - `BALLAST_API_PORT`: Port (default: 3000)
    /// - `BALLAST_CORS_ORIGINS`: Comma-separated allowed origins (empty = allow all)
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind = std::env::var("BALLAST_API_BIND")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(defaults.bind);

        let port = std::env::var("BALLAST_API_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.port);

        let cors_origins = std::env::var("BALLAST_CORS_ORIGINS")
            .ok()
            .map(|s| {
                s.split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            bind,
            port,
            cors_origins,
        }
    }

    /// Resolve the socket address to listen on.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let raw = format!("{}:{}", self.bind, self.port);
        raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::InvalidValue {
            field: "BALLAST_API_BIND".to_string(),
            value: raw.clone(),
            reason: e.to_string(),
        })
    }
}

// ============================================================================
// LAYER CONFIGURATION
// ============================================================================

/// Everything the application context needs to build the layer.
#[derive(Debug, Clone)]
pub struct LayerConfig {
    pub admission: AdmissionConfig,
    pub breakers: BTreeMap<Dependency, CircuitBreakerConfig>,
    /// Document read cache
    pub cache: CacheConfig,
    /// Nearby-supplier result cache
    pub nearby_cache: CacheConfig,
    pub coalescer: CoalescerConfig,
    pub batch_writer: BatchWriterConfig,
    /// Analytics event queue
    pub events_queue: WriteQueueConfig,
    pub spatial: SpatialConfig,
    /// Age after which a supplier position is pruned
    pub spatial_stale_after: Duration,
    pub server: ServerConfig,
    pub shutdown_timeout: Duration,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            breakers: Dependency::ALL
                .into_iter()
                .map(|dep| (dep, CircuitBreakerConfig::default()))
                .collect(),
            cache: CacheConfig::default(),
            nearby_cache: CacheConfig::default().with_ttl(NEARBY_CACHE_TTL),
            coalescer: CoalescerConfig::default(),
            batch_writer: BatchWriterConfig::default(),
            events_queue: WriteQueueConfig::default(),
            spatial: SpatialConfig::default(),
            spatial_stale_after: Duration::from_secs(DEFAULT_SPATIAL_STALE_AFTER_SECS),
            server: ServerConfig::default(),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

impl LayerConfig {
    /// Load every section from the environment.
    ///
    /// Besides the variables read by each component's own `from_env`:
    /// - `BALLAST_SPATIAL_STALE_AFTER_SECS`: Position max age (default: 300)
    /// - `BALLAST_SHUTDOWN_TIMEOUT_SECS`: Shutdown bound (default: 10)
    pub fn from_env() -> Self {
        let spatial_stale_after = std::env::var("BALLAST_SPATIAL_STALE_AFTER_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_SPATIAL_STALE_AFTER_SECS));

        let shutdown_timeout = std::env::var("BALLAST_SHUTDOWN_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS));

        let cache = CacheConfig::from_env();
        let nearby_cache = cache.clone().with_ttl(NEARBY_CACHE_TTL);

        Self {
            admission: AdmissionConfig::from_env(),
            breakers: Dependency::ALL
                .into_iter()
                .map(|dep| (dep, CircuitBreakerConfig::for_dependency(dep)))
                .collect(),
            cache,
            nearby_cache,
            coalescer: CoalescerConfig::from_env(),
            batch_writer: BatchWriterConfig::from_env(),
            events_queue: WriteQueueConfig::from_env(),
            spatial: SpatialConfig::from_env(),
            spatial_stale_after,
            server: ServerConfig::from_env(),
            shutdown_timeout,
        }
    }

    /// Breaker settings for one dependency.
    pub fn breaker(&self, dependency: Dependency) -> CircuitBreakerConfig {
        self.breakers
            .get(&dependency)
            .cloned()
            .unwrap_or_default()
    }

    /// Reject settings that would make a component useless or panic.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_limiter("BALLAST_RATE_LIMIT", &self.admission.per_client)?;
        validate_limiter("BALLAST_GLOBAL_RATE", &self.admission.global)?;

        for (dep, breaker) in &self.breakers {
            let prefix = format!("BALLAST_CIRCUIT_{}", dep.env_suffix());
            non_zero(
                &format!("{prefix}_FAILURE_THRESHOLD"),
                breaker.failure_threshold as u64,
            )?;
            non_zero_duration(&format!("{prefix}_CALL_TIMEOUT_MS"), breaker.call_timeout)?;
        }

        non_zero("BALLAST_CACHE_MAX_SIZE", self.cache.max_size as u64)?;
        non_zero_duration("BALLAST_CACHE_TTL_SECS", self.cache.default_ttl)?;
        non_zero_duration("BALLAST_CACHE_SWEEP_INTERVAL_SECS", self.cache.sweep_interval)?;
        non_zero("BALLAST_CACHE_MAX_SIZE", self.nearby_cache.max_size as u64)?;

        non_zero_duration("BALLAST_COALESCE_FLUSH_INTERVAL_MS", self.coalescer.flush_interval)?;

        non_zero("BALLAST_BATCH_MAX_SIZE", self.batch_writer.max_batch_size as u64)?;
        non_zero_duration("BALLAST_BATCH_FLUSH_INTERVAL_MS", self.batch_writer.flush_interval)?;
        if let Some(rate) = self.batch_writer.store_writes_per_sec {
            positive_rate("BALLAST_STORE_WRITES_PER_SEC", rate)?;
        }

        non_zero("BALLAST_QUEUE_MAX_SIZE", self.events_queue.max_size as u64)?;
        non_zero("BALLAST_QUEUE_BATCH_SIZE", self.events_queue.batch_size as u64)?;
        non_zero_duration("BALLAST_QUEUE_FLUSH_INTERVAL_MS", self.events_queue.flush_interval)?;

        if self.spatial.precision == 0 || self.spatial.precision > MAX_PRECISION {
            return Err(ConfigError::InvalidValue {
                field: "BALLAST_SPATIAL_PRECISION".to_string(),
                value: self.spatial.precision.to_string(),
                reason: format!("must be between 1 and {}", MAX_PRECISION),
            });
        }

        non_zero_duration("BALLAST_SHUTDOWN_TIMEOUT_SECS", self.shutdown_timeout)?;

        Ok(())
    }
}

fn validate_limiter(prefix: &str, config: &RateLimiterConfig) -> Result<(), ConfigError> {
    non_zero(&format!("{prefix}_MAX_TOKENS"), config.max_tokens as u64)?;
    positive_rate(&format!("{prefix}_REFILL_PER_SEC"), config.refill_per_sec)?;
    non_zero(&format!("{prefix}_MAX_CLIENTS"), config.max_clients as u64)
}

fn non_zero(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

fn non_zero_duration(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: format!("{:?}", value),
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(())
}

fn positive_rate(field: &str, value: f64) -> Result<(), ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: "must be a positive number".to_string(),
        });
    }
    Ok(())
}
