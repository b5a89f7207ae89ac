//! Gateway configuration.
//!
//! Sources are merged in this order, later ones winning:
//! 1. [`GatewayConfig::default()`]
//! 2. a TOML file, when one is given
//! 3. environment variables prefixed `SHOPWIRE_`, with `__` separating
//!    nested keys (`SHOPWIRE_RETRY__MAX_RETRIES=5`)
//!
//! ```toml
//! call_timeout_ms = 4000
//!
//! [quota]
//! monthly_limit = 10000
//!
//! [defaults]
//! requests_per_minute = 60
//!
//! [providers.shopapi]
//! base_url = "https://api.shop.test/v1"
//! requests_per_minute = 30
//! failure_threshold = 3
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::quota::QuotaConfig;
use crate::rate_limiter::{GlobalRateLimitConfig, RateLimitConfig};
use crate::retry::{Backoff, RetryConfig};
use crate::{CoreError, ProviderId, ValidationError, DEFAULT_TRANSIENT_STATUS};

pub const DEFAULT_ENV_PREFIX: &str = "SHOPWIRE";

/// Breaker and rate-limit settings for one provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderPolicy {
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub half_open_max_requests: u32,
    pub requests_per_second: u32,
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    pub burst_limit: u32,
    pub min_interval_ms: u64,
}

impl Default for ProviderPolicy {
    fn default() -> Self {
        let breaker = CircuitBreakerConfig::default();
        Self {
            failure_threshold: breaker.failure_threshold,
            recovery_timeout_secs: breaker.recovery_timeout.as_secs(),
            half_open_max_requests: breaker.half_open_max_requests,
            requests_per_second: 0,
            requests_per_minute: 60,
            requests_per_hour: 0,
            burst_limit: 0,
            min_interval_ms: 0,
        }
    }
}

impl ProviderPolicy {
    pub const fn circuit_breaker(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold,
            recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
            half_open_max_requests: self.half_open_max_requests,
        }
    }

    pub const fn rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            requests_per_second: self.requests_per_second,
            requests_per_minute: self.requests_per_minute,
            requests_per_hour: self.requests_per_hour,
            burst_limit: self.burst_limit,
            min_interval: Duration::from_millis(self.min_interval_ms),
        }
    }
}

/// Per-provider section; unset policy fields fall back to `[defaults]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderSettings {
    pub base_url: Option<String>,
    /// Header carrying the API key; bearer authorization when unset.
    pub api_key_header: Option<String>,
    pub failure_threshold: Option<u32>,
    pub recovery_timeout_secs: Option<u64>,
    pub half_open_max_requests: Option<u32>,
    pub requests_per_second: Option<u32>,
    pub requests_per_minute: Option<u32>,
    pub requests_per_hour: Option<u32>,
    pub burst_limit: Option<u32>,
    pub min_interval_ms: Option<u64>,
}

impl ProviderSettings {
    pub fn apply(&self, defaults: &ProviderPolicy) -> ProviderPolicy {
        ProviderPolicy {
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold),
            recovery_timeout_secs: self
                .recovery_timeout_secs
                .unwrap_or(defaults.recovery_timeout_secs),
            half_open_max_requests: self
                .half_open_max_requests
                .unwrap_or(defaults.half_open_max_requests),
            requests_per_second: self.requests_per_second.unwrap_or(defaults.requests_per_second),
            requests_per_minute: self.requests_per_minute.unwrap_or(defaults.requests_per_minute),
            requests_per_hour: self.requests_per_hour.unwrap_or(defaults.requests_per_hour),
            burst_limit: self.burst_limit.unwrap_or(defaults.burst_limit),
            min_interval_ms: self.min_interval_ms.unwrap_or(defaults.min_interval_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
    pub retry_on_status: Vec<u16>,
    pub retry_on_timeout: bool,
    pub retry_on_connect: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
            jitter_ms: 100,
            retry_on_status: DEFAULT_TRANSIENT_STATUS.to_vec(),
            retry_on_timeout: true,
            retry_on_connect: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub search_capacity: usize,
    pub details_capacity: usize,
    pub search_ttl_secs: u64,
    pub details_ttl_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            search_capacity: 256,
            details_capacity: 1_024,
            search_ttl_secs: 15 * 60,
            details_ttl_secs: 60 * 60,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    pub daily_limit: u64,
    pub monthly_limit: u64,
    pub safety_margin: f64,
    pub protection_enabled: bool,
    pub demo_mode: bool,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        let quota = QuotaConfig::default();
        Self {
            daily_limit: quota.daily_limit,
            monthly_limit: quota.monthly_limit,
            safety_margin: quota.safety_margin,
            protection_enabled: quota.protection_enabled,
            demo_mode: quota.demo_mode,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalRateLimitSettings {
    pub requests_per_minute: u32,
    pub high_priority_reserve: f64,
}

impl Default for GlobalRateLimitSettings {
    fn default() -> Self {
        let global = GlobalRateLimitConfig::default();
        Self {
            requests_per_minute: global.requests_per_minute,
            high_priority_reserve: global.high_priority_reserve,
        }
    }
}

/// Complete gateway configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Upper bound on a single provider call attempt.
    pub call_timeout_ms: u64,
    pub retry: RetrySettings,
    pub cache: CacheSettings,
    pub quota: QuotaSettings,
    pub global_rate_limit: GlobalRateLimitSettings,
    pub defaults: ProviderPolicy,
    pub providers: BTreeMap<String, ProviderSettings>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 5_000,
            retry: RetrySettings::default(),
            cache: CacheSettings::default(),
            quota: QuotaSettings::default(),
            global_rate_limit: GlobalRateLimitSettings::default(),
            defaults: ProviderPolicy::default(),
            providers: BTreeMap::new(),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.call_timeout_ms == 0 {
            return Err(ValidationError::BelowMinimum {
                field: "call_timeout_ms",
                min: 1,
            });
        }
        if self.cache.search_capacity == 0 {
            return Err(ValidationError::BelowMinimum {
                field: "cache.search_capacity",
                min: 1,
            });
        }
        if self.cache.details_capacity == 0 {
            return Err(ValidationError::BelowMinimum {
                field: "cache.details_capacity",
                min: 1,
            });
        }
        if self.cache.sweep_interval_secs == 0 {
            return Err(ValidationError::BelowMinimum {
                field: "cache.sweep_interval_secs",
                min: 1,
            });
        }

        let reserve = self.global_rate_limit.high_priority_reserve;
        if !(0.0..1.0).contains(&reserve) {
            return Err(ValidationError::InvalidRatio {
                field: "global_rate_limit.high_priority_reserve",
                value: reserve.to_string(),
            });
        }

        self.quota_config().validate()?;
        self.defaults.circuit_breaker().validate()?;
        for (name, settings) in &self.providers {
            ProviderId::parse(name)?;
            settings.apply(&self.defaults).circuit_breaker().validate()?;
        }
        Ok(())
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(self.retry.base_delay_ms),
                max: Duration::from_millis(self.retry.max_delay_ms),
                jitter: Duration::from_millis(self.retry.jitter_ms),
            },
            retry_on_status: self.retry.retry_on_status.clone(),
            retry_on_timeout: self.retry.retry_on_timeout,
            retry_on_connect: self.retry.retry_on_connect,
        }
    }

    pub const fn quota_config(&self) -> QuotaConfig {
        QuotaConfig {
            daily_limit: self.quota.daily_limit,
            monthly_limit: self.quota.monthly_limit,
            safety_margin: self.quota.safety_margin,
            protection_enabled: self.quota.protection_enabled,
            demo_mode: self.quota.demo_mode,
        }
    }

    pub const fn global_rate_limit_config(&self) -> GlobalRateLimitConfig {
        GlobalRateLimitConfig {
            requests_per_minute: self.global_rate_limit.requests_per_minute,
            high_priority_reserve: self.global_rate_limit.high_priority_reserve,
        }
    }

    pub fn provider(&self, provider: &ProviderId) -> Option<&ProviderSettings> {
        self.providers.get(provider.as_str())
    }

    /// Effective policy for `provider`: its overrides applied to `[defaults]`.
    pub fn policy_for(&self, provider: &ProviderId) -> ProviderPolicy {
        self.provider(provider)
            .map(|settings| settings.apply(&self.defaults))
            .unwrap_or(self.defaults)
    }
}

/// Loads [`GatewayConfig`] from defaults, an optional TOML file and the environment.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_path: None,
            env_prefix: DEFAULT_ENV_PREFIX.to_owned(),
        }
    }

    pub fn with_config_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn with_env_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    pub fn figment(&self) -> Result<Figment, CoreError> {
        let mut figment = Figment::new().merge(Serialized::defaults(GatewayConfig::default()));

        if let Some(path) = &self.config_path {
            if !path.is_file() {
                return Err(CoreError::MissingConfig(path.clone()));
            }
            figment = figment.merge(Toml::file(path));
            info!(path = %path.display(), "loaded configuration file");
        }

        Ok(figment.merge(Env::prefixed(&format!("{}_", self.env_prefix)).split("__")))
    }

    /// Loads and validates the configuration.
    pub fn load(&self) -> Result<GatewayConfig, CoreError> {
        let config: GatewayConfig = self.figment()?.extract()?;
        config.validate()?;
        debug!(providers = config.providers.len(), "configuration validated");
        Ok(config)
    }
}
