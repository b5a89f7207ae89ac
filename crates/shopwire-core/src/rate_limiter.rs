//! Per-provider and global request admission.
//!
//! Each provider owns a set of rolling windows (last second, last minute,
//! last hour) measured relative to now, an optional minimum spacing between
//! requests, and an optional burst ceiling enforced by a GCRA limiter. A single
//! global window caps aggregate consumption across providers and reserves a
//! slice of headroom for [`RequestPriority::High`] requests.
//!
//! Admission is all-or-nothing: a request either charges every relevant
//! window or none of them. Units are charged before dispatch and never
//! refunded, whatever the outcome of the call.

use std::collections::{HashMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::Quota;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::data_source::SourceError;
use crate::{ProviderId, ValidationError};

type BurstLimiter = governor::RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Admission tier against the global ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestPriority {
    #[default]
    Normal,
    High,
}

impl FromStr for RequestPriority {
    type Err = ValidationError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            other => Err(ValidationError::InvalidPriority {
                value: other.to_owned(),
            }),
        }
    }
}

/// Per-provider limits. A zero value leaves that window unenforced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    /// Instantaneous admissions allowed before the GCRA limiter throttles.
    pub burst_limit: u32,
    /// Minimum spacing between two admitted requests.
    pub min_interval: Duration,
}

impl RateLimitConfig {
    fn retention(&self) -> Duration {
        if self.requests_per_hour > 0 {
            HOUR
        } else if self.requests_per_minute > 0 {
            MINUTE
        } else if self.requests_per_second > 0 {
            SECOND
        } else {
            Duration::ZERO
        }
    }
}

/// Aggregate ceiling over a rolling minute across all providers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GlobalRateLimitConfig {
    /// Zero disables the global ceiling.
    pub requests_per_minute: u32,
    /// Fraction of the ceiling only [`RequestPriority::High`] requests may use.
    pub high_priority_reserve: f64,
}

impl Default for GlobalRateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 0,
            high_priority_reserve: 0.1,
        }
    }
}

impl GlobalRateLimitConfig {
    fn ceiling_for(&self, priority: RequestPriority) -> usize {
        let ceiling = self.requests_per_minute as usize;
        match priority {
            RequestPriority::High => ceiling,
            RequestPriority::Normal => {
                let reserve = (f64::from(self.requests_per_minute)
                    * self.high_priority_reserve.clamp(0.0, 1.0))
                .ceil() as usize;
                // Normal traffic keeps at least one slot under any enforced ceiling.
                ceiling.saturating_sub(reserve.min(ceiling.saturating_sub(1)))
            }
        }
    }
}

/// Remaining budget in the rolling minute and hour; `None` when unenforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RemainingQuota {
    pub per_minute: Option<u32>,
    pub per_hour: Option<u32>,
}

/// The limit that rejected a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateWindow {
    Second,
    Minute,
    Hour,
    Burst,
    MinInterval,
    Global,
}

impl Display for RateWindow {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Second => "per-second",
            Self::Minute => "per-minute",
            Self::Hour => "per-hour",
            Self::Burst => "burst",
            Self::MinInterval => "minimum-interval",
            Self::Global => "global",
        })
    }
}

fn count_since(history: &VecDeque<Instant>, now: Instant, window: Duration) -> usize {
    match now.checked_sub(window) {
        Some(cutoff) => history.len() - history.partition_point(|at| *at <= cutoff),
        None => history.len(),
    }
}

fn prune(history: &mut VecDeque<Instant>, now: Instant, retention: Duration) {
    let Some(cutoff) = now.checked_sub(retention) else {
        return;
    };
    while history.front().is_some_and(|at| *at <= cutoff) {
        history.pop_front();
    }
}

#[derive(Debug)]
struct ProviderWindows {
    config: RateLimitConfig,
    history: VecDeque<Instant>,
    last_request: Option<Instant>,
}

impl ProviderWindows {
    fn check(&self, now: Instant) -> Result<(), RateWindow> {
        let limits = [
            (self.config.requests_per_second, SECOND, RateWindow::Second),
            (self.config.requests_per_minute, MINUTE, RateWindow::Minute),
            (self.config.requests_per_hour, HOUR, RateWindow::Hour),
        ];
        for (limit, window, kind) in limits {
            if limit > 0 && count_since(&self.history, now, window) >= limit as usize {
                return Err(kind);
            }
        }

        if !self.config.min_interval.is_zero() {
            if let Some(last) = self.last_request {
                if now.saturating_duration_since(last) < self.config.min_interval {
                    return Err(RateWindow::MinInterval);
                }
            }
        }

        Ok(())
    }

    fn commit(&mut self, now: Instant) {
        if self.config.retention() > Duration::ZERO {
            self.history.push_back(now);
        }
        self.last_request = Some(now);
    }

    fn remaining(&self, now: Instant, limit: u32, window: Duration) -> Option<u32> {
        (limit > 0).then(|| {
            let used = count_since(&self.history, now, window);
            limit.saturating_sub(u32::try_from(used).unwrap_or(u32::MAX))
        })
    }
}

struct ProviderLimiter {
    windows: Mutex<ProviderWindows>,
    burst: Option<BurstLimiter>,
}

impl std::fmt::Debug for ProviderLimiter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderLimiter")
            .field("windows", &self.windows)
            .field("burst", &self.burst.is_some())
            .finish()
    }
}

impl ProviderLimiter {
    fn new(config: RateLimitConfig) -> Self {
        let burst = NonZeroU32::new(config.burst_limit)
            .map(|cells| governor::RateLimiter::direct(Quota::per_second(cells)));
        Self {
            windows: Mutex::new(ProviderWindows {
                config,
                history: VecDeque::new(),
                last_request: None,
            }),
            burst,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ProviderWindows> {
        self.windows.lock().unwrap_or_else(|poisoned| {
            warn!("rate limiter window mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

#[derive(Debug)]
struct GlobalWindow {
    config: GlobalRateLimitConfig,
    history: VecDeque<Instant>,
}

/// Shared admission controller for every provider.
///
/// Provider limiters live in their own shard of the map behind their own
/// mutex; the global window is the only state touched by every admission.
/// Locks are always taken provider first, then global.
#[derive(Debug)]
pub struct RateLimiter {
    providers: DashMap<ProviderId, Arc<ProviderLimiter>>,
    defaults: HashMap<ProviderId, RateLimitConfig>,
    fallback: RateLimitConfig,
    global: Mutex<GlobalWindow>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default(), GlobalRateLimitConfig::default())
    }
}

impl RateLimiter {
    pub fn new(fallback: RateLimitConfig, global: GlobalRateLimitConfig) -> Self {
        Self {
            providers: DashMap::new(),
            defaults: HashMap::new(),
            fallback,
            global: Mutex::new(GlobalWindow {
                config: global,
                history: VecDeque::new(),
            }),
        }
    }

    /// Registers the limits used when `provider` is first seen.
    pub fn with_default(mut self, provider: ProviderId, config: RateLimitConfig) -> Self {
        self.defaults.insert(provider, config);
        self
    }

    /// Admits one request for `provider` or rejects it with `RateLimitExceeded`.
    pub fn check_and_consume(
        &self,
        provider: &ProviderId,
        priority: RequestPriority,
    ) -> Result<(), SourceError> {
        let limiter = self.limiter_for(provider);
        let mut windows = limiter.lock();
        let now = Instant::now();
        let retention = windows.config.retention();
        prune(&mut windows.history, now, retention);

        if let Err(window) = windows.check(now) {
            return Err(rejection(provider, window));
        }

        let mut global = self.lock_global();
        prune(&mut global.history, now, MINUTE);
        if global.config.requests_per_minute > 0
            && global.history.len() >= global.config.ceiling_for(priority)
        {
            return Err(rejection(provider, RateWindow::Global));
        }

        // The GCRA check consumes a cell on success, so it runs last.
        if let Some(burst) = &limiter.burst {
            if burst.check().is_err() {
                return Err(rejection(provider, RateWindow::Burst));
            }
        }

        windows.commit(now);
        if global.config.requests_per_minute > 0 {
            global.history.push_back(now);
        }
        debug!(provider = %provider, ?priority, "rate limiter admitted request");
        Ok(())
    }

    pub fn remaining_quota(&self, provider: &ProviderId) -> RemainingQuota {
        let limiter = self.limiter_for(provider);
        let windows = limiter.lock();
        let now = Instant::now();
        RemainingQuota {
            per_minute: windows.remaining(now, windows.config.requests_per_minute, MINUTE),
            per_hour: windows.remaining(now, windows.config.requests_per_hour, HOUR),
        }
    }

    /// Replaces `provider`'s limits, discarding its consumed history.
    pub fn configure(&self, provider: &ProviderId, config: RateLimitConfig) {
        self.providers
            .insert(provider.clone(), Arc::new(ProviderLimiter::new(config)));
        debug!(provider = %provider, ?config, "rate limit configuration replaced");
    }

    pub fn configure_global(&self, config: GlobalRateLimitConfig) {
        self.lock_global().config = config;
    }

    pub fn config_for(&self, provider: &ProviderId) -> RateLimitConfig {
        self.providers
            .get(provider)
            .map(|limiter| limiter.lock().config)
            .unwrap_or_else(|| self.default_config(provider))
    }

    pub fn global_config(&self) -> GlobalRateLimitConfig {
        self.lock_global().config
    }

    fn limiter_for(&self, provider: &ProviderId) -> Arc<ProviderLimiter> {
        if let Some(existing) = self.providers.get(provider) {
            return Arc::clone(existing.value());
        }

        self.providers
            .entry(provider.clone())
            .or_insert_with(|| Arc::new(ProviderLimiter::new(self.default_config(provider))))
            .value()
            .clone()
    }

    fn default_config(&self, provider: &ProviderId) -> RateLimitConfig {
        self.defaults
            .get(provider)
            .copied()
            .unwrap_or(self.fallback)
    }

    fn lock_global(&self) -> MutexGuard<'_, GlobalWindow> {
        self.global.lock().unwrap_or_else(|poisoned| {
            warn!("global rate limiter mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }
}

fn rejection(provider: &ProviderId, window: RateWindow) -> SourceError {
    debug!(provider = %provider, %window, "rate limiter rejected request");
    SourceError::rate_limited(format!("'{provider}' exceeded its {window} rate limit"))
        .with_provider(provider.clone())
}
