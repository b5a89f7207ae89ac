//! Budget protection for paid provider tiers, plus the offline demo switch.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{ProviderId, UtcDateTime, ValidationError};

const DAY: Duration = Duration::from_secs(24 * 60 * 60);
const MONTH: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Budget limits and initial toggles.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuotaConfig {
    /// Requests allowed per rolling day; zero leaves the day unmetered.
    pub daily_limit: u64,
    /// Requests allowed per rolling 30 days; zero leaves the month unmetered.
    pub monthly_limit: u64,
    /// Fraction of a limit at which protection starts blocking.
    pub safety_margin: f64,
    pub protection_enabled: bool,
    pub demo_mode: bool,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: 0,
            monthly_limit: 0,
            safety_margin: 0.9,
            protection_enabled: true,
            demo_mode: false,
        }
    }
}

impl QuotaConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !(self.safety_margin > 0.0 && self.safety_margin <= 1.0) {
            return Err(ValidationError::InvalidRatio {
                field: "quota.safety_margin",
                value: self.safety_margin.to_string(),
            });
        }
        Ok(())
    }
}

/// Read-only view of quota usage for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QuotaStatus {
    pub daily_used: u64,
    pub daily_limit: u64,
    pub monthly_used: u64,
    pub monthly_limit: u64,
    pub monthly_utilization_percent: f64,
    pub protection_enabled: bool,
    pub demo_mode: bool,
    pub blocking: bool,
    pub day_started_at: UtcDateTime,
    pub per_provider: BTreeMap<ProviderId, u64>,
}

#[derive(Debug)]
struct Period {
    used: u64,
    started: Instant,
    started_at: UtcDateTime,
}

impl Period {
    fn new() -> Self {
        Self {
            used: 0,
            started: Instant::now(),
            started_at: UtcDateTime::now(),
        }
    }

    fn roll(&mut self, now: Instant, length: Duration) -> bool {
        if now.saturating_duration_since(self.started) >= length {
            *self = Self::new();
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
struct QuotaState {
    config: QuotaConfig,
    day: Period,
    month: Period,
    per_provider: BTreeMap<ProviderId, u64>,
}

impl QuotaState {
    fn roll(&mut self) {
        let now = Instant::now();
        if self.day.roll(now, DAY) {
            debug!("daily quota window rolled over");
        }
        if self.month.roll(now, MONTH) {
            self.per_provider.clear();
            debug!("monthly quota window rolled over");
        }
    }

    fn over_margin(&self, used: u64, limit: u64) -> bool {
        limit > 0 && used as f64 >= limit as f64 * self.config.safety_margin
    }

    fn blocking(&self) -> bool {
        self.config.demo_mode
            || (self.config.protection_enabled
                && (self.over_margin(self.day.used, self.config.daily_limit)
                    || self.over_margin(self.month.used, self.config.monthly_limit)))
    }
}

/// Tracks network usage against daily and monthly budgets.
///
/// Demo mode overrides everything else: while it is on, every provider is
/// blocked regardless of usage or the protection toggle.
#[derive(Debug)]
pub struct QuotaManager {
    state: Mutex<QuotaState>,
}

impl Default for QuotaManager {
    fn default() -> Self {
        Self::new(QuotaConfig::default())
    }
}

impl QuotaManager {
    pub fn new(config: QuotaConfig) -> Self {
        Self {
            state: Mutex::new(QuotaState {
                config,
                day: Period::new(),
                month: Period::new(),
                per_provider: BTreeMap::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QuotaState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("quota mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Counts one request that reached `provider` over the network.
    pub fn record_api_request(&self, provider: &ProviderId) {
        let mut state = self.lock();
        state.roll();
        state.day.used += 1;
        state.month.used += 1;
        *state.per_provider.entry(provider.clone()).or_default() += 1;

        if state.blocking() && !state.config.demo_mode {
            warn!(
                provider = %provider,
                daily_used = state.day.used,
                monthly_used = state.month.used,
                "quota safety margin reached, network requests are now blocked"
            );
        }
    }

    pub fn should_block_api_request(&self, provider: &ProviderId) -> bool {
        let mut state = self.lock();
        state.roll();
        let blocking = state.blocking();
        if blocking {
            debug!(provider = %provider, demo_mode = state.config.demo_mode, "quota blocks network request");
        }
        blocking
    }

    pub fn is_demo_mode(&self) -> bool {
        self.lock().config.demo_mode
    }

    pub fn enable_demo_mode(&self) {
        self.lock().config.demo_mode = true;
        info!("demo mode enabled, providers will not be contacted");
    }

    pub fn disable_demo_mode(&self) {
        self.lock().config.demo_mode = false;
        info!("demo mode disabled");
    }

    pub fn set_quota_protection(&self, enabled: bool) {
        self.lock().config.protection_enabled = enabled;
        info!(enabled, "quota protection toggled");
    }

    pub fn protection_enabled(&self) -> bool {
        self.lock().config.protection_enabled
    }

    pub fn reset_daily_counter(&self) {
        self.lock().day = Period::new();
        info!("daily quota counter reset");
    }

    pub fn config(&self) -> QuotaConfig {
        self.lock().config
    }

    pub fn status(&self) -> QuotaStatus {
        let mut state = self.lock();
        state.roll();
        let monthly_utilization_percent = if state.config.monthly_limit == 0 {
            0.0
        } else {
            state.month.used as f64 / state.config.monthly_limit as f64 * 100.0
        };

        QuotaStatus {
            daily_used: state.day.used,
            daily_limit: state.config.daily_limit,
            monthly_used: state.month.used,
            monthly_limit: state.config.monthly_limit,
            monthly_utilization_percent,
            protection_enabled: state.config.protection_enabled,
            demo_mode: state.config.demo_mode,
            blocking: state.blocking(),
            day_started_at: state.day.started_at,
            per_provider: state.per_provider.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(name: &str) -> ProviderId {
        ProviderId::parse(name).expect("valid provider")
    }

    fn limited(daily: u64, monthly: u64) -> QuotaManager {
        QuotaManager::new(QuotaConfig {
            daily_limit: daily,
            monthly_limit: monthly,
            ..QuotaConfig::default()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn blocks_once_usage_reaches_safety_margin() {
        let quota = limited(10, 0);
        let id = provider("shopapi");

        for _ in 0..8 {
            quota.record_api_request(&id);
        }
        assert!(!quota.should_block_api_request(&id));

        quota.record_api_request(&id);
        assert!(quota.should_block_api_request(&id), "9 of 10 hits the 0.9 margin");
    }

    #[tokio::test(start_paused = true)]
    async fn protection_toggle_lifts_the_block() {
        let quota = limited(1, 0);
        let id = provider("shopapi");
        quota.record_api_request(&id);
        assert!(quota.should_block_api_request(&id));

        quota.set_quota_protection(false);
        assert!(!quota.should_block_api_request(&id));
    }

    #[tokio::test(start_paused = true)]
    async fn demo_mode_blocks_every_provider_regardless_of_protection() {
        let quota = QuotaManager::default();
        quota.set_quota_protection(false);
        quota.enable_demo_mode();

        assert!(quota.should_block_api_request(&provider("shopapi")));
        assert!(quota.should_block_api_request(&provider("scraper")));

        quota.disable_demo_mode();
        assert!(!quota.should_block_api_request(&provider("shopapi")));
    }

    #[tokio::test(start_paused = true)]
    async fn daily_counter_rolls_after_a_day_but_month_keeps_counting() {
        let quota = limited(2, 100);
        let id = provider("shopapi");
        quota.record_api_request(&id);
        quota.record_api_request(&id);
        assert!(quota.should_block_api_request(&id));

        tokio::time::advance(DAY).await;
        assert!(!quota.should_block_api_request(&id));

        let status = quota.status();
        assert_eq!(status.daily_used, 0);
        assert_eq!(status.monthly_used, 2);
        assert!((status.monthly_utilization_percent - 2.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_daily_counter_clears_only_the_day() {
        let quota = limited(0, 0);
        let id = provider("shopapi");
        quota.record_api_request(&id);
        quota.reset_daily_counter();

        let status = quota.status();
        assert_eq!(status.daily_used, 0);
        assert_eq!(status.monthly_used, 1);
        assert_eq!(status.per_provider.get(&id), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn unmetered_limits_never_block() {
        let quota = QuotaManager::default();
        let id = provider("shopapi");
        for _ in 0..1_000 {
            quota.record_api_request(&id);
        }
        assert!(!quota.should_block_api_request(&id));
        assert_eq!(quota.status().monthly_utilization_percent, 0.0);
    }

    #[test]
    fn safety_margin_must_be_a_fraction() {
        let config = QuotaConfig {
            safety_margin: 1.5,
            ..QuotaConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidRatio { field: "quota.safety_margin", .. })
        ));
        assert!(QuotaConfig::default().validate().is_ok());
    }
}
