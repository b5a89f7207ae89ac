use std::fmt::{Display, Formatter};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{ProviderId, UtcDateTime, ValidationError};

/// Runtime circuit state for provider upstream calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        })
    }
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open a closed circuit.
    pub failure_threshold: u32,
    /// Time after the last failure before an open circuit admits a probe.
    pub recovery_timeout: Duration,
    /// Probes admitted while half-open, and consecutive successes needed to close.
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_requests: 3,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.failure_threshold == 0 {
            return Err(ValidationError::BelowMinimum {
                field: "failure_threshold",
                min: 1,
            });
        }
        if self.half_open_max_requests == 0 {
            return Err(ValidationError::BelowMinimum {
                field: "half_open_max_requests",
                min: 1,
            });
        }
        Ok(())
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_failure_at: Option<UtcDateTime>,
    pub half_open_success_count: u32,
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<UtcDateTime>,
    half_open_in_flight: u32,
    half_open_successes: u32,
}

impl Default for CircuitInner {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            last_failure_at: None,
            half_open_in_flight: 0,
            half_open_successes: 0,
        }
    }
}

/// Thread-safe circuit breaker guarding one provider.
///
/// Admission and outcome recording share a single mutex, so half-open probe
/// accounting cannot race with success counting.
#[derive(Debug)]
pub struct CircuitBreaker {
    provider: ProviderId,
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    pub fn new(provider: ProviderId, config: CircuitBreakerConfig) -> Self {
        Self {
            provider,
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    pub fn provider(&self) -> &ProviderId {
        &self.provider
    }

    pub const fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        // A panic while holding the lock cannot leave counters half-written.
        self.inner.lock().unwrap_or_else(|poisoned| {
            warn!(provider = %self.provider, "circuit breaker mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Returns whether a call may go upstream now.
    ///
    /// An open circuit whose recovery deadline has passed moves to half-open
    /// here, and the admitted call counts as its first probe.
    pub fn can_execute(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = inner
                    .last_failure
                    .map(|failed_at| failed_at.elapsed() >= self.config.recovery_timeout)
                    .unwrap_or(true);

                if recovered {
                    inner.state = CircuitState::HalfOpen;
                    inner.half_open_successes = 0;
                    inner.half_open_in_flight = 1;
                    debug!(provider = %self.provider, "circuit half-open, admitting probe");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight < self.config.half_open_max_requests {
                    inner.half_open_in_flight += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes = inner.half_open_successes.saturating_add(1);
                if inner.half_open_successes >= self.config.half_open_max_requests {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.half_open_in_flight = 0;
                    info!(provider = %self.provider, "circuit closed after successful probes");
                }
            }
            // A late success from a call admitted before the circuit opened.
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(UtcDateTime::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.half_open_successes = 0;
                inner.half_open_in_flight = 0;
                info!(provider = %self.provider, "probe failed, circuit re-opened");
            }
            CircuitState::Closed
                if inner.consecutive_failures >= self.config.failure_threshold =>
            {
                inner.state = CircuitState::Open;
                info!(
                    provider = %self.provider,
                    failures = inner.consecutive_failures,
                    "circuit opened"
                );
            }
            _ => {}
        }
    }

    /// Returns an admitted half-open probe slot that produced no outcome.
    pub fn release_probe(&self) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Forces the circuit closed with zeroed counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        *inner = CircuitInner::default();
        info!(provider = %self.provider, "circuit manually reset");
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.lock();
        BreakerStats {
            state: inner.state,
            failure_count: inner.consecutive_failures,
            last_failure_at: inner.last_failure_at,
            half_open_success_count: inner.half_open_successes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, recovery: Duration, probes: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            ProviderId::parse("shopapi").expect("valid provider"),
            CircuitBreakerConfig {
                failure_threshold,
                recovery_timeout: recovery,
                half_open_max_requests: probes,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn opens_after_threshold_failures() {
        let breaker = breaker(2, Duration::from_secs(10), 1);

        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn success_while_closed_only_resets_failures() {
        let breaker = breaker(3, Duration::from_secs(10), 1);

        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.consecutive_failures(), 0);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn stays_open_until_recovery_timeout_elapses() {
        let breaker = breaker(1, Duration::from_secs(30), 1);
        breaker.record_failure();

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_closes_after_required_successes() {
        let breaker = breaker(1, Duration::from_secs(1), 2);
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(1)).await;

        assert!(breaker.can_execute());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        assert_eq!(breaker.stats().half_open_success_count, 1);

        assert!(breaker.can_execute());
        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.consecutive_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens_and_resets_probes() {
        let breaker = breaker(1, Duration::from_secs(5), 3);
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(breaker.can_execute());
        breaker.record_success();
        assert!(breaker.can_execute());
        breaker.record_failure();

        assert_eq!(breaker.state(), CircuitState::Open);
        assert_eq!(breaker.stats().half_open_success_count, 0);
        assert!(!breaker.can_execute());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_limits_outstanding_probes() {
        let breaker = breaker(1, Duration::from_secs(1), 2);
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(1)).await;

        assert!(breaker.can_execute());
        assert!(breaker.can_execute());
        assert!(!breaker.can_execute(), "third concurrent probe must be rejected");

        breaker.release_probe();
        assert!(breaker.can_execute(), "released slot is reusable");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_probes_never_exceed_limit() {
        let breaker = std::sync::Arc::new(breaker(1, Duration::from_secs(1), 3));
        breaker.record_failure();
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(breaker.can_execute());

        let handles = (0..16)
            .map(|_| {
                let breaker = breaker.clone();
                std::thread::spawn(move || breaker.can_execute())
            })
            .collect::<Vec<_>>();
        let admitted = handles
            .into_iter()
            .map(|handle| handle.join().expect("thread completes"))
            .filter(|admitted| *admitted)
            .count();

        assert_eq!(admitted, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_forces_closed_state() {
        let breaker = breaker(1, Duration::from_secs(60), 1);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.reset();
        let stats = breaker.stats();
        assert_eq!(stats.state, CircuitState::Closed);
        assert_eq!(stats.failure_count, 0);
        assert!(stats.last_failure_at.is_none());
        assert!(breaker.can_execute());
    }

    #[test]
    fn config_rejects_zero_thresholds() {
        let config = CircuitBreakerConfig {
            failure_threshold: 0,
            ..CircuitBreakerConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ValidationError::BelowMinimum { field: "failure_threshold", .. })
        ));
    }
}
