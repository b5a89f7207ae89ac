//! Retry policy with exponential backoff and jitter.

use std::time::Duration;

use crate::data_source::{SourceError, SourceErrorKind, DEFAULT_TRANSIENT_STATUS};

/// Backoff strategy for retrying failed attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Uses a fixed delay between retries.
    Fixed {
        /// Delay between retries.
        delay: Duration,
    },
    /// Uses a doubling delay between retries.
    ///
    /// The delay is `min(base * 2^attempt, max) + U(0, jitter)`.
    Exponential {
        /// Delay before the first retry.
        base: Duration,
        /// Cap on the deterministic part of the delay.
        max: Duration,
        /// Upper bound of the random amount added to every delay.
        jitter: Duration,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(200),
            max: Duration::from_secs(5),
            jitter: Duration::from_millis(100),
        }
    }
}

impl Backoff {
    /// Delay to wait after the failed attempt numbered `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential { base, max, jitter } => {
                let scale = 2_u32.checked_pow(attempt).unwrap_or(u32::MAX);
                let delay = base.checked_mul(scale).unwrap_or(max).min(max);

                let jitter_ms = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
                if jitter_ms == 0 {
                    delay
                } else {
                    delay + Duration::from_millis(fastrand::u64(0..=jitter_ms))
                }
            }
        }
    }
}

/// Configuration for the automatic retry mechanism.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Provider status codes that should trigger a retry.
    pub retry_on_status: Vec<u16>,
    pub retry_on_timeout: bool,
    pub retry_on_connect: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            retry_on_status: DEFAULT_TRANSIENT_STATUS.to_vec(),
            retry_on_timeout: true,
            retry_on_connect: true,
        }
    }
}

impl RetryConfig {
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed { delay },
            ..Self::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn should_retry_status(&self, status: u16) -> bool {
        self.retry_on_status.contains(&status)
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    /// Whether `error` is worth another attempt under this policy.
    pub fn is_retryable(&self, error: &SourceError) -> bool {
        match error.kind() {
            SourceErrorKind::NetworkTimeout => self.retry_on_timeout,
            SourceErrorKind::NetworkUnreachable => self.retry_on_connect,
            SourceErrorKind::ProviderError(status) => self.should_retry_status(status),
            _ => false,
        }
    }

    /// Classifies the result of a single provider call.
    pub fn classify<T>(&self, result: Result<T, SourceError>) -> AttemptOutcome<T> {
        match result {
            Ok(value) => AttemptOutcome::Success(value),
            Err(error) if self.is_retryable(&error) => AttemptOutcome::RetryableFailure(error),
            Err(error) => AttemptOutcome::TerminalFailure(error),
        }
    }
}

/// What a single provider call attempt produced.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome<T> {
    Success(T),
    RetryableFailure(SourceError),
    TerminalFailure(SourceError),
}

impl<T> AttemptOutcome<T> {
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}
