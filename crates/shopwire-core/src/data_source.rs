//! Provider adapter contract and request/error types.
//!
//! This module defines the contract (`ProductSource`) every provider adapter
//! implements, plus the structured error the orchestration layer uses to
//! decide between short-circuiting, retrying and tripping a breaker.
//!
//! # Operations
//!
//! | Operation | Request | Response |
//! |-----------|---------|----------|
//! | Search | [`SearchRequest`] | `Vec<ProductRecord>` |
//! | Details | [`DetailsRequest`] | [`ProductRecord`] |
//!
//! # Error taxonomy
//!
//! | Kind | Origin | Retried | Breaker failure |
//! |------|--------|---------|-----------------|
//! | `CircuitOpen` | local | no | no |
//! | `RateLimitExceeded` | local | no | no |
//! | `QuotaExceeded` | local | no | no |
//! | `DemoModeActive` | local | no | no |
//! | `AuthenticationFailed` | provider | no | yes |
//! | `DecodingFailed` | provider | no | yes |
//! | `NetworkTimeout` | transport | yes | yes, once exhausted |
//! | `NetworkUnreachable` | transport | yes | yes, once exhausted |
//! | `ProviderError(code)` | provider | transient codes only | yes |

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::{ProductRecord, ProviderId, ValidationError};

/// HTTP-ish status codes treated as transient unless configured otherwise.
pub const DEFAULT_TRANSIENT_STATUS: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Operation kind used for cache key spaces and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Search,
    Details,
}

impl Operation {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Search => "search",
            Self::Details => "details",
        }
    }
}

impl Display for Operation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error classification shared by adapters and the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "code")]
pub enum SourceErrorKind {
    CircuitOpen,
    RateLimitExceeded,
    QuotaExceeded,
    DemoModeActive,
    AuthenticationFailed,
    NetworkTimeout,
    NetworkUnreachable,
    DecodingFailed,
    ProviderError(u16),
    Cancelled,
    NotRegistered,
}

impl SourceErrorKind {
    /// Short-circuits raised before any network attempt.
    pub const fn is_local(self) -> bool {
        matches!(
            self,
            Self::CircuitOpen
                | Self::RateLimitExceeded
                | Self::QuotaExceeded
                | Self::DemoModeActive
                | Self::Cancelled
                | Self::NotRegistered
        )
    }
}

/// Structured provider error surfaced to callers and merged into diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceError {
    kind: SourceErrorKind,
    message: String,
    provider: Option<ProviderId>,
    retryable: bool,
}

impl SourceError {
    fn new(kind: SourceErrorKind, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            kind,
            message: message.into(),
            provider: None,
            retryable,
        }
    }

    pub fn circuit_open(provider: &ProviderId) -> Self {
        Self::new(
            SourceErrorKind::CircuitOpen,
            format!("circuit breaker for '{provider}' is open; skipping upstream call"),
            false,
        )
        .with_provider(provider.clone())
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::RateLimitExceeded, message, false)
    }

    pub fn quota_exceeded(provider: &ProviderId) -> Self {
        Self::new(
            SourceErrorKind::QuotaExceeded,
            format!("quota protection is blocking requests to '{provider}' and no cached value exists"),
            false,
        )
        .with_provider(provider.clone())
    }

    pub fn demo_mode(provider: &ProviderId) -> Self {
        Self::new(
            SourceErrorKind::DemoModeActive,
            format!("demo mode is active; '{provider}' is unavailable and no cached value exists"),
            false,
        )
        .with_provider(provider.clone())
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::AuthenticationFailed, message, false)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::NetworkTimeout, message, true)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::NetworkUnreachable, message, true)
    }

    pub fn decoding(message: impl Into<String>) -> Self {
        Self::new(SourceErrorKind::DecodingFailed, message, false)
    }

    pub fn provider_status(code: u16, message: impl Into<String>) -> Self {
        Self::new(
            SourceErrorKind::ProviderError(code),
            message,
            DEFAULT_TRANSIENT_STATUS.contains(&code),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(SourceErrorKind::Cancelled, "request was cancelled", false)
    }

    pub fn not_registered(provider: &ProviderId) -> Self {
        Self::new(
            SourceErrorKind::NotRegistered,
            format!("provider '{provider}' is not registered"),
            false,
        )
        .with_provider(provider.clone())
    }

    pub fn with_provider(mut self, provider: ProviderId) -> Self {
        self.provider = Some(provider);
        self
    }

    pub const fn kind(&self) -> SourceErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn provider(&self) -> Option<&ProviderId> {
        self.provider.as_ref()
    }

    /// Default retry classification; the orchestrator's `RetryConfig` has the final say
    /// for provider status codes.
    pub const fn retryable(&self) -> bool {
        self.retryable
    }

    pub const fn code(&self) -> &'static str {
        match self.kind {
            SourceErrorKind::CircuitOpen => "provider.circuit_open",
            SourceErrorKind::RateLimitExceeded => "provider.rate_limited",
            SourceErrorKind::QuotaExceeded => "provider.quota_exceeded",
            SourceErrorKind::DemoModeActive => "provider.demo_mode",
            SourceErrorKind::AuthenticationFailed => "provider.authentication_failed",
            SourceErrorKind::NetworkTimeout => "provider.timeout",
            SourceErrorKind::NetworkUnreachable => "provider.unreachable",
            SourceErrorKind::DecodingFailed => "provider.decoding_failed",
            SourceErrorKind::ProviderError(_) => "provider.error",
            SourceErrorKind::Cancelled => "provider.cancelled",
            SourceErrorKind::NotRegistered => "provider.not_registered",
        }
    }
}

impl Display for SourceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            SourceErrorKind::ProviderError(status) => {
                write!(f, "{} ({}, status {status})", self.message, self.code())
            }
            _ => write!(f, "{} ({})", self.message, self.code()),
        }
    }
}

impl std::error::Error for SourceError {}

/// Request payload for search operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub query: String,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Result<Self, ValidationError> {
        let query = query.into();
        if query.trim().is_empty() {
            return Err(ValidationError::EmptyQuery);
        }
        Ok(Self { query })
    }

    /// Whitespace-collapsed, lowercased query used for cache keys.
    pub fn normalized_query(&self) -> String {
        self.query
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Request payload for product detail operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetailsRequest {
    pub id: String,
}

impl DetailsRequest {
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ValidationError::EmptyProductId);
        }
        Ok(Self { id })
    }
}

pub type SourceFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SourceError>> + Send + 'a>>;

/// Provider adapter contract.
///
/// Request construction and payload parsing live entirely inside the adapter;
/// the orchestrator only sees normalized records or a classified
/// [`SourceError`]. Any implementation can be registered under a provider name.
///
/// Implementations must be `Send + Sync` as they are shared across concurrent
/// searches.
pub trait ProductSource: Send + Sync {
    /// Returns the provider name this adapter is registered under.
    fn id(&self) -> ProviderId;

    /// Searches the provider catalogue.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] classified per the module-level taxonomy.
    fn search<'a>(&'a self, req: SearchRequest) -> SourceFuture<'a, Vec<ProductRecord>>;

    /// Fetches a single product by its provider-specific identifier.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError`] classified per the module-level taxonomy.
    fn details<'a>(&'a self, req: DetailsRequest) -> SourceFuture<'a, ProductRecord>;
}
