//! # Shopwire Core
//!
//! Provider resilience and orchestration for product-search aggregation.
//!
//! ## Overview
//!
//! Shopwire queries several independent, unreliable, rate-limited shopping
//! data providers and keeps the caller responsive and within budget:
//!
//! - **Circuit breaking** per provider, with lazy recovery and bounded probes
//! - **Rate limiting** over rolling second/minute/hour windows, a burst
//!   ceiling, minimum spacing and a global ceiling with priority tiers
//! - **Quota protection** against daily and monthly budgets, plus demo mode
//! - **Response caching** with TTL expiry, insertion-order eviction and a
//!   background sweep
//! - **Retries** with exponential backoff and jitter, cancellable at any point
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`adapters`] | Reference adapters (JSON HTTP API, offline fixture catalogue) |
//! | [`breaker_registry`] | One circuit breaker per provider |
//! | [`cache`] | TTL cache with hit/miss stats |
//! | [`circuit_breaker`] | Closed/open/half-open state machine |
//! | [`config`] | Configuration file and environment loading |
//! | [`credentials`] | Provider credential lookup |
//! | [`data_source`] | Adapter trait, requests and error taxonomy |
//! | [`domain`] | Product records and timestamps |
//! | [`error`] | Validation and configuration errors |
//! | [`http_client`] | Read-only HTTP transport abstraction |
//! | [`orchestrator`] | Single-provider pipeline and fan-out search |
//! | [`quota`] | Budget protection and demo mode |
//! | [`rate_limiter`] | Multi-window admission control |
//! | [`retry`] | Backoff policy and attempt classification |
//! | [`source`] | Provider identifiers |
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use shopwire_core::{FixtureSource, Orchestrator, ProviderId, RequestOptions, SearchRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let orchestrator = Orchestrator::builder()
//!         .with_source(Arc::new(FixtureSource::new(ProviderId::parse("shopapi")?)?))
//!         .with_source(Arc::new(FixtureSource::new(ProviderId::parse("scraper")?)?))
//!         .build();
//!
//!     let outcome = orchestrator
//!         .search_all(&SearchRequest::new("kettle")?, &RequestOptions::default())
//!         .await?;
//!     println!("{} products", outcome.records.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  CLI / Caller   │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐     ┌──────────────────────────────┐
//! │  Orchestrator   │────▶│ Quota · Cache · Breaker ·    │
//! └────────┬────────┘     │ Rate limiter · Retry policy  │
//!          │              └──────────────────────────────┘
//!          ▼
//! ┌─────────────────┐     ┌──────────────────┐
//! │ ProductSource   │────▶│ HTTP Client      │
//! │ (Adapter Trait) │     │ (reqwest)        │
//! └─────────────────┘     └──────────────────┘
//! ```
//!
//! ## Error Handling
//!
//! Provider calls fail with a [`SourceError`] whose [`SourceErrorKind`]
//! tells local short-circuits apart from provider failures:
//!
//! ```rust
//! use shopwire_core::{SourceError, SourceErrorKind};
//!
//! fn handle_error(error: SourceError) {
//!     match error.kind() {
//!         SourceErrorKind::CircuitOpen | SourceErrorKind::RateLimitExceeded => {
//!             // Back off; nothing reached the provider
//!         }
//!         SourceErrorKind::AuthenticationFailed => {
//!             // Fix the credential
//!         }
//!         _ => {}
//!     }
//! }
//! ```
//!
//! ## Security
//!
//! - Credentials are read through a [`CredentialSource`] and never logged
//! - All HTTP requests use TLS via rustls

pub mod adapters;
pub mod breaker_registry;
pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod credentials;
pub mod data_source;
pub mod domain;
pub mod error;
pub mod http_client;
pub mod orchestrator;
pub mod quota;
pub mod rate_limiter;
pub mod retry;
pub mod source;

// Adapter implementations
pub use adapters::{FixtureSource, JsonApiSource};

// Circuit breaking
pub use breaker_registry::CircuitBreakerRegistry;
pub use circuit_breaker::{BreakerStats, CircuitBreaker, CircuitBreakerConfig, CircuitState};

// Caching
pub use cache::{CacheMode, CacheStats, TtlCache};

// Configuration
pub use config::{ConfigLoader, GatewayConfig, ProviderPolicy, ProviderSettings};

// Credentials
pub use credentials::{Credential, CredentialSource, EnvCredentialSource, StaticCredentialSource};

// Data source trait and types
pub use data_source::{
    DetailsRequest, Operation, ProductSource, SearchRequest, SourceError, SourceErrorKind,
    SourceFuture, DEFAULT_TRANSIENT_STATUS,
};

// Domain models
pub use domain::{validate_currency_code, ProductRecord, UtcDateTime};

// Error types
pub use error::{CoreError, ValidationError};

// HTTP client types
pub use http_client::{
    HttpAuth, HttpClient, HttpError, HttpErrorKind, HttpRequest, HttpResponse, ReqwestHttpClient,
};

// Orchestration
pub use orchestrator::{
    ErrorReport, Fetched, GatewayStatus, Orchestrator, OrchestratorBuilder, Origin,
    ProviderReport, ProviderStatus, RequestOptions, SearchFailure, SearchOutcome,
};

// Quota protection
pub use quota::{QuotaConfig, QuotaManager, QuotaStatus};

// Rate limiting
pub use rate_limiter::{
    GlobalRateLimitConfig, RateLimitConfig, RateLimiter, RemainingQuota, RequestPriority,
};

// Retry logic
pub use retry::{AttemptOutcome, Backoff, RetryConfig};

// Source identifiers
pub use source::ProviderId;
