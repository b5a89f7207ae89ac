//! Request orchestration across providers.
//!
//! A single-provider call walks a fixed pipeline:
//!
//! 1. quota / demo-mode block: serve from cache or fail locally
//! 2. cache read-through
//! 3. circuit breaker admission
//! 4. rate limiter admission
//! 5. timed provider call, retried with backoff while the failure is transient
//! 6. outcome bookkeeping (breaker, quota, cache)
//!
//! [`Orchestrator::search_all`] fans that pipeline out to every registered
//! provider concurrently and merges whatever succeeded.

use std::collections::{HashMap, HashSet};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::breaker_registry::CircuitBreakerRegistry;
use crate::cache::{CacheMode, CacheStats, TtlCache, MIN_SWEEP_INTERVAL};
use crate::circuit_breaker::{BreakerStats, CircuitBreakerConfig};
use crate::config::GatewayConfig;
use crate::data_source::{
    DetailsRequest, Operation, ProductSource, SearchRequest, SourceError, SourceErrorKind,
    SourceFuture,
};
use crate::quota::{QuotaConfig, QuotaManager, QuotaStatus};
use crate::rate_limiter::{
    GlobalRateLimitConfig, RateLimitConfig, RateLimiter, RemainingQuota, RequestPriority,
};
use crate::retry::{AttemptOutcome, RetryConfig};
use crate::{ProductRecord, ProviderId, ValidationError};

/// Per-request knobs.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub priority: RequestPriority,
    pub cache_mode: CacheMode,
    /// Cancelling stops in-flight calls and pending retries.
    pub cancel: CancellationToken,
}

impl RequestOptions {
    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_cache_mode(mut self, cache_mode: CacheMode) -> Self {
        self.cache_mode = cache_mode;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Where a successful answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Cache,
    Network,
}

/// Successful single-provider answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: T,
    pub origin: Origin,
    /// Network attempts made; zero for cache answers.
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorReport {
    pub code: &'static str,
    pub kind: SourceErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ErrorReport {
    /// Reports `error` with `retryable` judged by `retry`.
    pub fn with_policy(error: &SourceError, retry: &RetryConfig) -> Self {
        Self {
            code: error.code(),
            kind: error.kind(),
            message: error.message().to_owned(),
            retryable: retry.is_retryable(error),
        }
    }
}

/// How one provider fared in a fan-out search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderReport {
    pub provider: ProviderId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
    pub records: usize,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
}

impl ProviderReport {
    pub const fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

/// Merged fan-out search result; at least one provider answered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchOutcome {
    pub request_id: Uuid,
    pub query: String,
    pub records: Vec<ProductRecord>,
    pub providers: Vec<ProviderReport>,
    pub latency_ms: u64,
}

impl SearchOutcome {
    pub fn failed_providers(&self) -> impl Iterator<Item = &ProviderReport> {
        self.providers.iter().filter(|report| !report.succeeded())
    }
}

/// Fan-out search in which no provider answered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchFailure {
    pub request_id: Uuid,
    pub query: String,
    pub providers: Vec<ProviderReport>,
    pub latency_ms: u64,
}

impl Display for SearchFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.providers.is_empty() {
            return write!(f, "no providers available for query '{}'", self.query);
        }
        write!(
            f,
            "all {} provider(s) failed for query '{}'",
            self.providers.len(),
            self.query
        )
    }
}

impl std::error::Error for SearchFailure {}

/// Per-provider view for [`GatewayStatus`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatus {
    pub provider: ProviderId,
    pub circuit: BreakerStats,
    pub remaining: RemainingQuota,
}

/// Read-only snapshot of every shared component.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatewayStatus {
    pub quota: QuotaStatus,
    pub providers: Vec<ProviderStatus>,
    pub search_cache: CacheStats,
    pub details_cache: CacheStats,
}

struct Execution<T> {
    result: Result<Fetched<T>, SourceError>,
    attempts: u32,
}

impl<T> Execution<T> {
    fn failed(error: SourceError, attempts: u32) -> Self {
        Self {
            result: Err(error),
            attempts,
        }
    }

    fn cached(value: T) -> Self {
        Self {
            result: Ok(Fetched {
                value,
                origin: Origin::Cache,
                attempts: 0,
            }),
            attempts: 0,
        }
    }
}

fn attribute(error: SourceError, provider: &ProviderId) -> SourceError {
    if error.provider().is_some() {
        error
    } else {
        error.with_provider(provider.clone())
    }
}

/// Failures that prove the request reached the provider and counts against its budget.
const fn reached_provider(kind: SourceErrorKind) -> bool {
    matches!(
        kind,
        SourceErrorKind::ProviderError(_) | SourceErrorKind::DecodingFailed
    )
}

fn search_key(provider: &ProviderId, request: &SearchRequest) -> String {
    format!("{provider}:{}", request.normalized_query())
}

fn details_key(provider: &ProviderId, request: &DetailsRequest) -> String {
    format!("{provider}:{}", request.id.trim())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Registry of provider adapters wired to the shared resilience components.
pub struct Orchestrator {
    sources: Vec<Arc<dyn ProductSource>>,
    index: HashMap<ProviderId, usize>,
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: Arc<RateLimiter>,
    quota: Arc<QuotaManager>,
    search_cache: TtlCache<String, Vec<ProductRecord>>,
    details_cache: TtlCache<String, ProductRecord>,
    retry: RetryConfig,
    call_timeout: Duration,
    sweep_interval: Duration,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("providers", &self.providers())
            .field("retry", &self.retry)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::new()
    }

    /// Registered providers in registration order.
    pub fn providers(&self) -> Vec<ProviderId> {
        self.sources.iter().map(|source| source.id()).collect()
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn quota(&self) -> &Arc<QuotaManager> {
        &self.quota
    }

    pub const fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    fn source(&self, provider: &ProviderId) -> Option<Arc<dyn ProductSource>> {
        self.index
            .get(provider)
            .map(|position| Arc::clone(&self.sources[*position]))
    }

    /// Searches a single provider.
    pub async fn search(
        &self,
        provider: &ProviderId,
        request: &SearchRequest,
        options: &RequestOptions,
    ) -> Result<Fetched<Vec<ProductRecord>>, SourceError> {
        self.search_provider(provider, request, options).await.result
    }

    /// Fetches one product from `provider`.
    pub async fn details(
        &self,
        provider: &ProviderId,
        request: &DetailsRequest,
        options: &RequestOptions,
    ) -> Result<Fetched<ProductRecord>, SourceError> {
        let key = details_key(provider, request);
        let request = request.clone();
        self.execute(
            provider,
            Operation::Details,
            &self.details_cache,
            key,
            options,
            move |source| source.details(request.clone()),
        )
        .await
        .result
    }

    /// Searches every registered provider concurrently and merges the answers.
    ///
    /// # Errors
    ///
    /// Returns [`SearchFailure`] only when no provider produced results.
    pub async fn search_all(
        &self,
        request: &SearchRequest,
        options: &RequestOptions,
    ) -> Result<SearchOutcome, SearchFailure> {
        self.search_providers(&self.providers(), request, options)
            .await
    }

    /// Like [`search_all`](Self::search_all), restricted to `providers`.
    ///
    /// Records are merged in the order `providers` is given, whatever order
    /// the answers arrive in; duplicates by `(source, id)` are dropped.
    pub async fn search_providers(
        &self,
        providers: &[ProviderId],
        request: &SearchRequest,
        options: &RequestOptions,
    ) -> Result<SearchOutcome, SearchFailure> {
        let request_id = Uuid::new_v4();
        let span = info_span!("search_all", %request_id, query = %request.query);

        async move {
            let started = Instant::now();
            let executions = join_all(
                providers
                    .iter()
                    .map(|provider| self.search_provider(provider, request, options)),
            )
            .await;

            let mut seen = HashSet::new();
            let mut records = Vec::new();
            let mut reports = Vec::with_capacity(providers.len());

            for (provider, execution) in providers.iter().zip(executions) {
                match execution.result {
                    Ok(fetched) => {
                        reports.push(ProviderReport {
                            provider: provider.clone(),
                            origin: Some(fetched.origin),
                            records: fetched.value.len(),
                            attempts: execution.attempts,
                            error: None,
                        });
                        for record in fetched.value {
                            let identity = (record.source.clone(), record.id.clone());
                            if seen.insert(identity) {
                                records.push(record);
                            }
                        }
                    }
                    Err(error) => {
                        warn!(provider = %provider, code = error.code(), error = %error, "provider excluded from merged results");
                        reports.push(ProviderReport {
                            provider: provider.clone(),
                            origin: None,
                            records: 0,
                            attempts: execution.attempts,
                            error: Some(self.error_report(&error)),
                        });
                    }
                }
            }

            let latency_ms = elapsed_ms(started);
            if reports.iter().any(ProviderReport::succeeded) {
                info!(records = records.len(), providers = reports.len(), latency_ms, "search merged");
                Ok(SearchOutcome {
                    request_id,
                    query: request.query.clone(),
                    records,
                    providers: reports,
                    latency_ms,
                })
            } else {
                warn!(providers = reports.len(), latency_ms, "every provider failed");
                Err(SearchFailure {
                    request_id,
                    query: request.query.clone(),
                    providers: reports,
                    latency_ms,
                })
            }
        }
        .instrument(span)
        .await
    }

    async fn search_provider(
        &self,
        provider: &ProviderId,
        request: &SearchRequest,
        options: &RequestOptions,
    ) -> Execution<Vec<ProductRecord>> {
        let key = search_key(provider, request);
        let request = request.clone();
        self.execute(
            provider,
            Operation::Search,
            &self.search_cache,
            key,
            options,
            move |source| source.search(request.clone()),
        )
        .await
    }

    fn blocked_error(&self, provider: &ProviderId) -> SourceError {
        if self.quota.is_demo_mode() {
            SourceError::demo_mode(provider)
        } else {
            SourceError::quota_exceeded(provider)
        }
    }

    /// Describes `error` with retryability judged by this orchestrator's retry policy.
    pub fn error_report(&self, error: &SourceError) -> ErrorReport {
        ErrorReport::with_policy(error, &self.retry)
    }

    async fn execute<T, F>(
        &self,
        provider: &ProviderId,
        operation: Operation,
        cache: &TtlCache<String, T>,
        key: String,
        options: &RequestOptions,
        mut call: F,
    ) -> Execution<T>
    where
        T: Clone + Send + Sync + 'static,
        F: for<'a> FnMut(&'a dyn ProductSource) -> SourceFuture<'a, T>,
    {
        let Some(source) = self.source(provider) else {
            return Execution::failed(SourceError::not_registered(provider), 0);
        };

        if self.quota.should_block_api_request(provider) {
            // Refresh still falls back to cached data while the network is off limits.
            if options.cache_mode != CacheMode::Bypass {
                if let Some(value) = cache.get(&key).await {
                    debug!(provider = %provider, %operation, "serving cached value while network is blocked");
                    return Execution::cached(value);
                }
            }
            return Execution::failed(self.blocked_error(provider), 0);
        }

        if options.cache_mode.reads() {
            if let Some(value) = cache.get(&key).await {
                debug!(provider = %provider, %operation, "cache hit");
                return Execution::cached(value);
            }
        }

        let mut attempts = 0_u32;
        loop {
            if options.cancel.is_cancelled() {
                return Execution::failed(SourceError::cancelled().with_provider(provider.clone()), attempts);
            }
            // Demo mode or the quota margin may have kicked in during a backoff wait.
            if attempts > 0 && self.quota.should_block_api_request(provider) {
                debug!(provider = %provider, %operation, attempts, "network blocked between attempts");
                return Execution::failed(self.blocked_error(provider), attempts);
            }
            // Fetched per attempt so a config update mid-request takes effect.
            let breaker = self.breakers.get(provider);
            if !breaker.can_execute() {
                return Execution::failed(SourceError::circuit_open(provider), attempts);
            }
            if let Err(error) = self.limiter.check_and_consume(provider, options.priority) {
                breaker.release_probe();
                return Execution::failed(attribute(error, provider), attempts);
            }

            attempts += 1;
            let result = tokio::select! {
                biased;
                _ = options.cancel.cancelled() => {
                    breaker.release_probe();
                    debug!(provider = %provider, %operation, attempts, "call cancelled");
                    return Execution::failed(SourceError::cancelled().with_provider(provider.clone()), attempts);
                }
                result = tokio::time::timeout(self.call_timeout, call(source.as_ref())) => {
                    result.unwrap_or_else(|_| {
                        Err(SourceError::timeout(format!(
                            "{operation} call to '{provider}' exceeded {} ms",
                            self.call_timeout.as_millis()
                        )))
                    })
                }
            };

            let error = match self.retry.classify(result) {
                AttemptOutcome::Success(value) => {
                    breaker.record_success();
                    self.quota.record_api_request(provider);
                    if options.cache_mode.writes() {
                        cache.put(key, value.clone(), None).await;
                    }
                    debug!(provider = %provider, %operation, attempts, "provider call succeeded");
                    return Execution {
                        result: Ok(Fetched {
                            value,
                            origin: Origin::Network,
                            attempts,
                        }),
                        attempts,
                    };
                }
                AttemptOutcome::RetryableFailure(error) if attempts <= self.retry.max_retries => {
                    if reached_provider(error.kind()) {
                        self.quota.record_api_request(provider);
                    }
                    // The next iteration re-checks admission from scratch.
                    breaker.release_probe();

                    let delay = self.retry.delay_for_attempt(attempts - 1);
                    warn!(
                        provider = %provider,
                        %operation,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying provider call"
                    );
                    tokio::select! {
                        biased;
                        _ = options.cancel.cancelled() => {
                            return Execution::failed(SourceError::cancelled().with_provider(provider.clone()), attempts);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }
                AttemptOutcome::RetryableFailure(error) | AttemptOutcome::TerminalFailure(error) => error,
            };

            if reached_provider(error.kind()) {
                self.quota.record_api_request(provider);
            }
            breaker.record_failure();
            warn!(provider = %provider, %operation, attempts, error = %error, "provider call failed");
            return Execution::failed(attribute(error, provider), attempts);
        }
    }

    pub fn set_quota_protection(&self, enabled: bool) {
        self.quota.set_quota_protection(enabled);
    }

    pub fn enable_demo_mode(&self) {
        self.quota.enable_demo_mode();
    }

    pub fn disable_demo_mode(&self) {
        self.quota.disable_demo_mode();
    }

    pub fn reset_daily_counter(&self) {
        self.quota.reset_daily_counter();
    }

    pub fn circuit_breaker_config(&self, provider: &ProviderId) -> CircuitBreakerConfig {
        self.breakers.config_for(provider)
    }

    /// Replaces `provider`'s breaker; the new one starts closed.
    pub fn set_circuit_breaker_config(
        &self,
        provider: &ProviderId,
        config: CircuitBreakerConfig,
    ) -> Result<(), ValidationError> {
        config.validate()?;
        self.breakers.update_config(provider, config);
        Ok(())
    }

    pub fn reset_circuit_breaker(&self, provider: &ProviderId) {
        self.breakers.reset(provider);
    }

    pub fn rate_limit_config(&self, provider: &ProviderId) -> RateLimitConfig {
        self.limiter.config_for(provider)
    }

    pub fn set_rate_limit_config(&self, provider: &ProviderId, config: RateLimitConfig) {
        self.limiter.configure(provider, config);
    }

    pub fn set_global_rate_limit(&self, config: GlobalRateLimitConfig) {
        self.limiter.configure_global(config);
    }

    pub async fn clear_cache(&self) {
        self.search_cache.clear().await;
        self.details_cache.clear().await;
        info!("response caches cleared");
    }

    pub async fn status(&self) -> GatewayStatus {
        let providers = self
            .providers()
            .into_iter()
            .map(|provider| ProviderStatus {
                circuit: self.breakers.get(&provider).stats(),
                remaining: self.limiter.remaining_quota(&provider),
                provider,
            })
            .collect();

        GatewayStatus {
            quota: self.quota.status(),
            providers,
            search_cache: self.search_cache.stats().await,
            details_cache: self.details_cache.stats().await,
        }
    }

    /// Starts the background cache sweeps; they stop when `cancel` fires.
    pub fn start_maintenance(&self, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
        vec![
            self.search_cache
                .spawn_sweeper(self.sweep_interval, cancel.child_token()),
            self.details_cache
                .spawn_sweeper(self.sweep_interval, cancel.child_token()),
        ]
    }
}

/// Builds an [`Orchestrator`] and the components it shares.
pub struct OrchestratorBuilder {
    sources: Vec<Arc<dyn ProductSource>>,
    breaker_fallback: CircuitBreakerConfig,
    breaker_overrides: Vec<(ProviderId, CircuitBreakerConfig)>,
    rate_fallback: RateLimitConfig,
    rate_overrides: Vec<(ProviderId, RateLimitConfig)>,
    global_rate_limit: GlobalRateLimitConfig,
    quota: QuotaConfig,
    retry: RetryConfig,
    call_timeout: Duration,
    search_cache: (usize, Duration),
    details_cache: (usize, Duration),
    sweep_interval: Duration,
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self::from_config(&GatewayConfig::default())
    }

    /// Applies every section of `config`; providers still need registering.
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut breaker_overrides = Vec::new();
        let mut rate_overrides = Vec::new();
        for (name, settings) in &config.providers {
            let Ok(provider) = ProviderId::parse(name) else {
                warn!(provider = %name, "skipping provider section with invalid name");
                continue;
            };
            let policy = settings.apply(&config.defaults);
            breaker_overrides.push((provider.clone(), policy.circuit_breaker()));
            rate_overrides.push((provider, policy.rate_limit()));
        }

        Self {
            sources: Vec::new(),
            breaker_fallback: config.defaults.circuit_breaker(),
            breaker_overrides,
            rate_fallback: config.defaults.rate_limit(),
            rate_overrides,
            global_rate_limit: config.global_rate_limit_config(),
            quota: config.quota_config(),
            retry: config.retry_config(),
            call_timeout: config.call_timeout(),
            search_cache: (
                config.cache.search_capacity,
                Duration::from_secs(config.cache.search_ttl_secs),
            ),
            details_cache: (
                config.cache.details_capacity,
                Duration::from_secs(config.cache.details_ttl_secs),
            ),
            sweep_interval: Duration::from_secs(config.cache.sweep_interval_secs),
        }
    }

    /// Registers an adapter; a later adapter with the same id replaces it in place.
    pub fn with_source(mut self, source: Arc<dyn ProductSource>) -> Self {
        let id = source.id();
        match self.sources.iter().position(|existing| existing.id() == id) {
            Some(position) => self.sources[position] = source,
            None => self.sources.push(source),
        }
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_fallback = config;
        self
    }

    pub fn with_provider_circuit_breaker(
        mut self,
        provider: ProviderId,
        config: CircuitBreakerConfig,
    ) -> Self {
        self.breaker_overrides.push((provider, config));
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_fallback = config;
        self
    }

    pub fn with_provider_rate_limit(mut self, provider: ProviderId, config: RateLimitConfig) -> Self {
        self.rate_overrides.push((provider, config));
        self
    }

    pub fn with_global_rate_limit(mut self, config: GlobalRateLimitConfig) -> Self {
        self.global_rate_limit = config;
        self
    }

    pub fn with_quota(mut self, config: QuotaConfig) -> Self {
        self.quota = config;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_search_cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.search_cache = (capacity, ttl);
        self
    }

    pub fn with_details_cache(mut self, capacity: usize, ttl: Duration) -> Self {
        self.details_cache = (capacity, ttl);
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval.max(MIN_SWEEP_INTERVAL);
        self
    }

    pub fn build(self) -> Orchestrator {
        let breakers = self
            .breaker_overrides
            .into_iter()
            .fold(CircuitBreakerRegistry::new(self.breaker_fallback), |registry, (id, config)| {
                registry.with_default(id, config)
            });
        let limiter = self.rate_overrides.into_iter().fold(
            RateLimiter::new(self.rate_fallback, self.global_rate_limit),
            |limiter, (id, config)| limiter.with_default(id, config),
        );
        let index = self
            .sources
            .iter()
            .enumerate()
            .map(|(position, source)| (source.id(), position))
            .collect();

        Orchestrator {
            sources: self.sources,
            index,
            breakers: Arc::new(breakers),
            limiter: Arc::new(limiter),
            quota: Arc::new(QuotaManager::new(self.quota)),
            search_cache: TtlCache::new("search", self.search_cache.0, self.search_cache.1),
            details_cache: TtlCache::new("details", self.details_cache.0, self.details_cache.1),
            retry: self.retry,
            call_timeout: self.call_timeout,
            sweep_interval: self.sweep_interval,
        }
    }
}
