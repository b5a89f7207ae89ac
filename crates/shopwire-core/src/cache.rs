//! In-memory caching for provider responses.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Floor for the sweep period; a zero interval would panic the ticker.
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Defines how a single request interacts with the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    /// Read from the cache if a non-expired entry is present;
    /// otherwise, fetch from the network and write the response to the cache. (Default)
    #[default]
    Use,
    /// Always fetch from the network, bypassing any cached entry,
    /// and write the new response to the cache.
    Refresh,
    /// Always fetch from the network and do not read from or write to the cache.
    Bypass,
}

impl CacheMode {
    pub const fn reads(self) -> bool {
        matches!(self, Self::Use)
    }

    pub const fn writes(self) -> bool {
        !matches!(self, Self::Bypass)
    }
}

/// Hit/miss counters and occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    ttl: Duration,
    seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > self.ttl
    }
}

#[derive(Debug)]
struct CacheInner<K, V> {
    map: HashMap<K, CacheEntry<V>>,
    /// Insertion sequence to key; the first entry is the oldest insertion.
    order: BTreeMap<u64, K>,
    next_seq: u64,
    capacity: usize,
}

impl<K, V> CacheInner<K, V>
where
    K: Eq + Hash + Clone,
{
    fn remove(&mut self, key: &K) -> Option<CacheEntry<V>> {
        let entry = self.map.remove(key)?;
        self.order.remove(&entry.seq);
        Some(entry)
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.order.pop_first() else {
            return false;
        };
        self.map.remove(&key);
        true
    }

    fn insert(&mut self, key: K, value: V, ttl: Duration, now: Instant) {
        self.remove(&key);
        while self.map.len() >= self.capacity && self.evict_oldest() {}

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, key.clone());
        self.map.insert(
            key,
            CacheEntry {
                value,
                inserted_at: now,
                ttl,
                seq,
            },
        );
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired = self
            .map
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
}

/// Capacity- and TTL-bounded cache shared across tasks.
///
/// At capacity the oldest insertion is evicted first; reads do not refresh
/// an entry's position. Values are cloned out on read, so callers never hold
/// a reference into the store and the background sweep can free entries at
/// any time.
#[derive(Debug)]
pub struct TtlCache<K, V> {
    name: &'static str,
    default_ttl: Duration,
    inner: Arc<RwLock<CacheInner<K, V>>>,
    counters: Arc<Counters>,
}

impl<K, V> Clone for TtlCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            default_ttl: self.default_ttl,
            inner: Arc::clone(&self.inner),
            counters: Arc::clone(&self.counters),
        }
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a cache holding at most `capacity` entries.
    pub fn new(name: &'static str, capacity: usize, default_ttl: Duration) -> Self {
        Self {
            name,
            default_ttl,
            inner: Arc::new(RwLock::new(CacheInner {
                map: HashMap::new(),
                order: BTreeMap::new(),
                next_seq: 0,
                capacity,
            })),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Create a disabled cache (every lookup misses, nothing is stored).
    pub fn disabled(name: &'static str) -> Self {
        Self::new(name, 0, Duration::ZERO)
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Get a copy of the cached value for `key` if present and not expired.
    ///
    /// Expired entries are removed here, whether or not the sweep has run.
    pub async fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let expired = {
            let store = self.inner.read().await;
            match store.map.get(key) {
                Some(entry) if !entry.is_expired(now) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
                Some(_) => true,
                None => false,
            }
        };

        if expired {
            let mut store = self.inner.write().await;
            // Re-check: a concurrent put may have replaced the entry.
            if store.map.get(key).is_some_and(|entry| entry.is_expired(now)) {
                store.remove(key);
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Insert or replace `key`; `ttl` overrides the cache default.
    pub async fn put(&self, key: K, value: V, ttl: Option<Duration>) {
        let mut store = self.inner.write().await;
        if store.capacity == 0 {
            return;
        }
        store.insert(key, value, ttl.unwrap_or(self.default_ttl), Instant::now());
    }

    pub async fn remove(&self, key: &K) -> bool {
        self.inner.write().await.remove(key).is_some()
    }

    /// Remove every expired entry; returns how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        self.inner.write().await.purge_expired(Instant::now())
    }

    /// Clear all entries. Hit/miss counters are kept.
    pub async fn clear(&self) {
        let mut store = self.inner.write().await;
        store.map.clear();
        store.order.clear();
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub async fn len(&self) -> usize {
        self.inner.read().await.map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> CacheStats {
        let store = self.inner.read().await;
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            size: store.map.len(),
            capacity: store.capacity,
        }
    }

    /// Spawn the periodic expiry sweep; it stops when `cancel` fires.
    pub fn spawn_sweeper(&self, every: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every.max(MIN_SWEEP_INTERVAL));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = cache.purge_expired().await;
                        if removed > 0 {
                            debug!(cache = cache.name, removed, "swept expired cache entries");
                        }
                    }
                }
            }
        })
    }
}
