//! TTL cache store with single-flight computation.
//!
//! Each key is in one of three states:
//!
//! - **empty**: nothing stored, nothing running;
//! - **pending**: one computation is running; later callers for the same
//!   key attach to it instead of starting another (fan-in);
//! - **ready**: a value is stored until its expiry.
//!
//! Ready values live in a [`moka::sync::Cache`] with a per-entry expiry and a
//! capacity bound. Pending computations live in a sharded in-flight table;
//! a shard lock is only ever held for a map operation, never across an
//! await, so lookups for unrelated keys do not serialize.
//!
//! The computation itself runs on a spawned tokio task. Callers await a
//! [`Shared`] handle to its result, so a caller giving up (timeout, dropped
//! future) never cancels the computation for the others, and the result is
//! still stored if every caller has left. Failures are never stored: the
//! pending entry is removed and every waiter receives a clone of the same
//! error.
//!
//! A panicking computation also releases the key. The first waiter to observe
//! it resumes the original panic payload; every other waiter coalesced onto
//! the same computation panics with the `Shared` future's own "inner future
//! panicked during poll" message instead.
//!
//! # Growth bound
//!
//! Expired entries are dropped lazily when looked up. Keys that are never
//! looked up again stay until moka's housekeeping or capacity eviction
//! reclaims them, so memory is bounded by `max_entries`. Set
//! [`CacheConfig::sweep_interval`] to run housekeeping periodically.
//!
//! # Lifecycle
//!
//! A store is created explicitly and shared by cloning the handle into every
//! layer that should see the same entries. It lives until the last handle is
//! dropped; [`CacheStore::clear`] is the administrative reset.

pub mod layer;

pub use layer::{CacheLayer, CachingOperation};

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use moka::Expiry;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::key::CacheKey;
use crate::{MimirError, Result};

/// Number of in-flight table shards.
const SHARDS: usize = 16;

/// What to do when a request cannot be turned into a cache key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyErrorPolicy {
    /// Log a warning and call the wrapped operation uncached.
    #[default]
    Bypass,
    /// Fail the call with [`MimirError::KeyDerivation`].
    Propagate,
}

/// Configuration for a cache layer and its store.
///
/// ```rust
/// # use mimir::CacheConfig;
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .ttl(Duration::from_secs(30))
///     .max_entries(1_000);
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Time-to-live for stored values. Default: 5 minutes.
    pub ttl: Duration,
    /// Maximum number of stored values. Default: 10,000.
    pub max_entries: u64,
    /// Key derivation failure handling. Default: bypass.
    pub on_key_error: KeyErrorPolicy,
    /// Period of the background expiry sweep. Default: disabled.
    pub sweep_interval: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            max_entries: 10_000,
            on_key_error: KeyErrorPolicy::Bypass,
            sweep_interval: None,
        }
    }
}

impl CacheConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the time-to-live for stored values.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Set the maximum number of stored values.
    pub fn max_entries(mut self, n: u64) -> Self {
        self.max_entries = n;
        self
    }

    /// Set the key derivation failure policy.
    pub fn on_key_error(mut self, policy: KeyErrorPolicy) -> Self {
        self.on_key_error = policy;
        self
    }

    /// Enable the periodic expiry sweep.
    pub fn sweep_interval(mut self, every: Duration) -> Self {
        self.sweep_interval = Some(every);
        self
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() {
            return Err(MimirError::config("cache ttl must be greater than zero"));
        }
        if self.max_entries == 0 {
            return Err(MimirError::config("cache max_entries must be greater than zero"));
        }
        if self.sweep_interval.is_some_and(|d| d.is_zero()) {
            return Err(MimirError::config("cache sweep_interval must be greater than zero"));
        }
        Ok(())
    }
}

/// How a lookup was served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// A fresh stored value was returned; nothing was computed.
    Hit,
    /// The caller attached to a computation already running for the key.
    Coalesced,
    /// The caller started the computation.
    Miss,
}

/// Counters for a store, taken with [`CacheStore::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub coalesced: u64,
    pub entries: u64,
    pub in_flight: u64,
}

#[derive(Clone)]
struct Stored<V> {
    value: V,
    ttl: Duration,
}

/// Expires each entry after the TTL it was stored with.
struct PerEntryTtl;

impl<V> Expiry<CacheKey, Stored<V>> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &CacheKey,
        value: &Stored<V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &CacheKey,
        value: &Stored<V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

type Completion<V, E> = Shared<BoxFuture<'static, std::result::Result<V, E>>>;

struct Flight<V, E> {
    id: u64,
    done: Completion<V, E>,
}

struct Inner<V, E> {
    ready: moka::sync::Cache<CacheKey, Stored<V>>,
    pending: Box<[Mutex<HashMap<CacheKey, Flight<V, E>>>]>,
    next_flight: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
}

impl<V, E> Inner<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn shard(&self, key: &CacheKey) -> MutexGuard<'_, HashMap<CacheKey, Flight<V, E>>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let idx = (hasher.finish() as usize) % self.pending.len();
        self.pending[idx]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the outcome of flight `id` and retire it.
    ///
    /// The value (if any) is stored before the pending entry is removed,
    /// under the shard lock, so no caller can observe the key as empty in
    /// between and start a duplicate computation.
    fn finish(&self, key: &CacheKey, id: u64, value: Option<(V, Duration)>) {
        let mut shard = self.shard(key);
        if let Some((value, ttl)) = value
            && !ttl.is_zero()
        {
            self.ready.insert(key.clone(), Stored { value, ttl });
        }
        if shard.get(key).is_some_and(|f| f.id == id) {
            shard.remove(key);
        }
    }
}

/// Retires a flight whose computation unwound before reaching `finish`.
struct FlightGuard<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    inner: Arc<Inner<V, E>>,
    key: CacheKey,
    id: u64,
    armed: bool,
}

impl<V, E> Drop for FlightGuard<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if self.armed {
            self.inner.finish(&self.key, self.id, None);
        }
    }
}

/// Concurrency-safe TTL store with single-flight fill. Cheap to clone.
pub struct CacheStore<V, E> {
    inner: Arc<Inner<V, E>>,
}

impl<V, E> Clone for CacheStore<V, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V, E> CacheStore<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + From<MimirError> + 'static,
{
    /// Create a store sized and swept according to `config`.
    ///
    /// The sweep task needs a tokio runtime; outside one the sweep is
    /// skipped with a warning and expiry stays lazy.
    pub fn new(config: &CacheConfig) -> Result<Self> {
        config.validate()?;
        let ready = moka::sync::Cache::builder()
            .max_capacity(config.max_entries)
            .expire_after(PerEntryTtl)
            .build();
        let pending = (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect();
        let inner = Arc::new(Inner {
            ready,
            pending,
            next_flight: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            coalesced: AtomicU64::new(0),
        });

        if let Some(every) = config.sweep_interval {
            match tokio::runtime::Handle::try_current() {
                Ok(rt) => {
                    rt.spawn(sweep(Arc::downgrade(&inner), every));
                }
                Err(_) => warn!("no tokio runtime available, periodic cache sweep disabled"),
            }
        }

        Ok(Self { inner })
    }

    /// Return the stored value for `key`, or compute it.
    ///
    /// `compute` runs at most once per miss, however many callers ask for
    /// `key` while it runs. Its error is returned unchanged to all of them
    /// and nothing is stored. A `ttl` of zero shares the computation but
    /// does not store the result.
    ///
    /// # Panics
    ///
    /// If `compute` panics, the first waiter to observe it panics with the
    /// original payload and the other waiters with a generic message (see
    /// the [module docs](self)).
    pub async fn get_or_compute<F, Fut>(
        &self,
        key: CacheKey,
        ttl: Duration,
        compute: F,
    ) -> std::result::Result<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
    {
        self.resolve(key, ttl, compute).await.1
    }

    /// Like [`get_or_compute`](Self::get_or_compute), also reporting how the
    /// lookup was served.
    pub async fn resolve<F, Fut>(
        &self,
        key: CacheKey,
        ttl: Duration,
        compute: F,
    ) -> (Lookup, std::result::Result<V, E>)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
    {
        if let Some(stored) = self.inner.ready.get(&key) {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            return (Lookup::Hit, Ok(stored.value));
        }

        let (lookup, done) = {
            let mut shard = self.inner.shard(&key);
            if let Some(flight) = shard.get(&key) {
                (Lookup::Coalesced, flight.done.clone())
            } else if let Some(stored) = self.inner.ready.get(&key) {
                // Filled between the first lookup and taking the lock.
                drop(shard);
                self.inner.hits.fetch_add(1, Ordering::Relaxed);
                return (Lookup::Hit, Ok(stored.value));
            } else {
                let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                let done = self.spawn_flight(key.clone(), id, ttl, compute);
                shard.insert(
                    key,
                    Flight {
                        id,
                        done: done.clone(),
                    },
                );
                (Lookup::Miss, done)
            }
        };

        match lookup {
            Lookup::Coalesced => self.inner.coalesced.fetch_add(1, Ordering::Relaxed),
            _ => self.inner.misses.fetch_add(1, Ordering::Relaxed),
        };
        (lookup, done.await)
    }

    fn spawn_flight<F, Fut>(
        &self,
        key: CacheKey,
        id: u64,
        ttl: Duration,
        compute: F,
    ) -> Completion<V, E>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = std::result::Result<V, E>> + Send + 'static,
    {
        let operation = key.namespace().to_owned();
        let mut guard = FlightGuard {
            inner: Arc::clone(&self.inner),
            key,
            id,
            armed: true,
        };
        let handle = tokio::spawn(async move {
            let result = compute().await;
            let value = result.as_ref().ok().map(|v| (v.clone(), ttl));
            guard.inner.finish(&guard.key, guard.id, value);
            guard.armed = false;
            result
        });

        async move {
            match handle.await {
                Ok(result) => result,
                Err(err) => match err.try_into_panic() {
                    Ok(payload) => std::panic::resume_unwind(payload),
                    Err(_) => Err(E::from(MimirError::ComputationAborted { operation })),
                },
            }
        }
        .boxed()
        .shared()
    }
}

impl<V, E> CacheStore<V, E>
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Peek at a fresh stored value without computing anything.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        self.inner.ready.get(key).map(|s| s.value)
    }

    /// Whether a fresh value is stored for `key`.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.ready.contains_key(key)
    }

    /// Drop the stored value for `key`. A running computation is unaffected.
    pub fn invalidate(&self, key: &CacheKey) {
        self.inner.ready.invalidate(key);
    }

    /// Drop every stored value. Running computations still store their
    /// results when they finish.
    pub fn clear(&self) {
        self.inner.ready.invalidate_all();
        self.inner.ready.run_pending_tasks();
        info!("cache store cleared");
    }

    /// Number of stored values (after pending housekeeping).
    pub fn len(&self) -> u64 {
        self.inner.ready.run_pending_tasks();
        self.inner.ready.entry_count()
    }

    /// Whether the store holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of computations currently running.
    pub fn in_flight(&self) -> u64 {
        self.inner
            .pending
            .iter()
            .map(|s| s.lock().unwrap_or_else(PoisonError::into_inner).len() as u64)
            .sum()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.inner.hits.load(Ordering::Relaxed),
            misses: self.inner.misses.load(Ordering::Relaxed),
            coalesced: self.inner.coalesced.load(Ordering::Relaxed),
            entries: self.len(),
            in_flight: self.in_flight(),
        }
    }
}

async fn sweep<V, E>(store: Weak<Inner<V, E>>, every: Duration)
where
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(inner) = store.upgrade() else {
            break;
        };
        inner.ready.run_pending_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.ttl, Duration::from_secs(300));
        assert_eq!(config.max_entries, 10_000);
        assert_eq!(config.on_key_error, KeyErrorPolicy::Bypass);
        assert!(config.sweep_interval.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_ttl_rejected() {
        let err = CacheConfig::new().ttl(Duration::ZERO).validate().unwrap_err();
        assert!(matches!(err, MimirError::Configuration(_)));
    }

    #[test]
    fn zero_capacity_rejected() {
        assert!(CacheConfig::new().max_entries(0).validate().is_err());
    }

    #[test]
    fn zero_sweep_interval_rejected() {
        assert!(
            CacheConfig::new()
                .sweep_interval(Duration::ZERO)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn store_outside_runtime_skips_sweep() {
        let store = CacheStore::<u32, MimirError>::new(
            &CacheConfig::new().sweep_interval(Duration::from_millis(10)),
        );
        assert!(store.is_ok());
    }
}
