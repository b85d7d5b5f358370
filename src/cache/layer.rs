//! Cache layer: serves repeated requests from a [`CacheStore`].
//!
//! A hit returns without touching anything inside this layer, so every
//! layer placed inside (retry, monitor) is skipped for that call.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use super::{CacheConfig, CacheStore, KeyErrorPolicy, Lookup};
use crate::error::CallError;
use crate::key::{KeyFn, derive_key};
use crate::stack::Layer;
use crate::telemetry;
use crate::traits::{LayerKind, Operation, SharedOperation};
use crate::{MimirError, Result};

/// Decorator that caches the responses of an [`Operation`].
pub struct CachingOperation<Req, T, E>
where
    Req: Send + Sync + 'static,
    T: Send + 'static,
    E: CallError,
{
    inner: SharedOperation<Req, T, E>,
    store: CacheStore<T, E>,
    ttl: Duration,
    key_fn: KeyFn<Req>,
    on_key_error: KeyErrorPolicy,
}

impl<Req, T, E> CachingOperation<Req, T, E>
where
    Req: Serialize + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: CallError + From<MimirError>,
{
    /// Wrap `inner`, keying requests by their serialized field values.
    ///
    /// # Errors
    ///
    /// Returns [`MimirError::Configuration`] if `config` is invalid.
    pub fn new(
        inner: SharedOperation<Req, T, E>,
        store: CacheStore<T, E>,
        config: &CacheConfig,
    ) -> Result<Self> {
        let namespace = inner.name().to_owned();
        let key_fn: KeyFn<Req> = Arc::new(move |req: &Req| derive_key(&namespace, req));
        Self::with_key_fn(inner, store, config, key_fn)
    }
}

impl<Req, T, E> CachingOperation<Req, T, E>
where
    Req: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: CallError + From<MimirError>,
{
    /// Wrap `inner` with a custom key function.
    pub fn with_key_fn(
        inner: SharedOperation<Req, T, E>,
        store: CacheStore<T, E>,
        config: &CacheConfig,
        key_fn: KeyFn<Req>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            inner,
            store,
            ttl: config.ttl,
            key_fn,
            on_key_error: config.on_key_error,
        })
    }

    /// The store backing this layer.
    pub fn store(&self) -> &CacheStore<T, E> {
        &self.store
    }
}

#[async_trait]
impl<Req, T, E> Operation<Req> for CachingOperation<Req, T, E>
where
    Req: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: CallError + From<MimirError>,
{
    type Response = T;
    type Error = E;

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn call(&self, request: &Req) -> std::result::Result<T, E> {
        let operation = self.inner.name();
        let key = match (self.key_fn)(request) {
            Ok(key) => key,
            Err(err) => match self.on_key_error {
                KeyErrorPolicy::Bypass => {
                    metrics::counter!(telemetry::CACHE_KEY_BYPASS_TOTAL,
                        "operation" => operation.to_owned(),
                    )
                    .increment(1);
                    warn!(operation, error = %err, "cache key derivation failed, calling uncached");
                    return self.inner.call(request).await;
                }
                KeyErrorPolicy::Propagate => return Err(E::from(MimirError::from(err))),
            },
        };

        let inner = Arc::clone(&self.inner);
        let owned = request.clone();
        let (lookup, result) = self
            .store
            .resolve(key, self.ttl, move || async move { inner.call(&owned).await })
            .await;

        let metric = match lookup {
            Lookup::Hit => telemetry::CACHE_HITS_TOTAL,
            Lookup::Coalesced => telemetry::CACHE_COALESCED_TOTAL,
            Lookup::Miss => telemetry::CACHE_MISSES_TOTAL,
        };
        metrics::counter!(metric, "operation" => operation.to_owned()).increment(1);
        debug!(operation, ?lookup, ok = result.is_ok(), "cache lookup");
        result
    }

    fn layers(&self) -> Vec<LayerKind> {
        let mut layers = vec![LayerKind::Cache];
        layers.extend(self.inner.layers());
        layers
    }
}

/// Declarative cache layer for [`StackBuilder`](crate::StackBuilder).
pub struct CacheLayer<T, E> {
    config: CacheConfig,
    store: Option<CacheStore<T, E>>,
}

impl<T, E> CacheLayer<T, E> {
    /// Cache into a store created for this layer alone.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            store: None,
        }
    }

    /// Cache into an existing, possibly shared, store.
    pub fn with_store(config: CacheConfig, store: CacheStore<T, E>) -> Self {
        Self {
            config,
            store: Some(store),
        }
    }
}

impl<Req, T, E> Layer<Req, T, E> for CacheLayer<T, E>
where
    Req: Serialize + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: CallError + From<MimirError>,
{
    fn apply(self: Box<Self>, inner: SharedOperation<Req, T, E>) -> Result<SharedOperation<Req, T, E>> {
        let Self { config, store } = *self;
        let store = match store {
            Some(store) => store,
            None => CacheStore::new(&config)?,
        };
        Ok(Arc::new(CachingOperation::new(inner, store, &config)?))
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Cache
    }

    fn config_json(&self) -> serde_json::Value {
        serde_json::json!({
            "ttl_ms": self.config.ttl.as_millis() as u64,
            "max_entries": self.config.max_entries,
            "on_key_error": self.config.on_key_error,
            "sweep_interval_ms": self.config.sweep_interval.map(|d| d.as_millis() as u64),
            "shared_store": self.store.is_some(),
        })
    }
}
