//! Builder for composing an operation with layers.
//!
//! # Layer Ordering Convention
//!
//! Layers form an "onion" around the raw operation:
//!
//! ```text
//! Caller
//!     ↓
//! Outermost layer (sees the call first, the result last)
//!     ↓
//! Inner layer
//!     ↓
//! Raw operation
//! ```
//!
//! Order is never canonicalised; it is exactly what the caller composed, and
//! it changes behaviour:
//!
//! - cache outside retry: a hit skips retries entirely;
//! - retry outside cache: every attempt consults the cache again;
//! - monitor outside retry: one sample covering all attempts;
//! - monitor inside retry: one sample per attempt;
//! - monitor outside cache: hits are recorded; inside: only misses.
//!
//! ## Storage vs Application Order
//!
//! The `layers` vector stores layers in **outermost-first** order (the last
//! layer added is the outermost), and they are **applied in reverse** during
//! [`build()`](StackBuilder::build):
//!
//! ```text
//! builder.with_retry(..).with_cache(..).with_monitor(..)
//!
//! Storage: [Monitor, Cache, Retry]  (outermost first)
//! Applied:  Raw -> Retry -> Cache -> Monitor
//! Result:   Monitor(Cache(Retry(Raw)))
//! ```

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::cache::{CacheLayer, CacheStore};
use crate::config::StackConfig;
use crate::error::CallError;
use crate::monitor::{MetricsRegistry, MonitorLayer};
use crate::retry::RetryLayer;
use crate::traits::{LayerKind, SharedOperation};
use crate::{CacheConfig, MimirError, Result, RetryConfig};

/// A wrapper that can be applied around an operation.
pub trait Layer<Req, T, E>: Send + Sync
where
    Req: Send + Sync + 'static,
    T: Send + 'static,
    E: CallError,
{
    /// Wrap `inner` and return the wrapped operation.
    ///
    /// # Errors
    ///
    /// Returns [`MimirError::Configuration`] for invalid layer configuration.
    fn apply(self: Box<Self>, inner: SharedOperation<Req, T, E>) -> Result<SharedOperation<Req, T, E>>;

    /// Which kind of layer this is.
    fn kind(&self) -> LayerKind;

    /// Configuration snapshot for inspection and logging.
    fn config_json(&self) -> serde_json::Value;
}

/// One entry of an exported stack, outermost first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerDescriptor {
    /// Layer kind name, or "operation" for the innermost raw operation.
    pub name: String,
    pub config: serde_json::Value,
}

/// Composes a raw operation with layers.
///
/// See [module-level documentation](self) for details on ordering.
pub struct StackBuilder<Req, T, E>
where
    Req: Send + Sync + 'static,
    T: Send + 'static,
    E: CallError,
{
    raw: SharedOperation<Req, T, E>,
    /// Layers in outermost-first order.
    layers: Vec<Box<dyn Layer<Req, T, E>>>,
}

impl<Req, T, E> StackBuilder<Req, T, E>
where
    Req: Send + Sync + 'static,
    T: Send + 'static,
    E: CallError,
{
    /// Create a new builder from a raw, unwrapped operation.
    pub fn new(raw: SharedOperation<Req, T, E>) -> Self {
        Self {
            raw,
            layers: Vec::new(),
        }
    }

    /// Add an arbitrary layer at the outermost position.
    pub fn layer(mut self, layer: impl Layer<Req, T, E> + 'static) -> Self {
        self.layers.insert(0, Box::new(layer));
        self
    }

    /// Add a retry layer at the outermost position.
    pub fn with_retry(self, config: RetryConfig) -> Self {
        self.layer(RetryLayer::new(config))
    }

    /// Add a monitor layer recording into `registry` at the outermost position.
    pub fn with_monitor(self, registry: &MetricsRegistry) -> Self {
        self.layer(MonitorLayer::new(registry))
    }

    /// Layer kinds in outermost-first order.
    pub fn order(&self) -> Vec<LayerKind> {
        self.layers.iter().map(|l| l.kind()).collect()
    }

    /// Export the composed order for inspection.
    ///
    /// The raw operation is appended as the innermost entry.
    pub fn to_stack(&self) -> Vec<LayerDescriptor> {
        let mut stack: Vec<LayerDescriptor> = self
            .layers
            .iter()
            .map(|l| LayerDescriptor {
                name: l.kind().as_str().to_owned(),
                config: l.config_json(),
            })
            .collect();
        stack.push(LayerDescriptor {
            name: "operation".to_owned(),
            config: json!({ "name": self.raw.name() }),
        });
        stack
    }

    /// Build the wrapped operation.
    ///
    /// Layers are applied in reverse storage order, innermost first, so the
    /// first stored layer ends up outermost.
    ///
    /// # Errors
    ///
    /// Returns [`MimirError::Configuration`] if any layer's configuration is
    /// invalid. Nothing is built in that case.
    pub fn build(self) -> Result<SharedOperation<Req, T, E>> {
        let mut acc = Arc::clone(&self.raw);
        for layer in self.layers.into_iter().rev() {
            acc = layer.apply(acc)?;
        }
        Ok(acc)
    }
}

impl<Req, T, E> StackBuilder<Req, T, E>
where
    Req: Serialize + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
    E: CallError + From<MimirError>,
{
    /// Add a cache layer with its own store at the outermost position.
    pub fn with_cache(self, config: CacheConfig) -> Self {
        self.layer(CacheLayer::new(config))
    }

    /// Add a cache layer backed by a shared store at the outermost position.
    pub fn with_cache_store(self, config: CacheConfig, store: CacheStore<T, E>) -> Self {
        self.layer(CacheLayer::with_store(config, store))
    }

    /// Build a stack exactly as `config` describes it.
    ///
    /// The cache layer uses `store` when given, a private store otherwise.
    /// The monitor layer records into `registry`.
    ///
    /// # Errors
    ///
    /// Returns [`MimirError::Configuration`] if `config` is inconsistent.
    pub fn from_config(
        raw: SharedOperation<Req, T, E>,
        config: &StackConfig,
        store: Option<CacheStore<T, E>>,
        registry: &MetricsRegistry,
    ) -> Result<Self> {
        let order = config.resolved_order()?;
        let mut builder = Self::new(raw);
        let mut store = store;
        // Innermost first, so that each addition becomes the new outermost.
        for kind in order.into_iter().rev() {
            builder = match kind {
                LayerKind::Cache => {
                    let cache = config.cache_config()?.ok_or_else(|| missing(kind))?;
                    match store.take() {
                        Some(store) => builder.with_cache_store(cache, store),
                        None => builder.with_cache(cache),
                    }
                }
                LayerKind::Retry => {
                    let retry = config.retry_config()?.ok_or_else(|| missing(kind))?;
                    builder.with_retry(retry)
                }
                LayerKind::Monitor => {
                    let mut layer = MonitorLayer::new(registry);
                    if let Some(name) = config
                        .monitor
                        .as_ref()
                        .and_then(|m| m.operation_name.clone())
                    {
                        layer = layer.named(name);
                    }
                    builder.layer(layer)
                }
            };
        }
        Ok(builder)
    }
}

fn missing(kind: LayerKind) -> MimirError {
    MimirError::config(format!("layer '{kind}' is ordered but not configured"))
}
