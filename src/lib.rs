//! Mimir - Stackable cache, retry and monitoring layers for async operations
//!
//! This crate wraps an asynchronous request/response [`Operation`] with any
//! combination of caching, retrying and performance monitoring, in whatever
//! order the caller composes them. The wrapped stack is itself an
//! [`Operation`] with the same request, response and error types, and errors
//! from the wrapped operation reach the caller unchanged.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use mimir::{
//!     CacheConfig, MetricsRegistry, MimirError, Operation, RetryConfig, SharedOperation,
//!     StackBuilder, operation_fn,
//! };
//! use serde::Serialize;
//!
//! #[derive(Clone, Serialize)]
//! struct Quote {
//!     symbol: String,
//! }
//!
//! #[tokio::main]
//! async fn main() -> mimir::Result<()> {
//!     let raw: SharedOperation<Quote, f64, MimirError> =
//!         std::sync::Arc::new(operation_fn("quote", |q: Quote| async move {
//!             Ok::<_, MimirError>(if q.symbol == "600000" { 7.5 } else { 0.0 })
//!         }));
//!
//!     let registry = MetricsRegistry::new();
//!     // Outermost last: Monitor(Cache(Retry(raw)))
//!     let quote = StackBuilder::new(raw)
//!         .with_retry(RetryConfig::new().max_attempts(3))
//!         .with_cache(CacheConfig::new().ttl(Duration::from_secs(60)))
//!         .with_monitor(&registry)
//!         .build()?;
//!
//!     let price = quote.call(&Quote { symbol: "600000".into() }).await?;
//!     println!("{price} {:?}", registry.snapshot("quote"));
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod key;
pub mod monitor;
pub mod retry;
pub mod stack;
pub mod telemetry;
pub mod traits;

// Re-export main types at crate root
pub use error::{CallError, KeyDerivationError, MimirError, Result};
pub use traits::{FnOperation, LayerKind, Operation, SharedOperation, operation_fn};

pub use cache::{
    CacheConfig, CacheLayer, CacheStats, CacheStore, CachingOperation, KeyErrorPolicy, Lookup,
};
pub use config::{CacheSection, MonitorSection, RetrySection, StackConfig};
pub use key::{CacheKey, KeyFn, derive_key};
pub use monitor::{
    MetricsRegistry, MonitorLayer, MonitoredOperation, OperationStats, Outcome, Sample, Summary,
};
pub use retry::{Disposition, RetryConfig, RetryLayer, RetryPolicy, RetryingOperation, with_retry};
pub use stack::{Layer, LayerDescriptor, StackBuilder};
