//! The operation trait every layer wraps and implements.
//!
//! A layer takes "the next operation" and returns a new operation with the
//! same request, response and error types. Because wrappers and the raw
//! operation share one trait, layers nest in any order and the composed
//! stack is indistinguishable in type from the operation it wraps:
//!
//! ```text
//! Caller
//!   ↓
//! MonitoredOperation   (timer start / sample record)
//!   ↓
//! CachingOperation     (lookup / store)
//!   ↓
//! RetryingOperation    (attempt loop / backoff)
//!   ↓
//! Raw operation        (e.g. a market-data fetch)
//! ```
//!
//! # Idempotency
//!
//! Retry re-invokes whatever it wraps, and a cache may serve one result to
//! many callers. Only wrap operations that are idempotent from the caller's
//! point of view with those layers. Nothing here can check that.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CallError;

/// Identifies a layer in a composed stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LayerKind {
    Cache,
    Retry,
    Monitor,
}

impl LayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LayerKind::Cache => "cache",
            LayerKind::Retry => "retry",
            LayerKind::Monitor => "monitor",
        }
    }
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An asynchronous request/response operation.
///
/// Requests are borrowed so that retry can re-issue the same request and
/// cache can derive a key without consuming it.
#[async_trait]
pub trait Operation<Req>: Send + Sync
where
    Req: Send + Sync + 'static,
{
    type Response: Send + 'static;
    type Error: CallError;

    /// Operation name for logging and metrics.
    fn name(&self) -> &str;

    /// Invoke the operation.
    async fn call(&self, request: &Req) -> Result<Self::Response, Self::Error>;

    /// Layers wrapping this operation, outermost first. Empty for a raw operation.
    fn layers(&self) -> Vec<LayerKind> {
        Vec::new()
    }

    /// Whether a cache layer sits anywhere in this stack.
    fn is_cacheable(&self) -> bool {
        self.layers().contains(&LayerKind::Cache)
    }

    /// Whether a retry layer sits anywhere in this stack.
    fn is_retryable(&self) -> bool {
        self.layers().contains(&LayerKind::Retry)
    }

    /// Whether a monitor layer sits anywhere in this stack.
    fn is_monitored(&self) -> bool {
        self.layers().contains(&LayerKind::Monitor)
    }
}

/// Type-erased, shareable operation. Every layer produces one of these.
pub type SharedOperation<Req, T, E> = Arc<dyn Operation<Req, Response = T, Error = E>>;

/// Operation backed by an async closure. See [`operation_fn`].
pub struct FnOperation<F> {
    name: String,
    f: F,
}

/// Adapt an async closure taking an owned request into an [`Operation`].
///
/// ```rust
/// # use std::sync::Arc;
/// # use mimir::{operation_fn, MimirError, Operation, SharedOperation};
/// let double: SharedOperation<u32, u32, MimirError> =
///     Arc::new(operation_fn("double", |n: u32| async move { Ok::<_, MimirError>(n * 2) }));
/// assert_eq!(double.name(), "double");
/// assert!(!double.is_cacheable());
/// ```
pub fn operation_fn<F>(name: impl Into<String>, f: F) -> FnOperation<F> {
    FnOperation {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<Req, F, Fut, T, E> Operation<Req> for FnOperation<F>
where
    Req: Clone + Send + Sync + 'static,
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, E>> + Send,
    T: Send + 'static,
    E: CallError,
{
    type Response = T;
    type Error = E;

    fn name(&self) -> &str {
        &self.name
    }

    async fn call(&self, request: &Req) -> Result<T, E> {
        (self.f)(request.clone()).await
    }
}
