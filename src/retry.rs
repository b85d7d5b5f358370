//! Retry configuration, delay calculation, and the retry decorator.
//!
//! [`RetryConfig`] holds the attempt budget and backoff curve;
//! [`RetryingOperation`] re-invokes a wrapped operation while its errors
//! are classified retryable. The attempt loop lives in [`with_retry`] so it can
//! also be used around ad-hoc futures.
//!
//! The error surfaced after the last attempt is that attempt's own error,
//! unchanged. There is no "retries exhausted" wrapper.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use crate::error::CallError;
use crate::stack::Layer;
use crate::telemetry;
use crate::traits::{LayerKind, Operation, SharedOperation};
use crate::{MimirError, Result};

/// Attempt budget and exponential backoff, with optional jitter.
///
/// ```rust
/// # use mimir::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::new()
///     .max_attempts(4)
///     .initial_delay(Duration::from_millis(250))
///     .max_delay(Duration::from_secs(5));
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per call, the first one included. 1 disables retry. Default: 3.
    pub max_attempts: u32,
    /// Backoff base: the wait after the first failure. Default: 500ms.
    pub initial_delay: Duration,
    /// Upper bound on any single wait. Default: 30s.
    pub max_delay: Duration,
    /// Scale computed waits by a random factor. Default: true.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single attempt, no retry.
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(MimirError::config("retry max_attempts must be at least 1"));
        }
        Ok(())
    }

    /// `initial_delay * 2^attempt` (0-indexed), capped at `max_delay`, before jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(attempt));
        delay.min(self.max_delay)
    }

    /// Calculate the effective delay, respecting server `retry_after` hints.
    ///
    /// A `retry_after` hint takes precedence over the calculated backoff and
    /// is never jittered. Otherwise, with jitter enabled, the backoff is
    /// scaled by a random factor in `[0.5, 1.0]` so that concurrent callers
    /// failing together do not retry in lockstep.
    pub fn effective_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        if let Some(hint) = retry_after {
            return hint;
        }
        let delay = self.delay_for_attempt(attempt);
        if self.jitter && !delay.is_zero() {
            delay.mul_f64(rand::rng().random_range(0.5..=1.0))
        } else {
            delay
        }
    }
}

/// Retry decision for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Try again if attempts remain.
    Retryable,
    /// Give up immediately (e.g. malformed input).
    Fatal,
}

type Classifier<E> = Arc<dyn Fn(&E) -> Disposition + Send + Sync>;
type Backoff = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// A validated [`RetryConfig`] plus the error classifier and backoff.
///
/// By default errors are classified with [`CallError::is_transient`] and
/// delays follow [`RetryConfig::effective_delay`].
pub struct RetryPolicy<E> {
    config: RetryConfig,
    classify: Classifier<E>,
    backoff: Option<Backoff>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            classify: Arc::clone(&self.classify),
            backoff: self.backoff.clone(),
        }
    }
}

impl<E: CallError> RetryPolicy<E> {
    /// # Errors
    ///
    /// Returns [`MimirError::Configuration`] if `max_attempts` is zero.
    pub fn new(config: RetryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            classify: Arc::new(|e: &E| {
                if e.is_transient() {
                    Disposition::Retryable
                } else {
                    Disposition::Fatal
                }
            }),
            backoff: None,
        })
    }

    /// Replace the error classifier.
    pub fn classify(mut self, f: impl Fn(&E) -> Disposition + Send + Sync + 'static) -> Self {
        self.classify = Arc::new(f);
        self
    }

    /// Replace the backoff curve. `f` receives the 1-based number of the
    /// attempt that just failed. `retry_after` hints still take precedence.
    pub fn backoff(mut self, f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.backoff = Some(Arc::new(f));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay to wait after `attempt` (1-based) failed with `err`.
    fn delay_after(&self, attempt: u32, err: &E) -> Duration {
        match (&self.backoff, err.retry_after()) {
            (_, Some(hint)) => hint,
            (Some(backoff), None) => backoff(attempt),
            (None, None) => self.config.effective_delay(attempt - 1, None),
        }
    }
}

/// Run `f` until it succeeds or the policy gives up.
///
/// Retries errors classified [`Disposition::Retryable`] up to
/// `policy.config().max_attempts`, sleeping between attempts. Fatal errors
/// are returned immediately. When attempts run out, the last attempt's error
/// is returned.
pub async fn with_retry<F, Fut, T, E>(policy: &RetryPolicy<E>, operation: &str, f: F) -> std::result::Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: CallError,
{
    let max_attempts = policy.config.max_attempts;
    let mut attempt = 1;
    loop {
        let err = match f().await {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };

        if (policy.classify)(&err) == Disposition::Fatal {
            debug!(operation, attempt, error = %err, "fatal error, not retrying");
            return Err(err);
        }
        if attempt >= max_attempts {
            if max_attempts > 1 {
                metrics::counter!(telemetry::RETRIES_EXHAUSTED_TOTAL,
                    "operation" => operation.to_owned(),
                )
                .increment(1);
                warn!(operation, attempts = attempt, error = %err, "retries exhausted");
            }
            return Err(err);
        }

        metrics::counter!(telemetry::RETRIES_TOTAL,
            "operation" => operation.to_owned(),
        )
        .increment(1);
        let delay = policy.delay_after(attempt, &err);
        warn!(
            operation,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after transient error"
        );
        tokio::time::sleep(delay).await;
        attempt += 1;
    }
}

/// Decorator that wraps an [`Operation`] with retry logic.
///
/// Every attempt goes through the full inner stack, so a cache placed inside
/// is consulted once per attempt and a monitor placed inside records one
/// sample per attempt.
pub struct RetryingOperation<Req, T, E>
where
    Req: Send + Sync + 'static,
    T: Send + 'static,
    E: CallError,
{
    inner: SharedOperation<Req, T, E>,
    policy: RetryPolicy<E>,
}

impl<Req, T, E> RetryingOperation<Req, T, E>
where
    Req: Send + Sync + 'static,
    T: Send + 'static,
    E: CallError,
{
    /// Wrap an operation with the default classifier and backoff.
    ///
    /// # Errors
    ///
    /// Returns [`MimirError::Configuration`] if `max_attempts` is zero.
    pub fn new(inner: SharedOperation<Req, T, E>, config: RetryConfig) -> Result<Self> {
        Ok(Self::with_policy(inner, RetryPolicy::new(config)?))
    }

    pub fn with_policy(inner: SharedOperation<Req, T, E>, policy: RetryPolicy<E>) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<Req, T, E> Operation<Req> for RetryingOperation<Req, T, E>
where
    Req: Send + Sync + 'static,
    T: Send + 'static,
    E: CallError,
{
    type Response = T;
    type Error = E;

    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn call(&self, request: &Req) -> std::result::Result<T, E> {
        with_retry(&self.policy, self.inner.name(), || self.inner.call(request)).await
    }

    fn layers(&self) -> Vec<LayerKind> {
        let mut layers = vec![LayerKind::Retry];
        layers.extend(self.inner.layers());
        layers
    }
}

/// Declarative retry layer for [`StackBuilder`](crate::StackBuilder).
pub struct RetryLayer<E> {
    config: RetryConfig,
    classify: Option<Classifier<E>>,
    backoff: Option<Backoff>,
}

impl<E> RetryLayer<E> {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            classify: None,
            backoff: None,
        }
    }

    /// Replace the error classifier.
    pub fn classify(mut self, f: impl Fn(&E) -> Disposition + Send + Sync + 'static) -> Self {
        self.classify = Some(Arc::new(f));
        self
    }

    /// Replace the backoff curve (see [`RetryPolicy::backoff`]).
    pub fn backoff(mut self, f: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.backoff = Some(Arc::new(f));
        self
    }
}

impl<Req, T, E> Layer<Req, T, E> for RetryLayer<E>
where
    Req: Send + Sync + 'static,
    T: Send + 'static,
    E: CallError,
{
    fn apply(self: Box<Self>, inner: SharedOperation<Req, T, E>) -> Result<SharedOperation<Req, T, E>> {
        let Self {
            config,
            classify,
            backoff,
        } = *self;
        let mut policy = RetryPolicy::new(config)?;
        if let Some(classify) = classify {
            policy.classify = classify;
        }
        policy.backoff = backoff;
        Ok(Arc::new(RetryingOperation::with_policy(inner, policy)))
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Retry
    }

    fn config_json(&self) -> serde_json::Value {
        serde_json::json!({
            "max_attempts": self.config.max_attempts,
            "initial_delay_ms": self.config.initial_delay.as_millis() as u64,
            "max_delay_ms": self.config.max_delay.as_millis() as u64,
            "jitter": self.config.jitter,
            "custom_classifier": self.classify.is_some(),
            "custom_backoff": self.backoff.is_some(),
        })
    }
}
