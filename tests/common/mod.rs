//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use mimir::{CallError, MimirError, Operation, RetryConfig, SharedOperation};

// ============================================================================
// Request / error types
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Quote {
    pub symbol: String,
    pub count: Option<u32>,
}

pub fn quote(symbol: &str) -> Quote {
    Quote {
        symbol: symbol.to_string(),
        count: None,
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TestError {
    #[error("transient failure on attempt {0}")]
    Transient(u32),
    #[error("bad input")]
    BadInput,
    #[error("rate limited")]
    RateLimited(Duration),
    #[error(transparent)]
    Mimir(#[from] MimirError),
}

impl CallError for TestError {
    fn kind(&self) -> &'static str {
        match self {
            TestError::Transient(_) => "transient",
            TestError::BadInput => "bad_input",
            TestError::RateLimited(_) => "rate_limited",
            TestError::Mimir(e) => e.kind(),
        }
    }

    fn is_transient(&self) -> bool {
        match self {
            TestError::BadInput => false,
            TestError::Mimir(e) => e.is_transient(),
            _ => true,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            TestError::RateLimited(d) => Some(*d),
            _ => None,
        }
    }
}

// ============================================================================
// Mock operation
// ============================================================================

/// Counts its calls and fails the first `fail_first` of them.
///
/// Successful calls return the 1-based call number, so tests can tell which
/// invocation produced a value.
pub struct Flaky {
    name: &'static str,
    calls: Arc<AtomicU32>,
    fail_first: u32,
    failure: fn(u32) -> TestError,
    delay: Duration,
}

impl Flaky {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            calls: Arc::new(AtomicU32::new(0)),
            fail_first: 0,
            failure: TestError::Transient,
            delay: Duration::ZERO,
        }
    }

    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    pub fn always_failing(self) -> Self {
        self.failing_first(u32::MAX)
    }

    pub fn failing_with(mut self, failure: fn(u32) -> TestError) -> Self {
        self.failure = failure;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Handle to the call counter, valid after the operation is shared.
    pub fn calls(&self) -> Arc<AtomicU32> {
        Arc::clone(&self.calls)
    }

    pub fn shared(self) -> SharedOperation<Quote, u32, TestError> {
        Arc::new(self)
    }
}

#[async_trait]
impl Operation<Quote> for Flaky {
    type Response = u32;
    type Error = TestError;

    fn name(&self) -> &str {
        self.name
    }

    async fn call(&self, _request: &Quote) -> Result<u32, TestError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if n <= self.fail_first {
            return Err((self.failure)(n));
        }
        Ok(n)
    }
}

pub fn count(calls: &AtomicU32) -> u32 {
    calls.load(Ordering::SeqCst)
}

/// Three attempts, tiny fixed delays.
pub fn fast_retry() -> RetryConfig {
    RetryConfig::new()
        .max_attempts(3)
        .initial_delay(Duration::from_millis(1))
        .jitter(false)
}
