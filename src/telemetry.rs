//! Telemetry metric name constants.
//!
//! Centralised metric names for mimir layers. Consumers install their own
//! `metrics` recorder (e.g. prometheus, statsd); without a recorder
//! installed, all metric calls are no-ops. The in-process aggregates kept by
//! [`MetricsRegistry`](crate::MetricsRegistry) are independent of this.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `mimir_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `operation`: name of the wrapped operation (e.g. "kline")
//! - `status`: outcome: "ok" or "error"
//! - `kind`: error kind as reported by [`CallError::kind`](crate::CallError::kind)

/// Total calls observed by monitor layers.
///
/// Labels: `operation`, `status` ("ok" | "error").
pub const REQUESTS_TOTAL: &str = "mimir_requests_total";

/// Call duration in seconds, as seen by monitor layers.
///
/// Labels: `operation`.
pub const REQUEST_DURATION_SECONDS: &str = "mimir_request_duration_seconds";

/// Failed calls observed by monitor layers, by error kind.
///
/// Labels: `operation`, `kind`.
pub const REQUEST_ERRORS_TOTAL: &str = "mimir_request_errors_total";

/// Total retry attempts (not counting the initial attempt).
///
/// Labels: `operation`.
pub const RETRIES_TOTAL: &str = "mimir_retries_total";

/// Calls that failed after using every attempt.
///
/// Labels: `operation`.
pub const RETRIES_EXHAUSTED_TOTAL: &str = "mimir_retries_exhausted_total";

/// Lookups served from a stored value.
///
/// Labels: `operation`.
pub const CACHE_HITS_TOTAL: &str = "mimir_cache_hits_total";

/// Lookups that started a computation.
///
/// Labels: `operation`.
pub const CACHE_MISSES_TOTAL: &str = "mimir_cache_misses_total";

/// Lookups that attached to a computation already running.
///
/// Labels: `operation`.
pub const CACHE_COALESCED_TOTAL: &str = "mimir_cache_coalesced_total";

/// Calls that skipped the cache because no key could be derived.
///
/// Labels: `operation`.
pub const CACHE_KEY_BYPASS_TOTAL: &str = "mimir_cache_key_bypass_total";
