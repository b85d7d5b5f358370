//! Per-operation latency and outcome aggregates.
//!
//! A [`MetricsRegistry`] owns one [`OperationStats`] per operation name.
//! Monitor layers resolve their stats handle once, when they are built, so
//! recording a sample touches only that operation's atomics: concurrent
//! calls never lose an update and unrelated operations never contend.
//! Samples are folded into the aggregates and not retained.
//!
//! [`MetricsRegistry::global`] is the process-wide registry, created on
//! first use and cleared only by [`MetricsRegistry::reset`]. Tests and
//! embedders that need isolation create their own with
//! [`MetricsRegistry::new`] and hand it to the layers explicitly.

pub mod layer;

pub use layer::{MonitorLayer, MonitoredOperation};

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::info;

/// One histogram bucket per power of two nanoseconds.
const BUCKETS: usize = 65;

/// Call outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failure,
}

/// A single observed call.
#[derive(Debug, Clone)]
pub struct Sample {
    pub started_at: Instant,
    pub ended_at: Instant,
    pub outcome: Outcome,
    /// [`CallError::kind`](crate::CallError::kind) of the failure, if any.
    pub error_kind: Option<&'static str>,
}

impl Sample {
    pub fn latency(&self) -> Duration {
        self.ended_at.saturating_duration_since(self.started_at)
    }
}

/// Running aggregates for one operation.
pub struct OperationStats {
    name: String,
    successes: AtomicU64,
    failures: AtomicU64,
    total_nanos: AtomicU64,
    min_nanos: AtomicU64,
    max_nanos: AtomicU64,
    buckets: [AtomicU64; BUCKETS],
    errors_by_kind: Mutex<HashMap<&'static str, u64>>,
}

impl OperationStats {
    fn new(name: String) -> Self {
        Self {
            name,
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            total_nanos: AtomicU64::new(0),
            min_nanos: AtomicU64::new(u64::MAX),
            max_nanos: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            errors_by_kind: Mutex::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fold a sample into the aggregates.
    pub fn record(&self, sample: &Sample) {
        let nanos = u64::try_from(sample.latency().as_nanos()).unwrap_or(u64::MAX);
        self.total_nanos.fetch_add(nanos, Ordering::Relaxed);
        self.min_nanos.fetch_min(nanos, Ordering::Relaxed);
        self.max_nanos.fetch_max(nanos, Ordering::Relaxed);
        self.buckets[bucket_index(nanos)].fetch_add(1, Ordering::Relaxed);

        match sample.outcome {
            Outcome::Success => {
                self.successes.fetch_add(1, Ordering::Relaxed);
            }
            Outcome::Failure => {
                if let Some(kind) = sample.error_kind {
                    *self
                        .errors_by_kind
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .entry(kind)
                        .or_insert(0) += 1;
                }
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Immutable copy of the current aggregates.
    pub fn summary(&self) -> Summary {
        let successes = self.successes.load(Ordering::Relaxed);
        let failures = self.failures.load(Ordering::Relaxed);
        let calls = successes + failures;
        let buckets: Vec<u64> = self
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .collect();
        let max = self.max_nanos.load(Ordering::Relaxed);
        let min = match self.min_nanos.load(Ordering::Relaxed) {
            u64::MAX => 0,
            n => n,
        };
        let mean = if calls == 0 {
            0
        } else {
            self.total_nanos.load(Ordering::Relaxed) / calls
        };
        let errors_by_kind = self
            .errors_by_kind
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| ((*k).to_owned(), *v))
            .collect();

        Summary {
            operation: self.name.clone(),
            calls,
            successes,
            failures,
            min: Duration::from_nanos(min),
            max: Duration::from_nanos(max),
            mean: Duration::from_nanos(mean),
            p50: Duration::from_nanos(percentile(&buckets, 0.50, max)),
            p95: Duration::from_nanos(percentile(&buckets, 0.95, max)),
            p99: Duration::from_nanos(percentile(&buckets, 0.99, max)),
            errors_by_kind,
        }
    }

    fn reset(&self) {
        self.successes.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.total_nanos.store(0, Ordering::Relaxed);
        self.min_nanos.store(u64::MAX, Ordering::Relaxed);
        self.max_nanos.store(0, Ordering::Relaxed);
        for b in &self.buckets {
            b.store(0, Ordering::Relaxed);
        }
        self.errors_by_kind
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Bucket `i` holds latencies in `[2^(i-1), 2^i)` ns; bucket 0 holds zero.
fn bucket_index(nanos: u64) -> usize {
    (u64::BITS - nanos.leading_zeros()) as usize
}

/// Upper bound of the bucket containing quantile `q`, clamped to `max`.
fn percentile(buckets: &[u64], q: f64, max: u64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }
    let rank = ((total as f64) * q).ceil().max(1.0) as u64;
    let mut seen = 0;
    for (i, count) in buckets.iter().enumerate() {
        seen += count;
        if seen >= rank {
            let upper = if i >= 64 { u64::MAX } else { (1u64 << i).saturating_sub(1) };
            return upper.min(max);
        }
    }
    max
}

/// Snapshot of an operation's aggregates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub operation: String,
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub min: Duration,
    pub max: Duration,
    pub mean: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub errors_by_kind: BTreeMap<String, u64>,
}

impl Summary {
    /// Fraction of calls that failed; zero when nothing was recorded.
    pub fn error_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.failures as f64 / self.calls as f64
        }
    }
}

/// Owner of per-operation aggregates. Cheap to clone.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    operations: Arc<RwLock<HashMap<String, Arc<OperationStats>>>>,
}

impl MetricsRegistry {
    /// Create an empty, isolated registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static MetricsRegistry {
        static GLOBAL: OnceLock<MetricsRegistry> = OnceLock::new();
        GLOBAL.get_or_init(MetricsRegistry::new)
    }

    /// Stats handle for `operation`, created on first request.
    pub fn stats(&self, operation: &str) -> Arc<OperationStats> {
        if let Some(stats) = self
            .operations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation)
        {
            return Arc::clone(stats);
        }
        let mut ops = self
            .operations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            ops.entry(operation.to_owned())
                .or_insert_with(|| Arc::new(OperationStats::new(operation.to_owned()))),
        )
    }

    /// Snapshot of one operation, or `None` if it was never monitored.
    pub fn snapshot(&self, operation: &str) -> Option<Summary> {
        let stats = self
            .operations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(operation)
            .cloned()?;
        Some(stats.summary())
    }

    /// Snapshots of every known operation, sorted by name.
    pub fn snapshot_all(&self) -> Vec<Summary> {
        let stats: Vec<Arc<OperationStats>> = self
            .operations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        let mut summaries: Vec<Summary> = stats.iter().map(|s| s.summary()).collect();
        summaries.sort_by(|a, b| a.operation.cmp(&b.operation));
        summaries
    }

    /// Zero every aggregate. Handles held by existing layers stay valid.
    pub fn reset(&self) {
        let ops = self
            .operations
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for stats in ops.values() {
            stats.reset();
        }
        info!(operations = ops.len(), "metrics registry reset");
    }
}
