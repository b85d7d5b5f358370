//! Monitor layer: times every call that reaches it.
//!
//! The measurement covers whatever sits inside the layer. Outside a retry
//! layer one sample spans all attempts; inside it, each attempt is a sample.
//! Outside a cache layer hits are recorded too; inside it, only the calls
//! that missed.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use super::{MetricsRegistry, OperationStats, Outcome, Sample};
use crate::error::CallError;
use crate::stack::Layer;
use crate::telemetry;
use crate::traits::{LayerKind, Operation, SharedOperation};
use crate::Result;

/// Decorator that records latency and outcome of an [`Operation`].
pub struct MonitoredOperation<Req, T, E>
where
    Req: Send + Sync + 'static,
    T: Send + 'static,
    E: CallError,
{
    inner: SharedOperation<Req, T, E>,
    stats: Arc<OperationStats>,
}

impl<Req, T, E> MonitoredOperation<Req, T, E>
where
    Req: Send + Sync + 'static,
    T: Send + 'static,
    E: CallError,
{
    /// Record into `registry` under `operation_name`.
    pub fn new(
        inner: SharedOperation<Req, T, E>,
        registry: &MetricsRegistry,
        operation_name: &str,
    ) -> Self {
        Self {
            inner,
            stats: registry.stats(operation_name),
        }
    }

    /// Name the samples are recorded under.
    pub fn operation_name(&self) -> &str {
        self.stats.name()
    }

    fn record(&self, started_at: Instant, error: Option<&E>) {
        let ended_at = Instant::now();
        let sample = Sample {
            started_at,
            ended_at,
            outcome: if error.is_some() {
                Outcome::Failure
            } else {
                Outcome::Success
            },
            error_kind: error.map(CallError::kind),
        };
        self.stats.record(&sample);

        let operation = self.stats.name().to_owned();
        let status = if error.is_some() { "error" } else { "ok" };
        metrics::counter!(telemetry::REQUESTS_TOTAL,
            "operation" => operation.clone(),
            "status" => status,
        )
        .increment(1);
        metrics::histogram!(telemetry::REQUEST_DURATION_SECONDS,
            "operation" => operation.clone(),
        )
        .record(sample.latency().as_secs_f64());
        if let Some(kind) = sample.error_kind {
            metrics::counter!(telemetry::REQUEST_ERRORS_TOTAL,
                "operation" => operation,
                "kind" => kind,
            )
            .increment(1);
        }
    }
}

#[async_trait]
impl<Req, T, E> Operation<Req> for MonitoredOperation<Req, T, E>
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
        let started_at = Instant::now();
        let result = self.inner.call(request).await;
        self.record(started_at, result.as_ref().err());
        result
    }

    fn layers(&self) -> Vec<LayerKind> {
        let mut layers = vec![LayerKind::Monitor];
        layers.extend(self.inner.layers());
        layers
    }
}

/// Declarative monitor layer for [`StackBuilder`](crate::StackBuilder).
pub struct MonitorLayer {
    operation_name: Option<String>,
    registry: MetricsRegistry,
}

impl MonitorLayer {
    /// Record into `registry` under the wrapped operation's name.
    pub fn new(registry: &MetricsRegistry) -> Self {
        Self {
            operation_name: None,
            registry: registry.clone(),
        }
    }

    /// Record into the process-wide [`MetricsRegistry::global`].
    pub fn global() -> Self {
        Self::new(MetricsRegistry::global())
    }

    /// Record under an explicit name instead of the operation's own.
    pub fn named(mut self, operation_name: impl Into<String>) -> Self {
        self.operation_name = Some(operation_name.into());
        self
    }
}

impl<Req, T, E> Layer<Req, T, E> for MonitorLayer
where
    Req: Send + Sync + 'static,
    T: Send + 'static,
    E: CallError,
{
    fn apply(self: Box<Self>, inner: SharedOperation<Req, T, E>) -> Result<SharedOperation<Req, T, E>> {
        let name = match &self.operation_name {
            Some(name) => name.clone(),
            None => inner.name().to_owned(),
        };
        Ok(Arc::new(MonitoredOperation::new(inner, &self.registry, &name)))
    }

    fn kind(&self) -> LayerKind {
        LayerKind::Monitor
    }

    fn config_json(&self) -> serde_json::Value {
        serde_json::json!({ "operation_name": self.operation_name })
    }
}
