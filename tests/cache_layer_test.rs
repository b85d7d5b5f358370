mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use common::{Flaky, TestError, count, quote};
use mimir::{
    CacheConfig, CacheKey, CacheStore, CachingOperation, KeyErrorPolicy, KeyFn, LayerKind,
    MimirError, Operation, SharedOperation, operation_fn,
};

fn cached(
    inner: SharedOperation<common::Quote, u32, TestError>,
    config: &CacheConfig,
) -> CachingOperation<common::Quote, u32, TestError> {
    let store = CacheStore::new(config).unwrap();
    CachingOperation::new(inner, store, config).unwrap()
}

#[tokio::test]
async fn repeated_request_served_from_cache() {
    let flaky = Flaky::new("quote");
    let calls = flaky.calls();
    let op = cached(flaky.shared(), &CacheConfig::default());

    assert_eq!(op.call(&quote("600000")).await, Ok(1));
    assert_eq!(op.call(&quote("600000")).await, Ok(1));
    assert_eq!(count(&calls), 1);
}

#[tokio::test]
async fn different_requests_are_cached_separately() {
    let flaky = Flaky::new("quote");
    let calls = flaky.calls();
    let op = cached(flaky.shared(), &CacheConfig::default());

    assert_eq!(op.call(&quote("600000")).await, Ok(1));
    assert_eq!(op.call(&quote("600519")).await, Ok(2));

    let mut with_count = quote("600000");
    with_count.count = Some(5);
    assert_eq!(op.call(&with_count).await, Ok(3));
    assert_eq!(count(&calls), 3);
    assert_eq!(op.store().len(), 3);
}

#[tokio::test]
async fn failures_are_not_cached() {
    let flaky = Flaky::new("quote").failing_first(1);
    let calls = flaky.calls();
    let op = cached(flaky.shared(), &CacheConfig::default());

    assert_eq!(op.call(&quote("600000")).await, Err(TestError::Transient(1)));
    assert_eq!(op.call(&quote("600000")).await, Ok(2));
    assert_eq!(op.call(&quote("600000")).await, Ok(2));
    assert_eq!(count(&calls), 2);
}

#[tokio::test]
async fn shared_store_serves_both_layers() {
    let config = CacheConfig::default();
    let store = CacheStore::new(&config).unwrap();

    let first = Flaky::new("quote");
    let first_calls = first.calls();
    let second = Flaky::new("quote");
    let second_calls = second.calls();

    let a = CachingOperation::new(first.shared(), store.clone(), &config).unwrap();
    let b = CachingOperation::new(second.shared(), store.clone(), &config).unwrap();

    assert_eq!(a.call(&quote("600000")).await, Ok(1));
    assert_eq!(b.call(&quote("600000")).await, Ok(1));
    assert_eq!(count(&first_calls), 1);
    assert_eq!(count(&second_calls), 0);
}

#[tokio::test]
async fn operation_name_namespaces_keys_in_shared_store() {
    let config = CacheConfig::default();
    let store = CacheStore::new(&config).unwrap();

    let a = CachingOperation::new(Flaky::new("quote").shared(), store.clone(), &config).unwrap();
    let b = CachingOperation::new(Flaky::new("depth").shared(), store.clone(), &config).unwrap();

    a.call(&quote("600000")).await.unwrap();
    b.call(&quote("600000")).await.unwrap();
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn custom_key_fn_controls_identity() {
    let flaky = Flaky::new("quote");
    let calls = flaky.calls();
    let config = CacheConfig::default();
    let key_fn: KeyFn<common::Quote> =
        Arc::new(|q: &common::Quote| Ok(CacheKey::from_canonical("quote", &q.symbol)));
    let op = CachingOperation::with_key_fn(
        flaky.shared(),
        CacheStore::new(&config).unwrap(),
        &config,
        key_fn,
    )
    .unwrap();

    let mut other_count = quote("600000");
    other_count.count = Some(99);
    op.call(&quote("600000")).await.unwrap();
    op.call(&other_count).await.unwrap();
    assert_eq!(count(&calls), 1);
}

#[derive(Clone, Serialize)]
struct Bounded {
    limit: f64,
}

#[tokio::test]
async fn non_finite_request_values_do_not_share_entries() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let raw: SharedOperation<Bounded, String, TestError> =
        Arc::new(operation_fn("bounded", move |req: Bounded| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok::<_, TestError>(req.limit.to_string()) }
        }));
    let op = cached_with(raw);

    assert_eq!(op.call(&Bounded { limit: f64::INFINITY }).await, Ok("inf".to_string()));
    assert_eq!(
        op.call(&Bounded { limit: f64::NEG_INFINITY }).await,
        Ok("-inf".to_string())
    );
    assert_eq!(op.call(&Bounded { limit: f64::NAN }).await, Ok("NaN".to_string()));
    assert_eq!(op.call(&Bounded { limit: f64::INFINITY }).await, Ok("inf".to_string()));
    assert_eq!(count(&calls), 3);
    assert_eq!(op.store().len(), 3);
}

fn cached_with(
    inner: SharedOperation<Bounded, String, TestError>,
) -> CachingOperation<Bounded, String, TestError> {
    let config = CacheConfig::default();
    CachingOperation::new(inner, CacheStore::new(&config).unwrap(), &config).unwrap()
}

#[test]
fn invalid_config_rejected_at_wrap_time() {
    let config = CacheConfig::new().ttl(Duration::ZERO);
    let store = CacheStore::new(&CacheConfig::default()).unwrap();
    let result = CachingOperation::new(Flaky::new("quote").shared(), store, &config);
    assert!(matches!(result, Err(MimirError::Configuration(_))));
}

#[test]
fn introspection_reports_cache_layer() {
    let op = cached(Flaky::new("quote").shared(), &CacheConfig::default());
    assert_eq!(op.name(), "quote");
    assert_eq!(op.layers(), vec![LayerKind::Cache]);
    assert!(op.is_cacheable());
    assert!(!op.is_retryable());
    assert!(!op.is_monitored());
}

// ============================================================================
// Key derivation failures
// ============================================================================

/// Request whose map keys are not strings and cannot be keyed.
#[derive(Clone, Serialize)]
struct Unkeyable {
    ranges: HashMap<(u32, u32), u32>,
}

struct Counting {
    calls: Arc<std::sync::atomic::AtomicU32>,
}

#[async_trait]
impl Operation<Unkeyable> for Counting {
    type Response = u32;
    type Error = TestError;

    fn name(&self) -> &str {
        "ranges"
    }

    async fn call(&self, _request: &Unkeyable) -> Result<u32, TestError> {
        Ok(self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1)
    }
}

fn unkeyable() -> Unkeyable {
    Unkeyable {
        ranges: HashMap::from([((1, 2), 3)]),
    }
}

#[tokio::test]
async fn key_error_bypasses_cache_by_default() {
    let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let config = CacheConfig::default();
    let store = CacheStore::new(&config).unwrap();
    let op = CachingOperation::new(
        Arc::new(Counting {
            calls: Arc::clone(&calls),
        }),
        store.clone(),
        &config,
    )
    .unwrap();

    assert_eq!(op.call(&unkeyable()).await, Ok(1));
    assert_eq!(op.call(&unkeyable()).await, Ok(2));
    assert_eq!(count(&calls), 2);
    assert!(store.is_empty());
}

#[tokio::test]
async fn key_error_propagates_when_configured() {
    let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
    let config = CacheConfig::new().on_key_error(KeyErrorPolicy::Propagate);
    let op = CachingOperation::new(
        Arc::new(Counting {
            calls: Arc::clone(&calls),
        }),
        CacheStore::new(&config).unwrap(),
        &config,
    )
    .unwrap();

    let err = op.call(&unkeyable()).await.unwrap_err();
    match err {
        TestError::Mimir(MimirError::KeyDerivation(e)) => assert_eq!(e.operation, "ranges"),
        other => panic!("expected key derivation error, got {other:?}"),
    }
    assert_eq!(count(&calls), 0);
}
