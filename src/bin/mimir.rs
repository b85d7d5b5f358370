//! mimir: exercise a layer stack against a simulated market-data feed.
//!
//! Wraps a fake kline fetch that injects transient failures, fires a burst
//! of requests over a handful of symbols, and prints the monitor summary and
//! cache counters as JSON.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::StreamExt;
use rand::Rng;
use serde::Serialize;
use tracing::{info, warn};

use mimir::{
    CacheStore, CallError, MetricsRegistry, MimirError, Operation, SharedOperation,
    StackBuilder, StackConfig, operation_fn,
};

/// Stack used when no config file is given or found.
const DEMO_CONFIG: &str = r#"
order = ["monitor", "cache", "retry"]

[cache]
ttl_ms = 60000

[retry]
max_attempts = 3
backoff_base_ms = 20
max_delay_ms = 200

[monitor]
"#;

/// Drive a cache/retry/monitor stack with simulated traffic.
#[derive(Parser)]
#[command(name = "mimir")]
#[command(version)]
#[command(about = "Exercise a mimir layer stack against a simulated feed")]
struct Args {
    /// Path to a stack configuration file.
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
    /// Total number of calls to issue.
    #[arg(long, default_value_t = 200)]
    calls: usize,
    /// Number of distinct symbols (cache keys) to spread calls over.
    #[arg(long, default_value_t = 8)]
    symbols: usize,
    /// Maximum calls in flight at once.
    #[arg(long, default_value_t = 16)]
    concurrency: usize,
    /// Probability that a single upstream fetch fails transiently.
    #[arg(long, default_value_t = 0.2)]
    fail_rate: f64,
    /// Simulated upstream latency in milliseconds.
    #[arg(long, default_value_t = 25)]
    latency_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
struct KlineRequest {
    market: String,
    symbol: String,
    start_date: String,
    end_date: String,
    count: Option<u32>,
}

#[derive(Debug, Clone)]
struct Candle {
    close: f64,
}

#[derive(Debug, Clone, thiserror::Error)]
enum FeedError {
    #[error("upstream timed out fetching {0}")]
    Timeout(String),
    #[error("unknown symbol {0}")]
    UnknownSymbol(String),
    #[error(transparent)]
    Mimir(#[from] MimirError),
}

impl CallError for FeedError {
    fn kind(&self) -> &'static str {
        match self {
            FeedError::Timeout(_) => "timeout",
            FeedError::UnknownSymbol(_) => "unknown_symbol",
            FeedError::Mimir(e) => e.kind(),
        }
    }

    fn is_transient(&self) -> bool {
        match self {
            FeedError::Timeout(_) => true,
            FeedError::UnknownSymbol(_) => false,
            FeedError::Mimir(e) => e.is_transient(),
        }
    }
}

#[derive(Serialize)]
struct Report {
    stack: Vec<mimir::LayerDescriptor>,
    succeeded: usize,
    failed: usize,
    cache: Option<mimir::CacheStats>,
    monitor: Vec<mimir::Summary>,
}

fn kline_feed(fail_rate: f64, latency: Duration) -> SharedOperation<KlineRequest, Vec<Candle>, FeedError> {
    Arc::new(operation_fn("kline", move |req: KlineRequest| async move {
        tokio::time::sleep(latency).await;
        if req.symbol.is_empty() {
            return Err(FeedError::UnknownSymbol(req.symbol));
        }
        let timed_out = rand::rng().random_bool(fail_rate);
        if timed_out {
            return Err(FeedError::Timeout(req.symbol));
        }
        let count = req.count.unwrap_or(10);
        let candles: Vec<Candle> = (0..count)
            .map(|i| Candle {
                close: 10.0 + f64::from(i) * 0.01,
            })
            .collect();
        Ok::<_, FeedError>(candles)
    }))
}

fn load_config(explicit: Option<&std::path::Path>) -> mimir::Result<StackConfig> {
    if explicit.is_some() {
        return StackConfig::load(explicit);
    }
    match StackConfig::load(None) {
        Ok(config) => Ok(config),
        Err(e) => {
            info!(reason = %e, "using built-in demo stack");
            StackConfig::from_toml_str(DEMO_CONFIG)
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialise tracing (default: warn for CLI; override with RUST_LOG).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let fail_rate = args.fail_rate.clamp(0.0, 1.0);
    let raw = kline_feed(fail_rate, Duration::from_millis(args.latency_ms));

    let store = match config.cache_config()? {
        Some(cache) => Some(CacheStore::new(&cache)?),
        None => None,
    };
    let registry = MetricsRegistry::new();
    let builder = StackBuilder::from_config(raw, &config, store.clone(), &registry)?;
    let stack = builder.to_stack();
    let kline = builder.build()?;
    info!(layers = ?kline.layers(), "stack built");

    let symbols = args.symbols.max(1);
    let requests = (0..args.calls).map(|i| KlineRequest {
        market: "SH".to_string(),
        symbol: format!("{:06}", 600_000 + i % symbols),
        start_date: "20240101".to_string(),
        end_date: "20240131".to_string(),
        count: Some(20),
    });

    let outcomes: Vec<bool> = futures_util::stream::iter(requests)
        .map(|req| {
            let kline = Arc::clone(&kline);
            async move {
                match kline.call(&req).await {
                    Ok(candles) => {
                        let last = candles.last().map(|c| c.close).unwrap_or_default();
                        tracing::debug!(symbol = %req.symbol, last, "fetched");
                        true
                    }
                    Err(e) => {
                        warn!(symbol = %req.symbol, error = %e, "fetch failed");
                        false
                    }
                }
            }
        })
        .buffer_unordered(args.concurrency.max(1))
        .collect()
        .await;

    let succeeded = outcomes.iter().filter(|ok| **ok).count();
    let report = Report {
        stack,
        succeeded,
        failed: outcomes.len() - succeeded,
        cache: store.as_ref().map(CacheStore::stats),
        monitor: registry.snapshot_all(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    Ok(())
}
