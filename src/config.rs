//! Declarative stack configuration.
//!
//! A [`StackConfig`] names which layers wrap an operation, their settings,
//! and the order they nest in. It deserializes from TOML:
//!
//! ```toml
//! order = ["monitor", "cache", "retry"]   # outermost first
//!
//! [cache]
//! ttl_ms = 60000
//! max_entries = 5000
//! on_key_error = "bypass"
//!
//! [retry]
//! max_attempts = 3
//! backoff_base_ms = 200
//!
//! [monitor]
//! operation_name = "kline"
//! ```
//!
//! With the `config` feature, [`StackConfig::load`] resolves the file from:
//! 1. An explicit path (if provided)
//! 2. `~/.mimir/config.toml` (user)
//! 3. `/etc/mimir/config.toml` (system)

use std::collections::HashSet;
use std::time::Duration;

use serde::Deserialize;

use crate::cache::{CacheConfig, KeyErrorPolicy};
use crate::retry::RetryConfig;
use crate::traits::LayerKind;
use crate::{MimirError, Result};

/// Order used when a config names its layers but not their order.
const DEFAULT_ORDER: [LayerKind; 3] = [LayerKind::Monitor, LayerKind::Cache, LayerKind::Retry];

/// Layers to wrap an operation with, and their order.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackConfig {
    #[serde(default)]
    pub cache: Option<CacheSection>,
    #[serde(default)]
    pub retry: Option<RetrySection>,
    #[serde(default)]
    pub monitor: Option<MonitorSection>,
    /// Layer order, outermost first. Defaults to monitor, cache, retry
    /// restricted to the sections present.
    #[serde(default)]
    pub order: Option<Vec<LayerKind>>,
}

/// `[cache]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheSection {
    /// Time-to-live in milliseconds (default: 300000).
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
    /// Maximum stored values (default: 10000).
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
    #[serde(default)]
    pub on_key_error: KeyErrorPolicy,
    #[serde(default)]
    pub sweep_interval_ms: Option<u64>,
}

fn default_ttl_ms() -> u64 {
    300_000
}

fn default_max_entries() -> u64 {
    10_000
}

impl From<&CacheSection> for CacheConfig {
    fn from(section: &CacheSection) -> Self {
        let mut config = CacheConfig::new()
            .ttl(Duration::from_millis(section.ttl_ms))
            .max_entries(section.max_entries)
            .on_key_error(section.on_key_error);
        if let Some(ms) = section.sweep_interval_ms {
            config = config.sweep_interval(Duration::from_millis(ms));
        }
        config
    }
}

/// `[retry]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySection {
    /// Attempts including the first (default: 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds (default: 500).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Cap on any single delay in milliseconds (default: 30000).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> bool {
    true
}

impl From<&RetrySection> for RetryConfig {
    fn from(section: &RetrySection) -> Self {
        RetryConfig::new()
            .max_attempts(section.max_attempts)
            .initial_delay(Duration::from_millis(section.backoff_base_ms))
            .max_delay(Duration::from_millis(section.max_delay_ms))
            .jitter(section.jitter)
    }
}

/// `[monitor]` section.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MonitorSection {
    /// Name to record samples under instead of the operation's own.
    #[serde(default)]
    pub operation_name: Option<String>,
}

impl StackConfig {
    /// Parse a TOML document.
    #[cfg(feature = "config")]
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| MimirError::Configuration(format!("Failed to parse stack config: {e}")))?;
        config.resolved_order()?;
        Ok(config)
    }

    /// Load configuration from the standard locations.
    ///
    /// Resolution order:
    /// 1. Explicit path (if provided)
    /// 2. `~/.mimir/config.toml`
    /// 3. `/etc/mimir/config.toml`
    #[cfg(feature = "config")]
    pub fn load(explicit_path: Option<&std::path::Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        let content = std::fs::read_to_string(&path).map_err(|e| {
            MimirError::Configuration(format!("Failed to read config file {path:?}: {e}"))
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), "loaded stack config");
        Ok(config)
    }

    #[cfg(feature = "config")]
    fn resolve_config_path(explicit: Option<&std::path::Path>) -> Result<std::path::PathBuf> {
        use std::path::PathBuf;

        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(MimirError::Configuration(format!(
                "Config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".mimir").join("config.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/mimir/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(MimirError::Configuration(
            "No config file found. Create ~/.mimir/config.toml or /etc/mimir/config.toml"
                .to_string(),
        ))
    }

    fn has(&self, kind: LayerKind) -> bool {
        match kind {
            LayerKind::Cache => self.cache.is_some(),
            LayerKind::Retry => self.retry.is_some(),
            LayerKind::Monitor => self.monitor.is_some(),
        }
    }

    /// Layer order, outermost first.
    ///
    /// # Errors
    ///
    /// Returns [`MimirError::Configuration`] if `order` repeats a layer,
    /// names a layer without a section, or leaves out a configured one.
    pub fn resolved_order(&self) -> Result<Vec<LayerKind>> {
        let Some(order) = &self.order else {
            return Ok(DEFAULT_ORDER.into_iter().filter(|k| self.has(*k)).collect());
        };

        let mut seen = HashSet::new();
        for kind in order {
            if !seen.insert(*kind) {
                return Err(MimirError::config(format!("layer '{kind}' appears twice in order")));
            }
            if !self.has(*kind) {
                return Err(MimirError::config(format!(
                    "layer '{kind}' is ordered but has no [{kind}] section"
                )));
            }
        }
        if let Some(left_out) = DEFAULT_ORDER
            .into_iter()
            .find(|k| self.has(*k) && !seen.contains(k))
        {
            return Err(MimirError::config(format!(
                "[{left_out}] is configured but missing from order"
            )));
        }
        Ok(order.clone())
    }

    /// Validated cache settings, if a `[cache]` section is present.
    pub fn cache_config(&self) -> Result<Option<CacheConfig>> {
        self.cache
            .as_ref()
            .map(|section| {
                let config = CacheConfig::from(section);
                config.validate().map(|()| config)
            })
            .transpose()
    }

    /// Validated retry settings, if a `[retry]` section is present.
    pub fn retry_config(&self) -> Result<Option<RetryConfig>> {
        self.retry
            .as_ref()
            .map(|section| {
                let config = RetryConfig::from(section);
                config.validate().map(|()| config)
            })
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_all() -> StackConfig {
        StackConfig {
            cache: Some(CacheSection {
                ttl_ms: 1_000,
                max_entries: 10,
                on_key_error: KeyErrorPolicy::Bypass,
                sweep_interval_ms: None,
            }),
            retry: Some(RetrySection {
                max_attempts: 2,
                backoff_base_ms: 1,
                max_delay_ms: 10,
                jitter: false,
            }),
            monitor: Some(MonitorSection::default()),
            order: None,
        }
    }

    #[test]
    fn default_order_is_monitor_cache_retry() {
        let order = with_all().resolved_order().unwrap();
        assert_eq!(order, vec![LayerKind::Monitor, LayerKind::Cache, LayerKind::Retry]);
    }

    #[test]
    fn default_order_skips_absent_sections() {
        let mut config = with_all();
        config.cache = None;
        let order = config.resolved_order().unwrap();
        assert_eq!(order, vec![LayerKind::Monitor, LayerKind::Retry]);
    }

    #[test]
    fn empty_config_has_no_layers() {
        assert!(StackConfig::default().resolved_order().unwrap().is_empty());
    }

    #[test]
    fn explicit_order_is_kept() {
        let mut config = with_all();
        config.order = Some(vec![LayerKind::Retry, LayerKind::Cache, LayerKind::Monitor]);
        let order = config.resolved_order().unwrap();
        assert_eq!(order, vec![LayerKind::Retry, LayerKind::Cache, LayerKind::Monitor]);
    }

    #[test]
    fn duplicate_layer_rejected() {
        let mut config = with_all();
        config.order = Some(vec![
            LayerKind::Retry,
            LayerKind::Retry,
            LayerKind::Cache,
            LayerKind::Monitor,
        ]);
        assert!(matches!(
            config.resolved_order(),
            Err(MimirError::Configuration(_))
        ));
    }

    #[test]
    fn ordered_layer_without_section_rejected() {
        let mut config = with_all();
        config.monitor = None;
        config.order = Some(vec![LayerKind::Monitor, LayerKind::Cache, LayerKind::Retry]);
        assert!(config.resolved_order().is_err());
    }

    #[test]
    fn configured_layer_missing_from_order_rejected() {
        let mut config = with_all();
        config.order = Some(vec![LayerKind::Cache, LayerKind::Retry]);
        let err = config.resolved_order().unwrap_err();
        assert!(err.to_string().contains("monitor"));
    }

    #[test]
    fn sections_convert_to_runtime_configs() {
        let config = with_all();
        let cache = config.cache_config().unwrap().unwrap();
        assert_eq!(cache.ttl, Duration::from_secs(1));
        assert_eq!(cache.max_entries, 10);

        let retry = config.retry_config().unwrap().unwrap();
        assert_eq!(retry.max_attempts, 2);
        assert_eq!(retry.initial_delay, Duration::from_millis(1));
        assert!(!retry.jitter);
    }

    #[test]
    fn invalid_section_values_rejected() {
        let mut config = with_all();
        if let Some(retry) = config.retry.as_mut() {
            retry.max_attempts = 0;
        }
        assert!(config.retry_config().is_err());

        if let Some(cache) = config.cache.as_mut() {
            cache.ttl_ms = 0;
        }
        assert!(config.cache_config().is_err());
    }
}
