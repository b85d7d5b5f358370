//! Mimir error types

use std::time::Duration;

/// Errors raised by the layers themselves.
///
/// Errors produced by a wrapped operation never pass through this type: every
/// layer surfaces them to the caller exactly as the operation returned them.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MimirError {
    /// Invalid wrap-time configuration (zero attempts, zero TTL, bad layer order, ...).
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    KeyDerivation(#[from] KeyDerivationError),

    /// The task driving a shared cache computation was torn down before it
    /// produced a value (runtime shutdown).
    #[error("shared computation for '{operation}' was aborted")]
    ComputationAborted { operation: String },
}

impl MimirError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        MimirError::Configuration(msg.into())
    }
}

/// A request could not be turned into a deterministic cache key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("cannot derive cache key for '{operation}': {reason}")]
pub struct KeyDerivationError {
    pub operation: String,
    pub reason: String,
}

impl KeyDerivationError {
    pub fn new(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

/// Contract for errors returned by wrapped operations.
///
/// `Clone` is required because a failed shared computation hands the very
/// same error to every caller waiting on it.
pub trait CallError: std::error::Error + Clone + Send + Sync + 'static {
    /// Short, low-cardinality label used for metrics (e.g. "timeout", "auth").
    fn kind(&self) -> &'static str;

    /// Whether retrying could plausibly succeed.
    ///
    /// Feeds the default retry classifier. Defaults to `true`.
    fn is_transient(&self) -> bool {
        true
    }

    /// Server-provided delay hint that overrides the computed backoff.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl CallError for MimirError {
    fn kind(&self) -> &'static str {
        match self {
            MimirError::Configuration(_) => "configuration",
            MimirError::KeyDerivation(_) => "key_derivation",
            MimirError::ComputationAborted { .. } => "aborted",
        }
    }

    fn is_transient(&self) -> bool {
        matches!(self, MimirError::ComputationAborted { .. })
    }
}

/// Result type alias for Mimir operations
pub type Result<T> = std::result::Result<T, MimirError>;
