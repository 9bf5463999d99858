//! Error taxonomy for the matching engine.
//!
//! [`ConfigError`] rejects a run before it starts, [`ProviderError`] is what a
//! single embedding call returns, and [`ExhaustedFallbackError`] is what is left
//! once the fallback coordinator has nothing else to try. [`MatchError`] is the
//! run-level error surfaced to callers.

use serde::Serialize;
use thiserror::Error;

use crate::matching::FallbackMode;

/// Failure category of a single embedding call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    Timeout,
    RateLimited,
    Auth,
    /// Server-side 5xx or connection failure.
    Unavailable,
    MalformedResponse,
    ModelLoadFailed,
    OutOfMemory,
}

impl ProviderErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Auth => "auth",
            Self::Unavailable => "unavailable",
            Self::MalformedResponse => "malformed_response",
            Self::ModelLoadFailed => "model_load_failed",
            Self::OutOfMemory => "out_of_memory",
        }
    }

    /// Whether repeating the same remote request can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::RateLimited | Self::Unavailable)
    }
}

impl std::fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed embedding call, from either backend.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::MalformedResponse, message)
    }

    pub fn model_load(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::ModelLoadFailed, message)
    }
}

/// Invalid run or process configuration. Always fatal, raised before any work.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("threshold must be within [-1.0, 1.0], got {0}")]
    ThresholdOutOfRange(f64),

    #[error("batch size must be greater than zero")]
    ZeroBatchSize,

    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("embedding dimension must be greater than zero")]
    ZeroDimension,

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("unknown fallback mode `{0}` (expected auto, remote_only or local_only)")]
    UnknownFallbackMode(String),

    #[error("fallback mode `{mode}` requires the {backend} backend, but none is configured")]
    MissingBackend {
        mode: FallbackMode,
        backend: &'static str,
    },

    #[error("no API key configured for the remote embedding service; set DEEPINFRA_API_KEY or use MODEL_FALLBACK_MODE=local")]
    MissingApiKey,

    #[error("invalid value `{value}` for {key}")]
    InvalidEnv { key: &'static str, value: String },

    #[error("failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Every permitted backend failed for some batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExhaustedFallbackError {
    #[error("remote embedding failed and fallback is disabled: {0}")]
    RemoteOnly(ProviderError),

    #[error("remote service unavailable ({remote}), local fallback also failed: {local}")]
    BothFailed {
        remote: ProviderError,
        local: ProviderError,
    },

    #[error("local embedding failed: {0}")]
    LocalOnly(ProviderError),
}

impl ExhaustedFallbackError {
    /// The error of the last backend that was tried.
    pub fn last(&self) -> &ProviderError {
        match self {
            Self::RemoteOnly(err) | Self::LocalOnly(err) => err,
            Self::BothFailed { local, .. } => local,
        }
    }
}

/// Run-level failure. No partial result set accompanies any variant.
#[derive(Debug, Error)]
pub enum MatchError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Exhausted(#[from] ExhaustedFallbackError),

    #[error("matching run cancelled")]
    Cancelled,

    #[error("embedding task failed: {0}")]
    Task(String),
}
