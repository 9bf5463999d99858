//! Run-level types: configuration handed to the engine and what it returns.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::FoodMapperConfig;
use crate::embedding::{EmbeddingSource, DEFAULT_DIMENSIONS};
use crate::error::{ConfigError, ProviderErrorKind};

// ── Fallback mode ─────────────────────────────────────────────────────────────

/// Which embedding backends a run is allowed to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Remote first, switch to local for the rest of the run on failure.
    #[default]
    Auto,
    /// Remote only; a remote failure fails the run.
    #[serde(alias = "api", alias = "remote", alias = "off")]
    RemoteOnly,
    /// Local model only; no request is ever sent.
    #[serde(alias = "local")]
    LocalOnly,
}

impl FallbackMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::RemoteOnly => "remote_only",
            Self::LocalOnly => "local_only",
        }
    }

    pub fn uses_remote(&self) -> bool {
        !matches!(self, Self::LocalOnly)
    }

    pub fn uses_local(&self) -> bool {
        !matches!(self, Self::RemoteOnly)
    }
}

impl std::fmt::Display for FallbackMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FallbackMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "remote_only" | "remote" | "api" | "off" => Ok(Self::RemoteOnly),
            "local_only" | "local" => Ok(Self::LocalOnly),
            _ => Err(ConfigError::UnknownFallbackMode(s.to_string())),
        }
    }
}

// ── Retry policy ──────────────────────────────────────────────────────────────

/// Exponential backoff for transient remote failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `retry` (0-based): `min(max_delay, base_delay * 2^retry)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }
}

// ── Run configuration ─────────────────────────────────────────────────────────

/// Parameters for a single matching run. Immutable for the run's duration.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub threshold: f64,
    pub batch_size: usize,
    pub concurrency: usize,
    pub fallback_mode: FallbackMode,
    pub retry: RetryPolicy,
    pub dimensions: usize,
    pub normalize: bool,
    pub dedup_targets: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            batch_size: 200,
            concurrency: 100,
            fallback_mode: FallbackMode::Auto,
            retry: RetryPolicy::default(),
            dimensions: DEFAULT_DIMENSIONS,
            normalize: false,
            dedup_targets: true,
        }
    }
}

impl RunConfig {
    pub fn from_config(config: &FoodMapperConfig) -> Self {
        let m = &config.matching;
        Self {
            threshold: m.threshold,
            batch_size: m.batch_size,
            concurrency: m.concurrency,
            fallback_mode: m.fallback_mode,
            retry: RetryPolicy {
                max_retries: m.max_retries,
                base_delay: Duration::from_millis(m.retry_base_delay_ms),
                max_delay: Duration::from_millis(m.retry_max_delay_ms),
            },
            dimensions: config.embedding.dimensions,
            normalize: m.normalize,
            dedup_targets: m.dedup_targets,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.threshold.is_finite() || !(-1.0..=1.0).contains(&self.threshold) {
            return Err(ConfigError::ThresholdOutOfRange(self.threshold));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.dimensions == 0 {
            return Err(ConfigError::ZeroDimension);
        }
        Ok(())
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

/// Best match for one input row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub input_row_id: usize,
    pub best_target_row_id: Option<usize>,
    pub similarity_score: f64,
    pub is_match: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchSummary {
    pub total: usize,
    pub matched: usize,
    pub unmatched: usize,
    /// Mean score over matched rows; `None` when nothing matched.
    pub mean_matched_score: Option<f64>,
}

impl MatchSummary {
    pub fn from_results(results: &[MatchResult]) -> Self {
        let matched: Vec<f64> = results
            .iter()
            .filter(|r| r.is_match)
            .map(|r| r.similarity_score)
            .collect();
        let mean_matched_score =
            (!matched.is_empty()).then(|| matched.iter().sum::<f64>() / matched.len() as f64);
        Self {
            total: results.len(),
            matched: matched.len(),
            unmatched: results.len() - matched.len(),
            mean_matched_score,
        }
    }
}

/// Counters describing how a run's embeddings were produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStats {
    pub remote_batches: usize,
    pub local_batches: usize,
    /// Remotely embedded batches re-embedded locally after a backend switch.
    pub replayed_batches: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<ProviderErrorKind>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    /// One entry per input row, in input order.
    pub results: Vec<MatchResult>,
    /// The backend that produced every vector used in the run.
    pub backend: EmbeddingSource,
    pub summary: MatchSummary,
    pub stats: RunStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_mode_parses_aliases() {
        assert_eq!("auto".parse::<FallbackMode>().unwrap(), FallbackMode::Auto);
        assert_eq!("API".parse::<FallbackMode>().unwrap(), FallbackMode::RemoteOnly);
        assert_eq!("off".parse::<FallbackMode>().unwrap(), FallbackMode::RemoteOnly);
        assert_eq!("local".parse::<FallbackMode>().unwrap(), FallbackMode::LocalOnly);
        assert_eq!(
            "local_only".parse::<FallbackMode>().unwrap(),
            FallbackMode::LocalOnly
        );
        assert!("gpu".parse::<FallbackMode>().is_err());
    }

    #[test]
    fn retry_delays_double_then_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(4), Duration::from_secs(4));
        assert_eq!(policy.delay_for(40), Duration::from_secs(4));
    }

    #[test]
    fn validate_rejects_bad_values() {
        let ok = RunConfig::default();
        assert!(ok.validate().is_ok());

        let bad = RunConfig {
            threshold: 1.5,
            ..RunConfig::default()
        };
        assert_eq!(bad.validate(), Err(ConfigError::ThresholdOutOfRange(1.5)));

        let nan = RunConfig {
            threshold: f64::NAN,
            ..RunConfig::default()
        };
        assert!(matches!(
            nan.validate(),
            Err(ConfigError::ThresholdOutOfRange(_))
        ));

        let zero_batch = RunConfig {
            batch_size: 0,
            ..RunConfig::default()
        };
        assert_eq!(zero_batch.validate(), Err(ConfigError::ZeroBatchSize));

        let zero_conc = RunConfig {
            concurrency: 0,
            ..RunConfig::default()
        };
        assert_eq!(zero_conc.validate(), Err(ConfigError::ZeroConcurrency));

        let zero_dim = RunConfig {
            dimensions: 0,
            ..RunConfig::default()
        };
        assert_eq!(zero_dim.validate(), Err(ConfigError::ZeroDimension));
    }

    #[test]
    fn run_config_from_file_config() {
        let mut config = FoodMapperConfig::default();
        config.matching.retry_base_delay_ms = 10;
        config.matching.fallback_mode = FallbackMode::LocalOnly;
        config.embedding.dimensions = 384;
        let run = RunConfig::from_config(&config);
        assert_eq!(run.retry.base_delay, Duration::from_millis(10));
        assert_eq!(run.fallback_mode, FallbackMode::LocalOnly);
        assert_eq!(run.dimensions, 384);
        assert_eq!(run.threshold, 0.85);
    }

    #[test]
    fn summary_counts_and_mean() {
        let result = |id, score: f64, is_match| MatchResult {
            input_row_id: id,
            best_target_row_id: Some(0),
            similarity_score: score,
            is_match,
            target_text: None,
        };
        let results = vec![
            result(0, 0.9, true),
            result(1, 0.2, false),
            result(2, 0.95, true),
        ];
        let summary = MatchSummary::from_results(&results);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.matched, 2);
        assert_eq!(summary.unmatched, 1);
        assert!((summary.mean_matched_score.unwrap() - 0.925).abs() < 1e-12);

        let empty = MatchSummary::from_results(&[]);
        assert_eq!(empty.total, 0);
        assert_eq!(empty.mean_matched_score, None);
    }
}
