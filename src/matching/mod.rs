//! The matching engine: text in, one best-target record per input row out.
//!
//! A run prepares both text columns, embeds targets then inputs through a
//! [`BatchOrchestrator`] backed by a fresh [`FallbackCoordinator`], re-embeds
//! anything produced by a backend the run later abandoned, and scores the two
//! matrices on the blocking pool.

pub mod batch;
pub mod fallback;
pub mod similarity;
pub mod types;

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::config::FoodMapperConfig;
use crate::embedding::{LocalModel, RemoteEmbeddingClient};
use crate::error::{ConfigError, MatchError};
use crate::text::{dedup_targets, prepare};

pub use batch::{partition, BatchOrchestrator, Phase, ProgressSink};
pub use fallback::{BackendState, FallbackCoordinator};
pub use similarity::BestMatch;
pub use types::{
    FallbackMode, MatchResult, MatchSummary, RetryPolicy, RunConfig, RunOutcome, RunStats,
};

pub struct MatchEngine {
    remote: Option<Arc<RemoteEmbeddingClient>>,
    local: Option<Arc<LocalModel>>,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl MatchEngine {
    pub fn new(
        remote: Option<Arc<RemoteEmbeddingClient>>,
        local: Option<Arc<LocalModel>>,
    ) -> Self {
        Self {
            remote,
            local,
            progress: None,
        }
    }

    /// Build the engine from process configuration. The remote client is only
    /// constructed when the configured mode may use it.
    pub fn from_config(
        config: &FoodMapperConfig,
        local: Arc<LocalModel>,
    ) -> Result<Self, ConfigError> {
        let remote = if config.matching.fallback_mode.uses_remote() {
            Some(Arc::new(RemoteEmbeddingClient::new(&config.remote)?))
        } else {
            None
        };
        Ok(Self::new(remote, Some(local)))
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    /// Match every input text against the targets.
    ///
    /// Either returns a result for every input row or fails as a whole.
    pub async fn run(
        &self,
        input_texts: &[String],
        target_texts: &[String],
        config: &RunConfig,
    ) -> Result<RunOutcome, MatchError> {
        config.validate()?;

        // fresh coordinator per run: the circuit always starts closed
        let coordinator = Arc::new(FallbackCoordinator::new(
            config.fallback_mode,
            self.remote.clone(),
            self.local.clone(),
            config.retry,
            config.dimensions,
        )?);

        let batch_size = match &self.remote {
            Some(remote) if config.fallback_mode.uses_remote() => {
                config.batch_size.min(remote.max_batch_size())
            }
            _ => config.batch_size,
        };

        let inputs = prepare(input_texts, config.normalize);
        let mut targets = prepare(target_texts, config.normalize);
        if config.dedup_targets {
            targets = dedup_targets(targets);
        }

        info!(
            inputs = inputs.len(),
            targets = targets.len(),
            mode = %config.fallback_mode,
            batch_size,
            concurrency = config.concurrency,
            "starting matching run"
        );

        if inputs.is_empty() || targets.is_empty() {
            let results: Vec<MatchResult> = inputs
                .iter()
                .map(|item| similarity::unmatched(item.row_id))
                .collect();
            return Ok(RunOutcome {
                summary: MatchSummary::from_results(&results),
                results,
                backend: coordinator.active_source(),
                stats: coordinator.stats(),
            });
        }

        let orchestrator = BatchOrchestrator::new(
            Arc::clone(&coordinator),
            batch_size,
            config.concurrency,
            self.progress.clone(),
        );

        let mut target_vectors = orchestrator.embed_all(Phase::Targets, &targets).await?;
        let mut input_vectors = orchestrator.embed_all(Phase::Inputs, &inputs).await?;

        let mut replayed = orchestrator.reconcile(&targets, &mut target_vectors).await?;
        replayed += orchestrator.reconcile(&inputs, &mut input_vectors).await?;

        let backend = coordinator.active_source();
        let dimensions = config.dimensions;
        let threshold = config.threshold;
        let results = tokio::task::spawn_blocking(move || -> Result<Vec<MatchResult>, ConfigError> {
            let input_matrix = similarity::to_matrix(&input_vectors, dimensions)?;
            let target_matrix = similarity::to_matrix(&target_vectors, dimensions)?;
            let best = similarity::best_matches(&input_matrix, &target_matrix)?;
            Ok(similarity::classify(&inputs, &best, &targets, threshold))
        })
        .await
        .map_err(|e| MatchError::Task(e.to_string()))??;

        let summary = MatchSummary::from_results(&results);
        let mut stats = coordinator.stats();
        stats.replayed_batches = replayed;

        info!(
            backend = %backend,
            matched = summary.matched,
            unmatched = summary.unmatched,
            remote_batches = stats.remote_batches,
            local_batches = stats.local_batches,
            replayed_batches = stats.replayed_batches,
            "matching run complete"
        );

        Ok(RunOutcome {
            results,
            backend,
            summary,
            stats,
        })
    }

    /// Like [`run`](Self::run), but abandons the run when `cancel` completes.
    ///
    /// Cancellation never yields a partial result. In-flight batch tasks are
    /// aborted; a local inference already running on the blocking pool
    /// finishes in the background and its output is dropped.
    pub async fn run_until<F>(
        &self,
        input_texts: &[String],
        target_texts: &[String],
        config: &RunConfig,
        cancel: F,
    ) -> Result<RunOutcome, MatchError>
    where
        F: Future<Output = ()>,
    {
        tokio::select! {
            biased;
            _ = cancel => {
                info!("matching run cancelled");
                Err(MatchError::Cancelled)
            }
            outcome = self.run(input_texts, target_texts, config) => outcome,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{EmbeddingProvider, EmbeddingSource};
    use crate::error::ProviderError;

    /// Vectors keyed on the first letter so "apple" and "avocado" collide.
    struct FirstLetterEmbedder;

    impl EmbeddingProvider for FirstLetterEmbedder {
        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts
                .iter()
                .map(|t| {
                    let c = t.bytes().next().unwrap_or(b'a');
                    let mut v = vec![0.0; 26];
                    v[(c.to_ascii_lowercase().wrapping_sub(b'a') % 26) as usize] = 1.0;
                    v
                })
                .collect())
        }
        fn dimensions(&self) -> usize {
            26
        }
    }

    fn local_engine() -> MatchEngine {
        let local = Arc::new(LocalModel::preloaded(Arc::new(FirstLetterEmbedder)));
        MatchEngine::new(None, Some(local))
    }

    fn local_config() -> RunConfig {
        RunConfig {
            fallback_mode: FallbackMode::LocalOnly,
            dimensions: 26,
            batch_size: 2,
            concurrency: 2,
            ..RunConfig::default()
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn run_matches_each_input() {
        let engine = local_engine();
        let outcome = engine
            .run(
                &strings(&["apple", "banana", "zucchini"]),
                &strings(&["beef", "avocado"]),
                &local_config(),
            )
            .await
            .unwrap();

        assert_eq!(outcome.backend, EmbeddingSource::Local);
        assert_eq!(outcome.results.len(), 3);
        assert_eq!(outcome.results[0].best_target_row_id, Some(1));
        assert!(outcome.results[0].is_match);
        assert_eq!(outcome.results[1].best_target_row_id, Some(0));
        assert!(!outcome.results[2].is_match);
        assert_eq!(outcome.summary.matched, 2);
        assert_eq!(outcome.summary.unmatched, 1);
    }

    #[tokio::test]
    async fn empty_targets_leave_every_row_unmatched() {
        let local = Arc::new(LocalModel::new(|| {
            Err(ProviderError::model_load("must not be loaded"))
        }));
        let engine = MatchEngine::new(None, Some(Arc::clone(&local)));
        let outcome = engine
            .run(&strings(&["apple", "pear"]), &[], &local_config())
            .await
            .unwrap();
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results.iter().all(|r| r.best_target_row_id.is_none() && !r.is_match));
        assert_eq!(local.load_count(), 0);
    }

    #[tokio::test]
    async fn empty_inputs_give_empty_results() {
        let outcome = local_engine()
            .run(&[], &strings(&["apple"]), &local_config())
            .await
            .unwrap();
        assert!(outcome.results.is_empty());
        assert_eq!(outcome.summary.total, 0);
    }

    #[tokio::test]
    async fn invalid_config_fails_before_work() {
        let config = RunConfig {
            threshold: 2.0,
            ..local_config()
        };
        let err = local_engine()
            .run(&strings(&["a"]), &strings(&["b"]), &config)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MatchError::Config(ConfigError::ThresholdOutOfRange(_))
        ));
    }

    #[tokio::test]
    async fn missing_remote_for_auto_is_config_error() {
        let config = RunConfig {
            fallback_mode: FallbackMode::Auto,
            ..local_config()
        };
        let err = local_engine()
            .run(&strings(&["a"]), &strings(&["b"]), &config)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MatchError::Config(ConfigError::MissingBackend { backend: "remote", .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_run_returns_no_results() {
        let engine = local_engine();
        let err = engine
            .run_until(
                &strings(&["apple"]),
                &strings(&["avocado"]),
                &local_config(),
                std::future::ready(()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MatchError::Cancelled));
    }

    #[test]
    fn from_config_requires_api_key_unless_local() {
        let local = Arc::new(LocalModel::preloaded(Arc::new(FirstLetterEmbedder)));
        let config = FoodMapperConfig::default();
        assert_eq!(
            MatchEngine::from_config(&config, Arc::clone(&local)).err(),
            Some(ConfigError::MissingApiKey)
        );

        let mut config = FoodMapperConfig::default();
        config.matching.fallback_mode = FallbackMode::LocalOnly;
        assert!(MatchEngine::from_config(&config, local).is_ok());
    }
}
