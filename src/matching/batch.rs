//! Bounded-concurrency batch embedding with ordered reassembly.

use std::ops::Range;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;

use crate::embedding::{EmbeddingSource, EmbeddingVector};
use crate::error::{ExhaustedFallbackError, MatchError};
use crate::matching::fallback::FallbackCoordinator;
use crate::text::TextItem;

/// Which pass of a run a batch belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Targets,
    Inputs,
    /// Re-embedding remote batches locally after a backend switch.
    Replay,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Targets => "targets",
            Self::Inputs => "inputs",
            Self::Replay => "replay",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Receives batch completion counts. Called once with `completed == 0` when a
/// phase starts, then after every finished batch.
pub trait ProgressSink: Send + Sync {
    fn on_batch(&self, phase: Phase, completed: usize, total: usize);
}

/// Split `0..len` into contiguous ranges of at most `batch_size` items.
pub fn partition(len: usize, batch_size: usize) -> Vec<Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..len)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(len))
        .collect()
}

pub struct BatchOrchestrator {
    coordinator: Arc<FallbackCoordinator>,
    batch_size: usize,
    permits: Arc<Semaphore>,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl BatchOrchestrator {
    pub fn new(
        coordinator: Arc<FallbackCoordinator>,
        batch_size: usize,
        concurrency: usize,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Self {
        Self {
            coordinator,
            batch_size: batch_size.max(1),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            progress,
        }
    }

    /// Embed every item. `output[i]` belongs to `items[i]`; any fatal batch
    /// error aborts the remaining batches and fails the whole call.
    pub async fn embed_all(
        &self,
        phase: Phase,
        items: &[TextItem],
    ) -> Result<Vec<EmbeddingVector>, MatchError> {
        let ranges = partition(items.len(), self.batch_size);
        let batches = self.run_batches(phase, items, &ranges, false).await?;
        Ok(batches.into_iter().flatten().collect())
    }

    /// Re-embed locally every batch whose vectors did not come from the
    /// coordinator's final backend. Returns the number of batches replayed.
    pub async fn reconcile(
        &self,
        items: &[TextItem],
        vectors: &mut [EmbeddingVector],
    ) -> Result<usize, MatchError> {
        if self.coordinator.active_source() != EmbeddingSource::Local {
            return Ok(0);
        }

        let stale: Vec<Range<usize>> = partition(items.len(), self.batch_size)
            .into_iter()
            .filter(|range| {
                vectors[range.clone()]
                    .iter()
                    .any(|v| v.source != EmbeddingSource::Local)
            })
            .collect();
        if stale.is_empty() {
            return Ok(0);
        }

        debug!(batches = stale.len(), "re-embedding remote batches locally");
        let replayed = self.run_batches(Phase::Replay, items, &stale, true).await?;
        for (range, batch) in stale.iter().zip(replayed) {
            for (slot, vector) in vectors[range.clone()].iter_mut().zip(batch) {
                *slot = vector;
            }
        }
        Ok(stale.len())
    }

    async fn run_batches(
        &self,
        phase: Phase,
        items: &[TextItem],
        ranges: &[Range<usize>],
        local_only: bool,
    ) -> Result<Vec<Vec<EmbeddingVector>>, MatchError> {
        let total = ranges.len();
        self.report(phase, 0, total);

        let mut tasks: JoinSet<(usize, Result<Vec<EmbeddingVector>, ExhaustedFallbackError>)> =
            JoinSet::new();
        for (index, range) in ranges.iter().enumerate() {
            let batch = items[range.clone()].to_vec();
            let coordinator = Arc::clone(&self.coordinator);
            let permits = Arc::clone(&self.permits);
            tasks.spawn(async move {
                // the semaphore is never closed
                let _permit = permits.acquire_owned().await.ok();
                let result = if local_only {
                    coordinator.embed_with_local(&batch).await
                } else {
                    coordinator.embed(&batch).await
                };
                (index, result)
            });
        }

        let mut slots: Vec<Option<Vec<EmbeddingVector>>> = vec![None; total];
        let mut completed = 0;
        while let Some(joined) = tasks.join_next().await {
            let (index, result) = joined.map_err(|e| MatchError::Task(e.to_string()))?;
            // dropping `tasks` on return aborts the batches still running
            let vectors = result?;
            debug!(phase = %phase, batch = index, rows = vectors.len(), "batch embedded");
            slots[index] = Some(vectors);
            completed += 1;
            self.report(phase, completed, total);
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.ok_or_else(|| MatchError::Task(format!("batch {index} produced no result")))
            })
            .collect()
    }

    fn report(&self, phase: Phase, completed: usize, total: usize) {
        if let Some(progress) = &self.progress {
            progress.on_batch(phase, completed, total);
        }
    }
}
