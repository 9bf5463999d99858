//! Remote-first embedding with a one-way switch to the local model.
//!
//! A [`FallbackCoordinator`] lives for exactly one run, so every run starts
//! with a closed circuit. The active backend and the switch reason sit behind
//! one mutex; the first batch whose remote call exhausts its retries performs
//! the switch and every other batch observes it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::embedding::{
    EmbeddingBackend, EmbeddingSource, EmbeddingVector, LocalModel, RemoteEmbeddingClient,
};
use crate::error::{ConfigError, ExhaustedFallbackError, ProviderError};
use crate::matching::types::{FallbackMode, RetryPolicy, RunStats};
use crate::text::TextItem;

/// Backend selection state for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Remote,
    /// Remote is active and at least one batch is waiting to retry.
    Degrading,
    Local,
}

struct CoordinatorState {
    active: EmbeddingBackend,
    retrying: usize,
    switch_reason: Option<ProviderError>,
}

pub struct FallbackCoordinator {
    mode: FallbackMode,
    retry: RetryPolicy,
    dimensions: usize,
    local: Option<EmbeddingBackend>,
    state: Mutex<CoordinatorState>,
    /// The ONNX session runs one inference at a time.
    local_gate: Semaphore,
    remote_batches: AtomicUsize,
    local_batches: AtomicUsize,
}

impl FallbackCoordinator {
    /// Build a coordinator for one run. Fails if `mode` needs a backend that
    /// was not supplied.
    pub fn new(
        mode: FallbackMode,
        remote: Option<Arc<RemoteEmbeddingClient>>,
        local: Option<Arc<LocalModel>>,
        retry: RetryPolicy,
        dimensions: usize,
    ) -> Result<Self, ConfigError> {
        if mode.uses_remote() && remote.is_none() {
            return Err(ConfigError::MissingBackend {
                mode,
                backend: "remote",
            });
        }
        if mode.uses_local() && local.is_none() {
            return Err(ConfigError::MissingBackend {
                mode,
                backend: "local",
            });
        }

        let local = local
            .filter(|_| mode.uses_local())
            .map(EmbeddingBackend::Local);
        let active = match (mode, remote) {
            (FallbackMode::LocalOnly, _) | (_, None) => local.clone(),
            (_, Some(client)) => Some(EmbeddingBackend::Remote(client)),
        }
        .ok_or(ConfigError::MissingBackend {
            mode,
            backend: "local",
        })?;

        Ok(Self {
            mode,
            retry,
            dimensions,
            local,
            state: Mutex::new(CoordinatorState {
                active,
                retrying: 0,
                switch_reason: None,
            }),
            local_gate: Semaphore::new(1),
            remote_batches: AtomicUsize::new(0),
            local_batches: AtomicUsize::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mode(&self) -> FallbackMode {
        self.mode
    }

    pub fn state(&self) -> BackendState {
        let state = self.lock();
        match state.active.source() {
            EmbeddingSource::Local => BackendState::Local,
            EmbeddingSource::Remote if state.retrying > 0 => BackendState::Degrading,
            EmbeddingSource::Remote => BackendState::Remote,
        }
    }

    /// The backend new batches go to. `Degrading` reads as `Remote`.
    pub fn active_source(&self) -> EmbeddingSource {
        self.lock().active.source()
    }

    pub fn switch_reason(&self) -> Option<ProviderError> {
        self.lock().switch_reason.clone()
    }

    pub fn stats(&self) -> RunStats {
        RunStats {
            remote_batches: self.remote_batches.load(Ordering::Relaxed),
            local_batches: self.local_batches.load(Ordering::Relaxed),
            replayed_batches: 0,
            fallback_reason: self.lock().switch_reason.as_ref().map(|e| e.kind),
        }
    }

    /// Embed one batch on whichever backend is active, retrying and switching
    /// as the mode allows. Output order matches `batch`.
    pub async fn embed(
        &self,
        batch: &[TextItem],
    ) -> Result<Vec<EmbeddingVector>, ExhaustedFallbackError> {
        loop {
            let active = self.lock().active.clone();
            if let EmbeddingBackend::Local(_) = active {
                return self.embed_local(&active, batch).await;
            }

            match self.embed_remote(&active, batch).await {
                Ok(vectors) => {
                    if self.active_source() == EmbeddingSource::Local {
                        debug!(rows = batch.len(), "discarding remote result that finished after fallback");
                        continue;
                    }
                    self.remote_batches.fetch_add(1, Ordering::Relaxed);
                    return Ok(vectors);
                }
                Err(err) => {
                    if self.mode == FallbackMode::RemoteOnly {
                        return Err(ExhaustedFallbackError::RemoteOnly(err));
                    }
                    self.switch_to_local(err);
                }
            }
        }
    }

    /// Embed a batch on the local backend regardless of the current state.
    pub async fn embed_with_local(
        &self,
        batch: &[TextItem],
    ) -> Result<Vec<EmbeddingVector>, ExhaustedFallbackError> {
        match self.local.clone() {
            Some(local) => self.embed_local(&local, batch).await,
            None => Err(ExhaustedFallbackError::LocalOnly(ProviderError::model_load(
                "no local model configured",
            ))),
        }
    }

    async fn embed_remote(
        &self,
        backend: &EmbeddingBackend,
        batch: &[TextItem],
    ) -> Result<Vec<EmbeddingVector>, ProviderError> {
        let mut retry = 0;
        loop {
            let err = match backend.embed(batch, self.dimensions).await {
                Ok(vectors) => return Ok(vectors),
                Err(err) => err,
            };

            if !err.kind.is_transient() || retry >= self.retry.max_retries {
                return Err(err);
            }

            let delay = self.retry.delay_for(retry);
            warn!(
                kind = %err.kind,
                retry = retry + 1,
                max_retries = self.retry.max_retries,
                delay_ms = delay.as_millis() as u64,
                "remote embedding failed, retrying"
            );
            {
                let _guard = RetryGuard::enter(self);
                tokio::time::sleep(delay).await;
            }

            // another batch already gave up on remote
            if self.active_source() == EmbeddingSource::Local {
                return Err(err);
            }
            retry += 1;
        }
    }

    async fn embed_local(
        &self,
        backend: &EmbeddingBackend,
        batch: &[TextItem],
    ) -> Result<Vec<EmbeddingVector>, ExhaustedFallbackError> {
        let result = match self.local_gate.acquire().await {
            Ok(_permit) => backend.embed(batch, self.dimensions).await,
            Err(_) => Err(ProviderError::model_load("local inference gate closed")),
        };

        match result {
            Ok(vectors) => {
                self.local_batches.fetch_add(1, Ordering::Relaxed);
                Ok(vectors)
            }
            Err(local) => match self.switch_reason() {
                Some(remote) => Err(ExhaustedFallbackError::BothFailed { remote, local }),
                None => Err(ExhaustedFallbackError::LocalOnly(local)),
            },
        }
    }

    /// Switch the run to the local backend. Only the first caller has an effect.
    fn switch_to_local(&self, reason: ProviderError) {
        let Some(local) = self.local.clone() else {
            return;
        };
        let mut state = self.lock();
        if state.active.source() == EmbeddingSource::Local {
            return;
        }
        info!(
            kind = %reason.kind,
            error = %reason.message,
            "remote embedding unavailable, switching run to local model"
        );
        state.active = local;
        state.switch_reason = Some(reason);
    }
}

/// Marks a batch as waiting to retry for as long as it is alive.
struct RetryGuard<'a>(&'a FallbackCoordinator);

impl<'a> RetryGuard<'a> {
    fn enter(coordinator: &'a FallbackCoordinator) -> Self {
        coordinator.lock().retrying += 1;
        Self(coordinator)
    }
}

impl Drop for RetryGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.0.lock();
        state.retrying = state.retrying.saturating_sub(1);
    }
}
