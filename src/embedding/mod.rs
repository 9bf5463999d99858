//! Text-to-vector embedding backends.
//!
//! Two backends produce vectors for a batch of [`TextItem`]s:
//!
//! - [`remote::RemoteEmbeddingClient`]: an OpenAI-compatible `/embeddings` API
//!   (DeepInfra by default), one HTTP request per batch.
//! - [`local::LocalModel`]: a lazily loaded ONNX Runtime model
//!   (`thenlper/gte-large`, 1024 dimensions) executed on the blocking pool.
//!
//! [`EmbeddingBackend`] is the single interface the matching engine calls.
//! Whatever the backend, every vector it returns has been checked for count,
//! dimension and finiteness and is L2-normalized, so cosine similarity reduces
//! to a dot product.

pub mod local;
pub mod remote;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, ProviderErrorKind};
use crate::text::TextItem;

pub use local::LocalModel;
pub use remote::RemoteEmbeddingClient;

/// Dimension of `thenlper/gte-large` vectors.
pub const DEFAULT_DIMENSIONS: usize = 1024;

/// Model served remotely and run locally by default.
pub const DEFAULT_MODEL: &str = "thenlper/gte-large";

/// Trait for synchronous batch embedding.
///
/// Implementations run on the caller's thread. Callers in async contexts should
/// use `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts. Output order matches input order.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError>;

    /// Embed a single text.
    fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.embed_batch(&[text])?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::model_load("provider returned no vector for one input"))
    }

    /// Number of dimensions this provider produces.
    fn dimensions(&self) -> usize;
}

/// Which backend produced a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingSource {
    Remote,
    Local,
}

impl EmbeddingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Remote => "remote",
            Self::Local => "local",
        }
    }
}

impl std::fmt::Display for EmbeddingSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A unit-length embedding for one dataset row.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector {
    pub row_id: usize,
    pub values: Vec<f32>,
    pub source: EmbeddingSource,
}

impl EmbeddingVector {
    pub fn dimensions(&self) -> usize {
        self.values.len()
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.values)
    }
}

/// The backend variants behind one `embed` interface.
#[derive(Clone)]
pub enum EmbeddingBackend {
    Remote(Arc<RemoteEmbeddingClient>),
    Local(Arc<LocalModel>),
}

impl EmbeddingBackend {
    pub fn source(&self) -> EmbeddingSource {
        match self {
            Self::Remote(_) => EmbeddingSource::Remote,
            Self::Local(_) => EmbeddingSource::Local,
        }
    }

    /// Embed one batch. `output[i]` belongs to `batch[i]`.
    pub async fn embed(
        &self,
        batch: &[TextItem],
        dimensions: usize,
    ) -> Result<Vec<EmbeddingVector>, ProviderError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let raw = match self {
            Self::Remote(client) => {
                let texts: Vec<&str> = batch.iter().map(TextItem::embedding_text).collect();
                client.embed_batch(&texts).await?
            }
            Self::Local(model) => {
                let model = Arc::clone(model);
                let texts: Vec<String> = batch
                    .iter()
                    .map(|item| crate::text::collapse_whitespace(item.embedding_text()))
                    .collect();
                // CPU/GPU-bound inference → spawn_blocking
                tokio::task::spawn_blocking(move || {
                    let provider = model.get_or_load()?;
                    let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
                    provider.embed_batch(&refs)
                })
                .await
                .map_err(|e| ProviderError::model_load(format!("local inference task failed: {e}")))??
            }
        };
        finish_batch(raw, batch, dimensions, self.source())
    }
}

/// Validate a backend's raw output against the request and normalize it.
pub(crate) fn finish_batch(
    raw: Vec<Vec<f32>>,
    batch: &[TextItem],
    dimensions: usize,
    source: EmbeddingSource,
) -> Result<Vec<EmbeddingVector>, ProviderError> {
    let invalid = |message: String| match source {
        EmbeddingSource::Remote => ProviderError::new(ProviderErrorKind::MalformedResponse, message),
        EmbeddingSource::Local => ProviderError::new(ProviderErrorKind::ModelLoadFailed, message),
    };

    if raw.len() != batch.len() {
        return Err(invalid(format!(
            "received {} embeddings for {} inputs",
            raw.len(),
            batch.len()
        )));
    }

    raw.into_iter()
        .zip(batch)
        .map(|(mut values, item)| {
            if values.len() != dimensions {
                return Err(invalid(format!(
                    "embedding for row {} has {} dimensions, expected {dimensions}",
                    item.row_id,
                    values.len()
                )));
            }
            if values.iter().any(|v| !v.is_finite()) {
                return Err(invalid(format!(
                    "embedding for row {} contains non-finite values",
                    item.row_id
                )));
            }
            if !l2_normalize(&mut values) {
                return Err(invalid(format!(
                    "embedding for row {} has zero norm",
                    item.row_id
                )));
            }
            Ok(EmbeddingVector {
                row_id: item.row_id,
                values,
                source,
            })
        })
        .collect()
}

pub(crate) fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// L2-normalize in place. Returns `false` for a zero vector, which is left as is.
///
/// Vectors already within rounding distance of unit length are not rescaled.
pub fn l2_normalize(v: &mut [f32]) -> bool {
    let norm = l2_norm(v);
    if norm == 0.0 {
        return false;
    }
    if (norm - 1.0).abs() > 1e-7 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    true
}
