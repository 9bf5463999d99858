//! Local ONNX Runtime embedding backend.
//!
//! [`OnnxEmbeddingProvider`] runs `thenlper/gte-large` via `ort`: tokenization,
//! inference, mean pooling, and L2 normalization. [`LocalModel`] is the
//! process-wide slot that loads it lazily on first use and releases it on
//! [`LocalModel::dispose`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;

use super::{l2_normalize, EmbeddingProvider};
use crate::config::EmbeddingConfig;
use crate::error::{ProviderError, ProviderErrorKind};

/// Compute device the ONNX session was registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeDevice {
    Cuda,
    Cpu,
}

impl ComputeDevice {
    /// Accelerated device when the crate is built with the `cuda` feature.
    ///
    /// ONNX Runtime falls back to CPU on its own if no CUDA device can be opened.
    pub fn preferred() -> Self {
        if cfg!(feature = "cuda") {
            Self::Cuda
        } else {
            Self::Cpu
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Cpu => "cpu",
        }
    }
}

/// Model files expected inside the cache directory.
pub fn model_paths(cache_dir: &Path) -> (PathBuf, PathBuf) {
    (cache_dir.join("model.onnx"), cache_dir.join("tokenizer.json"))
}

/// Local ONNX-based embedding provider.
pub struct OnnxEmbeddingProvider {
    session: Mutex<Session>,
    tokenizer: Tokenizer,
    dimensions: usize,
    device: ComputeDevice,
}

// Safety: Tokenizer is Send+Sync. Session is behind a Mutex.
// The Mutex guarantees exclusive access during run().
unsafe impl Send for OnnxEmbeddingProvider {}
unsafe impl Sync for OnnxEmbeddingProvider {}

impl OnnxEmbeddingProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self, ProviderError> {
        let cache_dir = crate::config::expand_tilde(&config.cache_dir);
        let (model_path, tokenizer_path) = model_paths(&cache_dir);

        if !model_path.exists() {
            return Err(ProviderError::model_load(format!(
                "ONNX model not found at {}. Run `food-mapper model download` first.",
                model_path.display()
            )));
        }
        if !tokenizer_path.exists() {
            return Err(ProviderError::model_load(format!(
                "tokenizer not found at {}. Run `food-mapper model download` first.",
                tokenizer_path.display()
            )));
        }

        let device = ComputeDevice::preferred();
        let session = build_session(config.intra_threads, &model_path)
            .map_err(|e| classify_ort_error("failed to load ONNX model", &format!("{e:#}")))?;

        tracing::info!(
            model = %config.model,
            path = %model_path.display(),
            device = device.as_str(),
            "ONNX model loaded"
        );

        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| ProviderError::model_load(format!("failed to load tokenizer: {e}")))?;

        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: config.max_seq_len,
                ..Default::default()
            }))
            .map_err(|e| ProviderError::model_load(format!("failed to set truncation: {e}")))?;

        tokenizer.with_padding(Some(tokenizers::PaddingParams {
            strategy: tokenizers::PaddingStrategy::BatchLongest,
            ..Default::default()
        }));

        tracing::info!(tokenizer = %tokenizer_path.display(), "tokenizer loaded");

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            dimensions: config.dimensions,
            device,
        })
    }

    pub fn device(&self) -> ComputeDevice {
        self.device
    }
}

fn build_session(intra_threads: usize, model_path: &Path) -> anyhow::Result<Session> {
    let builder = Session::builder()?
        .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads)?;

    #[cfg(feature = "cuda")]
    let builder = builder.with_execution_providers([
        ort::execution_providers::CUDAExecutionProvider::default().build(),
    ])?;

    Ok(builder.commit_from_file(model_path)?)
}

/// Map an ONNX Runtime failure onto the local error kinds.
fn classify_ort_error(context: &str, message: &str) -> ProviderError {
    let lower = message.to_lowercase();
    let kind = if lower.contains("out of memory")
        || lower.contains("failed to allocate")
        || lower.contains("bad_alloc")
    {
        ProviderErrorKind::OutOfMemory
    } else {
        ProviderErrorKind::ModelLoadFailed
    };
    ProviderError::new(kind, format!("{context}: {message}"))
}

fn inference_error(e: impl std::fmt::Display) -> ProviderError {
    classify_ort_error("ONNX inference failed", &e.to_string())
}

impl EmbeddingProvider for OnnxEmbeddingProvider {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        // Step 1: Tokenize
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| ProviderError::model_load(format!("tokenization failed: {e}")))?;

        let batch_size = encodings.len();
        let seq_len = encodings[0].get_ids().len();

        // Step 2: Build flat input tensors as i64
        let mut input_ids_flat = Vec::with_capacity(batch_size * seq_len);
        let mut attention_mask_flat = Vec::with_capacity(batch_size * seq_len);

        for encoding in &encodings {
            input_ids_flat.extend(encoding.get_ids().iter().map(|&id| id as i64));
            attention_mask_flat.extend(encoding.get_attention_mask().iter().map(|&m| m as i64));
        }

        let shape = vec![batch_size as i64, seq_len as i64];
        let input_ids_tensor =
            Tensor::from_array((shape.clone(), input_ids_flat.into_boxed_slice())).map_err(inference_error)?;
        let attention_mask_tensor =
            Tensor::from_array((shape.clone(), attention_mask_flat.clone().into_boxed_slice()))
                .map_err(inference_error)?;
        // token_type_ids: all zeros (single sentence)
        let token_type_ids = vec![0i64; batch_size * seq_len];
        let token_type_ids_tensor =
            Tensor::from_array((shape, token_type_ids.into_boxed_slice())).map_err(inference_error)?;

        // Step 3: Run ONNX inference
        let mut session = self
            .session
            .lock()
            .map_err(|e| ProviderError::model_load(format!("session lock poisoned: {e}")))?;

        let outputs = session
            .run(ort::inputs! {
                "input_ids" => input_ids_tensor,
                "attention_mask" => attention_mask_tensor,
                "token_type_ids" => token_type_ids_tensor,
            })
            .map_err(inference_error)?;

        // Step 4: Extract token embeddings: [batch, seq_len, hidden]
        let token_emb_value = outputs
            .get("last_hidden_state")
            .or_else(|| outputs.get("token_embeddings"))
            .unwrap_or_else(|| &outputs[0]);

        let (shape, data) = token_emb_value
            .try_extract_tensor::<f32>()
            .map_err(inference_error)?;

        let dims: &[i64] = &shape;
        if dims.len() != 3 || dims[2] != self.dimensions as i64 {
            return Err(ProviderError::model_load(format!(
                "unexpected hidden state shape {dims:?}, expected [batch, seq, {}]",
                self.dimensions
            )));
        }
        let hidden_dim = dims[2] as usize;
        let actual_seq_len = dims[1] as usize;

        // Step 5: Mean pooling with attention mask
        let mut results = Vec::with_capacity(batch_size);
        for b in 0..batch_size {
            let mut sum = vec![0.0f32; hidden_dim];
            let mut count = 0.0f32;

            for s in 0..actual_seq_len {
                let mask = attention_mask_flat[b * seq_len + s] as f32;
                if mask > 0.0 {
                    let offset = (b * actual_seq_len + s) * hidden_dim;
                    for (d, acc) in sum.iter_mut().enumerate() {
                        *acc += data[offset + d] * mask;
                    }
                    count += mask;
                }
            }

            if count > 0.0 {
                for acc in &mut sum {
                    *acc /= count;
                }
            }

            // Step 6: L2 normalize
            l2_normalize(&mut sum);
            results.push(sum);
        }

        Ok(results)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

type Loader = Box<dyn Fn() -> Result<Arc<dyn EmbeddingProvider>, ProviderError> + Send + Sync>;

/// Process-wide, lazily initialized local model.
///
/// Lifecycle: created once by the process (empty), loaded by the first local
/// embedding call, shared read-only by every later call, and released by
/// [`dispose`](Self::dispose) at shutdown. Concurrent first callers block on the
/// same load; a failed load leaves the slot empty so a later call can retry.
pub struct LocalModel {
    loader: Loader,
    slot: Mutex<Option<Arc<dyn EmbeddingProvider>>>,
    expected_dimensions: Option<usize>,
    loads: AtomicUsize,
}

impl LocalModel {
    pub fn new(
        loader: impl Fn() -> Result<Arc<dyn EmbeddingProvider>, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            loader: Box::new(loader),
            slot: Mutex::new(None),
            expected_dimensions: None,
            loads: AtomicUsize::new(0),
        }
    }

    /// Slot that loads the ONNX model described by `config` on first use.
    pub fn from_config(config: &EmbeddingConfig) -> Self {
        let config = config.clone();
        let dimensions = config.dimensions;
        let mut model = Self::new(move || {
            let provider = OnnxEmbeddingProvider::new(&config)?;
            Ok(Arc::new(provider) as Arc<dyn EmbeddingProvider>)
        });
        model.expected_dimensions = Some(dimensions);
        model
    }

    /// Slot that is already filled with `provider`.
    pub fn preloaded(provider: Arc<dyn EmbeddingProvider>) -> Self {
        let model = Self::new(|| Err(ProviderError::model_load("local model was disposed")));
        *model.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(provider);
        model
    }

    /// Return the loaded provider, loading it if this is the first use.
    pub fn get_or_load(&self) -> Result<Arc<dyn EmbeddingProvider>, ProviderError> {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(provider) = slot.as_ref() {
            return Ok(Arc::clone(provider));
        }

        tracing::info!("loading local embedding model");
        let provider = (self.loader)()?;
        if let Some(expected) = self.expected_dimensions {
            if provider.dimensions() != expected {
                return Err(ProviderError::model_load(format!(
                    "local model produces {} dimensions, configured {expected}",
                    provider.dimensions()
                )));
            }
        }
        self.loads.fetch_add(1, Ordering::Relaxed);
        *slot = Some(Arc::clone(&provider));
        Ok(provider)
    }

    pub fn is_loaded(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Number of successful loads performed by this slot.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    /// Release the model. In-flight calls keep their own handle until they finish.
    pub fn dispose(&self) {
        if self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
        {
            tracing::info!("local embedding model disposed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ConstEmbedder(usize);

    impl EmbeddingProvider for ConstEmbedder {
        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts.iter().map(|_| vec![1.0; self.0]).collect())
        }
        fn dimensions(&self) -> usize {
            self.0
        }
    }

    #[test]
    fn lazy_slot_loads_once() {
        let model = LocalModel::new(|| Ok(Arc::new(ConstEmbedder(4)) as Arc<dyn EmbeddingProvider>));
        assert!(!model.is_loaded());
        model.get_or_load().unwrap();
        model.get_or_load().unwrap();
        assert!(model.is_loaded());
        assert_eq!(model.load_count(), 1);
    }

    #[test]
    fn concurrent_first_use_loads_once() {
        let model = Arc::new(LocalModel::new(|| {
            std::thread::sleep(std::time::Duration::from_millis(20));
            Ok(Arc::new(ConstEmbedder(4)) as Arc<dyn EmbeddingProvider>)
        }));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let model = Arc::clone(&model);
                std::thread::spawn(move || model.get_or_load().map(|p| p.dimensions()))
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap().unwrap(), 4);
        }
        assert_eq!(model.load_count(), 1);
    }

    #[test]
    fn failed_load_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let model = LocalModel::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ProviderError::model_load("first load fails"))
            } else {
                Ok(Arc::new(ConstEmbedder(4)) as Arc<dyn EmbeddingProvider>)
            }
        });
        assert_eq!(
            model.get_or_load().err().map(|e| e.kind),
            Some(ProviderErrorKind::ModelLoadFailed)
        );
        assert!(model.get_or_load().is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn dispose_empties_slot() {
        let model = LocalModel::preloaded(Arc::new(ConstEmbedder(4)));
        assert!(model.is_loaded());
        model.dispose();
        assert!(!model.is_loaded());
        assert!(model.get_or_load().is_err());
    }

    #[test]
    fn missing_model_files_fail_with_model_load() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = EmbeddingConfig {
            cache_dir: tmp.path().to_string_lossy().into_owned(),
            ..EmbeddingConfig::default()
        };
        let err = OnnxEmbeddingProvider::new(&config).err().unwrap();
        assert_eq!(err.kind, ProviderErrorKind::ModelLoadFailed);
        assert!(err.message.contains("model download"));
    }

    #[test]
    fn ort_errors_are_classified() {
        let oom = classify_ort_error("ONNX inference failed", "Failed to allocate memory for tensor");
        assert_eq!(oom.kind, ProviderErrorKind::OutOfMemory);
        let other = classify_ort_error("failed to load ONNX model", "invalid protobuf");
        assert_eq!(other.kind, ProviderErrorKind::ModelLoadFailed);
    }

    fn test_config() -> EmbeddingConfig {
        EmbeddingConfig::default()
    }

    fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
    }

    #[test]
    #[ignore] // Requires model files, run with: cargo test -- --ignored
    fn test_embed_produces_configured_dims_and_unit_norm() {
        let config = test_config();
        let provider = OnnxEmbeddingProvider::new(&config).unwrap();
        let embedding = provider.embed("Chicken breast, raw").unwrap();
        assert_eq!(embedding.len(), config.dimensions);
        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4, "L2 norm should be ~1.0, got {norm}");
    }

    #[test]
    #[ignore]
    fn test_similar_foods_score_higher() {
        let provider = OnnxEmbeddingProvider::new(&test_config()).unwrap();
        let batch = provider
            .embed_batch(&["chicken breast, raw", "chicken breast, cooked", "beef steak, raw"])
            .unwrap();
        let close = cosine_similarity(&batch[0], &batch[1]);
        let far = cosine_similarity(&batch[0], &batch[2]);
        assert!(close > far, "expected {close} > {far}");
    }
}
