//! OpenAI-compatible remote embedding client.
//!
//! One `POST {base_url}/embeddings` per batch, one attempt per call. Retries and
//! backend switching are the fallback coordinator's job, so every failure is
//! reported as a classified [`ProviderError`].

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::RemoteConfig;
use crate::error::{ConfigError, ProviderError, ProviderErrorKind};

/// Async embeddings client for an OpenAI-compatible endpoint.
pub struct RemoteEmbeddingClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    priority: bool,
    max_batch_size: usize,
}

impl RemoteEmbeddingClient {
    pub fn new(config: &RemoteConfig) -> Result<Self, ConfigError> {
        let api_key = config.api_key.trim();
        if api_key.is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if config.max_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }

        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|e| ConfigError::HttpClient(format!("invalid API key header: {e}")))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .default_headers(headers)
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            priority: config.priority,
            max_batch_size: config.max_batch_size,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Largest batch the provider accepts in one request.
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Send one batch and return the raw vectors in input order.
    ///
    /// Count and dimension are validated by the caller against the run's
    /// configuration; this only guarantees the response decoded.
    pub async fn embed_batch(&self, inputs: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if inputs.is_empty() {
            return Ok(Vec::new());
        }
        if inputs.len() > self.max_batch_size {
            return Err(ProviderError::malformed(format!(
                "batch of {} exceeds provider max {}",
                inputs.len(),
                self.max_batch_size
            )));
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: inputs,
            encoding_format: "float",
            normalize: true,
            service_tier: self.priority.then_some("priority"),
        };

        let started = std::time::Instant::now();
        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(ProviderError::new(
                classify_status(status),
                format!("embeddings request failed ({status}): {}", truncate(&body, 200)),
            ));
        }

        let parsed: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    transport_error(&e)
                } else {
                    ProviderError::malformed(format!("failed to parse embedding response: {e}"))
                }
            })?;

        tracing::debug!(
            batch_size = inputs.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "remote embeddings batch complete"
        );

        parsed.into_ordered()
    }
}

/// Map a non-2xx status onto a provider error kind.
pub(crate) fn classify_status(status: StatusCode) -> ProviderErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderErrorKind::Auth,
        StatusCode::TOO_MANY_REQUESTS => ProviderErrorKind::RateLimited,
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => ProviderErrorKind::Timeout,
        _ => ProviderErrorKind::Unavailable,
    }
}

fn transport_error(err: &reqwest::Error) -> ProviderError {
    let kind = if err.is_timeout() {
        ProviderErrorKind::Timeout
    } else if err.is_decode() {
        ProviderErrorKind::MalformedResponse
    } else {
        ProviderErrorKind::Unavailable
    };
    ProviderError::new(kind, format!("embeddings request failed: {err}"))
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    encoding_format: &'static str,
    normalize: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    service_tier: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

impl EmbeddingResponse {
    /// Vectors in request order. When any entry carries an `index`, every
    /// entry must, and the indices must be exactly `0..len`. Without indices
    /// response order is used.
    fn into_ordered(mut self) -> Result<Vec<Vec<f32>>, ProviderError> {
        let indexed = self.data.iter().filter(|entry| entry.index.is_some()).count();
        if indexed > 0 {
            if indexed != self.data.len() {
                return Err(ProviderError::malformed(format!(
                    "only {indexed} of {} embeddings carry an index",
                    self.data.len()
                )));
            }
            self.data.sort_by_key(|entry| entry.index);
            let in_order = self
                .data
                .iter()
                .enumerate()
                .all(|(position, entry)| entry.index == Some(position));
            if !in_order {
                let indices: Vec<Option<usize>> = self.data.iter().map(|entry| entry.index).collect();
                return Err(ProviderError::malformed(format!(
                    "embedding indices are not a permutation of 0..{}: {indices:?}",
                    self.data.len()
                )));
            }
        }
        Ok(self.data.into_iter().map(|entry| entry.embedding).collect())
    }
}
