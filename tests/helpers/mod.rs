#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};

use food_mapper::config::RemoteConfig;
use food_mapper::embedding::{EmbeddingProvider, LocalModel, RemoteEmbeddingClient};
use food_mapper::error::ProviderError;
use food_mapper::matching::{FallbackMode, RetryPolicy, RunConfig};

/// Dimension of every test vector.
pub const DIMS: usize = 8;

/// What the stub embedding service answers to one request.
pub enum StubReply {
    /// 200 with one vector per input, `index` set.
    Vectors(Vec<Vec<f32>>),
    /// Empty body with this status code.
    Status(u16),
    /// 200 with this exact body.
    Raw(String),
    /// Wait, then answer 503.
    Sleep(Duration),
    /// Wait, then answer like `Vectors`.
    Delayed(Duration, Vec<Vec<f32>>),
}

type Responder = dyn Fn(&[String], usize) -> StubReply + Send + Sync;

#[derive(Clone)]
struct StubState {
    responder: Arc<Responder>,
    requests: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Value>>>,
    auth_headers: Arc<Mutex<Vec<String>>>,
}

/// In-process OpenAI-compatible `/v1/embeddings` endpoint.
pub struct StubServer {
    pub base_url: String,
    requests: Arc<AtomicUsize>,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<Value>>>,
    auth_headers: Arc<Mutex<Vec<String>>>,
}

impl StubServer {
    /// Start a server whose reply to request number `n` (0-based) for
    /// `inputs` is `responder(inputs, n)`.
    pub async fn start(
        responder: impl Fn(&[String], usize) -> StubReply + Send + Sync + 'static,
    ) -> Self {
        let state = StubState {
            responder: Arc::new(responder),
            requests: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: Arc::new(AtomicUsize::new(0)),
            bodies: Arc::new(Mutex::new(Vec::new())),
            auth_headers: Arc::new(Mutex::new(Vec::new())),
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Self {
            base_url: format!("http://{addr}/v1"),
            requests: Arc::clone(&state.requests),
            in_flight: Arc::clone(&state.in_flight),
            peak_in_flight: Arc::clone(&state.peak_in_flight),
            bodies: Arc::clone(&state.bodies),
            auth_headers: Arc::clone(&state.auth_headers),
        };

        let app = Router::new()
            .route("/v1/embeddings", post(embeddings))
            .with_state(state);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        server
    }

    /// Server that embeds every input with [`keyword_vector`].
    pub async fn healthy() -> Self {
        Self::start(|inputs, _| StubReply::Vectors(inputs.iter().map(|t| keyword_vector(t)).collect()))
            .await
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Largest number of requests the server was handling at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Every `input` array received, in arrival order.
    pub fn received_inputs(&self) -> Vec<Vec<String>> {
        self.bodies
            .lock()
            .unwrap()
            .iter()
            .map(|body| input_strings(body))
            .collect()
    }

    pub fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().unwrap().clone()
    }

    pub fn auth_headers(&self) -> Vec<String> {
        self.auth_headers.lock().unwrap().clone()
    }

    pub fn remote_config(&self) -> RemoteConfig {
        RemoteConfig {
            base_url: self.base_url.clone(),
            api_key: "test-key".into(),
            timeout_secs: 5,
            connect_timeout_secs: 2,
            ..RemoteConfig::default()
        }
    }

    pub fn client(&self) -> Arc<RemoteEmbeddingClient> {
        Arc::new(RemoteEmbeddingClient::new(&self.remote_config()).unwrap())
    }
}

async fn embeddings(
    State(state): State<StubState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    let call = state.requests.fetch_add(1, Ordering::SeqCst);
    let inputs = input_strings(&body);
    let model = body["model"].as_str().unwrap_or_default().to_string();
    state.bodies.lock().unwrap().push(body);
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        state.auth_headers.lock().unwrap().push(auth.to_string());
    }

    let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.peak_in_flight.fetch_max(now, Ordering::SeqCst);
    let response = respond((state.responder)(&inputs, call), &model).await;
    state.in_flight.fetch_sub(1, Ordering::SeqCst);
    response
}

async fn respond(reply: StubReply, model: &str) -> Response {
    match reply {
        StubReply::Vectors(vectors) => vectors_response(&vectors, model),
        StubReply::Delayed(delay, vectors) => {
            tokio::time::sleep(delay).await;
            vectors_response(&vectors, model)
        }
        StubReply::Status(code) => StatusCode::from_u16(code)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            .into_response(),
        StubReply::Raw(body) => (StatusCode::OK, body).into_response(),
        StubReply::Sleep(delay) => {
            tokio::time::sleep(delay).await;
            StatusCode::SERVICE_UNAVAILABLE.into_response()
        }
    }
}

fn vectors_response(vectors: &[Vec<f32>], model: &str) -> Response {
    let data: Vec<Value> = vectors
        .iter()
        .enumerate()
        .map(|(index, embedding)| json!({ "object": "embedding", "embedding": embedding, "index": index }))
        .collect();
    Json(json!({ "object": "list", "data": data, "model": model })).into_response()
}

fn input_strings(body: &Value) -> Vec<String> {
    body["input"]
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

const KEYWORDS: [&str; 7] = ["chicken", "beef", "milk", "apple", "rice", "bread", "egg"];

/// Deterministic vector: one dimension per food keyword the text mentions,
/// plus a small constant so no vector is zero.
pub fn keyword_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let mut v = vec![0.0f32; DIMS];
    for (i, keyword) in KEYWORDS.iter().enumerate() {
        if lower.contains(keyword) {
            v[i] = 1.0;
        }
    }
    v[DIMS - 1] = 0.1;
    v
}

/// Local stand-in that embeds with [`keyword_vector`] and counts calls.
#[derive(Default)]
pub struct KeywordEmbedder {
    pub calls: AtomicUsize,
}

impl EmbeddingProvider for KeywordEmbedder {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| keyword_vector(t)).collect())
    }

    fn dimensions(&self) -> usize {
        DIMS
    }
}

/// A lazily "loaded" local model backed by [`KeywordEmbedder`].
pub fn keyword_local() -> Arc<LocalModel> {
    Arc::new(LocalModel::new(|| {
        Ok(Arc::new(KeywordEmbedder::default()) as Arc<dyn EmbeddingProvider>)
    }))
}

/// A local model whose load always fails with `out_of_memory`.
pub fn broken_local() -> Arc<LocalModel> {
    Arc::new(LocalModel::new(|| {
        Err(ProviderError::new(
            food_mapper::error::ProviderErrorKind::OutOfMemory,
            "CUDA out of memory",
        ))
    }))
}

/// Run configuration with tiny retry delays.
pub fn run_config(mode: FallbackMode) -> RunConfig {
    RunConfig {
        fallback_mode: mode,
        dimensions: DIMS,
        batch_size: 2,
        concurrency: 2,
        retry: RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        ..RunConfig::default()
    }
}

pub fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}
