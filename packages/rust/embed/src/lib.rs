//! Embedding backends.
//!
//! The set of backends is closed: [`EmbeddingBackend`] in the config selects
//! one and [`build_embedder`] constructs it. Callers only see the
//! [`Embedder`] trait.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, instrument};

use paperpipe_shared::{
    EmbeddingBackend, EmbeddingConfig, PaperPipeError, Result, resolve_api_key,
};

/// Default endpoint for the OpenAI backend.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com";

/// Default endpoint for the local backend (Ollama-compatible server).
pub const LOCAL_BASE_URL: &str = "http://localhost:11434";

const USER_AGENT: &str = concat!("PaperPipe/", env!("CARGO_PKG_VERSION"));

/// Maps text to a fixed-length vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Model name recorded next to every stored vector.
    fn model(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Build the embedder selected by the `[embedding]` config section.
///
/// The OpenAI backend needs its API key in the env var named by
/// `api_key_env`; a missing key is a config error reported here, before any
/// paper is processed.
pub fn build_embedder(config: &EmbeddingConfig) -> Result<Box<dyn Embedder>> {
    let client = Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(60))
        .build()
        .map_err(|e| PaperPipeError::Network(format!("failed to build HTTP client: {e}")))?;
    let model = config.model_name();

    match config.backend {
        EmbeddingBackend::OpenAi => {
            let api_key = resolve_api_key(config)?;
            let base_url = config.base_url.as_deref().unwrap_or(OPENAI_BASE_URL);
            Ok(Box::new(OpenAiEmbedder::new(client, base_url, api_key, model)))
        }
        EmbeddingBackend::Local => {
            let base_url = config.base_url.as_deref().unwrap_or(LOCAL_BASE_URL);
            Ok(Box::new(LocalEmbedder::new(client, base_url, model)))
        }
    }
}

// ---------------------------------------------------------------------------
// OpenAI
// ---------------------------------------------------------------------------

/// OpenAI `/v1/embeddings` (or any compatible endpoint).
pub struct OpenAiEmbedder {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiDatum>,
}

#[derive(Deserialize)]
struct OpenAiDatum {
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(
        client: Client,
        base_url: &str,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, chars = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        ensure_input(text)?;
        let url = format!("{}/v1/embeddings", self.base_url);
        let body = json!({ "model": self.model, "input": text });

        let request = self.client.post(&url).bearer_auth(&self.api_key).json(&body);
        let response: OpenAiResponse = send_json(request, &url).await?;

        let vector = response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .unwrap_or_default();
        ensure_vector(vector, &url)
    }
}

// ---------------------------------------------------------------------------
// Local
// ---------------------------------------------------------------------------

/// Local embedding server speaking the Ollama `/api/embeddings` protocol.
pub struct LocalEmbedder {
    client: Client,
    base_url: String,
    model: String,
}

#[derive(Deserialize)]
struct LocalResponse {
    #[serde(default)]
    embedding: Vec<f32>,
}

impl LocalEmbedder {
    pub fn new(client: Client, base_url: &str, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for LocalEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, chars = text.len()))]
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        ensure_input(text)?;
        let url = format!("{}/api/embeddings", self.base_url);
        let body = json!({ "model": self.model, "prompt": text });

        let response: LocalResponse = send_json(self.client.post(&url).json(&body), &url).await?;
        ensure_vector(response.embedding, &url)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn send_json<T: serde::de::DeserializeOwned>(
    request: reqwest::RequestBuilder,
    url: &str,
) -> Result<T> {
    let response = request
        .send()
        .await
        .map_err(|e| PaperPipeError::Embedding(format!("POST {url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        return Err(PaperPipeError::Embedding(format!(
            "POST {url} returned {status}: {}",
            detail.trim()
        )));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| PaperPipeError::Embedding(format!("unexpected response from {url}: {e}")))
}

fn ensure_input(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(PaperPipeError::Embedding("cannot embed empty text".into()));
    }
    Ok(())
}

fn ensure_vector(vector: Vec<f32>, url: &str) -> Result<Vec<f32>> {
    if vector.is_empty() {
        return Err(PaperPipeError::Embedding(format!(
            "{url} returned no embedding"
        )));
    }
    debug!(dimensions = vector.len(), "embedding received");
    Ok(vector)
}
