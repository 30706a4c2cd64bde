//! HTTP-backed language-model providers.
//!
//! Implements the [`EmbeddingClient`] and [`AnswerGenerator`] traits from
//! `finrag-core` for:
//! - **[`DisabledProvider`]**: fails every call; the default when no
//!   provider is configured.
//! - **[`OpenAiProvider`]**: `POST /v1/embeddings` and
//!   `POST /v1/chat/completions`.
//! - **[`OllamaProvider`]**: `POST /api/embed` and `POST /api/chat` on a
//!   local Ollama instance.
//!
//! Every outbound call first passes through a shared [`RequestPacer`],
//! which enforces a minimum spacing between consecutive calls from this
//! process. Calls are never retried; failures map to [`ProviderError`] and
//! are handled by the caller.
//!
//! Use [`create_provider`] to build the configured pair.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use finrag_core::embedding::{AnswerGenerator, EmbeddingClient, ProviderError};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::ProviderConfig;

pub const SYSTEM_PROMPT: &str =
    "You are a financial analyst assistant. Answer questions based on the provided context.";

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// Render the user turn sent to the chat model.
pub fn user_prompt(context: &str, question: &str) -> String {
    format!("Context:\n{}\n\nQuestion:\n{}", context, question)
}

// ============ Pacing ============

/// Process-local minimum spacing between provider calls.
///
/// Holding the lock across the sleep queues concurrent callers, so each
/// one is released at least `min_interval` after the previous.
pub struct RequestPacer {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    /// Wait until a call may be issued, then claim the slot.
    pub async fn wait(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(prev) = *last_call {
            let ready_at = prev + self.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

// ============ Disabled Provider ============

/// A provider that fails every call with [`ProviderError::Disabled`].
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingClient for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Disabled)
    }
}

#[async_trait]
impl AnswerGenerator for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _context: &str, _question: &str) -> Result<String, ProviderError> {
        Err(ProviderError::Disabled)
    }
}

// ============ OpenAI Provider ============

pub struct OpenAiProvider {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    embedding_model: String,
    completion_model: String,
    pacer: RequestPacer,
}

impl OpenAiProvider {
    /// Build a provider with an explicit API key.
    ///
    /// # Errors
    ///
    /// Returns an error if either model is missing from `config` or the
    /// HTTP client cannot be built.
    pub fn new(config: &ProviderConfig, api_key: String) -> Result<Self> {
        let (embedding_model, completion_model) = required_models(config)?;
        Ok(Self {
            http: http_client(config)?,
            base_url: base_url(config, OPENAI_DEFAULT_URL),
            api_key,
            embedding_model,
            completion_model,
            pacer: RequestPacer::new(config.min_interval()),
        })
    }

    /// Build a provider reading the key from `OPENAI_API_KEY`.
    pub fn from_env(config: &ProviderConfig) -> Result<Self> {
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) => key,
            Err(_) => bail!("OPENAI_API_KEY environment variable not set"),
        };
        Self::new(config, api_key)
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, ProviderError> {
        self.pacer.wait().await;
        let request = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", self.api_key));
        send_json(request, body).await
    }
}

#[async_trait]
impl EmbeddingClient for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.embedding_model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = json!({
            "model": self.embedding_model,
            "input": text,
        });
        let json = self.post("/v1/embeddings", &body).await?;
        parse_openai_embedding(&json)
    }
}

#[async_trait]
impl AnswerGenerator for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.completion_model
    }

    async fn generate(&self, context: &str, question: &str) -> Result<String, ProviderError> {
        let body = json!({
            "model": self.completion_model,
            "messages": chat_messages(context, question),
        });
        let json = self.post("/v1/chat/completions", &body).await?;
        parse_openai_chat(&json)
    }
}

/// Extract `data[0].embedding` from an OpenAI embeddings response.
pub fn parse_openai_embedding(json: &Value) -> Result<Vec<f32>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ProviderError::Decode("missing data array".into()))?;
    let first = data.first().ok_or(ProviderError::EmptyResponse)?;
    let embedding = first
        .get("embedding")
        .ok_or_else(|| ProviderError::Decode("missing embedding".into()))?;
    float_array(embedding)
}

/// Extract `choices[0].message.content` from an OpenAI chat response.
pub fn parse_openai_chat(json: &Value) -> Result<String, ProviderError> {
    let choices = json
        .get("choices")
        .and_then(|c| c.as_array())
        .ok_or_else(|| ProviderError::Decode("missing choices array".into()))?;
    let first = choices.first().ok_or(ProviderError::EmptyResponse)?;
    message_content(first)
}

// ============ Ollama Provider ============

pub struct OllamaProvider {
    http: reqwest::Client,
    base_url: String,
    embedding_model: String,
    completion_model: String,
    pacer: RequestPacer,
}

impl OllamaProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let (embedding_model, completion_model) = required_models(config)?;
        Ok(Self {
            http: http_client(config)?,
            base_url: base_url(config, OLLAMA_DEFAULT_URL),
            embedding_model,
            completion_model,
            pacer: RequestPacer::new(config.min_interval()),
        })
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value, ProviderError> {
        self.pacer.wait().await;
        let request = self.http.post(format!("{}{}", self.base_url, path));
        send_json(request, body).await
    }
}

#[async_trait]
impl EmbeddingClient for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.embedding_model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let body = json!({
            "model": self.embedding_model,
            "input": text,
        });
        let json = self.post("/api/embed", &body).await?;
        parse_ollama_embedding(&json)
    }
}

#[async_trait]
impl AnswerGenerator for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.completion_model
    }

    async fn generate(&self, context: &str, question: &str) -> Result<String, ProviderError> {
        let body = json!({
            "model": self.completion_model,
            "messages": chat_messages(context, question),
            "stream": false,
        });
        let json = self.post("/api/chat", &body).await?;
        parse_ollama_chat(&json)
    }
}

/// Extract `embeddings[0]` from an Ollama `/api/embed` response.
pub fn parse_ollama_embedding(json: &Value) -> Result<Vec<f32>, ProviderError> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| ProviderError::Decode("missing embeddings array".into()))?;
    let first = embeddings.first().ok_or(ProviderError::EmptyResponse)?;
    float_array(first)
}

/// Extract `message.content` from a non-streaming Ollama `/api/chat` response.
pub fn parse_ollama_chat(json: &Value) -> Result<String, ProviderError> {
    message_content(json)
}

// ============ Deadlines ============

/// Run a provider call under a deadline.
///
/// Expiry drops the in-flight call and yields [`ProviderError::Timeout`]
/// naming `stage`.
pub async fn with_deadline<T, F>(
    stage: &'static str,
    after: Duration,
    call: F,
) -> Result<T, ProviderError>
where
    F: std::future::Future<Output = Result<T, ProviderError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout { stage, after }),
    }
}

// ============ Factory ============

/// The embedding and generation halves of one configured provider.
///
/// Both handles point at the same instance, so they share one pacer.
#[derive(Clone)]
pub struct Providers {
    pub embedder: Arc<dyn EmbeddingClient>,
    pub generator: Arc<dyn AnswerGenerator>,
}

/// Create the provider pair selected by `config.kind`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"openai"` | [`OpenAiProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
pub fn create_provider(config: &ProviderConfig) -> Result<Providers> {
    match config.kind.as_str() {
        "disabled" => Ok(pair(Arc::new(DisabledProvider))),
        "openai" => Ok(pair(Arc::new(OpenAiProvider::from_env(config)?))),
        "ollama" => Ok(pair(Arc::new(OllamaProvider::new(config)?))),
        other => bail!("Unknown provider kind: {}", other),
    }
}

fn pair<P>(provider: Arc<P>) -> Providers
where
    P: EmbeddingClient + AnswerGenerator + 'static,
{
    Providers {
        embedder: provider.clone(),
        generator: provider,
    }
}

// ============ Helpers ============

fn required_models(config: &ProviderConfig) -> Result<(String, String)> {
    let embedding_model = config
        .embedding_model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("provider.embedding_model required for {}", config.kind))?;
    let completion_model = config
        .completion_model
        .clone()
        .ok_or_else(|| anyhow::anyhow!("provider.completion_model required for {}", config.kind))?;
    Ok((embedding_model, completion_model))
}

fn http_client(config: &ProviderConfig) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(config.timeout())
        .build()?)
}

fn base_url(config: &ProviderConfig, default: &str) -> String {
    config
        .url
        .as_deref()
        .unwrap_or(default)
        .trim_end_matches('/')
        .to_string()
}

fn chat_messages(context: &str, question: &str) -> Value {
    json!([
        { "role": "system", "content": SYSTEM_PROMPT },
        { "role": "user", "content": user_prompt(context, question) },
    ])
}

async fn send_json(
    request: reqwest::RequestBuilder,
    body: &Value,
) -> Result<Value, ProviderError> {
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|e| ProviderError::Transport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(ProviderError::Http {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json::<Value>()
        .await
        .map_err(|e| ProviderError::Decode(e.to_string()))
}

fn float_array(value: &Value) -> Result<Vec<f32>, ProviderError> {
    let items = value
        .as_array()
        .ok_or_else(|| ProviderError::Decode("embedding is not an array".into()))?;
    if items.is_empty() {
        return Err(ProviderError::EmptyResponse);
    }
    items
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| ProviderError::Decode("embedding value is not a number".into()))
        })
        .collect()
}

fn message_content(value: &Value) -> Result<String, ProviderError> {
    let content = value
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| ProviderError::Decode("missing message content".into()))?;
    if content.trim().is_empty() {
        return Err(ProviderError::EmptyResponse);
    }
    Ok(content.to_string())
}
