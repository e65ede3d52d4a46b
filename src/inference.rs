//! Inference engine: text embeddings and completions.
//!
//! - **[`DisabledEngine`]**: every call fails; used when no provider is configured.
//! - **[`OpenAIEngine`]**: `/v1/embeddings` and `/v1/chat/completions`.
//! - **[`OllamaEngine`]**: `/api/embed` and `/api/generate` on a local Ollama.
//!
//! Use [`create_engine`] to build the engine named by `[inference]`.
//!
//! # Retry Strategy
//!
//! Both HTTP engines retry transient failures with exponential backoff:
//! - HTTP 429 and 5xx → retry
//! - other HTTP 4xx → fail immediately
//! - network errors → retry
//! - backoff 1s, 2s, 4s, ... capped at 32s

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::config::InferenceConfig;

#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Embedding model identifier, recorded in index manifests.
    fn embed_model(&self) -> &str;

    fn dims(&self) -> usize;

    /// One vector per input text, in input order.
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Complete `prompt`. `model` overrides the configured chat model.
    async fn complete(&self, model: Option<&str>, prompt: &str) -> Result<String>;
}

/// Embed one query text.
pub async fn embed_one(engine: &dyn InferenceEngine, text: &str) -> Result<Vec<f32>> {
    engine
        .embed(&[text.to_string()])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| anyhow!("Empty embedding response"))
}

pub struct DisabledEngine;

#[async_trait]
impl InferenceEngine for DisabledEngine {
    fn embed_model(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        bail!("Inference provider is disabled")
    }

    async fn complete(&self, _model: Option<&str>, _prompt: &str) -> Result<String> {
        bail!("Inference provider is disabled")
    }
}

/// Shared HTTP plumbing: one client, retry budget, and the JSON POST loop.
struct HttpCaller {
    client: reqwest::Client,
    max_retries: u32,
    label: &'static str,
}

impl HttpCaller {
    fn new(config: &InferenceConfig, label: &'static str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            max_retries: config.max_retries,
            label,
        })
    }

    async fn post_json(&self, url: &str, bearer: Option<&str>, body: &Value) -> Result<Value> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = self
                .client
                .post(url)
                .header("Content-Type", "application/json")
                .json(body);
            if let Some(token) = bearer {
                req = req.header("Authorization", format!("Bearer {}", token));
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if status.as_u16() == 429 || status.is_server_error() {
                        tracing::warn!(
                            provider = self.label,
                            %status,
                            attempt,
                            "transient inference error, retrying"
                        );
                        last_err = Some(anyhow!("{} API error {}: {}", self.label, status, body_text));
                        continue;
                    }
                    bail!("{} API error {}: {}", self.label, status, body_text);
                }
                Err(e) => {
                    last_err = Some(anyhow!("{} connection error ({}): {}", self.label, url, e));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("{} request failed after retries", self.label)))
    }
}

fn float_array(value: &Value, what: &str) -> Result<Vec<f32>> {
    Ok(value
        .as_array()
        .ok_or_else(|| anyhow!("Invalid response: {} is not an array", what))?
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

// ============ OpenAI ============

pub struct OpenAIEngine {
    http: HttpCaller,
    base_url: String,
    api_key: String,
    embed_model: String,
    chat_model: String,
    dims: usize,
    batch_size: usize,
}

impl OpenAIEngine {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY not set and inference.api_key missing"))?;
        Ok(Self {
            http: HttpCaller::new(config, "OpenAI")?,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            api_key,
            embed_model: required(&config.embed_model, "inference.embed_model")?,
            chat_model: required(&config.chat_model, "inference.chat_model")?,
            dims: config.dims_or_default(),
            batch_size: config.batch_size,
        })
    }
}

fn required(value: &Option<String>, key: &str) -> Result<String> {
    value.clone().ok_or_else(|| anyhow!("{} is required", key))
}

/// Extract `data[].embedding` ordered by each item's `index`.
fn parse_openai_embeddings(json: &Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| anyhow!("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, float_array(embedding, "embedding")?));
    }
    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

fn parse_openai_completion(json: &Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing choices[0].message.content"))
}

#[async_trait]
impl InferenceEngine for OpenAIEngine {
    fn embed_model(&self) -> &str {
        &self.embed_model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/embeddings", self.base_url);
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = json!({ "model": self.embed_model, "input": batch });
            let resp = self.http.post_json(&url, Some(&self.api_key), &body).await?;
            let vectors = parse_openai_embeddings(&resp)?;
            if vectors.len() != batch.len() {
                bail!(
                    "OpenAI returned {} embeddings for {} inputs",
                    vectors.len(),
                    batch.len()
                );
            }
            out.extend(vectors);
        }
        Ok(out)
    }

    async fn complete(&self, model: Option<&str>, prompt: &str) -> Result<String> {
        let body = json!({
            "model": model.unwrap_or(&self.chat_model),
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": 0.0,
        });
        let url = format!("{}/chat/completions", self.base_url);
        let resp = self.http.post_json(&url, Some(&self.api_key), &body).await?;
        parse_openai_completion(&resp)
    }
}

// ============ Ollama ============

pub struct OllamaEngine {
    http: HttpCaller,
    url: String,
    embed_model: String,
    chat_model: String,
    dims: usize,
    batch_size: usize,
}

impl OllamaEngine {
    pub fn new(config: &InferenceConfig) -> Result<Self> {
        Ok(Self {
            http: HttpCaller::new(config, "Ollama")?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            embed_model: required(&config.embed_model, "inference.embed_model")?,
            chat_model: required(&config.chat_model, "inference.chat_model")?,
            dims: config
                .dims
                .ok_or_else(|| anyhow!("inference.dims must be set for the ollama provider"))?,
            batch_size: config.batch_size,
        })
    }
}

fn parse_ollama_embeddings(json: &Value) -> Result<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow!("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(|e| float_array(e, "embedding"))
        .collect()
}

#[async_trait]
impl InferenceEngine for OllamaEngine {
    fn embed_model(&self) -> &str {
        &self.embed_model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = format!("{}/api/embed", self.url);
        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let body = json!({ "model": self.embed_model, "input": batch });
            let resp = self.http.post_json(&url, None, &body).await?;
            out.extend(parse_ollama_embeddings(&resp)?);
        }
        Ok(out)
    }

    async fn complete(&self, model: Option<&str>, prompt: &str) -> Result<String> {
        let body = json!({
            "model": model.unwrap_or(&self.chat_model),
            "prompt": prompt,
            "stream": false,
        });
        let resp = self
            .http
            .post_json(&format!("{}/api/generate", self.url), None, &body)
            .await?;
        resp.get("response")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| anyhow!("Invalid Ollama response: missing response"))
    }
}

/// Build the engine named by `config.provider`.
///
/// | Config Value | Engine |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEngine`] |
/// | `"openai"` | [`OpenAIEngine`] |
/// | `"ollama"` | [`OllamaEngine`] |
pub fn create_engine(config: &InferenceConfig) -> Result<Arc<dyn InferenceEngine>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEngine)),
        "openai" => Ok(Arc::new(OpenAIEngine::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEngine::new(config)?)),
        other => bail!("Unknown inference provider: {}", other),
    }
}
