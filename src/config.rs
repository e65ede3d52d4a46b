//! TOML configuration.
//!
//! One file (default `./config/chatdocs.toml`) configures the repository
//! database, HTTP bind address, index cache, chunking, retrieval, the
//! inference engine, the job runner and every vector backend. The parsed
//! [`Config`] is passed explicitly to each component; nothing reads
//! credentials from global state.
//!
//! ```toml
//! [db]
//! path = "./data/chatdocs.sqlite"
//!
//! [server]
//! bind = "127.0.0.1:8000"
//!
//! [cache]
//! dir = "./cache"
//!
//! [inference]
//! provider = "openai"
//! embed_model = "text-embedding-3-small"
//! dims = 1536
//! chat_model = "gpt-4o-mini"
//!
//! [storage.embedded]
//! persist_dir = "./persist"
//!
//! [storage.chroma]
//! url = "http://chroma:8001"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    pub cache: CacheConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default)]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: 0,
        }
    }
}

fn default_max_tokens() -> usize {
    512
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    /// Passages retrieved per simple-mode query.
    #[serde(default = "default_similarity_top_k")]
    pub similarity_top_k: usize,
    /// Enhanced-mode breadth when the client sends no `top_k`.
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,
    /// Passages (or partial summaries) folded into one summary call.
    #[serde(default = "default_summary_fanout")]
    pub summary_fanout: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_top_k: default_similarity_top_k(),
            default_top_k: default_top_k(),
            summary_fanout: default_summary_fanout(),
        }
    }
}

fn default_similarity_top_k() -> usize {
    4
}
fn default_top_k() -> usize {
    20
}
fn default_summary_fanout() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub embed_model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub chat_model: Option<String>,
    /// Falls back to `OPENAI_API_KEY` at startup when unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            embed_model: None,
            dims: None,
            chat_model: None,
            api_key: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl InferenceConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn dims_or_default(&self) -> usize {
        self.dims.unwrap_or(1536)
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct JobsConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_workers() -> usize {
    2
}
fn default_queue_capacity() -> usize {
    256
}

/// Per-backend connection settings. A backend without a section is not
/// configured and cannot be resolved.
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub chroma: Option<ChromaConfig>,
    pub embedded: Option<EmbeddedConfig>,
    pub milvus: Option<MilvusConfig>,
    /// Open namespace handles kept before idle ones are dropped.
    #[serde(default = "default_max_open_handles")]
    pub max_open_handles: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            chroma: None,
            embedded: None,
            milvus: None,
            max_open_handles: default_max_open_handles(),
        }
    }
}

fn default_max_open_handles() -> usize {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChromaConfig {
    pub url: String,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddedConfig {
    pub persist_dir: PathBuf,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MilvusConfig {
    pub uri: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub overwrite: bool,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config file")?;

    if config.chunking.max_tokens == 0 {
        bail!("chunking.max_tokens must be > 0");
    }
    if config.chunking.overlap_tokens >= config.chunking.max_tokens {
        bail!("chunking.overlap_tokens must be < chunking.max_tokens");
    }

    if config.retrieval.similarity_top_k == 0 || config.retrieval.default_top_k == 0 {
        bail!("retrieval top_k values must be >= 1");
    }
    if config.retrieval.summary_fanout < 2 {
        bail!("retrieval.summary_fanout must be >= 2");
    }

    if config.jobs.workers == 0 {
        bail!("jobs.workers must be >= 1");
    }
    if config.jobs.queue_capacity == 0 {
        bail!("jobs.queue_capacity must be >= 1");
    }
    if config.storage.max_open_handles == 0 {
        bail!("storage.max_open_handles must be >= 1");
    }

    match config.inference.provider.as_str() {
        "disabled" | "openai" | "ollama" => {}
        other => bail!(
            "Unknown inference provider: '{}'. Must be disabled, openai, or ollama.",
            other
        ),
    }
    if config.inference.is_enabled() {
        if config.inference.embed_model.is_none() {
            bail!(
                "inference.embed_model must be specified when provider is '{}'",
                config.inference.provider
            );
        }
        if config.inference.chat_model.is_none() {
            bail!(
                "inference.chat_model must be specified when provider is '{}'",
                config.inference.provider
            );
        }
        if config.inference.dims == Some(0) {
            bail!("inference.dims must be > 0");
        }
        // Ollama model widths vary; there is no safe default.
        if config.inference.provider == "ollama" && config.inference.dims.is_none() {
            bail!("inference.dims must be specified when provider is 'ollama'");
        }
    }
    if config.inference.batch_size == 0 {
        bail!("inference.batch_size must be >= 1");
    }

    if config.inference.provider == "openai" && config.inference.api_key.is_none() {
        config.inference.api_key = std::env::var("OPENAI_API_KEY").ok();
    }

    Ok(config)
}
