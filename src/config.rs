use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::resilience::{CircuitBreakerConfig, RetryConfig};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub index: IndexConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub slack: SlackConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// Directory holding `vectors.bin` and `documents.json`.
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_messages_file")]
    pub messages_file: PathBuf,
    #[serde(default = "default_min_message_length")]
    pub min_message_length: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            messages_file: default_messages_file(),
            min_message_length: default_min_message_length(),
        }
    }
}

fn default_messages_file() -> PathBuf {
    PathBuf::from("data/slack_messages.json")
}
fn default_min_message_length() -> usize {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
        }
    }
}

fn default_chunk_size() -> usize {
    500
}
fn default_chunk_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL override (OpenAI-compatible gateway or Ollama host).
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            batch_size: default_batch_size(),
            timeout_secs: default_timeout_secs(),
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_llm_provider")]
    pub provider: String,
    #[serde(default = "default_llm_model")]
    pub model: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_query_length")]
    pub max_query_length: usize,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            model: default_llm_model(),
            url: None,
            timeout_secs: default_llm_timeout(),
            max_query_length: default_max_query_length(),
            temperature: default_temperature(),
        }
    }
}

fn default_llm_provider() -> String {
    "openai".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_timeout() -> u64 {
    60
}
fn default_max_query_length() -> usize {
    500
}
fn default_temperature() -> f32 {
    0.2
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_priority_channels")]
    pub priority_channels: Vec<String>,
    #[serde(default = "default_priority_boost")]
    pub priority_boost: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            priority_channels: default_priority_channels(),
            priority_boost: default_priority_boost(),
        }
    }
}

fn default_top_k() -> usize {
    10
}
fn default_priority_channels() -> Vec<String> {
    [
        "leadership",
        "management",
        "executives",
        "all-hands",
        "announcements",
        "important",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
fn default_priority_boost() -> f32 {
    0.3
}

/// Per-dependency retry profiles plus the shared breaker settings.
#[derive(Debug, Deserialize, Clone)]
pub struct ResilienceConfig {
    #[serde(default = "RetryConfig::slack")]
    pub slack: RetryConfig,
    #[serde(default = "RetryConfig::embedding")]
    pub embedding: RetryConfig,
    #[serde(default = "RetryConfig::storage")]
    pub storage: RetryConfig,
    #[serde(default = "RetryConfig::llm")]
    pub llm: RetryConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            slack: RetryConfig::slack(),
            embedding: RetryConfig::embedding(),
            storage: RetryConfig::storage(),
            llm: RetryConfig::llm(),
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SlackConfig {
    /// Environment variable holding the bot token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    /// Channel names to fetch; empty means every channel the bot can see.
    #[serde(default)]
    pub channels: Vec<String>,
    #[serde(default = "default_limit_per_channel")]
    pub limit_per_channel: usize,
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            channels: Vec::new(),
            limit_per_channel: default_limit_per_channel(),
            url: None,
        }
    }
}

fn default_token_env() -> String {
    "SLACK_BOT_TOKEN".to_string()
}
fn default_limit_per_channel() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Configuration with every section at its default and the index at `path`.
    pub fn with_index_path(path: impl Into<PathBuf>) -> Self {
        Self {
            index: IndexConfig { path: path.into() },
            ingest: IngestConfig::default(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            llm: LlmConfig::default(),
            retrieval: RetrievalConfig::default(),
            resilience: ResilienceConfig::default(),
            slack: SlackConfig::default(),
            log: LogConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate chunking
    if config.chunking.chunk_size == 0 {
        anyhow::bail!("chunking.chunk_size must be > 0");
    }
    if config.chunking.chunk_overlap >= config.chunking.chunk_size {
        anyhow::bail!("chunking.chunk_overlap must be smaller than chunking.chunk_size");
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(0.0..=1.0).contains(&config.retrieval.priority_boost) {
        anyhow::bail!("retrieval.priority_boost must be in [0.0, 1.0]");
    }

    // Validate embedding
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }
    match config.embedding.provider.as_str() {
        "openai" | "ollama" => {
            if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
                anyhow::bail!(
                    "embedding.dims must be > 0 when provider is '{}'",
                    config.embedding.provider
                );
            }
            if config.embedding.model.is_none() {
                anyhow::bail!(
                    "embedding.model must be specified when provider is '{}'",
                    config.embedding.provider
                );
            }
        }
        "disabled" | "hash" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, hash, or local.",
            other
        ),
    }

    // Validate llm
    match config.llm.provider.as_str() {
        "openai" | "github" => {}
        other => anyhow::bail!(
            "Unknown llm provider: '{}'. Must be openai or github.",
            other
        ),
    }
    if config.llm.max_query_length == 0 {
        anyhow::bail!("llm.max_query_length must be > 0");
    }

    // Validate resilience
    for (name, retry) in [
        ("slack", &config.resilience.slack),
        ("embedding", &config.resilience.embedding),
        ("storage", &config.resilience.storage),
        ("llm", &config.resilience.llm),
    ] {
        if retry.max_attempts == 0 {
            anyhow::bail!("resilience.{}.max_attempts must be >= 1", name);
        }
        if retry.initial_delay_secs < 0.0 || retry.max_delay_secs < retry.initial_delay_secs {
            anyhow::bail!(
                "resilience.{}: delays must satisfy 0 <= initial_delay_secs <= max_delay_secs",
                name
            );
        }
    }
    if config.resilience.circuit_breaker.failure_threshold == 0 {
        anyhow::bail!("resilience.circuit_breaker.failure_threshold must be >= 1");
    }

    Ok(())
}
