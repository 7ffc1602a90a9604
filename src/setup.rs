//! Wiring from [`Config`] to runtime collaborators.
//!
//! Each protected dependency gets its own [`Guard`] built from its
//! `[resilience.*]` retry profile and the shared breaker settings, so a
//! failing chat service never opens the embedding breaker.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::answer::Orchestrator;
use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::index::{PriorityPolicy, VectorIndex};
use crate::llm::create_chat_client;
use crate::resilience::{
    Guard, EMBEDDING_RETRYABLE, LLM_RETRYABLE, SLACK_RETRYABLE, STORAGE_RETRYABLE,
};

/// One guard per protected dependency.
#[derive(Debug, Clone)]
pub struct Guards {
    pub slack: Guard,
    pub embedding: Guard,
    pub storage: Guard,
    pub llm: Guard,
}

pub fn guards(config: &Config) -> Guards {
    let r = &config.resilience;
    let breaker = &r.circuit_breaker;
    Guards {
        slack: Guard::new("slack", r.slack.clone(), breaker.clone(), SLACK_RETRYABLE),
        embedding: Guard::new(
            "embedding",
            r.embedding.clone(),
            breaker.clone(),
            EMBEDDING_RETRYABLE,
        ),
        storage: Guard::new("storage", r.storage.clone(), breaker.clone(), STORAGE_RETRYABLE),
        llm: Guard::new("llm", r.llm.clone(), breaker.clone(), LLM_RETRYABLE),
    }
}

/// The configured embedding provider. Fails early when embeddings are disabled.
pub fn embedding_provider(config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    if !config.embedding.is_enabled() {
        anyhow::bail!(
            "Embeddings are disabled. Set [embedding] provider to openai, ollama, hash or local."
        );
    }
    create_provider(&config.embedding)
}

/// Load the persisted index with the configured provider and priority policy.
pub async fn open_index(config: &Config, guards: &Guards) -> Result<VectorIndex> {
    let embedder = embedding_provider(config)?;
    let mut index = VectorIndex::new(embedder, guards.embedding.clone(), guards.storage.clone())
        .with_batch_size(config.embedding.batch_size)
        .with_priority(PriorityPolicy::from_config(&config.retrieval));
    index
        .restore(&config.index.path)
        .await
        .with_context(|| "Run `ethos index` first to build the index")?;
    Ok(index)
}

/// Index, chat client and LLM guard assembled into an orchestrator.
pub async fn orchestrator(config: &Config) -> Result<Orchestrator> {
    let guards = guards(config);
    let index = open_index(config, &guards).await?;
    let chat = create_chat_client(&config.llm)?;
    Ok(Orchestrator::new(Arc::new(index), chat, guards.llm)
        .with_max_query_length(config.llm.max_query_length))
}
