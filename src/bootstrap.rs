use std::sync::Arc;

use anyhow::{Context, Result};

use crate::chat::ChatEngine;
use crate::config::AppConfig;
use crate::index::VectorIndex;
use crate::llm::LanguageModel;
use crate::memory::SessionStore;
use crate::openai::OpenAiClient;
use crate::retrieval::{FusionRetriever, VectorRetriever};

/// Every long-lived object, built once before the first request.
#[derive(Clone)]
pub struct Services {
    pub retriever: FusionRetriever,
    pub chat: ChatEngine,
    pub sessions: SessionStore,
}

impl Services {
    pub fn build(config: &AppConfig) -> Result<Self> {
        let index = VectorIndex::load(&config.storage_dir).with_context(|| {
            format!(
                "failed to load index from {}",
                config.storage_dir.display()
            )
        })?;
        if index.is_empty() {
            tracing::warn!("index at {} has no nodes", config.storage_dir.display());
        }
        tracing::info!(
            nodes = index.len(),
            dimension = index.dimension(),
            "loaded index from {}",
            config.storage_dir.display()
        );

        let llm: Arc<dyn LanguageModel> = Arc::new(OpenAiClient::new(config)?);
        Ok(Self::from_parts(config, Arc::new(index), llm))
    }

    pub fn from_parts(
        config: &AppConfig,
        index: Arc<VectorIndex>,
        llm: Arc<dyn LanguageModel>,
    ) -> Self {
        let vector = VectorRetriever::new(
            index,
            llm.clone(),
            config.retrieval.similarity_top_k,
        );
        let retriever = FusionRetriever::new(vector.clone(), llm.clone(), &config.retrieval);
        let chat = ChatEngine::new(vector, llm, config.system_prompt.clone());
        let sessions = SessionStore::new(config.memory.token_limit, config.memory.session_ttl_secs);

        Self {
            retriever,
            chat,
            sessions,
        }
    }
}
