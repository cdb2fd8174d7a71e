use std::sync::Arc;

use anyhow::Result;
use futures_util::{stream, StreamExt};

use crate::llm::{LanguageModel, TokenStream};
use crate::memory::{count_tokens, SharedMemory};
use crate::models::{ChatMessage, ScoredNode};
use crate::retrieval::VectorRetriever;

/// Answers with the system prompt, retrieved context and session history
/// ("context" chat mode).
#[derive(Clone)]
pub struct ChatEngine {
    retriever: VectorRetriever,
    llm: Arc<dyn LanguageModel>,
    system_prompt: String,
}

impl ChatEngine {
    pub fn new(
        retriever: VectorRetriever,
        llm: Arc<dyn LanguageModel>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            retriever,
            llm,
            system_prompt: system_prompt.into(),
        }
    }

    /// Starts a streamed answer. The turn is written to `memory` only once
    /// the upstream stream has finished cleanly.
    pub async fn stream_chat(&self, memory: SharedMemory, message: &str) -> Result<TokenStream> {
        let nodes = self.retriever.retrieve(message).await?;
        tracing::debug!(nodes = nodes.len(), "retrieved chat context");

        let system = ChatMessage::system(build_system_prompt(&self.system_prompt, &nodes));
        let reserved = count_tokens(&system.content) + count_tokens(message);
        let history = {
            let memory = memory.lock().map_err(|_| anyhow::anyhow!("lock poisoned"))?;
            memory.get(reserved)
        };

        let user = ChatMessage::user(message);
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(system);
        messages.extend(history);
        messages.push(user.clone());

        let upstream = self.llm.stream_chat(&messages).await?;
        Ok(record_turn(upstream, memory, user))
    }
}

struct TurnState {
    upstream: TokenStream,
    memory: SharedMemory,
    user: ChatMessage,
    answer: String,
    finished: bool,
}

fn record_turn(upstream: TokenStream, memory: SharedMemory, user: ChatMessage) -> TokenStream {
    let state = TurnState {
        upstream,
        memory,
        user,
        answer: String::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }

        match state.upstream.next().await {
            Some(Ok(token)) => {
                state.answer.push_str(&token);
                Some((Ok(token), state))
            }
            Some(Err(err)) => {
                state.finished = true;
                Some((Err(err), state))
            }
            None => {
                state.finished = true;
                match state.memory.lock() {
                    Ok(mut memory) => {
                        memory.put(state.user.clone());
                        memory.put(ChatMessage::assistant(std::mem::take(&mut state.answer)));
                    }
                    Err(_) => tracing::warn!("chat memory lock poisoned; turn not recorded"),
                }
                None
            }
        }
    }))
}

fn build_system_prompt(system_prompt: &str, nodes: &[ScoredNode]) -> String {
    let context = nodes
        .iter()
        .map(|node| node.text.trim())
        .collect::<Vec<_>>()
        .join("\n\n");

    format!(
        "{system_prompt}\n\
         Context information is below.\n\
         --------------------\n\
         {context}\n\
         --------------------\n"
    )
}
