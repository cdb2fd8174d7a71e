use std::pin::Pin;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::Stream;

use crate::models::ChatMessage;

/// Lazily produced answer tokens, in generation order.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Opens a streamed completion. Errors before the first token are returned
    /// directly; errors after that arrive as the stream's last item.
    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<TokenStream>;
}
