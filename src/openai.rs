use std::collections::VecDeque;
use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::{stream, Stream, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;
use crate::llm::{LanguageModel, TokenStream};
use crate::models::ChatMessage;

#[derive(Clone)]
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    chat_model: String,
    embedding_model: String,
    temperature: f32,
}

impl OpenAiClient {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut bearer = HeaderValue::from_str(&format!("Bearer {}", config.openai_api_key))
            .context("OPENAI_API_KEY contains characters not allowed in a header")?;
        bearer.set_sensitive(true);
        headers.insert(AUTHORIZATION, bearer);

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .context("failed to build openai http client")?;

        Ok(Self {
            client,
            base_url: config.openai_base_url.clone(),
            chat_model: config.models.chat_model.clone(),
            embedding_model: config.models.embedding_model.clone(),
            temperature: config.models.temperature,
        })
    }

    async fn post_chat(&self, messages: &[ChatMessage], stream: bool) -> Result<Response> {
        #[derive(Serialize)]
        struct ChatReq<'a> {
            model: &'a str,
            messages: &'a [ChatMessage],
            temperature: f32,
            stream: bool,
        }

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&ChatReq {
                model: &self.chat_model,
                messages,
                temperature: self.temperature,
                stream,
            })
            .send()
            .await
            .context("failed to call openai chat completions endpoint")?;

        ensure_success(response, "/chat/completions").await
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        #[derive(Serialize)]
        struct EmbedReq<'a> {
            model: &'a str,
            input: &'a str,
        }

        #[derive(Deserialize)]
        struct EmbedResp {
            data: Vec<EmbedItem>,
        }

        #[derive(Deserialize)]
        struct EmbedItem {
            embedding: Vec<f32>,
        }

        let input = text.trim();
        if input.is_empty() {
            anyhow::bail!("cannot embed empty text input");
        }

        let url = format!("{}/embeddings", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&EmbedReq {
                model: &self.embedding_model,
                input,
            })
            .send()
            .await
            .context("failed to call openai embeddings endpoint")?;

        let response = ensure_success(response, "/embeddings")
            .await?
            .json::<EmbedResp>()
            .await
            .context("failed to decode openai /embeddings response")?;

        response
            .data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| anyhow::anyhow!("openai /embeddings returned empty data array"))
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        #[derive(Deserialize)]
        struct CompletionResp {
            choices: Vec<CompletionChoice>,
        }

        #[derive(Deserialize)]
        struct CompletionChoice {
            message: CompletionMessage,
        }

        #[derive(Deserialize)]
        struct CompletionMessage {
            #[serde(default)]
            content: Option<String>,
        }

        let response = self
            .post_chat(&[ChatMessage::user(prompt)], false)
            .await?
            .json::<CompletionResp>()
            .await
            .context("failed to decode openai chat completion response")?;

        let content = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        Ok(content.trim().to_string())
    }

    async fn stream_chat(&self, messages: &[ChatMessage]) -> Result<TokenStream> {
        let response = self.post_chat(messages, true).await?;
        Ok(sse_token_stream(response.bytes_stream()))
    }
}

async fn ensure_success(response: Response, endpoint: &str) -> Result<Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!(
        "openai {endpoint} returned {status}: {}",
        normalize_err_body(&body)
    )
}

#[derive(Debug, PartialEq)]
enum SseEvent {
    Token(String),
    Done,
    Failed(String),
    Skip,
}

struct SseState<S> {
    body: Pin<Box<S>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String>>,
    finished: bool,
}

impl<S> SseState<S> {
    /// Moves every complete line out of the byte buffer. Returns true once
    /// the terminal event has been seen.
    fn drain_lines(&mut self) -> bool {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if self.push_line(&line) {
                return true;
            }
        }
        false
    }

    fn push_line(&mut self, line: &[u8]) -> bool {
        let line = String::from_utf8_lossy(line);
        match parse_sse_line(&line) {
            SseEvent::Token(token) => self.pending.push_back(Ok(token)),
            SseEvent::Failed(message) => {
                self.pending
                    .push_back(Err(anyhow::anyhow!("openai stream error: {message}")));
                return true;
            }
            SseEvent::Done => return true,
            SseEvent::Skip => {}
        }
        false
    }
}

fn sse_token_stream<S>(body: S) -> TokenStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let state = SseState {
        body: Box::pin(body),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.body.next().await {
                Some(Ok(bytes)) => {
                    state.buffer.extend_from_slice(&bytes);
                    state.finished = state.drain_lines();
                }
                Some(Err(err)) => {
                    state.finished = true;
                    state.pending.push_back(
                        Err(anyhow::Error::new(err).context("openai stream interrupted")),
                    );
                }
                None => {
                    state.finished = true;
                    let rest = std::mem::take(&mut state.buffer);
                    if !rest.is_empty() {
                        state.push_line(&rest);
                    }
                }
            }
        }
    }))
}

fn parse_sse_line(line: &str) -> SseEvent {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return SseEvent::Skip;
    };
    let data = data.trim();
    if data == "[DONE]" {
        return SseEvent::Done;
    }

    let Ok(json) = serde_json::from_str::<serde_json::Value>(data) else {
        tracing::debug!("skipping undecodable stream line: {}", data);
        return SseEvent::Skip;
    };

    if let Some(err) = json.get("error") {
        let message = err
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| err.to_string());
        return SseEvent::Failed(message);
    }

    match json["choices"][0]["delta"]["content"].as_str() {
        Some(content) if !content.is_empty() => SseEvent::Token(content.to_string()),
        _ => SseEvent::Skip,
    }
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = json.get("error") {
            if let Some(message) = err.get("message").and_then(|v| v.as_str()) {
                return message.to_string();
            }
            if let Some(message) = err.as_str() {
                return message.to_string();
            }
        }
    }

    trimmed.to_string()
}
