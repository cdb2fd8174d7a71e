use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Duration, Utc};
use tiktoken_rs::{cl100k_base, CoreBPE};
use uuid::Uuid;

use crate::models::{ChatMessage, Role};

pub const DEFAULT_SESSION_ID: &str = "default";

pub type SharedMemory = Arc<Mutex<ChatMemoryBuffer>>;

static TOKENIZER: OnceLock<Option<CoreBPE>> = OnceLock::new();

/// Token count under the cl100k_base encoding used by the chat models.
/// Falls back to a four-bytes-per-token estimate if the encoder can't load.
pub fn count_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }

    let tokenizer = TOKENIZER.get_or_init(|| match cl100k_base() {
        Ok(bpe) => Some(bpe),
        Err(err) => {
            tracing::warn!("cl100k_base unavailable, estimating token counts: {:#}", err);
            None
        }
    });

    match tokenizer {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => text.len().div_ceil(4),
    }
}

/// Conversation history bounded by a token budget.
#[derive(Debug, Clone)]
pub struct ChatMemoryBuffer {
    token_limit: usize,
    messages: Vec<ChatMessage>,
}

impl ChatMemoryBuffer {
    pub fn new(token_limit: usize) -> Self {
        Self {
            token_limit,
            messages: Vec::new(),
        }
    }

    pub fn put(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[cfg(test)]
    pub fn all(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Latest history that fits next to `initial_token_count` tokens of
    /// prompt. The returned slice never opens with an assistant reply.
    pub fn get(&self, initial_token_count: usize) -> Vec<ChatMessage> {
        if initial_token_count > self.token_limit {
            return vec![];
        }

        let total = self.messages.len();
        let mut start = 0;
        let mut tokens: usize = initial_token_count
            + self
                .messages
                .iter()
                .map(|m| count_tokens(&m.content))
                .sum::<usize>();

        while start < total && tokens > self.token_limit {
            tokens -= count_tokens(&self.messages[start].content);
            start += 1;
            while start < total && self.messages[start].role == Role::Assistant {
                tokens -= count_tokens(&self.messages[start].content);
                start += 1;
            }
        }

        if tokens > self.token_limit {
            return vec![];
        }
        self.messages[start..].to_vec()
    }
}

struct SessionEntry {
    memory: SharedMemory,
    last_active: DateTime<Utc>,
}

/// Independent memory buffers keyed by conversation id.
#[derive(Clone)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<String, SessionEntry>>>,
    token_limit: usize,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(token_limit: usize, ttl_secs: u64) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            token_limit,
            ttl: Duration::seconds(ttl_secs.min(u64::from(u32::MAX)) as i64),
        }
    }

    pub fn create(&self) -> String {
        let session_id = Uuid::new_v4().to_string();
        self.get_or_create(&session_id);
        session_id
    }

    pub fn get_or_create(&self, session_id: &str) -> SharedMemory {
        let now = Utc::now();
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let entry = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionEntry {
                memory: Arc::new(Mutex::new(ChatMemoryBuffer::new(self.token_limit))),
                last_active: now,
            });
        entry.last_active = now;
        entry.memory.clone()
    }

    pub fn close(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(session_id)
            .is_some()
    }

    /// Drops sessions idle for longer than the TTL. Returns how many went.
    pub fn evict_idle(&self, now: DateTime<Utc>) -> usize {
        let mut sessions = self
            .sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = sessions.len();
        sessions.retain(|_, entry| now - entry.last_active <= self.ttl);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
