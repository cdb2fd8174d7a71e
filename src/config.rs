use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;

pub const DEFAULT_SYSTEM_PROMPT: &str = "Act as an experienced risk and financial policy analyst. \
     You are now able to intelligently answer questions about the information you have been provided.";

pub const DEFAULT_QUERY_GEN_PROMPT: &str = "You are a helpful assistant that generates multiple search queries based on a \
     single input query. Generate {num_queries} search queries, one on each line, \
     related to the following input query:\n\
     Query: {query}\n\
     Queries:\n";

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub chat_model: String,
    pub temperature: f32,
    pub embedding_model: String,
}

#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub similarity_top_k: usize,
    pub num_queries: usize,
    pub use_async: bool,
    pub query_gen_prompt: String,
    /// Query issued by `/retrive` regardless of the request body.
    pub fixed_query: String,
}

#[derive(Clone, Debug)]
pub struct MemoryConfig {
    pub token_limit: usize,
    pub session_ttl_secs: u64,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub storage_dir: PathBuf,
    pub template_dir: PathBuf,
    pub openai_api_key: String,
    pub openai_base_url: String,
    pub system_prompt: String,
    pub open_browser: bool,
    pub debug: bool,
    pub models: ModelConfig,
    pub retrieval: RetrievalConfig,
    pub memory: MemoryConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let openai_api_key = lookup("OPENAI_API_KEY")
            .map(|key| key.trim().to_string())
            .unwrap_or_default();
        if openai_api_key.is_empty() {
            anyhow::bail!("the OPENAI_API_KEY environment variable is not set");
        }

        let string_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            bind_addr: string_or("DOCCHAT_BIND", "127.0.0.1:5000"),
            storage_dir: PathBuf::from(string_or("DOCCHAT_STORAGE_DIR", "data/storage")),
            template_dir: PathBuf::from(string_or("DOCCHAT_TEMPLATE_DIR", "templates")),
            openai_api_key,
            openai_base_url: string_or("OPENAI_BASE_URL", "https://api.openai.com/v1")
                .trim_end_matches('/')
                .to_string(),
            system_prompt: string_or("SYSTEM_PROMPT", DEFAULT_SYSTEM_PROMPT),
            open_browser: parse_or(lookup("DOCCHAT_OPEN_BROWSER"), true),
            debug: parse_or(lookup("DOCCHAT_DEBUG"), true),
            models: ModelConfig {
                chat_model: string_or("CHAT_MODEL", "gpt-4"),
                temperature: parse_or(lookup("CHAT_TEMPERATURE"), 0.0),
                embedding_model: string_or("EMBEDDING_MODEL", "text-embedding-ada-002"),
            },
            retrieval: RetrievalConfig {
                similarity_top_k: parse_or(lookup("SIMILARITY_TOP_K"), 2),
                num_queries: parse_or(lookup("FUSION_NUM_QUERIES"), 2),
                use_async: parse_or(lookup("FUSION_USE_ASYNC"), true),
                query_gen_prompt: string_or("QUERY_GEN_PROMPT", DEFAULT_QUERY_GEN_PROMPT),
                fixed_query: string_or("RETRIEVE_QUERY", "41D"),
            },
            memory: MemoryConfig {
                token_limit: parse_or(lookup("MEMORY_TOKEN_LIMIT"), 20_000),
                session_ttl_secs: parse_or(lookup("SESSION_TTL_SECS"), 3_600),
            },
        })
    }

    /// Local URL for the bound address. Wildcard binds open on loopback.
    pub fn browser_url(&self) -> String {
        match self.bind_addr.parse::<SocketAddr>() {
            Ok(addr) if addr.ip().is_unspecified() => {
                format!("http://127.0.0.1:{}/", addr.port())
            }
            _ => format!("http://{}/", self.bind_addr),
        }
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, default: T) -> T {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
