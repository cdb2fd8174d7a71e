pub mod bootstrap;
pub mod browser;
pub mod chat;
pub mod config;
pub mod index;
pub mod llm;
pub mod memory;
pub mod models;
pub mod openai;
pub mod retrieval;
pub mod server;
pub mod stream;

pub use bootstrap::Services;
pub use config::AppConfig;
pub use server::run_server;
