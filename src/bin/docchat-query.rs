use std::io::Write;

use anyhow::{Context, Result};
use clap::Parser;
use futures_util::StreamExt;
use tracing_subscriber::EnvFilter;

use docchat::memory::DEFAULT_SESSION_ID;
use docchat::stream::{batch_tokens, CHAT_BATCH_SIZE};
use docchat::{AppConfig, Services};

#[derive(Parser, Debug)]
#[command(name = "docchat-query")]
#[command(about = "Query the loaded index from the terminal")]
struct Cli {
    /// Retrieval query; defaults to the query `/retrive` serves.
    #[arg(long)]
    query: Option<String>,
    /// Send this message to the chat engine and stream the answer instead.
    #[arg(long)]
    chat: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();

    let config = AppConfig::from_env()?;
    let services = Services::build(&config)?;

    if let Some(message) = cli.chat {
        let memory = services.sessions.get_or_create(DEFAULT_SESSION_ID);
        let tokens = services
            .chat
            .stream_chat(memory, &message)
            .await
            .context("failed to start chat")?;

        let mut chunks = batch_tokens(tokens, CHAT_BATCH_SIZE);
        let mut stdout = std::io::stdout();
        while let Some(chunk) = chunks.next().await {
            write!(stdout, "{}", chunk?)?;
            stdout.flush()?;
        }
        writeln!(stdout)?;
        return Ok(());
    }

    let query = cli.query.unwrap_or(config.retrieval.fixed_query);
    let nodes = services
        .retriever
        .retrieve(&query)
        .await
        .with_context(|| format!("retrieval failed for {query:?}"))?;

    if nodes.is_empty() {
        println!("No sources found for {query:?}");
    }
    for node in nodes {
        println!("{}", node.source_line());
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
