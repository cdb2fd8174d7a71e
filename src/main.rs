use anyhow::Result;
use tracing_subscriber::EnvFilter;

use docchat::{run_server, AppConfig, Services};

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let config = AppConfig::from_env()?;
    init_tracing(config.debug);

    let services = Services::build(&config)?;

    run_server(config, services).await
}

fn init_tracing(debug: bool) {
    let default_filter = if debug {
        "docchat=debug,tower_http=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
