use anyhow::Result;
use chat_relay::{Config, Server};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    init_tracing(config.json_logs);

    info!("chat-relay v{} starting", env!("CARGO_PKG_VERSION"));

    let server = Server::bind(&config).await?;

    let handle = server.handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received");
                handle.shutdown();
            }
            Err(e) => warn!(error = %e, "failed to listen for ctrl-c"),
        }
    });

    server.run().await
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=info"));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
