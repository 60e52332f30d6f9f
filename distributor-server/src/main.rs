use std::net::TcpListener;

use envconfig::Envconfig;
use tracing_subscriber::EnvFilter;

use distributor_server::{config, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = config::Config::init_from_env()?;
    let listener = TcpListener::bind(config.address)?;

    server::serve(config, listener, shutdown_signal()).await;
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install shutdown signal handler");
    tracing::info!("shutting down");
}
