//! CLI entry point: parse `Args`, initialise tracing, serve until
//! signalled, then let in-flight writes drain before exiting.

use clap::Parser;
use inkwell_server::config::{Args, ServerConfig};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = ServerConfig::from(args);

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(inkwell_server::config::default_log_directive())))
        .init();

    std::fs::create_dir_all(&config.storage)?;

    let idle_threshold = config.idle_threshold;
    let host = config.host();
    let (app, hub) = inkwell_server::app(config.clone());
    let listener = TcpListener::bind(host).await?;
    info!(addr = %host, storage = %config.storage.display(), "inkwell listening");

    let sweeper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(15));
        loop {
            ticker.tick().await;
            hub.sweep(idle_threshold).await;
        }
    });

    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;

    sweeper.abort();
    info!("inkwell shut down");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
