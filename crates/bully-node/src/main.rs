use anyhow::{Context, Result};
use bully_cluster::ElectionEngine;
use bully_node::{router, AppState, Cli, WebhookObserver};
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let config = cli.election_config()?;
    let listener = TcpListener::bind(cli.bind_address())
        .await
        .with_context(|| format!("Failed to listen on {}", cli.bind_address()))?;

    let hook = WebhookObserver::new(cli.webhook_url(), bully_node::webhook::DEFAULT_TIMEOUT)?;
    let engine = Arc::new(
        ElectionEngine::new(listener, cli.candidates(), Arc::new(hook), config).await?,
    );

    println!("My ID: {}", engine.my_id());

    let state = AppState {
        engine: engine.clone(),
        show_port: cli.showport,
        unix_time: cli.unix_time,
    };
    let http = TcpListener::bind(cli.http)
        .await
        .with_context(|| format!("Failed to bind HTTP endpoint {}", cli.http))?;
    tracing::info!("Leader endpoint listening on {}", cli.http);

    let served = axum::serve(http, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    engine.finalize().await;
    served.context("HTTP server failed")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down");
}

fn setup_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}
