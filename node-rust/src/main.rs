mod config;
mod models;
mod routes;
mod state;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use gridbug_protocol::{GossipNode, BUILD};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = config::Cli::parse();
    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .init();

    let settings = cli.settings();
    let seeds = cli.seed_source();
    tracing::info!(
        node_id = %settings.node_id,
        role = %settings.role,
        build = BUILD,
        port = settings.listen_port,
        "Starting GridBug"
    );

    let node = GossipNode::bootstrap(settings, seeds)
        .await
        .context("Refusing to start with invalid configuration")?;
    let port = node.settings.listen_port;
    let state = state::AppState::new(node);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = state.node.clone();
    let poll_task = tokio::spawn(async move { poller.run(shutdown_rx).await });

    let app = routes::create_router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Unable to listen on {addr}"))?;
    tracing::info!("Listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Err(e) = poll_task.await {
        tracing::warn!("Poll loop ended abnormally: {e}");
    }
    tracing::info!("GridBug stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async { tokio::signal::ctrl_c().await.ok(); };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("SIGTERM handler unavailable: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }
}
