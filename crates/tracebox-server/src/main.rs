//! Tracebox server entry point.
//!
//! Serves the stepping UI and the session websocket until Ctrl-C, then tears
//! down every live session before exiting.

use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracebox_server::{http, AppState, TraceboxConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long shutdown waits for sessions to release their sandboxes.
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::from_default_env()
                .add_directive("tracebox_server=info".parse()?)
                .add_directive("tracebox_core=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("Starting Tracebox server");

    // Load configuration from environment
    let config = TraceboxConfig::from_env();
    tracing::info!(?config, "Configuration loaded");

    // Validate configuration (warn-only to support development environments)
    config.validate_warn();

    let sandbox = config.sandbox_config()?;

    // Create shutdown broadcast channel
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let state = AppState::new(sandbox, shutdown_tx.clone());
    let sessions = state.sessions.clone();

    let http_addr = config.http_addr;
    let mut shutdown_rx = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        let shutdown = async move {
            let _ = shutdown_rx.recv().await;
        };

        if let Err(e) = http::serve(state, http_addr, shutdown).await {
            tracing::error!(error = %e, "HTTP server error");
        }
    });

    tracing::info!(
        http_addr = %config.http_addr,
        isolation = ?config.isolation,
        "Server ready"
    );

    // Wait for shutdown signal
    signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, cleaning up...");

    // Sessions treat this like a closed transport
    let _ = shutdown_tx.send(());

    sessions.close();
    if tokio::time::timeout(SESSION_DRAIN_TIMEOUT, sessions.wait())
        .await
        .is_err()
    {
        tracing::warn!(
            remaining = sessions.len(),
            "Sessions did not finish before shutdown timeout"
        );
    } else {
        tracing::info!("All sessions closed");
    }

    let _ = http_handle.await;

    tracing::info!("Server shutdown complete");
    Ok(())
}
