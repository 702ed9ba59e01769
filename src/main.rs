//! Portico - Entry Point
//!
//! Starts the local proxy facade and runs it until a shutdown signal.

use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use portico::config::Config;
use portico::proxy::ProxySession;

#[tokio::main]
async fn main() -> portico::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "portico=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Portico proxy facade");

    let config = Config::from_env()?;
    info!(
        "Configuration loaded: {} mode, listening on {}",
        config.proxy.mode.as_str(),
        config.proxy.local_addr()
    );

    let session = ProxySession::new(config);
    let local_addr = session.start().await?;
    info!("Proxy facade ready on {}", local_addr);

    shutdown_signal().await;
    info!("Shutdown signal received");

    session.stop().await;
    info!("Portico stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
