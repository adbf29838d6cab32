//! Spot Trader Web Server
//!
//! Runs the automation loops and the JSON API in one process.

use anyhow::Result;
use spot_trader::api::{create_app, AppState};
use spot_trader::Config;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Default to warn, info for the engine itself. Override with RUST_LOG.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn,spot_trader=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    // Load configuration
    let config = Config::from_env()?;

    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║       SPOT TRADER - WEB SERVER                               ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Trading Pair:  {:<44} ║", config.trade_symbol);
    println!("║  Environment:   {:<44} ║", config.environment.as_str());
    let webhook = if config.alert_webhook_url.is_some() {
        "ENABLED"
    } else {
        "DISABLED (log only)"
    };
    println!("║  Alert Webhook: {:<44} ║", webhook);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();
    config.log_summary();

    // Create application state
    info!("Initializing application state...");
    let state = AppState::new(config.clone()).await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(4);
    let handles = state.start_background_tasks(&shutdown_tx).await;

    // Create the Axum app
    let app = create_app(state);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let listener = TcpListener::bind(addr).await?;

    info!("Server listening on http://{}", addr);
    println!();
    println!("  API:       http://localhost:{}/api", config.api_port);
    println!("  Health:    http://localhost:{}/health", config.api_port);
    println!();

    // Run the server until ctrl-c, then stop the loops
    let signal_tx = shutdown_tx.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Could not listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Shutdown requested");
            let _ = signal_tx.send(());
        })
        .await?;

    let _ = shutdown_tx.send(());
    for handle in handles {
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            warn!("Background task did not stop in time");
        }
    }

    Ok(())
}
