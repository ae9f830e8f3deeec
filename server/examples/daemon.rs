use anyhow::{Context, Result};
use ipchub_server::{listener_fn, CancellationToken, IpcError, Server, ServerConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Long-running server example with signal handling and graceful shutdown
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== ipchub Daemon Server Example ===");

    // Ctrl+C cancels every accept and receive, which closes the server
    let cancellation = CancellationToken::new();
    let token = cancellation.clone();
    ctrlc::set_handler(move || {
        info!("Received shutdown signal, stopping server...");
        token.cancel();
    })
    .context("Failed to set signal handler")?;

    let config = ServerConfig::from_env()?.with_cancellation(cancellation);
    let server = Server::bind(config).await.context("Failed to bind IPC server")?;

    server.add_listener(listener_fn(|payload, connection, _server| async move {
        info!(connection = %connection.id(), "Received {}", payload.to_json());
        anyhow::Ok(())
    }))?;
    server.set_restart_hook(|| info!("Restart hook invoked"));

    println!("Clients connect with:");
    println!("  IPCHUB_ADDRESS={}", server.uri());
    println!("  IPCHUB_KEY={}", server.key());
    println!("Press Ctrl+C to stop the server gracefully");
    println!();

    match server.run().await {
        Ok(()) => info!("Server stopped normally"),
        Err(IpcError::Cancelled) => info!("Server stopped by signal"),
        Err(e) => error!("Server error: {}", e),
    }

    // Only a shutdown requested by a client removes the hook
    if let Some(restart) = server.take_restart_hook() {
        restart();
    }

    println!("✓ Server shutdown completed");
    Ok(())
}
