use anyhow::{Context, Result};
use ipchub_server::{listener_fn, Payload, Server, ServerConfig};
use tracing::info;

/// Echo server example that sends every payload back to its sender
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== ipchub Echo Server Example ===");
    println!("This server will echo back any payload sent by clients");

    let server = Server::bind(ServerConfig::from_env()?)
        .await
        .context("Failed to bind echo server")?;

    server.add_listener(listener_fn(|payload, connection, _server| async move {
        let reply = match payload.as_str() {
            Some("ping") => Payload::from("pong"),
            _ => payload,
        };
        connection.send(reply).await?;
        anyhow::Ok(())
    }))?;

    println!("Listening on: {}", server.uri());
    println!("Key: {}", server.key());
    println!("Send \"ping\" for \"pong\"; anything else is echoed; a shutdown payload stops the server");
    println!();

    info!("Starting echo server...");
    server.run().await?;

    println!("✓ Echo server shutdown completed");
    Ok(())
}
