use std::time::Duration;

use anyhow::{Context, Result};
use ipchub_client::{ClientConfig, IpcClient};

/// Talks to a running echo server; reads IPCHUB_ADDRESS and IPCHUB_KEY
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== ipchub Client Basic Example ===");

    let config = ClientConfig::from_env()?.with_connect_timeout(Duration::from_secs(5));
    let client = IpcClient::with_config(config)
        .await
        .context("Failed to connect; is IPCHUB_ADDRESS/IPCHUB_KEY set?")?;
    println!("✓ Connected to {}", client.address());

    for payload in [
        serde_json::json!("ping"),
        serde_json::json!({ "ping": 1 }),
        serde_json::json!([1, 2, 3]),
    ] {
        println!("Sending {payload}");
        client.send(payload).await?;
        match client.receive().await? {
            Some(reply) => println!("  reply: {}", reply.to_json()),
            None => {
                println!("Server closed the connection");
                return Ok(());
            }
        }
    }

    if std::env::args().any(|arg| arg == "--shutdown") {
        println!("Requesting server shutdown...");
        client.shutdown_server().await?;
    } else {
        client.disconnect().await;
    }

    println!("✓ Done");
    Ok(())
}
