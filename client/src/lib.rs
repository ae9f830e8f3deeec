//! ipchub Client Library
//!
//! This crate provides the client side of ipchub. A client connects to a
//! server's local endpoint (unix-domain socket or loopback TCP), presents the
//! shared key, and then exchanges [`Payload`]s over a framed connection.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//!
//! use ipchub_client::{ClientConfig, IpcClient};
//!
//! # async fn run() -> ipchub_client::Result<()> {
//! let config = ClientConfig::from_env()?.with_connect_timeout(Duration::from_secs(5));
//!
//! let client = IpcClient::with_config(config).await?;
//! client.send("status").await?;
//!
//! if let Some(reply) = client.receive().await? {
//!     println!("Server replied: {}", reply.to_json());
//! }
//!
//! client.disconnect().await;
//! # Ok(())
//! # }
//! ```

mod client;

pub use client::*;
// Re-export important types from ipchub-common for convenience
pub use ipchub_common::{Address, CancellationToken, Connection, IpcError, Payload, Result};
