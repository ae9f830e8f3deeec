//! ipchub Server Library
//!
//! This crate provides the server side of ipchub: it binds a local endpoint
//! (a unix-domain socket, or loopback TCP), admits only clients presenting the
//! shared key, and hands every payload they send to each registered listener.
//!
//! # Example
//!
//! ```no_run
//! use ipchub_server::{listener_fn, Server, ServerConfig};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let server = Server::bind(ServerConfig::new().with_key("secret")).await?;
//! server.add_listener(listener_fn(|payload, connection, _server| async move {
//!     connection.send(payload).await?;
//!     anyhow::Ok(())
//! }))?;
//!
//! println!("listening on {}", server.uri());
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

/// Server configuration
pub mod config;

/// Key-checking accept side of the handshake
pub mod hub;

/// Payload observers
pub mod listener;

/// Accept loop, per-connection drain and listener fan-out
pub mod server;

pub use config::ServerConfig;
pub use hub::IpcHub;
// Re-export important types from ipchub-common for convenience
pub use ipchub_common::{Address, CancellationToken, Connection, IpcError, Payload, Result};
pub use listener::{listener_fn, FnListener, Listener};
pub use server::{RestartHook, Server, ServerHandle, ServerState};
