//! ipchub Common Library
//!
//! This crate provides the protocol pieces shared by the ipchub client and
//! server. It includes:
//!
//! - Listening/connecting addresses (unix-domain paths and loopback TCP)
//! - The payload model and the length-prefixed frame codec
//! - Framed channels and key-authenticated connections
//! - The shared-key handshake and key generation
//!
//! # Features
//!
//! - **Cross-platform transports**: Unix domain sockets where available, loopback TCP everywhere
//! - **No torn frames**: partial reads are buffered, concurrent sends are serialized
//! - **Orderly close**: a close sentinel lets the peer stop reading before the stream ends
//! - **Cancellation**: every suspension point honours a `CancellationToken`

/// Listening and connecting addresses
pub mod address;

/// Framed channel over a socket
pub mod channel;

/// Length-prefixed frame codec
pub mod codec;

/// Constants and environment configuration
pub mod config;

/// Key-authenticated connection with close signalling
pub mod connection;

/// Error taxonomy
pub mod error;

/// Shared-key handshake and the client half of the hub
pub mod handshake;

/// One-shot close notification
pub mod lifecycle;

/// Application payloads
pub mod payload;

/// Platform-specific socket implementations
pub mod platform_socket;

// Re-export commonly used types for convenience
pub use address::Address;
pub use channel::Channel;
pub use connection::Connection;
pub use error::{IpcError, Result};
pub use handshake::generate_key;
pub use lifecycle::CloseSignal;
pub use payload::{Packet, Payload};
pub use platform_socket::{PlatformListener, PlatformSocket};
pub use tokio_util::sync::CancellationToken;
