use std::io;

use thiserror::Error;

/// Errors produced by the IPC layer.
#[derive(Error, Debug)]
pub enum IpcError {
    /// The transport could not reach the remote address.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source:  io::Error,
    },

    /// The listening endpoint could not be opened.
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source:  io::Error,
    },

    /// The peer refused the presented key.
    #[error("handshake rejected by {0}")]
    Authentication(String),

    /// A malformed or truncated frame was read from the stream.
    #[error("framing error: {0}")]
    Framing(String),

    #[error("frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("channel is closed")]
    ChannelClosed,

    #[error("operation was cancelled")]
    Cancelled,

    #[error("hub is closed")]
    HubClosed,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A configured key that no client could present.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("listener is already registered")]
    ListenerAlreadyRegistered,

    #[error("listener is not registered")]
    ListenerNotFound,

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, IpcError>;

impl From<bincode::Error> for IpcError {
    fn from(err: bincode::Error) -> Self {
        IpcError::Serialization(err.to_string())
    }
}

impl IpcError {
    /// Returns true when the error means the connection is gone rather than
    /// that a particular operation failed.
    pub fn is_disconnect(&self) -> bool {
        match self {
            IpcError::Framing(_) | IpcError::ChannelClosed => true,
            IpcError::Io(e) => is_disconnect_kind(e.kind()),
            _ => false,
        }
    }
}

/// I/O error kinds that indicate the peer went away.
pub(crate) fn is_disconnect_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::BrokenPipe
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_classification() {
        assert!(IpcError::ChannelClosed.is_disconnect());
        assert!(IpcError::Framing("short read".into()).is_disconnect());
        assert!(IpcError::Io(io::Error::from(io::ErrorKind::BrokenPipe)).is_disconnect());
        assert!(!IpcError::Io(io::Error::from(io::ErrorKind::PermissionDenied)).is_disconnect());
        assert!(!IpcError::Cancelled.is_disconnect());
        assert!(!IpcError::HubClosed.is_disconnect());
    }

    #[test]
    fn test_messages() {
        let err = IpcError::FrameTooLarge { size: 10, max: 4 };
        assert_eq!(err.to_string(), "frame too large: 10 bytes (max: 4)");
        assert_eq!(IpcError::ChannelClosed.to_string(), "channel is closed");
    }
}
