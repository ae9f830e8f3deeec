use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
};

use crate::{
    address::Address,
    error::{IpcError, Result},
};

/// Cross-platform byte stream
#[derive(Debug)]
pub enum PlatformSocket {
    #[cfg(unix)]
    /// Unix domain socket
    Unix(UnixStream),
    /// Loopback TCP connection
    Tcp(TcpStream),
}

/// Cross-platform socket listener
#[derive(Debug)]
pub enum PlatformListener {
    #[cfg(unix)]
    /// Unix domain socket listener
    Unix(UnixListener),
    /// TCP listener
    Tcp(TcpListener),
}

impl PlatformSocket {
    /// Opens a transport connection to `address`.
    pub async fn connect(address: &Address) -> Result<Self> {
        let connect_error = |source| IpcError::Connect {
            address: address.to_string(),
            source,
        };

        match address {
            #[cfg(unix)]
            Address::Unix(path) => {
                tracing::debug!("Connecting to unix socket {}", path.display());
                let stream = UnixStream::connect(path).await.map_err(connect_error)?;
                Ok(PlatformSocket::Unix(stream))
            }
            #[cfg(not(unix))]
            Address::Unix(_) => Err(connect_error(unix_unsupported())),
            Address::Tcp(addr) => {
                tracing::debug!("Connecting to tcp socket {}", addr);
                let stream = TcpStream::connect(addr).await.map_err(connect_error)?;
                stream.set_nodelay(true).map_err(connect_error)?;
                Ok(PlatformSocket::Tcp(stream))
            }
        }
    }
}

impl AsyncRead for PlatformSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            PlatformSocket::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for PlatformSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            PlatformSocket::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => Pin::new(stream).poll_flush(cx),
            PlatformSocket::Tcp(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            PlatformSocket::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            PlatformSocket::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

impl PlatformListener {
    /// Opens a listening endpoint at `address`.
    ///
    /// Unix paths must not exist yet; a stale file is reported as a bind error
    /// rather than removed, since the caller may not own it.
    pub async fn bind(address: &Address) -> Result<Self> {
        let bind_error = |source| IpcError::Bind {
            address: address.to_string(),
            source,
        };

        match address {
            #[cfg(unix)]
            Address::Unix(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.is_dir() {
                        return Err(bind_error(io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("parent directory {} does not exist", parent.display()),
                        )));
                    }
                }
                let listener = UnixListener::bind(path).map_err(bind_error)?;
                tracing::debug!("Unix socket bound at {}", path.display());
                Ok(PlatformListener::Unix(listener))
            }
            #[cfg(not(unix))]
            Address::Unix(_) => Err(bind_error(unix_unsupported())),
            Address::Tcp(addr) => {
                let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
                tracing::debug!("Tcp socket bound at {}", addr);
                Ok(PlatformListener::Tcp(listener))
            }
        }
    }

    /// Accepts one raw connection.
    pub async fn accept(&self) -> io::Result<PlatformSocket> {
        match self {
            #[cfg(unix)]
            PlatformListener::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                Ok(PlatformSocket::Unix(stream))
            }
            PlatformListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                tracing::trace!("Accepted tcp connection from {}", peer);
                stream.set_nodelay(true)?;
                Ok(PlatformSocket::Tcp(stream))
            }
        }
    }

    /// The address actually bound, with an ephemeral TCP port resolved.
    pub fn local_address(&self) -> Result<Address> {
        match self {
            #[cfg(unix)]
            PlatformListener::Unix(listener) => {
                let addr = listener.local_addr()?;
                addr.as_pathname()
                    .map(|path| Address::Unix(path.to_path_buf()))
                    .ok_or_else(|| IpcError::InvalidAddress("unnamed unix socket".to_string()))
            }
            PlatformListener::Tcp(listener) => Ok(Address::Tcp(listener.local_addr()?)),
        }
    }
}

#[cfg(not(unix))]
fn unix_unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "unix domain sockets are not supported on this platform",
    )
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_tcp_ephemeral_port_is_resolved() {
        let listener = PlatformListener::bind(&Address::loopback()).await.unwrap();
        let Address::Tcp(addr) = listener.local_address().unwrap() else {
            panic!("expected tcp address");
        };
        assert_ne!(addr.port(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_bytes_flow_both_ways() {
        let tmp = tempfile::TempDir::new().unwrap();
        let address = Address::unix(tmp.path().join("raw.sock"));
        let listener = PlatformListener::bind(&address).await.unwrap();
        assert_eq!(listener.local_address().unwrap(), address);

        let client = tokio::spawn({
            let address = address.clone();
            async move {
                let mut socket = PlatformSocket::connect(&address).await.unwrap();
                socket.write_all(b"hi").await.unwrap();
                let mut reply = [0u8; 2];
                socket.read_exact(&mut reply).await.unwrap();
                reply
            }
        });

        let mut server_side = listener.accept().await.unwrap();
        let mut buf = [0u8; 2];
        server_side.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
        server_side.write_all(b"yo").await.unwrap();

        assert_eq!(&client.await.unwrap(), b"yo");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_connect_to_missing_path_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let address = Address::unix(tmp.path().join("absent.sock"));
        let result = PlatformSocket::connect(&address).await;
        assert!(matches!(result, Err(IpcError::Connect { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_bind_existing_path_fails() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("taken.sock");
        std::fs::write(&path, b"").unwrap();
        let result = PlatformListener::bind(&Address::unix(&path)).await;
        assert!(matches!(result, Err(IpcError::Bind { .. })));
    }
}
