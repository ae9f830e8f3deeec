use std::{fmt, sync::Arc};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    channel::Channel,
    error::{IpcError, Result},
    payload::{Packet, Payload},
    platform_socket::PlatformSocket,
};

/// An authenticated, framed connection to a peer.
///
/// Handles are cheap to clone and share one stream. When the last handle of a
/// still-open connection is dropped, `disconnect` runs in the background on the
/// current tokio runtime.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id:           Uuid,
    channel:      Arc<Channel<Packet>>,
    cancellation: CancellationToken,
}

impl Connection {
    pub fn new(socket: PlatformSocket, cancellation: CancellationToken, max_frame_size: usize) -> Self {
        let id = Uuid::new_v4();
        tracing::debug!(connection = %id, "Connection established");
        Self {
            inner: Arc::new(Inner {
                id,
                channel: Arc::new(Channel::new(socket, max_frame_size)),
                cancellation,
            }),
        }
    }

    /// Unique identifier, useful for logging and correlating listener calls.
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Token that aborts pending receives on this connection.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.inner.cancellation
    }

    pub async fn send(&self, payload: impl Into<Payload>) -> Result<()> {
        self.inner.channel.send(&Packet::Data(payload.into())).await
    }

    /// Receives the next payload.
    ///
    /// Returns `Ok(None)` once the peer signalled close, whether by sending the
    /// close sentinel or by ending the stream.
    pub async fn receive(&self) -> Result<Option<Payload>> {
        let packet = tokio::select! {
            biased;
            _ = self.inner.cancellation.cancelled() => return Err(IpcError::Cancelled),
            packet = self.inner.channel.receive() => packet?,
        };

        match packet {
            Some(Packet::Data(payload)) => Ok(Some(payload)),
            Some(Packet::Close) => {
                tracing::debug!(connection = %self.inner.id, "Peer sent close signal");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Tells the peer to stop reading, then closes. Idempotent.
    ///
    /// A failure to deliver the close signal is ignored; the peer may already
    /// be gone.
    pub async fn disconnect(&self) {
        disconnect_channel(&self.inner.channel, self.inner.id).await;
    }

    /// Closes without sending the close signal.
    pub fn close(&self) {
        self.inner.channel.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.channel.is_closed()
    }

    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        self.inner.channel.on_close(callback);
    }
}

async fn disconnect_channel(channel: &Channel<Packet>, id: Uuid) {
    if channel.is_closed() {
        return;
    }
    if let Err(e) = channel.send(&Packet::Close).await {
        tracing::trace!(connection = %id, "Close signal not delivered: {}", e);
    }
    channel.shutdown().await;
    tracing::debug!(connection = %id, "Disconnected");
}

impl Drop for Inner {
    fn drop(&mut self) {
        if self.channel.is_closed() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let channel = self.channel.clone();
                let id = self.id;
                handle.spawn(async move { disconnect_channel(&channel, id).await });
            }
            Err(_) => self.channel.close(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

#[cfg(all(test, unix))]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use tokio::net::UnixStream;

    use super::*;
    use crate::config::DEFAULT_MAX_FRAME_SIZE;

    fn pair() -> (Connection, Connection) {
        let (a, b) = UnixStream::pair().unwrap();
        (
            Connection::new(PlatformSocket::Unix(a), CancellationToken::new(), DEFAULT_MAX_FRAME_SIZE),
            Connection::new(PlatformSocket::Unix(b), CancellationToken::new(), DEFAULT_MAX_FRAME_SIZE),
        )
    }

    #[tokio::test]
    async fn test_null_is_an_ordinary_payload() {
        let (a, b) = pair();
        a.send(Payload::Null).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), Some(Payload::Null));
        assert!(!b.is_closed());
    }

    #[tokio::test]
    async fn test_disconnect_yields_no_value_on_peer() {
        let (a, b) = pair();
        a.send("last").await.unwrap();
        a.disconnect().await;
        assert!(a.is_closed());

        assert_eq!(b.receive().await.unwrap(), Some(Payload::from("last")));
        assert_eq!(b.receive().await.unwrap(), None);

        b.disconnect().await;
        assert!(b.is_closed());
        assert!(matches!(b.send(1i64).await, Err(IpcError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (a, _b) = pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        a.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        a.disconnect().await;
        a.disconnect().await;
        a.close();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_receive_leaves_connection_open() {
        let (raw_a, raw_b) = UnixStream::pair().unwrap();
        let cancellation = CancellationToken::new();
        let a = Connection::new(PlatformSocket::Unix(raw_a), CancellationToken::new(), DEFAULT_MAX_FRAME_SIZE);
        let b = Connection::new(PlatformSocket::Unix(raw_b), cancellation.clone(), DEFAULT_MAX_FRAME_SIZE);

        cancellation.cancel();
        assert!(matches!(b.receive().await, Err(IpcError::Cancelled)));
        assert!(!b.is_closed());
        a.send(1i64).await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_last_handle_disconnects() {
        let (a, b) = pair();
        let clone = a.clone();
        drop(a);
        assert!(!clone.is_closed());
        drop(clone);

        let received = tokio::time::timeout(Duration::from_secs(2), b.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received, None);
    }
}
