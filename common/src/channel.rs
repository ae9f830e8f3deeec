use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{self, AsyncWriteExt, ReadHalf, WriteHalf},
    sync::Mutex,
};

use crate::{
    codec::{self, FrameDecoder},
    error::{IpcError, Result},
    lifecycle::CloseSignal,
    platform_socket::PlatformSocket,
};

struct FrameReader {
    half:    Option<ReadHalf<PlatformSocket>>,
    decoder: FrameDecoder,
}

/// Framed, full-duplex channel of `T` values over one socket.
///
/// Sends are serialized by a writer lock so frames from concurrent callers
/// never interleave. Receives buffer partial input in the decoder, so an
/// abandoned receive leaves the stream intact for the next one.
pub struct Channel<T> {
    reader:         Mutex<FrameReader>,
    writer:         Mutex<Option<WriteHalf<PlatformSocket>>>,
    closed:         CloseSignal,
    max_frame_size: usize,
    _marker:        PhantomData<fn(T) -> T>,
}

impl<T> Channel<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(socket: PlatformSocket, max_frame_size: usize) -> Self {
        let (read_half, write_half) = io::split(socket);
        Self {
            reader: Mutex::new(FrameReader {
                half:    Some(read_half),
                decoder: FrameDecoder::new(max_frame_size),
            }),
            writer: Mutex::new(Some(write_half)),
            closed: CloseSignal::new(),
            max_frame_size,
            _marker: PhantomData,
        }
    }

    /// Writes one complete frame.
    ///
    /// Closure is observed while waiting for the writer; once the first byte
    /// is written the frame is always completed or the channel closed.
    pub async fn send(&self, value: &T) -> Result<()> {
        if self.is_closed() {
            return Err(IpcError::ChannelClosed);
        }
        let frame = codec::encode(value, self.max_frame_size)?;

        let mut writer = tokio::select! {
            _ = self.closed.closed() => return Err(IpcError::ChannelClosed),
            guard = self.writer.lock() => guard,
        };
        if self.is_closed() {
            writer.take();
            return Err(IpcError::ChannelClosed);
        }
        let Some(half) = writer.as_mut() else {
            return Err(IpcError::ChannelClosed);
        };

        let written = async {
            half.write_all(&frame).await?;
            half.flush().await
        }
        .await;

        if let Err(e) = written {
            tracing::debug!("Write failed, closing channel: {}", e);
            writer.take();
            drop(writer);
            self.close();
            return Err(e.into());
        }
        if self.is_closed() {
            // closed while this send held the writer
            writer.take();
        }
        Ok(())
    }

    /// Reads the next value.
    ///
    /// Returns `Ok(None)` when the peer closed the stream on a frame boundary.
    /// End of stream, a framing error or a transport error closes the channel.
    pub async fn receive(&self) -> Result<Option<T>> {
        if self.is_closed() {
            return Err(IpcError::ChannelClosed);
        }

        let mut reader = tokio::select! {
            _ = self.closed.closed() => return Err(IpcError::ChannelClosed),
            guard = self.reader.lock() => guard,
        };
        let FrameReader { half, decoder } = &mut *reader;
        let Some(stream) = half.as_mut() else {
            return Err(IpcError::ChannelClosed);
        };

        let result = tokio::select! {
            _ = self.closed.closed() => Err(IpcError::ChannelClosed),
            result = codec::decode(stream, decoder) => result,
        };

        match result {
            Ok(Some(value)) => Ok(Some(value)),
            Err(IpcError::ChannelClosed) => {
                half.take();
                Err(IpcError::ChannelClosed)
            }
            Ok(None) => {
                tracing::trace!("Peer closed the stream");
                half.take();
                drop(reader);
                self.close();
                Ok(None)
            }
            Err(e) => {
                tracing::debug!("Receive failed, closing channel: {}", e);
                half.take();
                drop(reader);
                self.close();
                Err(e)
            }
        }
    }

    /// Shuts the write side down (sending EOF to the peer) and closes.
    pub async fn shutdown(&self) {
        if !self.is_closed() {
            let mut writer = self.writer.lock().await;
            if let Some(mut half) = writer.take() {
                if let Err(e) = half.shutdown().await {
                    tracing::trace!("Shutdown of write half failed: {}", e);
                }
            }
        }
        self.close();
    }

    /// Closes the channel. Idempotent.
    ///
    /// Stream halves not currently borrowed by a send or receive are released
    /// immediately; borrowed ones are released when that operation returns.
    pub fn close(&self) {
        if let Ok(mut writer) = self.writer.try_lock() {
            writer.take();
        }
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.half.take();
        }
        self.closed.close();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        self.closed.on_close(callback);
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("closed", &self.closed.is_closed())
            .field("max_frame_size", &self.max_frame_size)
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use tokio::net::UnixStream;

    use super::*;
    use crate::{config::DEFAULT_MAX_FRAME_SIZE, payload::Payload};

    fn pair() -> (Channel<Payload>, Channel<Payload>) {
        let (a, b) = UnixStream::pair().unwrap();
        (
            Channel::new(PlatformSocket::Unix(a), DEFAULT_MAX_FRAME_SIZE),
            Channel::new(PlatformSocket::Unix(b), DEFAULT_MAX_FRAME_SIZE),
        )
    }

    #[tokio::test]
    async fn test_send_receive_in_order() {
        let (a, b) = pair();
        for i in 0..10 {
            a.send(&Payload::Int(i)).await.unwrap();
        }
        for i in 0..10 {
            assert_eq!(b.receive().await.unwrap(), Some(Payload::Int(i)));
        }
    }

    #[tokio::test]
    async fn test_concurrent_sends_do_not_interleave() {
        let (a, b) = pair();
        let a = Arc::new(a);
        let big = Payload::String("z".repeat(256 * 1024));

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let a = a.clone();
            let big = big.clone();
            tasks.push(tokio::spawn(async move { a.send(&big).await }));
        }

        for _ in 0..4 {
            assert_eq!(b.receive().await.unwrap(), Some(big.clone()));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_fires_once() {
        let (a, _b) = pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        a.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        a.close();
        a.close();
        assert!(a.is_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(matches!(a.send(&Payload::Null).await, Err(IpcError::ChannelClosed)));
        assert!(matches!(a.receive().await, Err(IpcError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_peer_shutdown_ends_stream_and_closes() {
        let (a, b) = pair();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        b.on_close(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        a.send(&Payload::Int(1)).await.unwrap();
        a.shutdown().await;

        assert_eq!(b.receive().await.unwrap(), Some(Payload::Int(1)));
        assert_eq!(b.receive().await.unwrap(), None);
        assert!(b.is_closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(matches!(b.send(&Payload::Null).await, Err(IpcError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_local_close_wakes_pending_receive() {
        let (a, _b) = pair();
        let a = Arc::new(a);
        let pending = {
            let a = a.clone();
            tokio::spawn(async move { a.receive().await })
        };

        tokio::task::yield_now().await;
        a.close();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), pending)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(IpcError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_close_during_send_releases_stream_after_write() {
        use tokio::io::AsyncReadExt;

        let (raw_a, mut raw_b) = UnixStream::pair().unwrap();
        let a = Arc::new(Channel::<Payload>::new(PlatformSocket::Unix(raw_a), DEFAULT_MAX_FRAME_SIZE));
        let big = Payload::String("x".repeat(4 * 1024 * 1024));

        let sending = {
            let a = a.clone();
            tokio::spawn(async move { a.send(&big).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        a.close();

        let mut received = Vec::new();
        let read = tokio::time::timeout(std::time::Duration::from_secs(5), raw_b.read_to_end(&mut received))
            .await
            .expect("peer never saw end of stream");
        read.unwrap();
        assert!(received.len() > 4 * 1024 * 1024);
        sending.await.unwrap().unwrap();
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn test_abandoned_receive_keeps_partial_frame() {
        let (raw_a, raw_b) = UnixStream::pair().unwrap();
        let b: Channel<Payload> = Channel::new(PlatformSocket::Unix(raw_b), DEFAULT_MAX_FRAME_SIZE);
        let mut raw_a = raw_a;

        let frame = codec::encode(&Payload::from("split"), DEFAULT_MAX_FRAME_SIZE).unwrap();
        let (head, tail) = frame.split_at(3);
        raw_a.write_all(head).await.unwrap();

        let first = tokio::time::timeout(std::time::Duration::from_millis(50), b.receive()).await;
        assert!(first.is_err(), "receive should still be waiting");

        raw_a.write_all(tail).await.unwrap();
        assert_eq!(b.receive().await.unwrap(), Some(Payload::from("split")));
    }
}
