//! Length-prefixed frame codec.
//!
//! ```text
//! [u32 LE length] [bincode body: length bytes]
//! ```
//!
//! Reads go through a [`FrameDecoder`] that buffers partial input, so a read
//! that is abandoned half way (cancelled, timed out) never loses bytes and a
//! caller never sees a partial frame.

use serde::{de::DeserializeOwned, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{is_disconnect_kind, IpcError, Result};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX: usize = 4;

const READ_CHUNK: usize = 8 * 1024;

/// Serializes `value` and prepends its length.
pub fn encode<T: Serialize>(value: &T, max_frame_size: usize) -> Result<Vec<u8>> {
    let body = bincode::serialize(value)?;
    if body.len() > max_frame_size || body.len() > u32::MAX as usize {
        return Err(IpcError::FrameTooLarge {
            size: body.len(),
            max:  max_frame_size,
        });
    }

    let mut frame = Vec::with_capacity(LENGTH_PREFIX + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Deserializes one frame body.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    bincode::deserialize(body).map_err(|e| IpcError::Framing(format!("undecodable frame: {e}")))
}

/// Reads the next frame from `reader` and deserializes it.
///
/// Returns `Ok(None)` when the stream ends cleanly on a frame boundary and
/// [`IpcError::Framing`] when it ends mid-frame.
pub async fn decode<T, R>(reader: &mut R, decoder: &mut FrameDecoder) -> Result<Option<T>>
where
    T: DeserializeOwned,
    R: AsyncRead + Unpin,
{
    match read_frame(reader, decoder).await? {
        Some(body) => decode_body(&body).map(Some),
        None => Ok(None),
    }
}

/// Reads the next complete frame body from `reader`.
///
/// Cancel safe: bytes read before the future is dropped stay in `decoder`.
pub async fn read_frame<R>(reader: &mut R, decoder: &mut FrameDecoder) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        if let Some(body) = decoder.next_frame()? {
            return Ok(Some(body));
        }

        let n = match reader.read(&mut chunk).await {
            Ok(n) => n,
            Err(e) if is_disconnect_kind(e.kind()) => 0,
            Err(e) => return Err(e.into()),
        };

        if n == 0 {
            if decoder.has_partial() {
                return Err(IpcError::Framing(format!(
                    "stream ended mid-frame with {} buffered bytes",
                    decoder.buffered()
                )));
            }
            return Ok(None);
        }

        decoder.feed(&chunk[..n]);
    }
}

/// Incremental frame decoder that handles partial reads.
#[derive(Debug)]
pub struct FrameDecoder {
    buf:            Vec<u8>,
    max_frame_size: usize,
}

impl FrameDecoder {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_size,
        }
    }

    /// Appends raw bytes read from the stream.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extracts the next complete frame body, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`IpcError::Framing`] for a zero-length or oversized prefix.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buf.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if length == 0 {
            return Err(IpcError::Framing("zero-length frame".to_string()));
        }
        if length > self.max_frame_size {
            return Err(IpcError::Framing(format!(
                "frame of {length} bytes exceeds limit of {}",
                self.max_frame_size
            )));
        }

        let total = LENGTH_PREFIX + length;
        if self.buf.len() < total {
            return Ok(None);
        }

        let body = self.buf[LENGTH_PREFIX..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(body))
    }

    /// Returns true if part of a frame is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}
