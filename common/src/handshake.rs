//! Shared-key handshake.
//!
//! The client writes `[u32 LE length][key bytes]` as the first unit on a new
//! stream. The server compares the key byte-for-byte and answers with a
//! single [`HANDSHAKE_ACK`] byte, or closes the stream on mismatch.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::{
    address::Address,
    config::{HANDSHAKE_ACK, KEY_BYTES, MAX_KEY_LEN},
    error::{is_disconnect_kind, IpcError, Result},
    platform_socket::PlatformSocket,
};

/// Produces a fresh random key (32 random bytes, hex encoded).
pub fn generate_key() -> String {
    hex::encode(rand::random::<[u8; KEY_BYTES]>())
}

/// Writes the key frame a client presents on connect.
pub async fn write_key<W: AsyncWrite + Unpin>(writer: &mut W, key: &str) -> io::Result<()> {
    let bytes = key.as_bytes();
    if bytes.len() > MAX_KEY_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("key of {} bytes exceeds limit of {MAX_KEY_LEN}", bytes.len()),
        ));
    }
    writer.write_u32_le(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

/// Reads the key frame presented by a connecting client.
pub async fn read_key<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Vec<u8>> {
    let len = reader.read_u32_le().await? as usize;
    if len > MAX_KEY_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("presented key of {len} bytes exceeds limit of {MAX_KEY_LEN}"),
        ));
    }
    let mut key = vec![0u8; len];
    reader.read_exact(&mut key).await?;
    Ok(key)
}

/// Server side: reads the presented key and acknowledges it if it matches.
///
/// Returns `Ok(false)` on mismatch; the caller drops the stream.
pub async fn verify<S>(stream: &mut S, expected: &str) -> io::Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let presented = read_key(stream).await?;
    if !keys_match(&presented, expected.as_bytes()) {
        return Ok(false);
    }
    stream.write_u8(HANDSHAKE_ACK).await?;
    stream.flush().await?;
    Ok(true)
}

/// Client side: presents `key` and waits for the acknowledgement.
pub async fn present_key<S>(stream: &mut S, key: &str, peer: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if let Err(e) = write_key(stream, key).await {
        if is_disconnect_kind(e.kind()) {
            return Err(IpcError::Authentication(peer.to_string()));
        }
        return Err(e.into());
    }

    match stream.read_u8().await {
        Ok(HANDSHAKE_ACK) => Ok(()),
        Ok(other) => Err(IpcError::Authentication(format!(
            "{peer} (unexpected handshake reply 0x{other:02x})"
        ))),
        Err(e) if is_disconnect_kind(e.kind()) => Err(IpcError::Authentication(peer.to_string())),
        Err(e) => Err(e.into()),
    }
}

/// Connects to a hub at `address` and authenticates with `key`.
///
/// # Errors
///
/// [`IpcError::Connect`] for transport failures, [`IpcError::Authentication`]
/// when the server rejects the key, [`IpcError::Cancelled`] if `cancellation`
/// fires first.
pub async fn connect(
    address: &Address,
    key: &str,
    cancellation: &CancellationToken,
) -> Result<PlatformSocket> {
    let peer = address.to_string();
    let attempt = async {
        let mut socket = PlatformSocket::connect(address).await?;
        present_key(&mut socket, key, &peer).await?;
        Ok::<_, IpcError>(socket)
    };

    tokio::select! {
        biased;
        _ = cancellation.cancelled() => Err(IpcError::Cancelled),
        result = attempt => {
            if result.is_ok() {
                tracing::debug!("Handshake with {} completed", peer);
            }
            result
        }
    }
}

/// Compares keys without short-circuiting on the first differing byte.
fn keys_match(presented: &[u8], expected: &[u8]) -> bool {
    if presented.len() != expected.len() {
        return false;
    }
    presented
        .iter()
        .zip(expected)
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}
