use std::{env, time::Duration};

/// Prefix of socket files synthesized under the temp directory
pub const SOCKET_PREFIX: &str = "ipchub-";
/// Extension of socket files synthesized under the temp directory
pub const SOCKET_SUFFIX: &str = ".sock";

/// Env var carrying the server URI to clients started out-of-band
pub const ADDRESS_ENV: &str = "IPCHUB_ADDRESS";
/// Env var carrying the shared secret key
pub const KEY_ENV: &str = "IPCHUB_KEY";
/// Env var overriding the maximum frame size in bytes
pub const MAX_FRAME_SIZE_ENV: &str = "IPCHUB_MAX_FRAME_SIZE";

/// Largest frame body accepted or produced by default (16 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Random bytes in a generated key (hex encoded to twice this length)
pub const KEY_BYTES: usize = 32;

/// Random bytes in the suffix of a synthesized socket path
pub const SOCKET_SUFFIX_BYTES: usize = 10;

/// Largest key a connecting client may present
pub const MAX_KEY_LEN: usize = 1024;

/// Byte the server writes back once a presented key is accepted
pub const HANDSHAKE_ACK: u8 = 0x01;

/// How long the server waits for a freshly accepted client to present its key
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long a client waits for the transport connect plus handshake
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reads a non-empty env var.
pub fn env_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Maximum frame size from `IPCHUB_MAX_FRAME_SIZE`, falling back to the
/// default when unset or unparsable.
pub fn max_frame_size_from_env() -> usize {
    match env_var(MAX_FRAME_SIZE_ENV) {
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(size) if size > 0 => size,
            _ => {
                tracing::warn!("Ignoring invalid {}={:?}", MAX_FRAME_SIZE_ENV, raw);
                DEFAULT_MAX_FRAME_SIZE
            }
        },
        None => DEFAULT_MAX_FRAME_SIZE,
    }
}
