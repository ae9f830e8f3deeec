use std::time::Duration;

use ipchub_common::{
    config::{
        env_var, max_frame_size_from_env, ADDRESS_ENV, DEFAULT_HANDSHAKE_TIMEOUT,
        DEFAULT_MAX_FRAME_SIZE, KEY_ENV,
    },
    Address, CancellationToken, Result,
};

/// Configuration for an IPC server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on; synthesized when `None`
    pub address:           Option<Address>,
    /// Shared secret clients must present; generated when `None`
    pub key:               Option<String>,
    /// Aborts every accept (and every receive on accepted connections)
    pub cancellation:      CancellationToken,
    /// How long a new client has to present its key
    pub handshake_timeout: Duration,
    /// Largest frame body accepted or produced
    pub max_frame_size:    usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address:           None,
            key:               None,
            cancellation:      CancellationToken::new(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_frame_size:    DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ServerConfig {
    /// Creates a server configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables
    ///
    /// Reads IPCHUB_ADDRESS, IPCHUB_KEY and IPCHUB_MAX_FRAME_SIZE
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new();

        if let Some(address) = env_var(ADDRESS_ENV) {
            config.address = Some(address.parse()?);
        }
        config.key = env_var(KEY_ENV);
        config.max_frame_size = max_frame_size_from_env();

        Ok(config)
    }

    /// Set the listening address
    pub fn with_address(mut self, address: impl Into<Address>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Set the shared secret key
    pub fn with_key<S: Into<String>>(mut self, key: S) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the server-wide cancellation token
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the maximum frame size
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}
