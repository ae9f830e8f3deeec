use std::{io, time::Duration};

use ipchub_common::{
    config::{
        env_var, max_frame_size_from_env, ADDRESS_ENV, DEFAULT_CONNECT_TIMEOUT,
        DEFAULT_MAX_FRAME_SIZE, KEY_ENV,
    },
    handshake, Address, CancellationToken, Connection, IpcError, Payload, Result,
};

/// Configuration for the IPC client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Address of the server to connect to
    pub address:         Option<Address>,
    /// Shared secret presented during the handshake
    pub key:             Option<String>,
    /// Aborts connecting and any pending receive
    pub cancellation:    CancellationToken,
    /// Upper bound on transport connect plus handshake
    pub connect_timeout: Duration,
    /// Largest frame body accepted or produced
    pub max_frame_size:  usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address:         None,
            key:             None,
            cancellation:    CancellationToken::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_frame_size:  DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    /// Creates a client configuration with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables
    ///
    /// Reads IPCHUB_ADDRESS, IPCHUB_KEY and IPCHUB_MAX_FRAME_SIZE, the values a
    /// server publishes for out-of-band bootstrapping
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new();

        if let Some(address) = env_var(ADDRESS_ENV) {
            config.address = Some(address.parse()?);
        }
        config.key = env_var(KEY_ENV);
        config.max_frame_size = max_frame_size_from_env();

        Ok(config)
    }

    /// Set the server address
    pub fn with_address(mut self, address: impl Into<Address>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Set the shared secret key
    pub fn with_key<S: Into<String>>(mut self, key: S) -> Self {
        self.key = Some(key.into());
        self
    }

    /// Set the cancellation token
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the maximum frame size
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }
}

/// A client connected and authenticated to an ipchub server
///
/// Dropping the client (and every clone of its [`Connection`]) disconnects it.
#[derive(Debug)]
pub struct IpcClient {
    address:    Address,
    connection: Connection,
}

impl IpcClient {
    /// Connects to `address` and authenticates with `key` using default settings
    pub async fn connect(address: impl Into<Address>, key: impl Into<String>) -> Result<Self> {
        Self::with_config(ClientConfig::new().with_address(address).with_key(key)).await
    }

    /// Connects using the given configuration
    ///
    /// # Errors
    ///
    /// [`IpcError::InvalidAddress`] when no address is configured,
    /// [`IpcError::Connect`] on transport failure or timeout,
    /// [`IpcError::Authentication`] when the key is rejected.
    pub async fn with_config(config: ClientConfig) -> Result<Self> {
        let address = config
            .address
            .ok_or_else(|| IpcError::InvalidAddress("no server address configured".to_string()))?;
        let key = config.key.unwrap_or_default();

        tracing::debug!("Connecting to IPC server at {}", address);

        let connecting = handshake::connect(&address, &key, &config.cancellation);
        let socket = match tokio::time::timeout(config.connect_timeout, connecting).await {
            Ok(socket) => socket?,
            Err(_) => {
                return Err(IpcError::Connect {
                    address: address.to_string(),
                    source:  io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("no handshake within {:?}", config.connect_timeout),
                    ),
                });
            }
        };

        let connection = Connection::new(socket, config.cancellation, config.max_frame_size);
        tracing::info!(connection = %connection.id(), "Connected to IPC server at {}", address);

        Ok(Self {
            address,
            connection,
        })
    }

    pub async fn send(&self, payload: impl Into<Payload>) -> Result<()> {
        self.connection.send(payload).await
    }

    /// Receives the next payload, `None` once the server closed the connection
    pub async fn receive(&self) -> Result<Option<Payload>> {
        self.connection.receive().await
    }

    /// Sends the close signal and closes the connection. Idempotent.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await
    }

    pub fn is_closed(&self) -> bool {
        self.connection.is_closed()
    }

    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        self.connection.on_close(callback);
    }

    /// Asks the server to shut down, then disconnects
    ///
    /// The server closes this connection and stops accepting once it has
    /// processed the request.
    pub async fn shutdown_server(&self) -> Result<()> {
        tracing::info!("Requesting shutdown of IPC server at {}", self.address);
        self.connection.send(Payload::Shutdown).await?;
        self.connection.disconnect().await;
        Ok(())
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The underlying connection, e.g. to hand to a task that receives
    /// concurrently with sends
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}
