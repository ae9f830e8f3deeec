use std::{
    fmt,
    panic::AssertUnwindSafe,
    path::PathBuf,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc, Mutex, MutexGuard, RwLock,
    },
};

use futures_util::FutureExt;
use ipchub_common::{
    config::MAX_KEY_LEN,
    handshake, Address, CancellationToken, CloseSignal, Connection, IpcError, Payload, Result,
};
use tokio::task::JoinHandle;

use crate::{
    config::ServerConfig,
    hub::IpcHub,
    listener::{same_listener, Listener},
};

/// Hook the embedding application may use to restart the server process.
pub type RestartHook = Box<dyn FnOnce() + Send + 'static>;

/// Lifecycle of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Binding,
    Listening,
    Closing,
    Closed,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Binding,
            1 => ServerState::Listening,
            2 => ServerState::Closing,
            _ => ServerState::Closed,
        }
    }
}

/// Why a connection's drain loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainEnd {
    PeerClosed,
    Shutdown,
    ServerClosed,
    Failed,
}

/// An IPC server that authenticates clients with a shared key and fans every
/// received payload out to the registered listeners.
///
/// `Server` is a cheap handle; clones refer to the same server. The server is
/// closed when [`Server::close`] is called, when a client sends
/// [`Payload::Shutdown`], or when the last handle is dropped.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

struct Inner {
    hub:            IpcHub,
    key:            String,
    cancellation:   CancellationToken,
    max_frame_size: usize,
    state:          AtomicU8,
    listeners:      RwLock<Vec<Arc<dyn Listener>>>,
    restart_hook:   Mutex<Option<RestartHook>>,
    to_unlink:      Mutex<Option<PathBuf>>,
    closed:         CloseSignal,
}

impl Server {
    /// Binds the listening endpoint described by `config`.
    ///
    /// # Errors
    ///
    /// [`IpcError::InvalidKey`] when the key exceeds [`MAX_KEY_LEN`] bytes,
    /// [`IpcError::Bind`] when the address cannot be bound.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let key = config.key.unwrap_or_else(handshake::generate_key);
        if key.len() > MAX_KEY_LEN {
            return Err(IpcError::InvalidKey(format!(
                "{} bytes exceeds limit of {MAX_KEY_LEN}",
                key.len()
            )));
        }
        let hub = IpcHub::bind(config.address, config.handshake_timeout).await?;
        let to_unlink = hub.synthesized_path().cloned();

        let inner = Inner {
            hub,
            key,
            cancellation: config.cancellation,
            max_frame_size: config.max_frame_size,
            state: AtomicU8::new(ServerState::Binding as u8),
            listeners: RwLock::new(Vec::new()),
            restart_hook: Mutex::new(None),
            to_unlink: Mutex::new(to_unlink),
            closed: CloseSignal::new(),
        };
        inner.state.store(ServerState::Listening as u8, Ordering::SeqCst);

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Accepts one authenticated connection.
    ///
    /// # Errors
    ///
    /// [`IpcError::HubClosed`] once the server is closed, [`IpcError::Cancelled`]
    /// if the server-wide cancellation fires.
    pub async fn accept(&self) -> Result<Connection> {
        let socket = self
            .inner
            .hub
            .accept(&self.inner.key, &self.inner.cancellation)
            .await?;
        let connection = Connection::new(
            socket,
            self.inner.cancellation.clone(),
            self.inner.max_frame_size,
        );
        tracing::info!(connection = %connection.id(), "Client connected to {}", self.uri());
        Ok(connection)
    }

    /// Runs the accept loop until the server closes.
    ///
    /// Each accepted connection is drained on its own task. Returns `Ok(())`
    /// once the server is closed; server-wide cancellation closes the server
    /// and returns [`IpcError::Cancelled`].
    pub async fn run(&self) -> Result<()> {
        tracing::info!("IPC server accepting connections on {}", self.uri());

        loop {
            match self.accept().await {
                Ok(connection) => {
                    let server = self.clone();
                    tokio::spawn(async move { server.drain(connection).await });
                }
                Err(IpcError::HubClosed) => {
                    tracing::debug!("Accept loop on {} stopped", self.uri());
                    return Ok(());
                }
                Err(e) => {
                    tracing::error!("Accept loop on {} failed: {}", self.uri(), e);
                    self.close();
                    return Err(e);
                }
            }
        }
    }

    /// Runs the accept loop on a background task.
    ///
    /// Dropping the returned handle closes the server.
    pub fn spawn(&self) -> ServerHandle {
        let server = self.clone();
        let task = tokio::spawn(async move { server.run().await });
        ServerHandle {
            server: self.clone(),
            task:   Some(task),
        }
    }

    /// Receives from `connection` until it ends, dispatching each payload.
    async fn drain(&self, connection: Connection) {
        let id = connection.id();
        let server_closed = self.inner.closed.token();

        let end = loop {
            let received = tokio::select! {
                biased;
                _ = server_closed.cancelled() => break DrainEnd::ServerClosed,
                received = connection.receive() => received,
            };

            match received {
                Ok(Some(Payload::Shutdown)) => {
                    tracing::info!(connection = %id, "Shutdown requested by client");
                    break DrainEnd::Shutdown;
                }
                Ok(Some(payload)) => self.dispatch(payload, &connection),
                Ok(None) => break DrainEnd::PeerClosed,
                Err(e) if e.is_disconnect() => {
                    tracing::debug!(connection = %id, "Connection ended: {}", e);
                    break DrainEnd::PeerClosed;
                }
                Err(IpcError::Cancelled) => {
                    tracing::debug!(connection = %id, "Receive cancelled");
                    break DrainEnd::ServerClosed;
                }
                Err(e) => {
                    tracing::error!(connection = %id, "Receive failed: {}", e);
                    break DrainEnd::Failed;
                }
            }
        };

        connection.disconnect().await;
        tracing::debug!(connection = %id, "Drain finished: {:?}", end);

        if end == DrainEnd::Shutdown {
            if self.take_restart_hook().is_some() {
                tracing::debug!("Restart hook removed by shutdown request");
            }
            self.close();
        }
    }

    /// Hands `payload` to every registered listener, each on its own task.
    ///
    /// Listeners are snapshotted first, so registrations changed mid-dispatch
    /// only affect later payloads.
    fn dispatch(&self, payload: Payload, connection: &Connection) {
        let listeners = self.listeners_snapshot();
        tracing::trace!(
            connection = %connection.id(),
            "Dispatching payload to {} listener(s)",
            listeners.len()
        );

        for listener in listeners {
            let payload = payload.clone();
            let connection = connection.clone();
            let server = self.clone();
            tokio::spawn(async move {
                let id = connection.id();
                let call = listener.listen(payload, connection, server);
                match AssertUnwindSafe(call).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(connection = %id, "Listener failed: {:#}", e),
                    Err(_) => tracing::error!(connection = %id, "Listener panicked"),
                }
            });
        }
    }

    /// Registers a listener.
    ///
    /// # Errors
    ///
    /// [`IpcError::ListenerAlreadyRegistered`] if this exact listener is
    /// already registered.
    pub fn add_listener(&self, listener: Arc<dyn Listener>) -> Result<()> {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if listeners.iter().any(|l| same_listener(l, &listener)) {
            return Err(IpcError::ListenerAlreadyRegistered);
        }
        listeners.push(listener);
        Ok(())
    }

    /// Unregisters a listener and returns it.
    ///
    /// # Errors
    ///
    /// [`IpcError::ListenerNotFound`] if it was not registered.
    pub fn remove_listener(&self, listener: &Arc<dyn Listener>) -> Result<Arc<dyn Listener>> {
        let mut listeners = self
            .inner
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let index = listeners
            .iter()
            .position(|l| same_listener(l, listener))
            .ok_or(IpcError::ListenerNotFound)?;
        Ok(listeners.remove(index))
    }

    pub fn listener_count(&self) -> usize {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn Listener>> {
        self.inner
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Installs the hook the application runs to restart the server.
    ///
    /// A [`Payload::Shutdown`] request removes it, so the application can tell
    /// a requested shutdown from one it should recover from.
    pub fn set_restart_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.restart_hook() = Some(Box::new(hook));
    }

    pub fn take_restart_hook(&self) -> Option<RestartHook> {
        self.restart_hook().take()
    }

    pub fn has_restart_hook(&self) -> bool {
        self.restart_hook().is_some()
    }

    fn restart_hook(&self) -> MutexGuard<'_, Option<RestartHook>> {
        self.inner
            .restart_hook
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Closes the server. Idempotent.
    ///
    /// Fails pending accepts, stops every drain task (each disconnects its
    /// connection), deletes a synthesized socket file and fires `on_close`.
    pub fn close(&self) {
        self.inner.close();
    }

    /// Returns whether the hub has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.hub.is_closed()
    }

    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        self.inner.closed.on_close(callback);
    }

    /// Completes once the server is closed.
    pub async fn closed(&self) {
        self.inner.closed.closed().await
    }

    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    pub fn address(&self) -> &Address {
        self.inner.hub.address()
    }

    pub fn uri(&self) -> String {
        self.inner.hub.uri()
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn generate_key() -> String {
        handshake::generate_key()
    }
}

impl Inner {
    fn close(&self) {
        let transitioned = self
            .state
            .compare_exchange(
                ServerState::Listening as u8,
                ServerState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();
        if !transitioned {
            return;
        }

        tracing::info!("Closing IPC server on {}", self.hub.uri());
        self.hub.close();
        self.unlink();
        self.state.store(ServerState::Closed as u8, Ordering::SeqCst);
        self.closed.close();
    }

    fn unlink(&self) {
        let path = self
            .to_unlink
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(path) = path {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!("Removed socket file {}", path.display()),
                Err(e) => tracing::debug!("Could not remove socket file {}: {}", path.display(), e),
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("address", self.address())
            .field("state", &self.state())
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// Handle to a server whose accept loop runs in the background.
///
/// Dropping the handle closes the server.
pub struct ServerHandle {
    server: Server,
    task:   Option<JoinHandle<Result<()>>>,
}

impl ServerHandle {
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Closes the server and waits for the accept loop to finish.
    pub async fn shutdown(mut self) -> Result<()> {
        self.server.close();
        self.join().await
    }

    /// Waits for the accept loop to finish without closing the server.
    pub async fn join(&mut self) -> Result<()> {
        match self.task.take() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => {
                    tracing::error!("Accept loop task failed: {}", e);
                    Ok(())
                }
            },
            None => Ok(()),
        }
    }
}

impl std::ops::Deref for ServerHandle {
    type Target = Server;

    fn deref(&self) -> &Server {
        &self.server
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.server.close();
    }
}
