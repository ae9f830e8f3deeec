use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    time::Duration,
};

use ipchub_common::{
    handshake, Address, CancellationToken, CloseSignal, IpcError, PlatformListener, PlatformSocket,
    Result,
};
use tokio::{sync::Mutex as AsyncMutex, task::JoinSet};

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Server half of the handshake: binds an address, accepts raw connections and
/// yields only those that presented the expected key.
pub struct IpcHub {
    listener:          Mutex<Option<Arc<PlatformListener>>>,
    address:           Address,
    synthesized_path:  Option<PathBuf>,
    handshake_timeout: Duration,
    pending:           AsyncMutex<JoinSet<Option<PlatformSocket>>>,
    closed:            CloseSignal,
}

impl IpcHub {
    /// Opens a listening endpoint.
    ///
    /// With no address, a private socket path is synthesized under the temp
    /// directory (loopback TCP on platforms without unix sockets). Only such
    /// a synthesized path is reported by [`IpcHub::synthesized_path`].
    pub async fn bind(address: Option<Address>, handshake_timeout: Duration) -> Result<Self> {
        let synthesize = address.is_none();
        let requested = address.unwrap_or_else(Address::synthesize);

        let listener = PlatformListener::bind(&requested).await?;
        let address = listener.local_address()?;

        let synthesized_path = match (&address, synthesize) {
            (Address::Unix(path), true) => {
                restrict_permissions(path);
                Some(path.clone())
            }
            _ => None,
        };

        tracing::info!("IPC hub listening on {}", address);

        Ok(Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            address,
            synthesized_path,
            handshake_timeout,
            pending: AsyncMutex::new(JoinSet::new()),
            closed: CloseSignal::new(),
        })
    }

    /// Accepts the next connection that presents `key`.
    ///
    /// Every raw connection is verified on its own task with its own timeout,
    /// so a client that never presents a key does not hold up others.
    /// Connections presenting another key, or none within the handshake
    /// timeout, are dropped and accepting continues. Handshakes still in
    /// flight when this returns are picked up by the next call.
    ///
    /// # Errors
    ///
    /// [`IpcError::Cancelled`] when `cancellation` fires, [`IpcError::HubClosed`]
    /// when the hub is or becomes closed.
    pub async fn accept(&self, key: &str, cancellation: &CancellationToken) -> Result<PlatformSocket> {
        let listener = self.current_listener()?;
        let mut pending = tokio::select! {
            biased;
            _ = cancellation.cancelled() => return Err(IpcError::Cancelled),
            _ = self.closed.closed() => return Err(IpcError::HubClosed),
            pending = self.pending.lock() => pending,
        };

        loop {
            tokio::select! {
                biased;
                _ = cancellation.cancelled() => return Err(IpcError::Cancelled),
                _ = self.closed.closed() => {
                    pending.abort_all();
                    return Err(IpcError::HubClosed);
                }
                Some(joined) = pending.join_next(), if !pending.is_empty() => {
                    if let Ok(Some(socket)) = joined {
                        tracing::debug!("Client authenticated on {}", self.address);
                        return Ok(socket);
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok(socket) => {
                        pending.spawn(verify_client(
                            socket,
                            key.to_owned(),
                            self.handshake_timeout,
                            self.address.to_string(),
                        ));
                    }
                    Err(e) => {
                        if self.is_closed() {
                            return Err(IpcError::HubClosed);
                        }
                        tracing::error!("Accept error on {}: {}", self.address, e);
                        tokio::select! {
                            biased;
                            _ = cancellation.cancelled() => return Err(IpcError::Cancelled),
                            _ = self.closed.closed() => return Err(IpcError::HubClosed),
                            _ = tokio::time::sleep(ACCEPT_RETRY_DELAY) => {}
                        }
                    }
                },
            }
        }
    }

    /// Closes the listening endpoint; pending and future accepts fail with
    /// [`IpcError::HubClosed`]. Idempotent.
    pub fn close(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if self.closed.close() {
            tracing::debug!("IPC hub on {} closed", self.address);
        }
        if let Ok(mut pending) = self.pending.try_lock() {
            pending.abort_all();
        }
        drop(listener);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        self.closed.on_close(callback);
    }

    /// The bound address, with any ephemeral port resolved.
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// URI of the bound address, e.g. `unix:///tmp/ipchub-….sock`.
    pub fn uri(&self) -> String {
        self.address.to_string()
    }

    /// Socket path this hub created itself and is responsible for deleting.
    pub fn synthesized_path(&self) -> Option<&PathBuf> {
        self.synthesized_path.as_ref()
    }

    pub fn generate_key() -> String {
        handshake::generate_key()
    }

    fn current_listener(&self) -> Result<Arc<PlatformListener>> {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(IpcError::HubClosed)
    }
}

impl Drop for IpcHub {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for IpcHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcHub")
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Runs the server half of the handshake on one raw connection.
///
/// Yields the socket only if it presented `key` within `timeout`.
async fn verify_client(
    mut socket: PlatformSocket,
    key: String,
    timeout: Duration,
    address: String,
) -> Option<PlatformSocket> {
    match tokio::time::timeout(timeout, handshake::verify(&mut socket, &key)).await {
        Ok(Ok(true)) => Some(socket),
        Ok(Ok(false)) => {
            tracing::warn!("Rejected connection on {}: key mismatch", address);
            None
        }
        Ok(Err(e)) => {
            tracing::warn!("Rejected connection on {}: handshake failed: {}", address, e);
            None
        }
        Err(_) => {
            tracing::warn!("Rejected connection on {}: no key within {:?}", address, timeout);
            None
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        tracing::warn!("Failed to restrict permissions on {}: {}", path.display(), e);
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path) {}

#[cfg(test)]
mod tests {
    use ipchub_common::config::DEFAULT_HANDSHAKE_TIMEOUT;
    use tokio::io::AsyncWriteExt;

    use super::*;

    #[tokio::test]
    async fn test_rejected_client_does_not_stop_accepting() {
        let hub = Arc::new(IpcHub::bind(Some(Address::loopback()), DEFAULT_HANDSHAKE_TIMEOUT).await.unwrap());
        let address = hub.address().clone();

        let accepting = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.accept("k1", &CancellationToken::new()).await })
        };

        let never = CancellationToken::new();
        let rejected = handshake::connect(&address, "wrong", &never).await;
        assert!(matches!(rejected, Err(IpcError::Authentication(_))));

        let accepted = handshake::connect(&address, "k1", &never).await;
        assert!(accepted.is_ok());
        assert!(accepting.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_silent_client_times_out() {
        let hub = Arc::new(
            IpcHub::bind(Some(Address::loopback()), Duration::from_millis(50))
                .await
                .unwrap(),
        );
        let address = hub.address().clone();
        let accepting = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.accept("k1", &CancellationToken::new()).await })
        };

        let mut silent = PlatformSocket::connect(&address).await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let _ = silent.shutdown().await;

        let accepted = handshake::connect(&address, "k1", &CancellationToken::new()).await;
        assert!(accepted.is_ok());
        assert!(accepting.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_silent_clients_do_not_delay_others() {
        let hub = Arc::new(
            IpcHub::bind(Some(Address::loopback()), Duration::from_secs(30))
                .await
                .unwrap(),
        );
        let address = hub.address().clone();
        let accepting = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.accept("k1", &CancellationToken::new()).await })
        };

        let _silent_a = PlatformSocket::connect(&address).await.unwrap();
        let _silent_b = PlatformSocket::connect(&address).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let accepted = tokio::time::timeout(
            Duration::from_secs(2),
            handshake::connect(&address, "k1", &CancellationToken::new()),
        )
        .await
        .expect("authenticated client waited behind silent ones");
        assert!(accepted.is_ok());

        let socket = tokio::time::timeout(Duration::from_secs(2), accepting)
            .await
            .unwrap()
            .unwrap();
        assert!(socket.is_ok());
        hub.close();
    }

    #[tokio::test]
    async fn test_close_fails_pending_accept() {
        let hub = Arc::new(IpcHub::bind(Some(Address::loopback()), DEFAULT_HANDSHAKE_TIMEOUT).await.unwrap());
        let pending = {
            let hub = hub.clone();
            tokio::spawn(async move { hub.accept("k1", &CancellationToken::new()).await })
        };
        tokio::task::yield_now().await;

        hub.close();
        hub.close();
        assert!(hub.is_closed());
        assert!(matches!(pending.await.unwrap(), Err(IpcError::HubClosed)));
        assert!(matches!(
            hub.accept("k1", &CancellationToken::new()).await,
            Err(IpcError::HubClosed)
        ));
    }

    #[tokio::test]
    async fn test_cancellation_fails_accept_without_closing() {
        let hub = IpcHub::bind(Some(Address::loopback()), DEFAULT_HANDSHAKE_TIMEOUT).await.unwrap();
        let cancellation = CancellationToken::new();
        cancellation.cancel();
        assert!(matches!(hub.accept("k1", &cancellation).await, Err(IpcError::Cancelled)));
        assert!(!hub.is_closed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_only_synthesized_paths_are_owned() {
        let hub = IpcHub::bind(None, DEFAULT_HANDSHAKE_TIMEOUT).await.unwrap();
        let path = hub.synthesized_path().cloned().unwrap();
        assert!(path.exists());
        assert_eq!(hub.address(), &Address::Unix(path.clone()));
        drop(hub);
        let _ = std::fs::remove_file(path);

        let tmp = tempfile::TempDir::new().unwrap();
        let supplied = Address::unix(tmp.path().join("given.sock"));
        let hub = IpcHub::bind(Some(supplied.clone()), DEFAULT_HANDSHAKE_TIMEOUT).await.unwrap();
        assert!(hub.synthesized_path().is_none());
        assert_eq!(hub.address(), &supplied);
    }
}
