use std::{future::Future, marker::PhantomData, sync::Arc};

use async_trait::async_trait;
use ipchub_common::{Connection, Payload};

use crate::server::Server;

/// Observer of every payload the server receives.
///
/// `listen` runs on its own task, once per payload per registered listener,
/// so a slow listener never holds up the accept loop or other listeners.
/// Errors are logged by the server and otherwise ignored.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    async fn listen(&self, payload: Payload, connection: Connection, server: Server) -> anyhow::Result<()>;
}

/// Listener backed by an async closure, see [`listener_fn`].
pub struct FnListener<F, Fut> {
    f:       F,
    _marker: PhantomData<fn() -> Fut>,
}

#[async_trait]
impl<F, Fut> Listener for FnListener<F, Fut>
where
    F: Fn(Payload, Connection, Server) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn listen(&self, payload: Payload, connection: Connection, server: Server) -> anyhow::Result<()> {
        (self.f)(payload, connection, server).await
    }
}

/// Wraps an async closure as a shareable listener.
///
/// ```no_run
/// use ipchub_server::listener_fn;
///
/// let logger = listener_fn(|payload, connection, _server| async move {
///     tracing::info!(connection = %connection.id(), ?payload, "received");
///     anyhow::Ok(())
/// });
/// ```
pub fn listener_fn<F, Fut>(f: F) -> Arc<dyn Listener>
where
    F: Fn(Payload, Connection, Server) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnListener {
        f,
        _marker: PhantomData,
    })
}

/// Identity comparison for listener handles.
pub(crate) fn same_listener(a: &Arc<dyn Listener>, b: &Arc<dyn Listener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
