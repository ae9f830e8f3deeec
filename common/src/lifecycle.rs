use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

/// Callback run once when a resource closes.
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// One-shot "closed" state with `on_close` callbacks.
///
/// Callbacks registered before closure run exactly once, on the task that
/// performs the close. Callbacks registered afterwards run immediately.
pub struct CloseSignal {
    token:     CancellationToken,
    callbacks: Mutex<Option<Vec<CloseCallback>>>,
}

impl CloseSignal {
    pub fn new() -> Self {
        Self {
            token:     CancellationToken::new(),
            callbacks: Mutex::new(Some(Vec::new())),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Marks the resource closed and runs pending callbacks.
    ///
    /// Returns true only for the call that performed the transition.
    pub fn close(&self) -> bool {
        let pending = {
            let mut callbacks = self.lock();
            let pending = callbacks.take();
            if pending.is_some() {
                self.token.cancel();
            }
            pending
        };

        match pending {
            Some(callbacks) => {
                for callback in callbacks {
                    callback();
                }
                true
            }
            None => false,
        }
    }

    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        let mut callbacks = self.lock();
        if let Some(pending) = callbacks.as_mut() {
            pending.push(Box::new(callback));
            return;
        }
        drop(callbacks);
        callback();
    }

    /// Completes once the resource is closed.
    pub async fn closed(&self) {
        self.token.cancelled().await
    }

    /// Token cancelled on close, for use in `select!` from other tasks.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Option<Vec<CloseCallback>>> {
        self.callbacks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for CloseSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CloseSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloseSignal")
            .field("closed", &self.is_closed())
            .finish()
    }
}
