//! Connection observation hooks and one-shot lifecycle signals.

use crate::error::RpcError;
use crate::packet::Packet;
use tokio::sync::watch;

/// Observer of connection activity.
///
/// All methods default to no-ops. Observers see traffic but have no say in
/// correlation; they are called inline, so keep them cheap.
pub trait ConnectionObserver: Send + Sync + 'static {
    fn on_message_sent(&self, _packet: &Packet) {}

    fn on_message_received(&self, _packet: &Packet) {}

    fn on_exception(&self, _error: &RpcError) {}

    fn on_connected(&self) {}

    fn on_disconnected(&self) {}
}

/// Observer that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ConnectionObserver for NoopObserver {}

/// A value that is set at most once and can be awaited by many tasks.
#[derive(Debug)]
pub struct OnceSignal<T: Clone> {
    tx: watch::Sender<Option<T>>,
}

impl<T: Clone> Default for OnceSignal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> OnceSignal<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx }
    }

    /// Set the value. Only the first call has an effect; returns whether it won.
    pub fn set(&self, value: T) -> bool {
        let mut value = Some(value);
        self.tx.send_if_modified(|slot| {
            if slot.is_some() {
                false
            } else {
                *slot = value.take();
                true
            }
        })
    }

    pub fn get(&self) -> Option<T> {
        self.tx.borrow().clone()
    }

    pub fn is_set(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// Wait until the value is set.
    pub async fn wait(&self) -> T {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(value) = rx.borrow_and_update().clone() {
                return value;
            }
            // The sender lives in `self`, so `changed()` cannot fail while we borrow it.
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}
