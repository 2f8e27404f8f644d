//! The terminal liveness signal shared by connections and channels.

use async_trait::async_trait;
use tokio::sync::watch;

/// An entity with a one-shot terminal signal.
///
/// The signal is latched: once fired it stays observable, so an observer that
/// subscribes after the fact still resolves immediately. [`Connection`]
/// implements this for transport closure; [`Channel`] implements it for the
/// idle-channel signal emitted after its last member departs.
///
/// [`Connection`]: crate::Connection
/// [`Channel`]: crate::Channel
#[async_trait]
pub trait Closable: Send + Sync {
    /// Whether the terminal signal has fired.
    fn is_closed(&self) -> bool;

    /// Resolves when the terminal signal fires; immediately if it already has.
    async fn closed(&self);
}

/// Latched one-shot signal backing [`Closable`] implementations.
///
/// Built on a `watch` channel so late subscribers observe a past firing, and
/// so the false-to-true transition happens exactly once no matter how many
/// callers race on [`fire`](Self::fire).
#[derive(Debug)]
pub(crate) struct CloseSignal {
    tx: watch::Sender<bool>,
}

impl CloseSignal {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    /// Fire the signal. Returns `true` only for the call that performed the
    /// false-to-true transition.
    pub(crate) fn fire(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub(crate) fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Re-latch to the unfired state. Used by `Channel` when a member joins
    /// after the idle signal fired, making the channel live again.
    pub(crate) fn reset(&self) {
        self.tx.send_replace(false);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    pub(crate) async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives at least as long as `self`, so this cannot fail
        // while we are borrowing it.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}
