use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use crossbeam_channel::{bounded, select, Receiver, Sender};

use crate::{
    archiver::ItemStats, backend::node::Node, error::ArchiverErrorKind, PackratResult,
};

/// The result of saving one item, carried by a [`FutureNode`].
#[derive(Clone, Debug)]
pub(crate) struct SavedItem {
    /// The finalized node.
    pub(crate) node: Node,
    /// The stats accumulated while saving the item.
    pub(crate) stats: ItemStats,
}

pub(crate) type FutureResult = PackratResult<SavedItem>;

/// A write-once placeholder for the eventual result of a concurrent save operation.
///
/// A `FutureNode` either carries a pre-computed result or is backed by a
/// single-slot channel which will carry that result exactly once. Taking the
/// result consumes the future.
#[derive(Debug)]
pub(crate) enum FutureNode {
    /// The result is already known.
    Ready(FutureResult),
    /// The result will be delivered on this channel.
    Pending(Receiver<FutureResult>),
}

impl FutureNode {
    /// Creates a pre-satisfied future.
    pub(crate) fn ready(result: FutureResult) -> Self {
        Self::Ready(result)
    }

    /// Creates a pending future along with the sending side of its result slot.
    pub(crate) fn pending() -> (Self, Sender<FutureResult>) {
        let (tx, rx) = bounded(1);
        (Self::Pending(rx), tx)
    }

    /// Takes the result, blocking until it is available.
    ///
    /// # Errors
    ///
    /// * [`ArchiverErrorKind::Cancelled`] - If the token was cancelled or the producer went away.
    ///
    /// [`ArchiverErrorKind::Cancelled`]: crate::error::ArchiverErrorKind::Cancelled
    pub(crate) fn take(self, cancel: &CancelToken) -> FutureResult {
        match self {
            Self::Ready(result) => result,
            Self::Pending(rx) => select! {
                recv(rx) -> result => {
                    result.unwrap_or_else(|_| Err(ArchiverErrorKind::Cancelled.into()))
                }
                recv(cancel.wait()) -> _ => Err(ArchiverErrorKind::Cancelled.into()),
            },
        }
    }
}

/// A cancellation token shared by the scheduler and all worker pools.
///
/// Cancelling makes every pending [`FutureNode::take`] resolve with the
/// cancellation error and lets workers drain without processing further jobs.
#[derive(Clone, Debug)]
pub struct CancelToken {
    /// Whether the token was cancelled.
    cancelled: Arc<AtomicBool>,
    /// Held by the token; dropped on cancellation, which closes `rx`.
    tx: Arc<Mutex<Option<Sender<()>>>>,
    /// Closed exactly when the token is cancelled.
    rx: Receiver<()>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    /// Creates a new, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = bounded(0);
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(Mutex::new(Some(tx))),
            rx,
        }
    }

    /// Cancels the token.
    ///
    /// This is idempotent and never blocks.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Ok(mut guard) = self.tx.lock() {
            _ = guard.take();
        }
    }

    /// Whether the token was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// A channel which is closed exactly when the token is cancelled.
    pub(crate) fn wait(&self) -> &Receiver<()> {
        &self.rx
    }
}
