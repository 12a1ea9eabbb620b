use ccq_messages::PerChainQueryInternal;
use tokio::sync::watch;

/// Cancellation signal shared by all sub-queries of one request.
///
/// Dropping the signal cancels as well, so a request that is removed from
/// the pending store never leaves live work behind.
#[derive(Debug)]
pub struct CancelSignal(watch::Sender<bool>);

impl CancelSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self(tx)
    }

    /// Wraps `query` into a task observing this signal.
    pub fn task(
        &self,
        query: PerChainQueryInternal,
    ) -> WatcherTask {
        WatcherTask {
            query,
            cancelled: self.0.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

impl Default for CancelSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A sub-query queued for a chain's worker pool.
#[derive(Debug)]
pub struct WatcherTask {
    pub query: PerChainQueryInternal,
    cancelled: watch::Receiver<bool>,
}

impl WatcherTask {
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow() || self.cancelled.has_changed().is_err()
    }

    /// Resolves once the owning request is cancelled or dropped.
    pub async fn cancelled(&self) {
        let mut cancelled = self.cancelled.clone();
        // An error means the sender is gone, which counts as cancelled.
        let _ = cancelled.wait_for(|cancelled| *cancelled).await;
    }
}
