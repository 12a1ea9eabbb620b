use async_trait::async_trait;
use ccq_messages::ChainId;
use ccq_messages::ChainSpecificResponse;
use ccq_messages::PerChainQueryRequest;
use thiserror::Error;

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum WatcherError {
    /// The chain could not answer right now, e.g. the RPC node is behind or
    /// unreachable. The query will be dispatched again.
    #[error("retryable watcher error: {0}")]
    Retryable(String),

    /// The query can never be answered, e.g. the block does not exist or the
    /// call reverts.
    #[error("fatal watcher error: {0}")]
    Fatal(String),
}

/// Executes sub-queries against a single chain.
///
/// Implementations are shared by all workers of a chain's pool, so they must
/// be safe to call concurrently.
#[async_trait]
pub trait ChainWatcher: Send + Sync {
    /// The chain this watcher answers for.
    fn chain_id(&self) -> ChainId;

    /// Runs `query` against the chain and returns one result per call,
    /// account or PDA, in query order.
    async fn query(
        &self,
        query: &PerChainQueryRequest,
    ) -> Result<ChainSpecificResponse, WatcherError>;
}
