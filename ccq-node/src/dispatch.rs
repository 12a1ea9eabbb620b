use std::collections::BTreeMap;
use std::collections::HashMap;

use ccq_messages::ChainId;
use ccq_messages::QueryRequest;
use ccq_watchers::WatcherTask;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::config::ChainConfig;
use crate::error::QueryError;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChainRoute {
    pub chain_id: ChainId,
    pub num_workers: usize,
    pub enabled: bool,
}

/// Static per-chain settings, fixed for the lifetime of the process.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainDispatchTable {
    routes: BTreeMap<ChainId, ChainRoute>,
}

impl ChainDispatchTable {
    pub fn new(routes: impl IntoIterator<Item = ChainRoute>) -> Self {
        Self {
            routes: routes.into_iter().map(|r| (r.chain_id, r)).collect(),
        }
    }

    pub fn from_config(chains: &[ChainConfig]) -> Self {
        Self::new(chains.iter().map(|c| {
            ChainRoute {
                chain_id: c.chain_id,
                num_workers: c.num_workers,
                enabled: c.enabled,
            }
        }))
    }

    /// Whether sub-queries for `chain_id` have somewhere to go.
    pub fn is_supported(
        &self,
        chain_id: ChainId,
    ) -> bool {
        self.routes.get(&chain_id).is_some_and(|r| r.enabled)
    }

    /// Enabled routes, ordered by chain id.
    pub fn enabled_routes(&self) -> impl Iterator<Item = &ChainRoute> {
        self.routes.values().filter(|r| r.enabled)
    }

    /// Fails on the first sub-query without a route.
    pub fn check_request(
        &self,
        request: &QueryRequest,
    ) -> Result<(), QueryError> {
        match request
            .per_chain_queries
            .iter()
            .position(|pcq| !self.is_supported(pcq.chain_id))
        {
            Some(request_idx) => {
                Err(QueryError::Unsupported {
                    request_idx,
                    chain_id: request.per_chain_queries[request_idx].chain_id,
                })
            },
            None => Ok(()),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum DispatchError {
    NoRoute,
    QueueFull,
    QueueClosed,
}

/// The input queues of the per-chain worker pools.
#[derive(Debug, Default)]
pub struct ChainQueues {
    queues: HashMap<ChainId, mpsc::Sender<WatcherTask>>,
}

impl ChainQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        chain_id: ChainId,
        queue: mpsc::Sender<WatcherTask>,
    ) {
        self.queues.insert(chain_id, queue);
    }

    /// Queues `task` without waiting.
    pub fn try_dispatch(
        &self,
        task: WatcherTask,
    ) -> Result<(), DispatchError> {
        let queue = self
            .queues
            .get(&task.query.chain_id())
            .ok_or(DispatchError::NoRoute)?;
        queue.try_send(task).map_err(|err| {
            match err {
                TrySendError::Full(_) => DispatchError::QueueFull,
                TrySendError::Closed(_) => DispatchError::QueueClosed,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use ccq_messages::request::SolanaAccountQueryRequest;
    use ccq_messages::request::SolanaDataSlice;
    use ccq_messages::ChainSpecificQuery;
    use ccq_messages::PerChainQueryInternal;
    use ccq_messages::PerChainQueryRequest;
    use ccq_messages::RequestId;
    use ccq_watchers::CancelSignal;

    use super::*;

    fn table() -> ChainDispatchTable {
        ChainDispatchTable::new([
            ChainRoute {
                chain_id: ChainId::SOLANA,
                num_workers: 2,
                enabled: true,
            },
            ChainRoute {
                chain_id: ChainId::BSC,
                num_workers: 1,
                enabled: false,
            },
        ])
    }

    fn sol_query(chain_id: ChainId) -> PerChainQueryRequest {
        PerChainQueryRequest::new(
            chain_id,
            ChainSpecificQuery::SolanaAccount(SolanaAccountQueryRequest {
                slice: SolanaDataSlice::default(),
                accounts: vec![[3u8; 32]],
            }),
        )
    }

    #[test]
    fn test_unknown_and_disabled_chains_are_unsupported() {
        let table = table();
        assert!(table.is_supported(ChainId::SOLANA));
        assert!(!table.is_supported(ChainId::BSC));
        assert!(!table.is_supported(ChainId::ETHEREUM));
        assert_eq!(table.enabled_routes().count(), 1);

        let request = QueryRequest::new(
            1,
            vec![sol_query(ChainId::SOLANA), sol_query(ChainId::BSC)],
        );
        assert_eq!(
            table.check_request(&request),
            Err(QueryError::Unsupported {
                request_idx: 1,
                chain_id: ChainId::BSC,
            })
        );
    }

    #[tokio::test]
    async fn test_try_dispatch_never_blocks() {
        let (tx, mut rx) = mpsc::channel(1);
        let mut queues = ChainQueues::new();
        queues.insert(ChainId::SOLANA, tx);

        let signal = CancelSignal::new();
        let task = |chain_id| {
            signal.task(PerChainQueryInternal::new(
                RequestId::from_digest(&Default::default()),
                0,
                sol_query(chain_id),
            ))
        };

        assert_eq!(queues.try_dispatch(task(ChainId::SOLANA)), Ok(()));
        assert_eq!(
            queues.try_dispatch(task(ChainId::SOLANA)),
            Err(DispatchError::QueueFull)
        );
        assert_eq!(
            queues.try_dispatch(task(ChainId::POLYGON)),
            Err(DispatchError::NoRoute)
        );

        assert!(rx.recv().await.is_some());
        drop(rx);
        assert_eq!(
            queues.try_dispatch(task(ChainId::SOLANA)),
            Err(DispatchError::QueueClosed)
        );
    }
}
