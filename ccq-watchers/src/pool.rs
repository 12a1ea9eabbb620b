use std::sync::Arc;
use std::time::Instant;

use ccq_messages::ChainId;
use ccq_messages::PerChainQueryResponseInternal;
use ccq_messages::QueryStatus;
use metrics::histogram;
use tokio::sync::mpsc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::ChainWatcher;
use crate::WatcherError;
use crate::WatcherTask;

/// A fixed set of workers draining one chain's query queue.
pub struct WatcherPool {
    chain_id: ChainId,
    workers: Vec<JoinHandle<()>>,
}

impl WatcherPool {
    /// Spawns `num_workers` workers for `watcher` and returns the pool with
    /// the sending side of its queue.
    ///
    /// Responses are stamped with the pool's chain id, never with the id
    /// carried by the task, so a misrouted query shows up as a chain mismatch.
    pub fn spawn(
        watcher: Arc<dyn ChainWatcher>,
        num_workers: usize,
        queue_size: usize,
        responses: mpsc::Sender<PerChainQueryResponseInternal>,
    ) -> (Self, mpsc::Sender<WatcherTask>) {
        let chain_id = watcher.chain_id();
        let (tx, rx) = mpsc::channel(queue_size);
        let rx = Arc::new(Mutex::new(rx));

        let workers = (0..num_workers)
            .map(|worker| {
                tokio::spawn(run_worker(
                    chain_id,
                    worker,
                    Arc::clone(&watcher),
                    Arc::clone(&rx),
                    responses.clone(),
                ))
            })
            .collect();

        info!(%chain_id, num_workers, "started watcher pool");
        (Self { chain_id, workers }, tx)
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    /// Waits for all workers to exit. Workers stop once every sender of the
    /// queue has been dropped or the response channel closes.
    pub async fn join(self) {
        for worker in self.workers {
            if let Err(err) = worker.await {
                warn!(chain_id = %self.chain_id, ?err, "watcher worker panicked");
            }
        }
        debug!(chain_id = %self.chain_id, "watcher pool stopped");
    }
}

async fn run_worker(
    chain_id: ChainId,
    worker: usize,
    watcher: Arc<dyn ChainWatcher>,
    queue: Arc<Mutex<mpsc::Receiver<WatcherTask>>>,
    responses: mpsc::Sender<PerChainQueryResponseInternal>,
) {
    let chain = chain_id.to_string();
    loop {
        let task = queue.lock().await.recv().await;
        let Some(task) = task else {
            break;
        };

        let request_id = task.query.request_id.clone();
        let request_idx = task.query.request_idx;
        if task.is_cancelled() {
            debug!(%chain_id, %request_id, request_idx, "skipping cancelled query");
            continue;
        }

        let started = Instant::now();
        let result = tokio::select! {
            result = watcher.query(&task.query.request) => Some(result),
            _ = task.cancelled() => None,
        };
        let Some(result) = result else {
            debug!(%chain_id, %request_id, request_idx, "query cancelled while in flight");
            continue;
        };
        histogram!("ccq_watcher_query_duration_seconds", "chain" => chain.clone())
            .record(started.elapsed().as_secs_f64());

        let (status, response) = match result {
            Ok(response) => (QueryStatus::Success, Some(response)),
            Err(WatcherError::Retryable(err)) => {
                debug!(%chain_id, %request_id, request_idx, %err, "query needs retry");
                (QueryStatus::RetryNeeded, None)
            },
            Err(WatcherError::Fatal(err)) => {
                warn!(%chain_id, %request_id, request_idx, %err, "query failed");
                (QueryStatus::FatalError, None)
            },
        };

        let reply = PerChainQueryResponseInternal {
            request_id,
            request_idx,
            chain_id,
            status,
            response,
        };
        if responses.send(reply).await.is_err() {
            debug!(%chain_id, worker, "response channel closed");
            break;
        }
    }
    debug!(%chain_id, worker, "watcher worker exiting");
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use ccq_messages::request::EthCallData;
    use ccq_messages::request::EthCallQueryRequest;
    use ccq_messages::ChainSpecificQuery;
    use ccq_messages::ChainSpecificResponse;
    use ccq_messages::PerChainQueryInternal;
    use ccq_messages::PerChainQueryRequest;
    use ccq_messages::RequestId;

    use super::*;
    use crate::CancelSignal;
    use crate::DummyWatcher;

    /// Replays a fixed script of results, then succeeds.
    struct ScriptedWatcher {
        chain_id: ChainId,
        script: StdMutex<VecDeque<WatcherError>>,
        delay: Duration,
    }

    #[async_trait]
    impl ChainWatcher for ScriptedWatcher {
        fn chain_id(&self) -> ChainId {
            self.chain_id
        }

        async fn query(
            &self,
            query: &PerChainQueryRequest,
        ) -> Result<ChainSpecificResponse, WatcherError> {
            tokio::time::sleep(self.delay).await;
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(err) => Err(err),
                None => DummyWatcher::new(self.chain_id).query(query).await,
            }
        }
    }

    fn internal(
        chain_id: ChainId,
        idx: usize,
    ) -> PerChainQueryInternal {
        PerChainQueryInternal::new(
            RequestId::from_digest(&Default::default()),
            idx,
            PerChainQueryRequest::new(
                chain_id,
                ChainSpecificQuery::EthCall(EthCallQueryRequest {
                    block_id: "0x1".to_string(),
                    call_data: vec![EthCallData::new(Default::default(), vec![1, 2, 3, 4])],
                }),
            ),
        )
    }

    fn scripted(
        script: Vec<WatcherError>,
        delay: Duration,
    ) -> Arc<dyn ChainWatcher> {
        Arc::new(ScriptedWatcher {
            chain_id: ChainId::ETHEREUM,
            script: StdMutex::new(script.into()),
            delay,
        })
    }

    #[tokio::test]
    async fn test_pool_maps_watcher_results() -> anyhow::Result<()> {
        let (resp_tx, mut resp_rx) = mpsc::channel(10);
        let watcher = scripted(
            vec![
                WatcherError::Retryable("node behind".to_string()),
                WatcherError::Fatal("reverted".to_string()),
            ],
            Duration::ZERO,
        );
        let (pool, queue) = WatcherPool::spawn(watcher, 1, 10, resp_tx);
        let signal = CancelSignal::new();

        for idx in 0..3 {
            queue.send(signal.task(internal(ChainId::ETHEREUM, idx))).await?;
        }

        let statuses: Vec<_> = [
            resp_rx.recv().await,
            resp_rx.recv().await,
            resp_rx.recv().await,
        ]
        .into_iter()
        .map(|r| r.map(|r| (r.request_idx, r.status, r.response.is_some())))
        .collect();
        assert_eq!(
            statuses,
            vec![
                Some((0, QueryStatus::RetryNeeded, false)),
                Some((1, QueryStatus::FatalError, false)),
                Some((2, QueryStatus::Success, true)),
            ]
        );

        drop(queue);
        pool.join().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_pool_stamps_its_own_chain() -> anyhow::Result<()> {
        let (resp_tx, mut resp_rx) = mpsc::channel(10);
        let (pool, queue) = WatcherPool::spawn(scripted(vec![], Duration::ZERO), 2, 10, resp_tx);
        let signal = CancelSignal::new();

        // A query for another chain that ended up on this pool's queue.
        queue.send(signal.task(internal(ChainId::POLYGON, 0))).await?;
        let reply = resp_rx.recv().await.unwrap();
        assert_eq!(reply.chain_id, ChainId::ETHEREUM);

        drop(queue);
        pool.join().await;
        Ok(())
    }

    #[tokio::test]
    async fn test_pool_skips_cancelled_tasks() -> anyhow::Result<()> {
        let (resp_tx, mut resp_rx) = mpsc::channel(10);
        let (pool, queue) = WatcherPool::spawn(
            scripted(vec![], Duration::from_millis(200)),
            1,
            10,
            resp_tx,
        );

        let cancelled = CancelSignal::new();
        cancelled.cancel();
        queue.send(cancelled.task(internal(ChainId::ETHEREUM, 0))).await?;

        let in_flight = CancelSignal::new();
        queue.send(in_flight.task(internal(ChainId::ETHEREUM, 1))).await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        in_flight.cancel();

        let live = CancelSignal::new();
        queue.send(live.task(internal(ChainId::ETHEREUM, 2))).await?;

        let reply = resp_rx.recv().await.unwrap();
        assert_eq!(reply.request_idx, 2);
        assert_eq!(reply.status, QueryStatus::Success);

        drop(queue);
        pool.join().await;
        assert!(resp_rx.recv().await.is_none());
        Ok(())
    }
}
