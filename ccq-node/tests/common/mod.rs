#![allow(dead_code)]
use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use alloy_primitives::Address;
use ccq_auth::DigestSigner;
use ccq_messages::query_request_digest;
use ccq_messages::request::EthCallData;
use ccq_messages::request::EthCallQueryRequest;
use ccq_messages::ChainId;
use ccq_messages::ChainSpecificQuery;
use ccq_messages::ChainSpecificResponse;
use ccq_messages::Environment;
use ccq_messages::PerChainQueryRequest;
use ccq_messages::PerChainQueryResponseInternal;
use ccq_messages::QueryRequest;
use ccq_messages::QueryStatus;
use ccq_messages::RequestId;
use ccq_messages::SignedQueryRequest;
use ccq_node::dispatch::ChainDispatchTable;
use ccq_node::dispatch::ChainQueues;
use ccq_node::dispatch::ChainRoute;
use ccq_node::handler::QueryHandler;
use ccq_node::handler::QueryHandlerConfig;
use ccq_node::handler::QueryOutcome;
use ccq_node::handler::QuerySubmitter;
use ccq_node::publisher::ResponseSigner;
use ccq_node::validator::ValidatedRequest;
use ccq_watchers::ChainWatcher;
use ccq_watchers::DummyWatcher;
use ccq_watchers::WatcherTask;
use metrics::Counter;
use metrics::Gauge;
use metrics::Histogram;
use metrics::Key;
use metrics::KeyName;
use metrics::Metadata;
use metrics::Recorder;
use metrics::SharedString;
use metrics::Unit;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(100);
pub const RETRY_INTERVAL: Duration = Duration::from_millis(10);
pub const AUDIT_INTERVAL: Duration = Duration::from_millis(10);

/// Records counters and gauges in memory, keyed as `name{label=value,..}`
/// with labels sorted by name.
#[derive(Clone, Default)]
pub struct CountingRecorder {
    values: Arc<Mutex<HashMap<String, Arc<AtomicU64>>>>,
}

impl CountingRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, zero if it was never touched.
    pub fn counter(
        &self,
        key: &str,
    ) -> u64 {
        self.values
            .lock()
            .unwrap()
            .get(key)
            .map_or(0, |v| v.load(Ordering::SeqCst))
    }

    pub fn gauge(
        &self,
        key: &str,
    ) -> f64 {
        f64::from_bits(self.counter(key))
    }

    fn slot(
        &self,
        key: &Key,
    ) -> Arc<AtomicU64> {
        let mut labels: Vec<_> = key
            .labels()
            .map(|l| format!("{}={}", l.key(), l.value()))
            .collect();
        labels.sort();
        let name = if labels.is_empty() {
            key.name().to_string()
        } else {
            format!("{}{{{}}}", key.name(), labels.join(","))
        };
        Arc::clone(self.values.lock().unwrap().entry(name).or_default())
    }
}

impl Recorder for CountingRecorder {
    fn describe_counter(
        &self,
        _key: KeyName,
        _unit: Option<Unit>,
        _description: SharedString,
    ) {
    }

    fn describe_gauge(
        &self,
        _key: KeyName,
        _unit: Option<Unit>,
        _description: SharedString,
    ) {
    }

    fn describe_histogram(
        &self,
        _key: KeyName,
        _unit: Option<Unit>,
        _description: SharedString,
    ) {
    }

    fn register_counter(
        &self,
        key: &Key,
        _metadata: &Metadata<'_>,
    ) -> Counter {
        Counter::from_arc(self.slot(key))
    }

    fn register_gauge(
        &self,
        key: &Key,
        _metadata: &Metadata<'_>,
    ) -> Gauge {
        Gauge::from_arc(self.slot(key))
    }

    fn register_histogram(
        &self,
        _key: &Key,
        _metadata: &Metadata<'_>,
    ) -> Histogram {
        Histogram::noop()
    }
}

/// A query handler whose chain queues are read directly by the test, which
/// plays the watcher.
pub struct Harness {
    pub submitter: QuerySubmitter,
    pub chains: HashMap<ChainId, mpsc::Receiver<WatcherTask>>,
    pub responses: mpsc::Sender<PerChainQueryResponseInternal>,
    pub outcomes: mpsc::Receiver<QueryOutcome>,
    /// Extra sender used to clog the outcome channel.
    pub outcomes_tx: mpsc::Sender<QueryOutcome>,
    pub guardian: Address,
    pub handler: JoinHandle<()>,
}

impl Harness {
    pub fn start(
        chains: &[ChainId],
        outcome_capacity: usize,
    ) -> Self {
        Self::start_with_config(
            chains,
            outcome_capacity,
            QueryHandlerConfig {
                request_timeout: REQUEST_TIMEOUT,
                retry_interval: RETRY_INTERVAL,
                audit_interval: AUDIT_INTERVAL,
            },
        )
    }

    pub fn start_with_config(
        chains: &[ChainId],
        outcome_capacity: usize,
        config: QueryHandlerConfig,
    ) -> Self {
        let dispatch = Arc::new(ChainDispatchTable::new(chains.iter().map(|chain_id| {
            ChainRoute {
                chain_id: *chain_id,
                num_workers: 1,
                enabled: true,
            }
        })));

        let mut queues = ChainQueues::new();
        let mut receivers = HashMap::new();
        for chain_id in chains {
            let (tx, rx) = mpsc::channel(64);
            queues.insert(*chain_id, tx);
            receivers.insert(*chain_id, rx);
        }

        let signer = DigestSigner::random();
        let guardian = signer.address();
        let (requests_tx, requests_rx) = mpsc::channel(16);
        let (responses_tx, responses_rx) = mpsc::channel(64);
        let (outcomes_tx, outcomes_rx) = mpsc::channel(outcome_capacity);

        let handler = QueryHandler::new(
            config,
            Arc::clone(&dispatch),
            queues,
            ResponseSigner::new(signer),
            requests_rx,
            responses_rx,
            outcomes_tx.clone(),
        );

        Self {
            submitter: QuerySubmitter::new(dispatch, requests_tx),
            chains: receivers,
            responses: responses_tx,
            outcomes: outcomes_rx,
            outcomes_tx,
            guardian,
            handler: tokio::spawn(handler.run()),
        }
    }

    /// Next sub-query queued for `chain_id`.
    pub async fn next_task(
        &mut self,
        chain_id: ChainId,
    ) -> WatcherTask {
        let queue = self.chains.get_mut(&chain_id).expect("unknown chain");
        tokio::time::timeout(Duration::from_secs(1), queue.recv())
            .await
            .expect("no task dispatched")
            .expect("chain queue closed")
    }

    /// Whether a sub-query is waiting in the queue of `chain_id`.
    pub fn has_task(
        &mut self,
        chain_id: ChainId,
    ) -> bool {
        !self
            .chains
            .get_mut(&chain_id)
            .expect("unknown chain")
            .is_empty()
    }

    pub async fn next_outcome(&mut self) -> QueryOutcome {
        tokio::time::timeout(Duration::from_secs(1), self.outcomes.recv())
            .await
            .expect("no outcome")
            .expect("outcome channel closed")
    }

    pub async fn reply(
        &self,
        response: PerChainQueryResponseInternal,
    ) {
        self.responses.send(response).await.unwrap();
    }

    pub async fn succeed(
        &self,
        task: &WatcherTask,
    ) -> ChainSpecificResponse {
        let response = watcher_result(task).await;
        self.reply(PerChainQueryResponseInternal::success(
            &task.query,
            response.clone(),
        ))
        .await;
        response
    }

    pub async fn retry(
        &self,
        task: &WatcherTask,
    ) {
        self.reply(PerChainQueryResponseInternal::failure(
            &task.query,
            QueryStatus::RetryNeeded,
        ))
        .await;
    }

    pub async fn fail(
        &self,
        task: &WatcherTask,
    ) {
        self.reply(PerChainQueryResponseInternal::failure(
            &task.query,
            QueryStatus::FatalError,
        ))
        .await;
    }
}

/// A well formed result for the sub-query carried by `task`.
pub async fn watcher_result(task: &WatcherTask) -> ChainSpecificResponse {
    DummyWatcher::new(task.query.chain_id())
        .query(&task.query.request)
        .await
        .expect("dummy watcher failed")
}

/// A signed request with one `eth_call` per chain, in the given order.
pub fn eth_request(
    nonce: u32,
    chains: &[ChainId],
) -> ValidatedRequest {
    let query_request = QueryRequest::new(
        nonce,
        chains
            .iter()
            .map(|chain_id| {
                PerChainQueryRequest::new(
                    *chain_id,
                    ChainSpecificQuery::EthCall(EthCallQueryRequest {
                        block_id: "0x28d9630".to_string(),
                        call_data: vec![EthCallData::new(
                            Address::repeat_byte(0x11),
                            vec![0x06, 0xfd, 0xde, 0x03],
                        )],
                    }),
                )
            })
            .collect(),
    );
    let bytes = query_request.marshal().unwrap();
    let digest = query_request_digest(Environment::DevNet, &bytes);
    let signature = DigestSigner::random().sign(&digest).unwrap();
    ValidatedRequest {
        request_id: RequestId::from_digest(&digest),
        signed_request: SignedQueryRequest::new(bytes, signature.to_vec()),
        query_request,
        user_name: "Test User".to_string(),
    }
}
