//! The query handler: a single task owning every pending request.
//!
//! It fans validated requests out to the per-chain worker pools, collects
//! their responses, and publishes one signed response per request once all
//! sub-queries have succeeded. A periodic audit re-dispatches stalled
//! sub-queries and times out requests past their deadline.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use ccq_messages::PerChainQueryResponseInternal;
use ccq_messages::RequestId;
use ccq_messages::SignedQueryResponse;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::config::QueryConfig;
use crate::dispatch::ChainDispatchTable;
use crate::dispatch::ChainQueues;
use crate::error::QueryError;
use crate::error::RejectReason;
use crate::metrics::Metrics;
use crate::pending::PendingQuery;
use crate::pending::PendingQueryStore;
use crate::pending::ResponseEffect;
use crate::pending::SubQueryStatus;
use crate::publisher::ResponseSigner;
use crate::validator::ValidatedRequest;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct QueryHandlerConfig {
    pub request_timeout: Duration,
    pub retry_interval: Duration,
    pub audit_interval: Duration,
}

impl From<&QueryConfig> for QueryHandlerConfig {
    fn from(config: &QueryConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            retry_interval: config.retry_interval(),
            audit_interval: config.audit_interval(),
        }
    }
}

/// Final result of a request, exactly one per accepted request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryOutcome {
    Published {
        request_id: RequestId,
        response: SignedQueryResponse,
    },
    Failed {
        request_id: RequestId,
        error: QueryError,
    },
}

impl QueryOutcome {
    pub fn request_id(&self) -> &RequestId {
        match self {
            QueryOutcome::Published { request_id, .. } | QueryOutcome::Failed { request_id, .. } => {
                request_id
            },
        }
    }
}

/// Hands validated requests to the query handler.
#[derive(Clone, Debug)]
pub struct QuerySubmitter {
    dispatch: Arc<ChainDispatchTable>,
    requests: mpsc::Sender<ValidatedRequest>,
    metrics: Metrics,
}

impl QuerySubmitter {
    pub fn new(
        dispatch: Arc<ChainDispatchTable>,
        requests: mpsc::Sender<ValidatedRequest>,
    ) -> Self {
        Self {
            dispatch,
            requests,
            metrics: Metrics::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        !self.requests.is_closed()
    }

    /// Queues `request` for processing. Requests touching a chain without a
    /// route are rejected here, before anything is dispatched.
    pub async fn submit(
        &self,
        request: ValidatedRequest,
    ) -> Result<(), QueryError> {
        if let Err(err) = self.dispatch.check_request(&request.query_request) {
            debug!(request_id = %request.request_id, "rejecting request: {err}");
            self.metrics.increment_requests_failed(err.reason());
            return Err(err);
        }
        self.requests.send(request).await.map_err(|_| {
            QueryError::internal(
                RejectReason::HandlerUnavailable,
                "query handler is not running",
            )
        })
    }
}

pub struct QueryHandler {
    config: QueryHandlerConfig,
    dispatch: Arc<ChainDispatchTable>,
    queues: ChainQueues,
    signer: ResponseSigner,
    requests: mpsc::Receiver<ValidatedRequest>,
    responses: mpsc::Receiver<PerChainQueryResponseInternal>,
    outcomes: mpsc::Sender<QueryOutcome>,
    /// Failures that did not fit in the outcome channel.
    undelivered: VecDeque<QueryOutcome>,
    pending: PendingQueryStore,
    metrics: Metrics,
}

impl QueryHandler {
    pub fn new(
        config: QueryHandlerConfig,
        dispatch: Arc<ChainDispatchTable>,
        queues: ChainQueues,
        signer: ResponseSigner,
        requests: mpsc::Receiver<ValidatedRequest>,
        responses: mpsc::Receiver<PerChainQueryResponseInternal>,
        outcomes: mpsc::Sender<QueryOutcome>,
    ) -> Self {
        Self {
            config,
            dispatch,
            queues,
            signer,
            requests,
            responses,
            outcomes,
            undelivered: VecDeque::new(),
            pending: PendingQueryStore::new(),
            metrics: Metrics::new(),
        }
    }

    /// Runs until the request channel is closed, then cancels whatever is
    /// still pending.
    pub async fn run(mut self) {
        info!(
            guardian = %self.signer.address(),
            "query handler started"
        );

        let mut audit = tokio::time::interval(self.config.audit_interval);
        audit.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                request = self.requests.recv() => {
                    match request {
                        Some(request) => self.handle_request(request, Instant::now()),
                        None => {
                            info!("request channel closed");
                            break;
                        },
                    }
                },
                Some(response) = self.responses.recv() => {
                    self.handle_response(response, Instant::now());
                },
                _ = audit.tick() => {
                    self.audit(Instant::now());
                },
            }
        }

        self.shutdown();
    }

    fn handle_request(
        &mut self,
        request: ValidatedRequest,
        now: Instant,
    ) {
        self.metrics.increment_requests_received();
        let request_id = request.request_id.clone();

        if let Err(err) = self.dispatch.check_request(&request.query_request) {
            self.emit_failure(request_id, err);
            return;
        }

        let query = PendingQuery::new(
            request.request_id,
            request.signed_request,
            request.query_request,
            now,
            self.config.request_timeout,
        );
        let num_queries = query.per_chain_state.len();
        if let Err(query) = self.pending.insert(query) {
            warn!(request_id = %query.request_id, "dropping duplicate request");
            self.metrics
                .increment_requests_failed(QueryError::Duplicate.reason());
            return;
        }

        info!(
            %request_id,
            user_name = %request.user_name,
            num_queries,
            "received query request"
        );

        if let Some(query) = self.pending.get_mut(&request_id) {
            for idx in 0..num_queries {
                Self::dispatch(&self.queues, &self.metrics, query, idx, now);
            }
        }
        self.metrics.set_pending_queries(self.pending.len());
    }

    fn handle_response(
        &mut self,
        response: PerChainQueryResponseInternal,
        now: Instant,
    ) {
        self.metrics
            .increment_chain_responses(response.chain_id, response.status);

        let request_id = response.request_id.clone();
        let request_idx = response.request_idx;
        let Some(query) = self.pending.get_mut(&request_id) else {
            debug!(%request_id, request_idx, "response for a request that is no longer pending");
            return;
        };
        let chain_id = query
            .per_chain_state
            .get(request_idx)
            .map_or(response.chain_id, |s| s.chain_id);

        match query.apply_response(response) {
            ResponseEffect::Recorded { complete } => {
                debug!(%request_id, request_idx, %chain_id, complete, "query succeeded");
                if complete {
                    self.complete(&request_id);
                }
            },
            ResponseEffect::RetryNeeded => {
                self.metrics.increment_retries(chain_id);
                query.last_retry_at = Some(now);
                let due = query.per_chain_state[request_idx]
                    .due_for_dispatch(now, self.config.retry_interval);
                debug!(%request_id, request_idx, %chain_id, due, "query needs a retry");
                if due {
                    Self::dispatch(&self.queues, &self.metrics, query, request_idx, now);
                }
            },
            ResponseEffect::DuplicateIgnored => {
                debug!(%request_id, request_idx, %chain_id, "ignoring duplicate response");
            },
            ResponseEffect::Fatal { message } => {
                self.fail_request(
                    &request_id,
                    QueryError::FatalChainError {
                        request_idx,
                        chain_id,
                        message,
                    },
                );
            },
        }
    }

    /// Re-dispatches stalled sub-queries, retries blocked publications and
    /// times out expired requests.
    fn audit(
        &mut self,
        now: Instant,
    ) {
        for request_id in self.pending.request_ids() {
            let Some(query) = self.pending.get_mut(&request_id) else {
                continue;
            };

            if now >= query.deadline {
                let incomplete = query.incomplete();
                self.fail_request(&request_id, QueryError::Timeout { incomplete });
                continue;
            }

            if query.signed_response.is_some() {
                self.try_publish(&request_id);
                continue;
            }

            for idx in 0..query.per_chain_state.len() {
                let state = &mut query.per_chain_state[idx];
                if !state.due_for_dispatch(now, self.config.retry_interval) {
                    continue;
                }
                if state.status == SubQueryStatus::Pending && state.dispatch_count > 0 {
                    state.retry_count += 1;
                    self.metrics.increment_retries(state.chain_id);
                    query.last_retry_at = Some(now);
                }
                debug!(%request_id, idx, "audit re-dispatching query");
                Self::dispatch(&self.queues, &self.metrics, query, idx, now);
            }
        }

        self.flush_undelivered();
        self.metrics.set_pending_queries(self.pending.len());
    }

    fn dispatch(
        queues: &ChainQueues,
        metrics: &Metrics,
        query: &mut PendingQuery,
        idx: usize,
        now: Instant,
    ) -> bool {
        let Some(task) = query.task(idx) else {
            return false;
        };
        let chain_id = task.query.chain_id();
        match queues.try_dispatch(task) {
            Ok(()) => {
                query.mark_dispatched(idx, now);
                metrics.increment_chain_dispatches(chain_id);
                true
            },
            Err(err) => {
                warn!(
                    request_id = %query.request_id,
                    idx,
                    %chain_id,
                    "failed to dispatch query: {err:?}"
                );
                metrics.increment_chain_dispatch_failures(chain_id);
                false
            },
        }
    }

    /// Signs the publication of a request whose sub-queries all succeeded.
    fn complete(
        &mut self,
        request_id: &RequestId,
    ) {
        let Some(query) = self.pending.get_mut(request_id) else {
            return;
        };
        let Some(publication) = query.publication() else {
            return;
        };
        match self.signer.sign(&publication) {
            Ok(signed) => {
                query.signed_response = Some(signed);
                self.try_publish(request_id);
            },
            Err(err) => {
                warn!(%request_id, "failed to sign response: {err:?}");
                self.fail_request(
                    request_id,
                    QueryError::internal(
                        RejectReason::FailedToSignResponse,
                        "failed to sign response",
                    ),
                );
            },
        }
    }

    /// Hands a signed response to the outcome channel. A full channel leaves
    /// the request pending so the audit can try again.
    fn try_publish(
        &mut self,
        request_id: &RequestId,
    ) {
        let Some(response) = self
            .pending
            .get(request_id)
            .and_then(|q| q.signed_response.clone())
        else {
            return;
        };
        let outcome = QueryOutcome::Published {
            request_id: request_id.clone(),
            response,
        };
        match self.outcomes.try_send(outcome) {
            Ok(()) => {
                if let Some(query) = self.pending.remove(request_id) {
                    query.cancel();
                    info!(
                        %request_id,
                        elapsed_ms = query.created_at.elapsed().as_millis() as u64,
                        "published query response"
                    );
                }
                self.metrics.increment_responses_published();
                self.metrics.set_pending_queries(self.pending.len());
            },
            Err(TrySendError::Full(_)) => {
                warn!(%request_id, "outcome channel full, will retry publication");
            },
            Err(TrySendError::Closed(_)) => {
                warn!(%request_id, "outcome channel closed, dropping response");
                if let Some(query) = self.pending.remove(request_id) {
                    query.cancel();
                }
            },
        }
    }

    fn fail_request(
        &mut self,
        request_id: &RequestId,
        error: QueryError,
    ) {
        if let Some(query) = self.pending.remove(request_id) {
            query.cancel();
        }
        self.metrics.set_pending_queries(self.pending.len());
        self.emit_failure(request_id.clone(), error);
    }

    fn emit_failure(
        &mut self,
        request_id: RequestId,
        error: QueryError,
    ) {
        warn!(%request_id, "query request failed: {error}");
        self.metrics.increment_requests_failed(error.reason());
        self.deliver(QueryOutcome::Failed { request_id, error });
    }

    fn deliver(
        &mut self,
        outcome: QueryOutcome,
    ) {
        if !self.undelivered.is_empty() {
            self.undelivered.push_back(outcome);
            return;
        }
        match self.outcomes.try_send(outcome) {
            Ok(()) => {},
            Err(TrySendError::Full(outcome)) => self.undelivered.push_back(outcome),
            Err(TrySendError::Closed(outcome)) => {
                warn!(request_id = %outcome.request_id(), "outcome channel closed");
            },
        }
    }

    fn flush_undelivered(&mut self) {
        while let Some(outcome) = self.undelivered.pop_front() {
            match self.outcomes.try_send(outcome) {
                Ok(()) => {},
                Err(TrySendError::Full(outcome)) => {
                    self.undelivered.push_front(outcome);
                    break;
                },
                Err(TrySendError::Closed(_)) => {
                    self.undelivered.clear();
                    break;
                },
            }
        }
    }

    fn shutdown(&mut self) {
        let mut cancelled = 0;
        for query in self.pending.drain() {
            query.cancel();
            cancelled += 1;
        }
        self.metrics.set_pending_queries(0);
        info!(cancelled, "query handler stopped");
    }
}
