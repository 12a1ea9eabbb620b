//! In-flight requests, owned by the query handler task.
use std::collections::HashMap;
use std::time::Duration;

use ccq_messages::ChainId;
use ccq_messages::PerChainQueryInternal;
use ccq_messages::PerChainQueryResponse;
use ccq_messages::PerChainQueryResponseInternal;
use ccq_messages::QueryRequest;
use ccq_messages::QueryResponsePublication;
use ccq_messages::QueryStatus;
use ccq_messages::RequestId;
use ccq_messages::SignedQueryRequest;
use ccq_messages::SignedQueryResponse;
use ccq_watchers::CancelSignal;
use ccq_watchers::WatcherTask;
use tokio::time::Instant;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubQueryStatus {
    Pending,
    Success,
    RetryNeeded,
    FatalError,
}

impl SubQueryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubQueryStatus::Success | SubQueryStatus::FatalError)
    }
}

#[derive(Clone, Debug)]
pub struct PerChainState {
    pub chain_id: ChainId,
    pub request_idx: usize,
    pub status: SubQueryStatus,
    pub result: Option<PerChainQueryResponse>,
    pub retry_count: u32,
    pub dispatch_count: u32,
    /// Last time the sub-query was successfully queued.
    pub last_dispatch: Option<Instant>,
}

impl PerChainState {
    fn new(
        chain_id: ChainId,
        request_idx: usize,
    ) -> Self {
        Self {
            chain_id,
            request_idx,
            status: SubQueryStatus::Pending,
            result: None,
            retry_count: 0,
            dispatch_count: 0,
            last_dispatch: None,
        }
    }

    /// Whether the sub-query should be (re)queued at `now`.
    pub fn due_for_dispatch(
        &self,
        now: Instant,
        retry_interval: Duration,
    ) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.last_dispatch
            .map_or(true, |last| now.saturating_duration_since(last) >= retry_interval)
    }
}

/// What applying a watcher response did to the pending query.
#[derive(Debug, PartialEq, Eq)]
pub enum ResponseEffect {
    /// The result was recorded; `complete` is set once every sub-query has
    /// succeeded.
    Recorded { complete: bool },
    RetryNeeded,
    /// A result for an index that already succeeded; the first one wins.
    DuplicateIgnored,
    Fatal { message: String },
}

#[derive(Debug)]
pub struct PendingQuery {
    pub request_id: RequestId,
    pub signed_request: SignedQueryRequest,
    pub query_request: QueryRequest,
    pub per_chain_state: Vec<PerChainState>,
    pub created_at: Instant,
    pub deadline: Instant,
    pub last_retry_at: Option<Instant>,
    /// Signed publication awaiting hand-off to the outcome channel.
    pub signed_response: Option<SignedQueryResponse>,
    cancel: CancelSignal,
}

impl PendingQuery {
    pub fn new(
        request_id: RequestId,
        signed_request: SignedQueryRequest,
        query_request: QueryRequest,
        now: Instant,
        timeout: Duration,
    ) -> Self {
        let per_chain_state = query_request
            .per_chain_queries
            .iter()
            .enumerate()
            .map(|(idx, pcq)| PerChainState::new(pcq.chain_id, idx))
            .collect();
        Self {
            request_id,
            signed_request,
            query_request,
            per_chain_state,
            created_at: now,
            deadline: now + timeout,
            last_retry_at: None,
            signed_response: None,
            cancel: CancelSignal::new(),
        }
    }

    /// Builds the queue item for sub-query `idx`.
    pub fn task(
        &self,
        idx: usize,
    ) -> Option<WatcherTask> {
        let request = self.query_request.per_chain_queries.get(idx)?.clone();
        Some(
            self.cancel
                .task(PerChainQueryInternal::new(self.request_id.clone(), idx, request)),
        )
    }

    pub fn mark_dispatched(
        &mut self,
        idx: usize,
        now: Instant,
    ) {
        if let Some(state) = self.per_chain_state.get_mut(idx) {
            state.status = SubQueryStatus::Pending;
            state.dispatch_count += 1;
            state.last_dispatch = Some(now);
        }
    }

    /// Applies a watcher response. Only the handler task calls this, so the
    /// status transitions are never raced.
    pub fn apply_response(
        &mut self,
        response: PerChainQueryResponseInternal,
    ) -> ResponseEffect {
        let Some(state) = self.per_chain_state.get_mut(response.request_idx) else {
            return ResponseEffect::Fatal {
                message: format!("response index {} is out of range", response.request_idx),
            };
        };
        if state.chain_id != response.chain_id {
            return ResponseEffect::Fatal {
                message: format!(
                    "response for query {} came from chain {}, expected chain {}",
                    response.request_idx, response.chain_id, state.chain_id
                ),
            };
        }
        if state.status == SubQueryStatus::Success {
            return ResponseEffect::DuplicateIgnored;
        }

        match response.status {
            QueryStatus::Success => {
                let Some(result) = response.response else {
                    state.status = SubQueryStatus::FatalError;
                    return ResponseEffect::Fatal {
                        message: "successful response without a result".to_string(),
                    };
                };
                let result = PerChainQueryResponse::new(response.chain_id, result);
                let query = &self.query_request.per_chain_queries[response.request_idx];
                if let Err(err) = result.check_matches(query) {
                    state.status = SubQueryStatus::FatalError;
                    return ResponseEffect::Fatal {
                        message: err.to_string(),
                    };
                }
                state.result = Some(result);
                state.status = SubQueryStatus::Success;
                ResponseEffect::Recorded {
                    complete: self.is_complete(),
                }
            },
            QueryStatus::RetryNeeded => {
                state.status = SubQueryStatus::RetryNeeded;
                state.retry_count += 1;
                ResponseEffect::RetryNeeded
            },
            QueryStatus::FatalError => {
                state.status = SubQueryStatus::FatalError;
                ResponseEffect::Fatal {
                    message: "watcher reported a fatal error".to_string(),
                }
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        self.per_chain_state
            .iter()
            .all(|s| s.status == SubQueryStatus::Success)
    }

    /// Indices of the sub-queries that have not succeeded.
    pub fn incomplete(&self) -> Vec<usize> {
        self.per_chain_state
            .iter()
            .filter(|s| s.status != SubQueryStatus::Success)
            .map(|s| s.request_idx)
            .collect()
    }

    /// The aggregate response in request order, once every sub-query succeeded.
    pub fn publication(&self) -> Option<QueryResponsePublication> {
        let per_chain_responses = self
            .per_chain_state
            .iter()
            .map(|s| s.result.clone())
            .collect::<Option<Vec<_>>>()?;
        Some(QueryResponsePublication::new(
            self.signed_request.clone(),
            per_chain_responses,
        ))
    }

    /// Tells the workers to drop any queued or in-flight sub-query.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Pending queries by request id. Single writer: the query handler task.
#[derive(Debug, Default)]
pub struct PendingQueryStore {
    queries: HashMap<RequestId, PendingQuery>,
}

impl PendingQueryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `query`; returns it back if its request id is already pending.
    pub fn insert(
        &mut self,
        query: PendingQuery,
    ) -> Result<(), PendingQuery> {
        if self.queries.contains_key(&query.request_id) {
            return Err(query);
        }
        self.queries.insert(query.request_id.clone(), query);
        Ok(())
    }

    pub fn get(
        &self,
        request_id: &RequestId,
    ) -> Option<&PendingQuery> {
        self.queries.get(request_id)
    }

    pub fn get_mut(
        &mut self,
        request_id: &RequestId,
    ) -> Option<&mut PendingQuery> {
        self.queries.get_mut(request_id)
    }

    pub fn remove(
        &mut self,
        request_id: &RequestId,
    ) -> Option<PendingQuery> {
        self.queries.remove(request_id)
    }

    pub fn request_ids(&self) -> Vec<RequestId> {
        self.queries.keys().cloned().collect()
    }

    /// Removes every pending query, e.g. on shutdown.
    pub fn drain(&mut self) -> impl Iterator<Item = PendingQuery> + '_ {
        self.queries.drain().map(|(_, query)| query)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}
