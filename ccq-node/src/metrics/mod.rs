use ccq_messages::ChainId;
use ccq_messages::QueryStatus;
use metrics::counter;
use metrics::gauge;
use metrics::SharedString;

#[derive(Clone, Copy, Debug, Default)]
pub struct Metrics {}

impl Metrics {
    pub fn new() -> Self {
        Self {}
    }

    pub fn increment_invalid_requests(&self, reason: &'static str) {
        counter!("ccq_invalid_requests_total", "reason" => reason).increment(1);
    }

    pub fn increment_requested_calls(&self, chain_id: ChainId) {
        let chain = SharedString::from(chain_id.to_string());
        counter!("ccq_requested_calls_total", "chain" => chain).increment(1);
    }

    pub fn increment_requests_received(&self) {
        counter!("ccq_query_requests_received_total").increment(1);
    }

    pub fn increment_chain_dispatches(&self, chain_id: ChainId) {
        let chain = SharedString::from(chain_id.to_string());
        counter!("ccq_chain_dispatches_total", "chain" => chain).increment(1);
    }

    pub fn increment_chain_dispatch_failures(&self, chain_id: ChainId) {
        let chain = SharedString::from(chain_id.to_string());
        counter!("ccq_chain_dispatch_failures_total", "chain" => chain).increment(1);
    }

    pub fn increment_chain_responses(&self, chain_id: ChainId, status: QueryStatus) {
        let chain = SharedString::from(chain_id.to_string());
        counter!("ccq_chain_responses_total", "chain" => chain, "status" => status.as_str())
            .increment(1);
    }

    pub fn increment_retries(&self, chain_id: ChainId) {
        let chain = SharedString::from(chain_id.to_string());
        counter!("ccq_query_retries_total", "chain" => chain).increment(1);
    }

    pub fn increment_responses_published(&self) {
        counter!("ccq_query_responses_published_total").increment(1);
    }

    pub fn increment_requests_failed(&self, reason: &'static str) {
        counter!("ccq_query_requests_failed_total", "reason" => reason).increment(1);
    }

    pub fn set_pending_queries(&self, count: usize) {
        gauge!("ccq_pending_queries").set(count as f64);
    }
}
