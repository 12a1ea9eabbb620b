//! Messages exchanged between the query handler and the chain watchers.
use std::fmt::Display;
use std::fmt::Formatter;

use alloy_primitives::B256;
use serde_derive::Deserialize;
use serde_derive::Serialize;

use crate::request::PerChainQueryRequest;
use crate::response::ChainSpecificResponse;
use crate::ChainId;

/// Identifies a query request by the hex encoding of its request digest.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn from_digest(digest: &B256) -> Self {
        Self(hex::encode(digest))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RequestId {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome reported by a watcher for a single sub-query.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueryStatus {
    Success,
    RetryNeeded,
    FatalError,
}

impl QueryStatus {
    /// Metric label for the status.
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Success => "success",
            QueryStatus::RetryNeeded => "retry_needed",
            QueryStatus::FatalError => "fatal_error",
        }
    }
}

impl Display for QueryStatus {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A sub-query handed to the watcher of `request.chain_id`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerChainQueryInternal {
    pub request_id: RequestId,
    pub request_idx: usize,
    pub request: PerChainQueryRequest,
}

impl PerChainQueryInternal {
    pub fn new(
        request_id: RequestId,
        request_idx: usize,
        request: PerChainQueryRequest,
    ) -> Self {
        Self {
            request_id,
            request_idx,
            request,
        }
    }

    pub fn chain_id(&self) -> ChainId {
        self.request.chain_id
    }
}

/// A watcher's answer to a [`PerChainQueryInternal`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerChainQueryResponseInternal {
    pub request_id: RequestId,
    pub request_idx: usize,
    pub chain_id: ChainId,
    pub status: QueryStatus,
    /// Only set when `status` is [`QueryStatus::Success`].
    pub response: Option<ChainSpecificResponse>,
}

impl PerChainQueryResponseInternal {
    pub fn success(
        query: &PerChainQueryInternal,
        response: ChainSpecificResponse,
    ) -> Self {
        Self {
            request_id: query.request_id.clone(),
            request_idx: query.request_idx,
            chain_id: query.chain_id(),
            status: QueryStatus::Success,
            response: Some(response),
        }
    }

    pub fn failure(
        query: &PerChainQueryInternal,
        status: QueryStatus,
    ) -> Self {
        Self {
            request_id: query.request_id.clone(),
            request_idx: query.request_idx,
            chain_id: query.chain_id(),
            status,
            response: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_is_hex_digest() {
        let id = RequestId::from_digest(&B256::repeat_byte(0x0f));
        assert_eq!(id.as_str().len(), 64);
        assert!(id.to_string().starts_with("0f0f"));
    }
}
