use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use alloy_primitives::B256;
use async_trait::async_trait;
use ccq_messages::request::SolanaDataSlice;
use ccq_messages::response::EthBlockInfo;
use ccq_messages::response::EthCallByTimestampQueryResponse;
use ccq_messages::response::EthCallQueryResponse;
use ccq_messages::response::SolanaAccountQueryResponse;
use ccq_messages::response::SolanaAccountResult;
use ccq_messages::response::SolanaContext;
use ccq_messages::response::SolanaPdaQueryResponse;
use ccq_messages::response::SolanaPdaResult;
use ccq_messages::ChainId;
use ccq_messages::ChainSpecificQuery;
use ccq_messages::ChainSpecificResponse;
use ccq_messages::PerChainQueryRequest;
use rand::random;
use tracing::debug;

use crate::ChainWatcher;
use crate::WatcherError;

/// A watcher answering every query with random but well formed results.
///
/// Used for local deployments and tests where no RPC node is available.
#[derive(Clone, Debug)]
pub struct DummyWatcher {
    chain_id: ChainId,
    latency: Duration,
}

impl DummyWatcher {
    pub fn new(chain_id: ChainId) -> Self {
        Self {
            chain_id,
            latency: Duration::ZERO,
        }
    }

    /// Delays every answer by `latency`.
    pub fn with_latency(
        mut self,
        latency: Duration,
    ) -> Self {
        self.latency = latency;
        self
    }
}

#[async_trait]
impl ChainWatcher for DummyWatcher {
    fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    async fn query(
        &self,
        query: &PerChainQueryRequest,
    ) -> Result<ChainSpecificResponse, WatcherError> {
        debug!(chain_id = %self.chain_id, kind = %query.kind(), "dummy query");
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let response = match &query.query {
            ChainSpecificQuery::EthCall(q) => {
                ChainSpecificResponse::EthCall(EthCallQueryResponse {
                    block: dummy_block(&q.block_id),
                    results: dummy_results(q.call_data.len()),
                })
            },
            ChainSpecificQuery::EthCallWithFinality(q) => {
                ChainSpecificResponse::EthCallWithFinality(EthCallQueryResponse {
                    block: dummy_block(&q.block_id),
                    results: dummy_results(q.call_data.len()),
                })
            },
            ChainSpecificQuery::EthCallByTimestamp(q) => {
                let mut target_block = dummy_block(&q.target_block_id_hint);
                target_block.time = q.target_timestamp;
                let following_block = EthBlockInfo {
                    number: target_block.number + 1,
                    hash: B256::from(random::<[u8; 32]>()),
                    time: q.target_timestamp + 1,
                };
                ChainSpecificResponse::EthCallByTimestamp(EthCallByTimestampQueryResponse {
                    target_block,
                    following_block,
                    results: dummy_results(q.call_data.len()),
                })
            },
            ChainSpecificQuery::SolanaAccount(q) => {
                ChainSpecificResponse::SolanaAccount(SolanaAccountQueryResponse {
                    context: dummy_context(&q.slice),
                    results: (0..q.accounts.len())
                        .map(|_| dummy_account(&q.slice))
                        .collect(),
                })
            },
            ChainSpecificQuery::SolanaPda(q) => {
                ChainSpecificResponse::SolanaPda(SolanaPdaQueryResponse {
                    context: dummy_context(&q.slice),
                    results: q
                        .pdas
                        .iter()
                        .map(|_| {
                            SolanaPdaResult {
                                account: random(),
                                bump: 255,
                                account_info: dummy_account(&q.slice),
                            }
                        })
                        .collect(),
                })
            },
        };
        Ok(response)
    }
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or_default()
}

/// Uses the requested block number when the block id is a number rather than
/// a hash.
fn dummy_block(block_id: &str) -> EthBlockInfo {
    let number = block_id
        .strip_prefix("0x")
        .filter(|n| n.len() <= 16)
        .and_then(|n| u64::from_str_radix(n, 16).ok())
        .unwrap_or_default();
    EthBlockInfo {
        number,
        hash: B256::from(random::<[u8; 32]>()),
        time: now_micros(),
    }
}

fn dummy_results(count: usize) -> Vec<Vec<u8>> {
    (0..count).map(|_| random::<[u8; 32]>().to_vec()).collect()
}

fn dummy_context(slice: &SolanaDataSlice) -> SolanaContext {
    SolanaContext {
        slot: slice.min_context_slot.max(1),
        block_time: now_micros(),
        block_hash: random(),
    }
}

fn dummy_account(slice: &SolanaDataSlice) -> SolanaAccountResult {
    let len = if slice.data_slice_length == 0 {
        32
    } else {
        slice.data_slice_length.min(1024) as usize
    };
    SolanaAccountResult {
        lamports: 1_000_000,
        rent_epoch: 0,
        executable: false,
        owner: random(),
        data: (0..len).map(|_| random::<u8>()).collect(),
    }
}
