//! Query responses and the aggregate publication signed by the guardian.
use alloy_primitives::B256;
use bytes::BufMut;
use derive_debug_plus::Dbg;
use thiserror::Error;

use crate::codec::put_bytes;
use crate::codec::put_count;
use crate::codec::CodecError;
use crate::codec::Reader;
use crate::request::ChainSpecificQuery;
use crate::request::PerChainQueryRequest;
use crate::request::QueryKind;
use crate::request::QueryRequest;
use crate::request::SignedQueryRequest;
use crate::request::SIGNATURE_LEN;
use crate::request::SOLANA_ACCOUNT_LEN;
use crate::ChainId;

pub const QUERY_RESPONSE_VERSION: u8 = 1;

/// Requests delivered off-chain are published with this source chain id.
pub const OFF_CHAIN_REQUEST_CHAIN_ID: ChainId = ChainId::UNSET;

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ResponseMismatch {
    #[error("response is for chain {actual}, query was for chain {expected}")]
    Chain { expected: ChainId, actual: ChainId },

    #[error("response is of type {actual}, query was of type {expected}")]
    Kind {
        expected: QueryKind,
        actual: QueryKind,
    },

    #[error("response has {actual} results, query has {expected} entries")]
    ResultCount { expected: usize, actual: usize },

    #[error("publication has {actual} responses, request has {expected} queries")]
    ResponseCount { expected: usize, actual: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerChainQueryResponse {
    pub chain_id: ChainId,
    pub response: ChainSpecificResponse,
}

impl PerChainQueryResponse {
    pub fn new(
        chain_id: ChainId,
        response: ChainSpecificResponse,
    ) -> Self {
        Self { chain_id, response }
    }

    /// Checks that this response answers `query`: same chain, same kind and
    /// one result per call, account or PDA.
    pub fn check_matches(
        &self,
        query: &PerChainQueryRequest,
    ) -> Result<(), ResponseMismatch> {
        if self.chain_id != query.chain_id {
            return Err(ResponseMismatch::Chain {
                expected: query.chain_id,
                actual: self.chain_id,
            });
        }
        self.response.check_matches(&query.query)
    }

    fn marshal_into(
        &self,
        out: &mut Vec<u8>,
    ) -> Result<(), CodecError> {
        out.put_u16(self.chain_id.0);
        out.put_u8(self.response.kind().tag());
        let mut response = Vec::new();
        self.response.marshal_into(&mut response)?;
        put_bytes(out, "response", &response)
    }

    fn unmarshal_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let chain_id = ChainId(reader.u16("chain id")?);
        let kind = QueryKind::from_tag(reader.u8("response type")?)?;
        let response = reader.bytes("response")?;
        let mut response_reader = Reader::new(&response);
        let response = ChainSpecificResponse::unmarshal_from(kind, &mut response_reader)?;
        response_reader.finish("per chain response")?;
        Ok(Self { chain_id, response })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainSpecificResponse {
    EthCall(EthCallQueryResponse),
    EthCallByTimestamp(EthCallByTimestampQueryResponse),
    EthCallWithFinality(EthCallQueryResponse),
    SolanaAccount(SolanaAccountQueryResponse),
    SolanaPda(SolanaPdaQueryResponse),
}

impl ChainSpecificResponse {
    pub fn kind(&self) -> QueryKind {
        match self {
            ChainSpecificResponse::EthCall(_) => QueryKind::EthCall,
            ChainSpecificResponse::EthCallByTimestamp(_) => QueryKind::EthCallByTimestamp,
            ChainSpecificResponse::EthCallWithFinality(_) => QueryKind::EthCallWithFinality,
            ChainSpecificResponse::SolanaAccount(_) => QueryKind::SolanaAccount,
            ChainSpecificResponse::SolanaPda(_) => QueryKind::SolanaPda,
        }
    }

    pub fn result_count(&self) -> usize {
        match self {
            ChainSpecificResponse::EthCall(r) | ChainSpecificResponse::EthCallWithFinality(r) => {
                r.results.len()
            },
            ChainSpecificResponse::EthCallByTimestamp(r) => r.results.len(),
            ChainSpecificResponse::SolanaAccount(r) => r.results.len(),
            ChainSpecificResponse::SolanaPda(r) => r.results.len(),
        }
    }

    pub fn check_matches(
        &self,
        query: &ChainSpecificQuery,
    ) -> Result<(), ResponseMismatch> {
        if self.kind() != query.kind() {
            return Err(ResponseMismatch::Kind {
                expected: query.kind(),
                actual: self.kind(),
            });
        }
        if self.result_count() != query.result_count() {
            return Err(ResponseMismatch::ResultCount {
                expected: query.result_count(),
                actual: self.result_count(),
            });
        }
        Ok(())
    }

    fn marshal_into(
        &self,
        out: &mut Vec<u8>,
    ) -> Result<(), CodecError> {
        match self {
            ChainSpecificResponse::EthCall(r) | ChainSpecificResponse::EthCallWithFinality(r) => {
                r.block.marshal_into(out);
                marshal_results(out, &r.results)
            },
            ChainSpecificResponse::EthCallByTimestamp(r) => {
                r.target_block.marshal_into(out);
                r.following_block.marshal_into(out);
                marshal_results(out, &r.results)
            },
            ChainSpecificResponse::SolanaAccount(r) => {
                r.context.marshal_into(out);
                put_count(out, "account results", r.results.len())?;
                for result in &r.results {
                    result.marshal_into(out)?;
                }
                Ok(())
            },
            ChainSpecificResponse::SolanaPda(r) => {
                r.context.marshal_into(out);
                put_count(out, "pda results", r.results.len())?;
                for result in &r.results {
                    out.put_slice(&result.account);
                    out.put_u8(result.bump);
                    result.account_info.marshal_into(out)?;
                }
                Ok(())
            },
        }
    }

    fn unmarshal_from(
        kind: QueryKind,
        reader: &mut Reader<'_>,
    ) -> Result<Self, CodecError> {
        let response = match kind {
            QueryKind::EthCall | QueryKind::EthCallWithFinality => {
                let response = EthCallQueryResponse {
                    block: EthBlockInfo::unmarshal_from(reader)?,
                    results: unmarshal_results(reader)?,
                };
                if kind == QueryKind::EthCall {
                    ChainSpecificResponse::EthCall(response)
                } else {
                    ChainSpecificResponse::EthCallWithFinality(response)
                }
            },
            QueryKind::EthCallByTimestamp => {
                ChainSpecificResponse::EthCallByTimestamp(EthCallByTimestampQueryResponse {
                    target_block: EthBlockInfo::unmarshal_from(reader)?,
                    following_block: EthBlockInfo::unmarshal_from(reader)?,
                    results: unmarshal_results(reader)?,
                })
            },
            QueryKind::SolanaAccount => {
                let context = SolanaContext::unmarshal_from(reader)?;
                let count = reader.u8("account result count")?;
                let results = (0..count)
                    .map(|_| SolanaAccountResult::unmarshal_from(reader))
                    .collect::<Result<Vec<_>, _>>()?;
                ChainSpecificResponse::SolanaAccount(SolanaAccountQueryResponse { context, results })
            },
            QueryKind::SolanaPda => {
                let context = SolanaContext::unmarshal_from(reader)?;
                let count = reader.u8("pda result count")?;
                let mut results = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    results.push(SolanaPdaResult {
                        account: reader.array::<SOLANA_ACCOUNT_LEN>("pda account")?,
                        bump: reader.u8("bump")?,
                        account_info: SolanaAccountResult::unmarshal_from(reader)?,
                    });
                }
                ChainSpecificResponse::SolanaPda(SolanaPdaQueryResponse { context, results })
            },
        };
        Ok(response)
    }
}

/// The block an EVM call was executed against.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EthBlockInfo {
    pub number: u64,
    pub hash: B256,
    /// Block time in microseconds since the epoch.
    pub time: u64,
}

impl EthBlockInfo {
    fn marshal_into(
        &self,
        out: &mut Vec<u8>,
    ) {
        out.put_u64(self.number);
        out.put_slice(self.hash.as_slice());
        out.put_u64(self.time);
    }

    fn unmarshal_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            number: reader.u64("block number")?,
            hash: B256::from(reader.array::<32>("block hash")?),
            time: reader.u64("block time")?,
        })
    }
}

#[derive(Clone, Dbg, PartialEq, Eq)]
pub struct EthCallQueryResponse {
    pub block: EthBlockInfo,
    #[dbg(formatter = crate::hex_list_pretty)]
    pub results: Vec<Vec<u8>>,
}

#[derive(Clone, Dbg, PartialEq, Eq)]
pub struct EthCallByTimestampQueryResponse {
    pub target_block: EthBlockInfo,
    pub following_block: EthBlockInfo,
    #[dbg(formatter = crate::hex_list_pretty)]
    pub results: Vec<Vec<u8>>,
}

/// Slot context a Solana query was answered at.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SolanaContext {
    pub slot: u64,
    pub block_time: u64,
    pub block_hash: [u8; 32],
}

impl SolanaContext {
    fn marshal_into(
        &self,
        out: &mut Vec<u8>,
    ) {
        out.put_u64(self.slot);
        out.put_u64(self.block_time);
        out.put_slice(&self.block_hash);
    }

    fn unmarshal_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            slot: reader.u64("slot")?,
            block_time: reader.u64("block time")?,
            block_hash: reader.array::<32>("block hash")?,
        })
    }
}

#[derive(Clone, Dbg, PartialEq, Eq)]
pub struct SolanaAccountResult {
    pub lamports: u64,
    pub rent_epoch: u64,
    pub executable: bool,
    pub owner: [u8; SOLANA_ACCOUNT_LEN],
    #[dbg(formatter = crate::hex_pretty)]
    pub data: Vec<u8>,
}

impl SolanaAccountResult {
    fn marshal_into(
        &self,
        out: &mut Vec<u8>,
    ) -> Result<(), CodecError> {
        out.put_u64(self.lamports);
        out.put_u64(self.rent_epoch);
        out.put_u8(self.executable as u8);
        out.put_slice(&self.owner);
        put_bytes(out, "account data", &self.data)
    }

    fn unmarshal_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            lamports: reader.u64("lamports")?,
            rent_epoch: reader.u64("rent epoch")?,
            executable: reader.bool("executable")?,
            owner: reader.array::<SOLANA_ACCOUNT_LEN>("owner")?,
            data: reader.bytes("account data")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SolanaAccountQueryResponse {
    pub context: SolanaContext,
    pub results: Vec<SolanaAccountResult>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SolanaPdaResult {
    /// The derived account address.
    pub account: [u8; SOLANA_ACCOUNT_LEN],
    pub bump: u8,
    pub account_info: SolanaAccountResult,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SolanaPdaQueryResponse {
    pub context: SolanaContext,
    pub results: Vec<SolanaPdaResult>,
}

/// The aggregate answer to a request: the signed request it answers and
/// one response per sub-query, in request order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryResponsePublication {
    pub request: SignedQueryRequest,
    pub per_chain_responses: Vec<PerChainQueryResponse>,
}

impl QueryResponsePublication {
    pub fn new(
        request: SignedQueryRequest,
        per_chain_responses: Vec<PerChainQueryResponse>,
    ) -> Self {
        Self {
            request,
            per_chain_responses,
        }
    }

    pub fn marshal(&self) -> Result<Vec<u8>, CodecError> {
        if self.request.signature.len() != SIGNATURE_LEN {
            return Err(CodecError::InvalidSignatureLength(
                self.request.signature.len(),
            ));
        }
        let mut out = Vec::new();
        out.put_u8(QUERY_RESPONSE_VERSION);
        out.put_u16(OFF_CHAIN_REQUEST_CHAIN_ID.0);
        out.put_slice(&self.request.signature);
        put_bytes(&mut out, "request", &self.request.query_request)?;
        put_count(&mut out, "per chain responses", self.per_chain_responses.len())?;
        for response in &self.per_chain_responses {
            response.marshal_into(&mut out)?;
        }
        Ok(out)
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(data);
        let version = reader.u8("version")?;
        if version != QUERY_RESPONSE_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let _request_chain_id = reader.u16("request chain id")?;
        let signature = reader.fixed(SIGNATURE_LEN, "request signature")?;
        let query_request = reader.bytes("request")?;
        let count = reader.u8("per chain response count")?;
        let per_chain_responses = (0..count)
            .map(|_| PerChainQueryResponse::unmarshal_from(&mut reader))
            .collect::<Result<Vec<_>, _>>()?;
        reader.finish("query response")?;
        Ok(Self {
            request: SignedQueryRequest::new(query_request, signature),
            per_chain_responses,
        })
    }

    /// Checks that the publication answers `request` position by position.
    pub fn check_matches(
        &self,
        request: &QueryRequest,
    ) -> Result<(), ResponseMismatch> {
        if self.per_chain_responses.len() != request.per_chain_queries.len() {
            return Err(ResponseMismatch::ResponseCount {
                expected: request.per_chain_queries.len(),
                actual: self.per_chain_responses.len(),
            });
        }
        self.per_chain_responses
            .iter()
            .zip(&request.per_chain_queries)
            .try_for_each(|(response, query)| response.check_matches(query))
    }
}

/// A serialized publication and the guardian's signature over its digest,
/// ready for the transport.
#[derive(Clone, Dbg, PartialEq, Eq)]
pub struct SignedQueryResponse {
    #[dbg(formatter = crate::hex_pretty)]
    pub bytes: Vec<u8>,
    #[dbg(formatter = crate::hex_pretty)]
    pub signature: Vec<u8>,
}

fn marshal_results(
    out: &mut Vec<u8>,
    results: &[Vec<u8>],
) -> Result<(), CodecError> {
    put_count(out, "results", results.len())?;
    for result in results {
        put_bytes(out, "result", result)?;
    }
    Ok(())
}

fn unmarshal_results(reader: &mut Reader<'_>) -> Result<Vec<Vec<u8>>, CodecError> {
    let count = reader.u8("result count")?;
    (0..count).map(|_| reader.bytes("result")).collect()
}

#[cfg(test)]
mod tests {
    use alloy_primitives::Address;

    use super::*;
    use crate::request::EthCallData;
    use crate::request::EthCallQueryRequest;
    use crate::request::SolanaAccountQueryRequest;
    use crate::request::SolanaDataSlice;

    fn eth_query(calls: usize) -> PerChainQueryRequest {
        PerChainQueryRequest::new(
            ChainId::ETHEREUM,
            ChainSpecificQuery::EthCall(EthCallQueryRequest {
                block_id: "0x10".to_string(),
                call_data: vec![EthCallData::new(Address::ZERO, vec![1, 2, 3, 4]); calls],
            }),
        )
    }

    fn eth_response(results: usize) -> PerChainQueryResponse {
        PerChainQueryResponse::new(
            ChainId::ETHEREUM,
            ChainSpecificResponse::EthCall(EthCallQueryResponse {
                block: EthBlockInfo {
                    number: 16,
                    hash: B256::repeat_byte(0xab),
                    time: 1_697_216_322_000_000,
                },
                results: vec![vec![0u8; 32]; results],
            }),
        )
    }

    #[test]
    fn test_publication_layout() {
        let request = QueryRequest::new(3, vec![eth_query(1)]);
        let publication = QueryResponsePublication::new(
            SignedQueryRequest::new(request.marshal().unwrap(), vec![0x11; SIGNATURE_LEN]),
            vec![eth_response(1)],
        );
        let bytes = publication.marshal().unwrap();

        assert_eq!(bytes[0], QUERY_RESPONSE_VERSION);
        assert_eq!(&bytes[1..3], &[0, 0]);
        assert_eq!(&bytes[3..3 + SIGNATURE_LEN], &[0x11; SIGNATURE_LEN]);

        let decoded = QueryResponsePublication::unmarshal(&bytes).unwrap();
        assert_eq!(decoded, publication);
        assert!(decoded.check_matches(&request).is_ok());
    }

    #[test]
    fn test_publication_requires_full_signature() {
        let publication = QueryResponsePublication::new(
            SignedQueryRequest::new(vec![1], vec![]),
            vec![eth_response(1)],
        );
        assert_eq!(
            publication.marshal(),
            Err(CodecError::InvalidSignatureLength(0))
        );
    }

    #[test]
    fn test_solana_response_decodes() {
        let response = PerChainQueryResponse::new(
            ChainId::SOLANA,
            ChainSpecificResponse::SolanaPda(SolanaPdaQueryResponse {
                context: SolanaContext {
                    slot: 240_866_260,
                    block_time: 1_704_770_509_000_000,
                    block_hash: [9u8; 32],
                },
                results: vec![SolanaPdaResult {
                    account: [4u8; 32],
                    bump: 253,
                    account_info: SolanaAccountResult {
                        lamports: 1_141_440,
                        rent_epoch: 0,
                        executable: false,
                        owner: [5u8; 32],
                        data: vec![1, 2, 3],
                    },
                }],
            }),
        );
        let publication = QueryResponsePublication::new(
            SignedQueryRequest::new(vec![7, 7], vec![0u8; SIGNATURE_LEN]),
            vec![response],
        );
        let decoded =
            QueryResponsePublication::unmarshal(&publication.marshal().unwrap()).unwrap();
        assert_eq!(decoded, publication);
    }

    #[test]
    fn test_response_must_match_query() {
        let query = eth_query(2);
        assert!(eth_response(2).check_matches(&query).is_ok());
        assert_eq!(
            eth_response(1).check_matches(&query),
            Err(ResponseMismatch::ResultCount {
                expected: 2,
                actual: 1,
            })
        );

        let mut wrong_chain = eth_response(2);
        wrong_chain.chain_id = ChainId::POLYGON;
        assert!(matches!(
            wrong_chain.check_matches(&query),
            Err(ResponseMismatch::Chain { .. })
        ));

        let solana = PerChainQueryRequest::new(
            ChainId::ETHEREUM,
            ChainSpecificQuery::SolanaAccount(SolanaAccountQueryRequest {
                slice: SolanaDataSlice::default(),
                accounts: vec![[1u8; 32], [2u8; 32]],
            }),
        );
        assert_eq!(
            eth_response(2).check_matches(&solana),
            Err(ResponseMismatch::Kind {
                expected: QueryKind::SolanaAccount,
                actual: QueryKind::EthCall,
            })
        );
    }

    #[test]
    fn test_publication_must_align_with_request() {
        let request = QueryRequest::new(1, vec![eth_query(1), eth_query(1)]);
        let publication = QueryResponsePublication::new(
            SignedQueryRequest::new(request.marshal().unwrap(), vec![0u8; SIGNATURE_LEN]),
            vec![eth_response(1)],
        );
        assert_eq!(
            publication.check_matches(&request),
            Err(ResponseMismatch::ResponseCount {
                expected: 2,
                actual: 1,
            })
        );
    }
}
