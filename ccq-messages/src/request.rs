//! Query requests as submitted by CCQ callers.
use std::fmt::Display;
use std::fmt::Formatter;

use alloy_primitives::Address;
use bytes::BufMut;
use derive_debug_plus::Dbg;
use serde_derive::Deserialize;
use serde_derive::Serialize;
use thiserror::Error;

use crate::codec::put_bytes;
use crate::codec::put_count;
use crate::codec::CodecError;
use crate::codec::Reader;
use crate::ChainId;

pub const QUERY_REQUEST_VERSION: u8 = 1;

/// Upper bound for the number of sub-queries, calls, accounts and PDAs, all
/// of which are encoded with a one byte count.
pub const MAX_ENTRIES: usize = u8::MAX as usize;

pub const SOLANA_MAX_SEEDS: usize = 16;
pub const SOLANA_MAX_SEED_LEN: usize = 32;
pub const SOLANA_ACCOUNT_LEN: usize = 32;

/// Length of an `r || s || v` request signature.
pub const SIGNATURE_LEN: usize = 65;

/// The only commitment level accepted for Solana queries.
pub const SOLANA_COMMITMENT_FINALIZED: &str = "finalized";

/// The kind of a per chain query, which is also its wire tag.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum QueryKind {
    EthCall,
    EthCallByTimestamp,
    EthCallWithFinality,
    SolanaAccount,
    SolanaPda,
}

impl QueryKind {
    pub fn tag(&self) -> u8 {
        match self {
            QueryKind::EthCall => 1,
            QueryKind::EthCallByTimestamp => 2,
            QueryKind::EthCallWithFinality => 3,
            QueryKind::SolanaAccount => 4,
            QueryKind::SolanaPda => 5,
        }
    }

    pub fn from_tag(tag: u8) -> Result<Self, CodecError> {
        match tag {
            1 => Ok(QueryKind::EthCall),
            2 => Ok(QueryKind::EthCallByTimestamp),
            3 => Ok(QueryKind::EthCallWithFinality),
            4 => Ok(QueryKind::SolanaAccount),
            5 => Ok(QueryKind::SolanaPda),
            other => Err(CodecError::UnsupportedQueryType(other)),
        }
    }

    /// Prefix used by the permission call keys.
    pub fn call_tag(&self) -> &'static str {
        match self {
            QueryKind::EthCall => "ethCall",
            QueryKind::EthCallByTimestamp => "ethCallByTimestamp",
            QueryKind::EthCallWithFinality => "ethCallWithFinality",
            QueryKind::SolanaAccount => "solAccount",
            QueryKind::SolanaPda => "solPDA",
        }
    }
}

impl Display for QueryKind {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "{}", self.call_tag())
    }
}

#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("request does not contain any per chain queries")]
    NoQueries,

    #[error("request contains too many per chain queries: {0}")]
    TooManyQueries(usize),

    #[error("per chain query {idx} is invalid: {reason}")]
    InvalidQuery { idx: usize, reason: String },
}

/// A request envelope as received from the network: the serialized
/// [`QueryRequest`] and the requester's signature over its digest.
#[derive(Clone, PartialEq, Eq)]
pub struct SignedQueryRequest {
    pub query_request: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedQueryRequest {
    pub fn new(
        query_request: Vec<u8>,
        signature: Vec<u8>,
    ) -> Self {
        Self {
            query_request,
            signature,
        }
    }

    pub fn is_signed(&self) -> bool {
        !self.signature.is_empty()
    }
}

impl std::fmt::Debug for SignedQueryRequest {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        write!(
            f,
            "SIGNED_REQ<{} bytes, sig {}>",
            self.query_request.len(),
            hex::encode(&self.signature)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryRequest {
    pub nonce: u32,
    pub per_chain_queries: Vec<PerChainQueryRequest>,
}

impl QueryRequest {
    pub fn new(
        nonce: u32,
        per_chain_queries: Vec<PerChainQueryRequest>,
    ) -> Self {
        Self {
            nonce,
            per_chain_queries,
        }
    }

    pub fn marshal(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::new();
        out.put_u8(QUERY_REQUEST_VERSION);
        out.put_u32(self.nonce);
        put_count(&mut out, "per chain queries", self.per_chain_queries.len())?;
        for pcq in &self.per_chain_queries {
            pcq.marshal_into(&mut out)?;
        }
        Ok(out)
    }

    pub fn unmarshal(data: &[u8]) -> Result<Self, CodecError> {
        let mut reader = Reader::new(data);
        let version = reader.u8("version")?;
        if version != QUERY_REQUEST_VERSION {
            return Err(CodecError::UnsupportedVersion(version));
        }
        let nonce = reader.u32("nonce")?;
        let count = reader.u8("per chain query count")?;
        let per_chain_queries = (0..count)
            .map(|_| PerChainQueryRequest::unmarshal_from(&mut reader))
            .collect::<Result<Vec<_>, _>>()?;
        reader.finish("query request")?;
        Ok(Self {
            nonce,
            per_chain_queries,
        })
    }

    /// Structural checks on a decoded request.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.per_chain_queries.is_empty() {
            return Err(ValidationError::NoQueries);
        }
        if self.per_chain_queries.len() > MAX_ENTRIES {
            return Err(ValidationError::TooManyQueries(
                self.per_chain_queries.len(),
            ));
        }
        for (idx, pcq) in self.per_chain_queries.iter().enumerate() {
            pcq.validate()
                .map_err(|reason| ValidationError::InvalidQuery { idx, reason })?;
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PerChainQueryRequest {
    pub chain_id: ChainId,
    pub query: ChainSpecificQuery,
}

impl PerChainQueryRequest {
    pub fn new(
        chain_id: ChainId,
        query: ChainSpecificQuery,
    ) -> Self {
        Self { chain_id, query }
    }

    pub fn kind(&self) -> QueryKind {
        self.query.kind()
    }

    fn marshal_into(
        &self,
        out: &mut Vec<u8>,
    ) -> Result<(), CodecError> {
        out.put_u16(self.chain_id.0);
        out.put_u8(self.kind().tag());
        let mut query = Vec::new();
        self.query.marshal_into(&mut query)?;
        put_bytes(out, "query", &query)
    }

    fn unmarshal_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        let chain_id = ChainId(reader.u16("chain id")?);
        let kind = QueryKind::from_tag(reader.u8("query type")?)?;
        let query = reader.bytes("query")?;
        let mut query_reader = Reader::new(&query);
        let query = ChainSpecificQuery::unmarshal_from(kind, &mut query_reader)?;
        query_reader.finish("per chain query")?;
        Ok(Self { chain_id, query })
    }

    fn validate(&self) -> Result<(), String> {
        if self.chain_id == ChainId::UNSET {
            return Err("chain id must be set".to_string());
        }
        self.query.validate()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainSpecificQuery {
    EthCall(EthCallQueryRequest),
    EthCallByTimestamp(EthCallByTimestampQueryRequest),
    EthCallWithFinality(EthCallWithFinalityQueryRequest),
    SolanaAccount(SolanaAccountQueryRequest),
    SolanaPda(SolanaPdaQueryRequest),
}

impl ChainSpecificQuery {
    pub fn kind(&self) -> QueryKind {
        match self {
            ChainSpecificQuery::EthCall(_) => QueryKind::EthCall,
            ChainSpecificQuery::EthCallByTimestamp(_) => QueryKind::EthCallByTimestamp,
            ChainSpecificQuery::EthCallWithFinality(_) => QueryKind::EthCallWithFinality,
            ChainSpecificQuery::SolanaAccount(_) => QueryKind::SolanaAccount,
            ChainSpecificQuery::SolanaPda(_) => QueryKind::SolanaPda,
        }
    }

    /// Number of individual results a watcher must return for this query.
    pub fn result_count(&self) -> usize {
        match self {
            ChainSpecificQuery::EthCall(q) => q.call_data.len(),
            ChainSpecificQuery::EthCallByTimestamp(q) => q.call_data.len(),
            ChainSpecificQuery::EthCallWithFinality(q) => q.call_data.len(),
            ChainSpecificQuery::SolanaAccount(q) => q.accounts.len(),
            ChainSpecificQuery::SolanaPda(q) => q.pdas.len(),
        }
    }

    fn marshal_into(
        &self,
        out: &mut Vec<u8>,
    ) -> Result<(), CodecError> {
        match self {
            ChainSpecificQuery::EthCall(q) => {
                put_bytes(out, "block id", q.block_id.as_bytes())?;
                marshal_call_data(out, &q.call_data)
            },
            ChainSpecificQuery::EthCallByTimestamp(q) => {
                out.put_u64(q.target_timestamp);
                put_bytes(out, "target block hint", q.target_block_id_hint.as_bytes())?;
                put_bytes(
                    out,
                    "following block hint",
                    q.following_block_id_hint.as_bytes(),
                )?;
                marshal_call_data(out, &q.call_data)
            },
            ChainSpecificQuery::EthCallWithFinality(q) => {
                put_bytes(out, "block id", q.block_id.as_bytes())?;
                put_bytes(out, "finality", q.finality.as_bytes())?;
                marshal_call_data(out, &q.call_data)
            },
            ChainSpecificQuery::SolanaAccount(q) => {
                q.slice.marshal_into(out)?;
                put_count(out, "accounts", q.accounts.len())?;
                for account in &q.accounts {
                    out.put_slice(account);
                }
                Ok(())
            },
            ChainSpecificQuery::SolanaPda(q) => {
                q.slice.marshal_into(out)?;
                put_count(out, "pdas", q.pdas.len())?;
                for pda in &q.pdas {
                    out.put_slice(&pda.program_address);
                    put_count(out, "seeds", pda.seeds.len())?;
                    for seed in &pda.seeds {
                        put_bytes(out, "seed", seed)?;
                    }
                }
                Ok(())
            },
        }
    }

    fn unmarshal_from(
        kind: QueryKind,
        reader: &mut Reader<'_>,
    ) -> Result<Self, CodecError> {
        let query = match kind {
            QueryKind::EthCall => {
                ChainSpecificQuery::EthCall(EthCallQueryRequest {
                    block_id: reader.string("block id")?,
                    call_data: unmarshal_call_data(reader)?,
                })
            },
            QueryKind::EthCallByTimestamp => {
                ChainSpecificQuery::EthCallByTimestamp(EthCallByTimestampQueryRequest {
                    target_timestamp: reader.u64("target timestamp")?,
                    target_block_id_hint: reader.string("target block hint")?,
                    following_block_id_hint: reader.string("following block hint")?,
                    call_data: unmarshal_call_data(reader)?,
                })
            },
            QueryKind::EthCallWithFinality => {
                ChainSpecificQuery::EthCallWithFinality(EthCallWithFinalityQueryRequest {
                    block_id: reader.string("block id")?,
                    finality: reader.string("finality")?,
                    call_data: unmarshal_call_data(reader)?,
                })
            },
            QueryKind::SolanaAccount => {
                let slice = SolanaDataSlice::unmarshal_from(reader)?;
                let count = reader.u8("account count")?;
                let accounts = (0..count)
                    .map(|_| reader.array::<SOLANA_ACCOUNT_LEN>("account"))
                    .collect::<Result<Vec<_>, _>>()?;
                ChainSpecificQuery::SolanaAccount(SolanaAccountQueryRequest { slice, accounts })
            },
            QueryKind::SolanaPda => {
                let slice = SolanaDataSlice::unmarshal_from(reader)?;
                let count = reader.u8("pda count")?;
                let mut pdas = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let program_address = reader.array::<SOLANA_ACCOUNT_LEN>("program address")?;
                    let num_seeds = reader.u8("seed count")?;
                    let seeds = (0..num_seeds)
                        .map(|_| reader.bytes("seed"))
                        .collect::<Result<Vec<_>, _>>()?;
                    pdas.push(SolanaPdaEntry {
                        program_address,
                        seeds,
                    });
                }
                ChainSpecificQuery::SolanaPda(SolanaPdaQueryRequest { slice, pdas })
            },
        };
        Ok(query)
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            ChainSpecificQuery::EthCall(q) => {
                validate_block_id(&q.block_id)?;
                validate_call_data(&q.call_data)
            },
            ChainSpecificQuery::EthCallByTimestamp(q) => {
                if q.target_timestamp == 0 {
                    return Err("target timestamp may not be zero".to_string());
                }
                match (
                    q.target_block_id_hint.is_empty(),
                    q.following_block_id_hint.is_empty(),
                ) {
                    (true, true) => {},
                    (false, false) => {
                        validate_block_id(&q.target_block_id_hint)?;
                        validate_block_id(&q.following_block_id_hint)?;
                    },
                    _ => {
                        return Err(
                            "target and following block hints must both be set or both be empty"
                                .to_string(),
                        )
                    },
                }
                validate_call_data(&q.call_data)
            },
            ChainSpecificQuery::EthCallWithFinality(q) => {
                validate_block_id(&q.block_id)?;
                if q.finality != "finalized" && q.finality != "safe" {
                    return Err(format!(
                        r#"finality must be "finalized" or "safe", is "{}""#,
                        q.finality
                    ));
                }
                validate_call_data(&q.call_data)
            },
            ChainSpecificQuery::SolanaAccount(q) => {
                q.slice.validate()?;
                validate_count("accounts", q.accounts.len())
            },
            ChainSpecificQuery::SolanaPda(q) => {
                q.slice.validate()?;
                validate_count("pdas", q.pdas.len())?;
                for (idx, pda) in q.pdas.iter().enumerate() {
                    if pda.seeds.is_empty() || pda.seeds.len() > SOLANA_MAX_SEEDS {
                        return Err(format!(
                            "pda {idx} must have between 1 and {SOLANA_MAX_SEEDS} seeds, has {}",
                            pda.seeds.len()
                        ));
                    }
                    if let Some(seed) = pda
                        .seeds
                        .iter()
                        .find(|s| s.is_empty() || s.len() > SOLANA_MAX_SEED_LEN)
                    {
                        return Err(format!(
                            "pda {idx} has a seed of invalid length {}",
                            seed.len()
                        ));
                    }
                }
                Ok(())
            },
        }
    }
}

/// A single `eth_call` against a contract.
#[derive(Clone, Dbg, PartialEq, Eq)]
pub struct EthCallData {
    pub to: Address,
    #[dbg(formatter = crate::hex_pretty)]
    pub data: Vec<u8>,
}

impl EthCallData {
    pub fn new(
        to: Address,
        data: Vec<u8>,
    ) -> Self {
        Self { to, data }
    }

    /// The function selector: the first four bytes of the call data, or all
    /// of it when shorter.
    pub fn selector(&self) -> &[u8] {
        &self.data[..self.data.len().min(4)]
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EthCallQueryRequest {
    /// Block number or hash, hex encoded with a `0x` prefix.
    pub block_id: String,
    pub call_data: Vec<EthCallData>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EthCallByTimestampQueryRequest {
    /// Target time in microseconds since the epoch.
    pub target_timestamp: u64,
    pub target_block_id_hint: String,
    pub following_block_id_hint: String,
    pub call_data: Vec<EthCallData>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EthCallWithFinalityQueryRequest {
    pub block_id: String,
    /// Either `finalized` or `safe`.
    pub finality: String,
    pub call_data: Vec<EthCallData>,
}

/// Commitment and data slice parameters shared by the Solana queries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SolanaDataSlice {
    pub commitment: String,
    pub min_context_slot: u64,
    pub data_slice_offset: u64,
    pub data_slice_length: u64,
}

impl Default for SolanaDataSlice {
    fn default() -> Self {
        Self {
            commitment: SOLANA_COMMITMENT_FINALIZED.to_string(),
            min_context_slot: 0,
            data_slice_offset: 0,
            data_slice_length: 0,
        }
    }
}

impl SolanaDataSlice {
    fn marshal_into(
        &self,
        out: &mut Vec<u8>,
    ) -> Result<(), CodecError> {
        put_bytes(out, "commitment", self.commitment.as_bytes())?;
        out.put_u64(self.min_context_slot);
        out.put_u64(self.data_slice_offset);
        out.put_u64(self.data_slice_length);
        Ok(())
    }

    fn unmarshal_from(reader: &mut Reader<'_>) -> Result<Self, CodecError> {
        Ok(Self {
            commitment: reader.string("commitment")?,
            min_context_slot: reader.u64("min context slot")?,
            data_slice_offset: reader.u64("data slice offset")?,
            data_slice_length: reader.u64("data slice length")?,
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.commitment != SOLANA_COMMITMENT_FINALIZED {
            return Err(format!(
                r#"commitment must be "{SOLANA_COMMITMENT_FINALIZED}", is "{}""#,
                self.commitment
            ));
        }
        if self.data_slice_offset != 0 && self.data_slice_length == 0 {
            return Err("data slice offset requires a data slice length".to_string());
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SolanaAccountQueryRequest {
    pub slice: SolanaDataSlice,
    pub accounts: Vec<[u8; SOLANA_ACCOUNT_LEN]>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SolanaPdaEntry {
    pub program_address: [u8; SOLANA_ACCOUNT_LEN],
    pub seeds: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SolanaPdaQueryRequest {
    pub slice: SolanaDataSlice,
    pub pdas: Vec<SolanaPdaEntry>,
}

fn marshal_call_data(
    out: &mut Vec<u8>,
    call_data: &[EthCallData],
) -> Result<(), CodecError> {
    put_count(out, "call data", call_data.len())?;
    for call in call_data {
        out.put_slice(call.to.as_slice());
        put_bytes(out, "call data", &call.data)?;
    }
    Ok(())
}

fn unmarshal_call_data(reader: &mut Reader<'_>) -> Result<Vec<EthCallData>, CodecError> {
    let count = reader.u8("call data count")?;
    (0..count)
        .map(|_| {
            let to = Address::from(reader.array::<20>("call target")?);
            let data = reader.bytes("call data")?;
            Ok(EthCallData { to, data })
        })
        .collect()
}

fn validate_block_id(block_id: &str) -> Result<(), String> {
    if block_id.is_empty() {
        return Err("block id is required".to_string());
    }
    if !block_id.starts_with("0x") {
        return Err(format!(
            r#"block id must be a hex number or hash starting with 0x, is "{block_id}""#
        ));
    }
    Ok(())
}

fn validate_call_data(call_data: &[EthCallData]) -> Result<(), String> {
    validate_count("call data", call_data.len())?;
    if let Some(idx) = call_data.iter().position(|c| c.data.is_empty()) {
        return Err(format!("call data {idx} is empty"));
    }
    Ok(())
}

fn validate_count(
    what: &str,
    count: usize,
) -> Result<(), String> {
    if count == 0 {
        return Err(format!("at least one entry is required in {what}"));
    }
    if count > MAX_ENTRIES {
        return Err(format!("too many entries in {what}: {count}"));
    }
    Ok(())
}
