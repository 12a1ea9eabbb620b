//! Per caller allow lists, loaded once at startup from a JSON file.
//!
//! Every authorized call is flattened into a call key such as
//! `ethCall:2:0x<contract>:0x<selector>` or `solAccount:1:<base58 account>`,
//! and a request is authorized when each of its calls has a matching key.
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;

use anyhow::bail;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use ccq_messages::ChainId;
use ccq_messages::ChainSpecificQuery;
use ccq_messages::PerChainQueryRequest;
use ccq_messages::QueryKind;
use serde_derive::Deserialize;
use tracing::info;

#[derive(Deserialize, Debug)]
struct PermissionsFile {
    permissions: Vec<UserEntry>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct UserEntry {
    user_name: String,
    api_key: String,
    #[serde(default)]
    allow_unsigned: bool,
    allowed_calls: Vec<AllowedCall>,
}

#[derive(Deserialize, Debug)]
enum AllowedCall {
    #[serde(rename = "ethCall")]
    EthCall(EthCallEntry),
    #[serde(rename = "ethCallByTimestamp")]
    EthCallByTimestamp(EthCallEntry),
    #[serde(rename = "ethCallWithFinality")]
    EthCallWithFinality(EthCallEntry),
    #[serde(rename = "solAccount")]
    SolAccount(SolAccountEntry),
    #[serde(rename = "solPDA")]
    SolPda(SolPdaEntry),
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct EthCallEntry {
    chain: u16,
    contract_address: String,
    call: String,
}

#[derive(Deserialize, Debug)]
struct SolAccountEntry {
    chain: u16,
    account: String,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SolPdaEntry {
    chain: u16,
    program_address: String,
}

/// What a single caller is allowed to do.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PermissionEntry {
    pub user_name: String,
    pub allow_unsigned: bool,
    allowed_calls: HashSet<String>,
}

impl PermissionEntry {
    pub fn is_allowed(
        &self,
        call_key: &str,
    ) -> bool {
        self.allowed_calls.contains(call_key)
    }
}

/// Permissions of all callers, keyed by API key.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PermissionTable {
    users: HashMap<String, PermissionEntry>,
}

impl PermissionTable {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading permissions file {}", path.display()))?;
        let table = Self::parse(&json)
            .with_context(|| format!("parsing permissions file {}", path.display()))?;
        info!(
            users = table.users.len(),
            "loaded permissions from {}",
            path.display()
        );
        Ok(table)
    }

    pub fn parse(json: &str) -> Result<Self> {
        let file: PermissionsFile = serde_json::from_str(json)?;

        let mut user_names = HashSet::new();
        let mut users = HashMap::new();
        for user in file.permissions {
            ensure!(!user.user_name.is_empty(), "user name may not be empty");
            ensure!(
                !user.api_key.is_empty(),
                "api key for user {} may not be empty",
                user.user_name
            );
            ensure!(
                user_names.insert(user.user_name.clone()),
                "duplicate user name: {}",
                user.user_name
            );
            ensure!(
                !users.contains_key(&user.api_key),
                "duplicate api key for user {}",
                user.user_name
            );
            ensure!(
                !user.allowed_calls.is_empty(),
                "no allowed calls specified for user {}",
                user.user_name
            );

            let allowed_calls = user
                .allowed_calls
                .iter()
                .map(AllowedCall::call_key)
                .collect::<Result<HashSet<_>>>()
                .with_context(|| format!("invalid allowed call for user {}", user.user_name))?;

            users.insert(
                user.api_key,
                PermissionEntry {
                    user_name: user.user_name,
                    allow_unsigned: user.allow_unsigned,
                    allowed_calls,
                },
            );
        }

        Ok(Self { users })
    }

    pub fn get(
        &self,
        api_key: &str,
    ) -> Option<&PermissionEntry> {
        self.users.get(api_key)
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl AllowedCall {
    fn call_key(&self) -> Result<String> {
        match self {
            AllowedCall::EthCall(entry) => entry.call_key(QueryKind::EthCall),
            AllowedCall::EthCallByTimestamp(entry) => entry.call_key(QueryKind::EthCallByTimestamp),
            AllowedCall::EthCallWithFinality(entry) => {
                entry.call_key(QueryKind::EthCallWithFinality)
            },
            AllowedCall::SolAccount(entry) => {
                let account = parse_solana_address(&entry.account)?;
                Ok(solana_call_key(
                    QueryKind::SolanaAccount,
                    ChainId(entry.chain),
                    &account,
                ))
            },
            AllowedCall::SolPda(entry) => {
                let program = parse_solana_address(&entry.program_address)?;
                Ok(solana_call_key(
                    QueryKind::SolanaPda,
                    ChainId(entry.chain),
                    &program,
                ))
            },
        }
    }
}

impl EthCallEntry {
    fn call_key(
        &self,
        kind: QueryKind,
    ) -> Result<String> {
        let contract = decode_hex(&self.contract_address)
            .with_context(|| format!("invalid contract address {}", self.contract_address))?;
        ensure!(
            contract.len() == 20,
            "contract address {} must be 20 bytes",
            self.contract_address
        );
        let selector = decode_hex(&self.call)
            .with_context(|| format!("invalid call {}", self.call))?;
        ensure!(
            selector.len() == 4,
            "call {} must be a 4 byte function selector",
            self.call
        );
        Ok(eth_call_key(kind, ChainId(self.chain), &contract, &selector))
    }
}

/// Returns the call key of every call, account or PDA in `query`, in order.
pub fn call_keys(query: &PerChainQueryRequest) -> Vec<String> {
    let kind = query.kind();
    let chain_id = query.chain_id;
    match &query.query {
        ChainSpecificQuery::EthCall(q) => eth_call_keys(kind, chain_id, &q.call_data),
        ChainSpecificQuery::EthCallByTimestamp(q) => eth_call_keys(kind, chain_id, &q.call_data),
        ChainSpecificQuery::EthCallWithFinality(q) => eth_call_keys(kind, chain_id, &q.call_data),
        ChainSpecificQuery::SolanaAccount(q) => {
            q.accounts
                .iter()
                .map(|account| solana_call_key(kind, chain_id, account))
                .collect()
        },
        ChainSpecificQuery::SolanaPda(q) => {
            q.pdas
                .iter()
                .map(|pda| solana_call_key(kind, chain_id, &pda.program_address))
                .collect()
        },
    }
}

fn eth_call_keys(
    kind: QueryKind,
    chain_id: ChainId,
    calls: &[ccq_messages::request::EthCallData],
) -> Vec<String> {
    calls
        .iter()
        .map(|call| eth_call_key(kind, chain_id, call.to.as_slice(), call.selector()))
        .collect()
}

fn eth_call_key(
    kind: QueryKind,
    chain_id: ChainId,
    contract: &[u8],
    selector: &[u8],
) -> String {
    format!(
        "{}:{}:0x{}:0x{}",
        kind.call_tag(),
        chain_id.0,
        hex::encode(contract),
        hex::encode(selector)
    )
}

fn solana_call_key(
    kind: QueryKind,
    chain_id: ChainId,
    address: &[u8],
) -> String {
    format!(
        "{}:{}:{}",
        kind.call_tag(),
        chain_id.0,
        bs58::encode(address).into_string()
    )
}

fn decode_hex(value: &str) -> Result<Vec<u8>> {
    Ok(hex::decode(value.trim_start_matches("0x"))?)
}

/// Solana addresses are accepted in base58 or as `0x` prefixed hex.
fn parse_solana_address(value: &str) -> Result<Vec<u8>> {
    let bytes = if value.starts_with("0x") {
        decode_hex(value)?
    } else {
        bs58::decode(value)
            .into_vec()
            .with_context(|| format!("invalid base58 address {value}"))?
    };
    if bytes.len() != 32 {
        bail!("solana address {value} must be 32 bytes");
    }
    Ok(bytes)
}
