use std::fmt::Display;
use std::fmt::Formatter;
use std::str::FromStr;

use alloy_primitives::keccak256;
use alloy_primitives::B256;
use serde_derive::Deserialize;
use serde_derive::Serialize;

pub const MAINNET_QUERY_REQUEST_PREFIX: &[u8] = b"mainnet_query_request_000000000000|";
pub const TESTNET_QUERY_REQUEST_PREFIX: &[u8] = b"testnet_query_request_000000000000|";
pub const DEVNET_QUERY_REQUEST_PREFIX: &[u8] = b"devnet_query_request_0000000000000|";
pub const QUERY_RESPONSE_PREFIX: &[u8] = b"query_response_0000000000000000000|";

/// The network a guardian runs in. Request digests are domain separated by
/// environment so a signature for one network is never valid on another.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    MainNet,
    TestNet,
    DevNet,
}

impl Environment {
    pub fn request_prefix(&self) -> &'static [u8] {
        match self {
            Environment::MainNet => MAINNET_QUERY_REQUEST_PREFIX,
            Environment::TestNet => TESTNET_QUERY_REQUEST_PREFIX,
            Environment::DevNet => DEVNET_QUERY_REQUEST_PREFIX,
        }
    }
}

impl Display for Environment {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        let name = match self {
            Environment::MainNet => "mainnet",
            Environment::TestNet => "testnet",
            Environment::DevNet => "devnet",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Environment::MainNet),
            "testnet" => Ok(Environment::TestNet),
            "devnet" => Ok(Environment::DevNet),
            other => Err(format!("unknown environment: {other}")),
        }
    }
}

/// Digest a requester signs over a serialized [`crate::QueryRequest`].
pub fn query_request_digest(
    env: Environment,
    request: &[u8],
) -> B256 {
    prefixed_digest(env.request_prefix(), request)
}

/// Digest the guardian signs over a serialized
/// [`crate::QueryResponsePublication`].
pub fn query_response_digest(response: &[u8]) -> B256 {
    prefixed_digest(QUERY_RESPONSE_PREFIX, response)
}

fn prefixed_digest(
    prefix: &[u8],
    data: &[u8],
) -> B256 {
    let inner = keccak256(data);
    let mut buf = Vec::with_capacity(prefix.len() + inner.len());
    buf.extend_from_slice(prefix);
    buf.extend_from_slice(inner.as_slice());
    keccak256(buf)
}
