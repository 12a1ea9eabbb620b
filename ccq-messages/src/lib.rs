mod chain;
mod codec;
pub mod digest;
pub mod internal;
pub mod request;
pub mod response;

pub use chain::ChainId;
pub use codec::CodecError;
pub use digest::query_request_digest;
pub use digest::query_response_digest;
pub use digest::Environment;
pub use internal::PerChainQueryInternal;
pub use internal::PerChainQueryResponseInternal;
pub use internal::QueryStatus;
pub use internal::RequestId;
pub use request::ChainSpecificQuery;
pub use request::PerChainQueryRequest;
pub use request::QueryKind;
pub use request::QueryRequest;
pub use request::SignedQueryRequest;
pub use response::ChainSpecificResponse;
pub use response::PerChainQueryResponse;
pub use response::QueryResponsePublication;
pub use response::SignedQueryResponse;

pub fn hex_pretty(data: &Vec<u8>) -> String {
    format!("0x{}", hex::encode(data))
}

pub fn hex_list_pretty(data: &Vec<Vec<u8>>) -> String {
    format!("[{}]", data.iter().map(hex_pretty).collect::<Vec<_>>().join(", "))
}
