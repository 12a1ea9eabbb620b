//! Signing and signer recovery for query requests and responses.
mod requesters;
mod signer;

pub use ccq_messages::request::SIGNATURE_LEN;
pub use requesters::AllowedRequesters;
pub use signer::recover_signer;
pub use signer::DigestSigner;
