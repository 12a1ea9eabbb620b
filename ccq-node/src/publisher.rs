use alloy_primitives::Address;
use anyhow::Context;
use anyhow::Result;
use ccq_auth::DigestSigner;
use ccq_messages::query_response_digest;
use ccq_messages::QueryResponsePublication;
use ccq_messages::SignedQueryResponse;

/// Signs completed publications with the guardian key.
#[derive(Clone, Debug)]
pub struct ResponseSigner {
    signer: DigestSigner,
}

impl ResponseSigner {
    pub fn new(signer: DigestSigner) -> Self {
        Self { signer }
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn sign(
        &self,
        publication: &QueryResponsePublication,
    ) -> Result<SignedQueryResponse> {
        let bytes = publication
            .marshal()
            .context("failed to marshal query response")?;
        let digest = query_response_digest(&bytes);
        let signature = self
            .signer
            .sign(&digest)
            .context("failed to sign query response")?;
        Ok(SignedQueryResponse {
            bytes,
            signature: signature.to_vec(),
        })
    }
}
