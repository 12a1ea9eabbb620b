use std::fmt::Debug;
use std::fmt::Formatter;

use alloy_primitives::keccak256;
use alloy_primitives::Address;
use alloy_primitives::B256;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use ccq_messages::request::SIGNATURE_LEN;
use elliptic_curve::sec1::ToEncodedPoint;
use k256::ecdsa::RecoveryId;
use k256::ecdsa::Signature;
use k256::ecdsa::SigningKey;
use k256::ecdsa::VerifyingKey;
use k256::PublicKey;
use rand::rngs::OsRng;

/// Signs 32 byte digests with a secp256k1 key, producing Ethereum style
/// `r || s || v` signatures with `v` in `{0, 1}`.
#[derive(Clone)]
pub struct DigestSigner {
    key: SigningKey,
    address: Address,
}

impl DigestSigner {
    pub fn new(key: SigningKey) -> Self {
        let address = address_of(key.verifying_key());
        Self { key, address }
    }

    pub fn random() -> Self {
        Self::new(SigningKey::random(&mut OsRng))
    }

    /// Parses a hex encoded private key, with or without `0x` prefix.
    pub fn from_hex(private_key: &str) -> Result<Self> {
        let bytes = hex::decode(private_key.trim().trim_start_matches("0x"))
            .context("private key is not valid hex")?;
        let key = SigningKey::from_slice(&bytes).context("invalid secp256k1 private key")?;
        Ok(Self::new(key))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn sign(
        &self,
        digest: &B256,
    ) -> Result<[u8; SIGNATURE_LEN]> {
        let (signature, recovery_id) = self.key.sign_prehash_recoverable(digest.as_slice())?;
        let mut out = [0u8; SIGNATURE_LEN];
        out[..64].copy_from_slice(&signature.to_bytes());
        out[64] = recovery_id.to_byte();
        Ok(out)
    }
}

impl Debug for DigestSigner {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        write!(f, "DigestSigner({})", self.address)
    }
}

/// Recovers the address which signed `digest`.
///
/// Accepts `v` as either `{0, 1}` or `{27, 28}`.
pub fn recover_signer(
    digest: &B256,
    signature: &[u8],
) -> Result<Address> {
    if signature.len() != SIGNATURE_LEN {
        bail!("invalid signature length: {}", signature.len());
    }
    let mut signature_rs = Signature::from_slice(&signature[..64])?;
    let v = match signature[64] {
        v @ (27 | 28) => v - 27,
        v => v,
    };
    let mut recovery_id =
        RecoveryId::from_byte(v).with_context(|| format!("invalid recovery id: {v}"))?;

    // Normalize into "low S" form. See:
    // - https://github.com/RustCrypto/elliptic-curves/issues/988
    if let Some(normalized) = signature_rs.normalize_s() {
        signature_rs = normalized;
        recovery_id = RecoveryId::from_byte(recovery_id.to_byte() ^ 1)
            .context("failed to flip recovery id")?;
    }

    let verifying_key =
        VerifyingKey::recover_from_prehash(digest.as_slice(), &signature_rs, recovery_id)?;

    Ok(address_of(&verifying_key))
}

fn address_of(verifying_key: &VerifyingKey) -> Address {
    let public_key = PublicKey::from(verifying_key);
    let public_key = public_key.to_encoded_point(
        // compress =
        false,
    );
    let public_key = public_key.as_bytes();
    debug_assert_eq!(public_key[0], 0x04);

    Address::from_slice(&keccak256(&public_key[1..]).as_slice()[12..])
}
