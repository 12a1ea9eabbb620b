use std::collections::HashSet;
use std::str::FromStr;

use alloy_primitives::Address;
use anyhow::bail;
use anyhow::Context;
use anyhow::Result;

/// The set of addresses allowed to sign query requests.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AllowedRequesters(HashSet<Address>);

impl AllowedRequesters {
    pub fn new(addresses: impl IntoIterator<Item = Address>) -> Self {
        Self(addresses.into_iter().collect())
    }

    pub fn contains(
        &self,
        address: &Address,
    ) -> bool {
        self.0.contains(address)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for AllowedRequesters {
    type Err = anyhow::Error;

    /// Parses a comma separated list of hex addresses, with or without `0x`.
    fn from_str(s: &str) -> Result<Self> {
        let mut addresses = HashSet::new();
        for entry in s.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let bytes = hex::decode(entry.trim_start_matches("0x"))
                .with_context(|| format!("invalid requester address: {entry}"))?;
            if bytes.len() != 20 {
                bail!("invalid requester address length: {entry}");
            }
            addresses.insert(Address::from_slice(&bytes));
        }
        if addresses.is_empty() {
            bail!("no allowed requesters specified");
        }
        Ok(Self(addresses))
    }
}
