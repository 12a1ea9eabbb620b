use std::fmt::Display;
use std::fmt::Formatter;

use serde_derive::Deserialize;
use serde_derive::Serialize;

/// Network-wide chain identifier, as used in the query wire format.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ChainId(pub u16);

impl ChainId {
    pub const UNSET: ChainId = ChainId(0);
    pub const SOLANA: ChainId = ChainId(1);
    pub const ETHEREUM: ChainId = ChainId(2);
    pub const BSC: ChainId = ChainId(4);
    pub const POLYGON: ChainId = ChainId(5);
    pub const AVALANCHE: ChainId = ChainId(6);
    pub const ARBITRUM: ChainId = ChainId(23);
    pub const OPTIMISM: ChainId = ChainId(24);
    pub const BASE: ChainId = ChainId(30);
    pub const SEPOLIA: ChainId = ChainId(10002);

    /// Human readable name for the well known chains.
    pub fn name(&self) -> Option<&'static str> {
        match *self {
            Self::SOLANA => Some("solana"),
            Self::ETHEREUM => Some("ethereum"),
            Self::BSC => Some("bsc"),
            Self::POLYGON => Some("polygon"),
            Self::AVALANCHE => Some("avalanche"),
            Self::ARBITRUM => Some("arbitrum"),
            Self::OPTIMISM => Some("optimism"),
            Self::BASE => Some("base"),
            Self::SEPOLIA => Some("sepolia"),
            _ => None,
        }
    }
}

impl From<u16> for ChainId {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl Display for ChainId {
    fn fmt(
        &self,
        f: &mut Formatter<'_>,
    ) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "{}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_falls_back_to_number() {
        assert_eq!(ChainId::POLYGON.to_string(), "polygon");
        assert_eq!(ChainId(4242).to_string(), "4242");
    }
}
