use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// Identifies a chain by its guardian-network chain number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChainId(pub u16);

impl ChainId {
    pub const SOLANA: ChainId = ChainId(1);
    pub const ETHEREUM: ChainId = ChainId(2);
    pub const TERRA: ChainId = ChainId(3);
    pub const BSC: ChainId = ChainId(4);
    pub const POLYGON: ChainId = ChainId(5);
    pub const AVALANCHE: ChainId = ChainId(6);
    pub const OASIS: ChainId = ChainId(7);
    pub const ALGORAND: ChainId = ChainId(8);
    pub const AURORA: ChainId = ChainId(9);
    pub const FANTOM: ChainId = ChainId(10);
    pub const KARURA: ChainId = ChainId(11);
    pub const ACALA: ChainId = ChainId(12);
    pub const KLAYTN: ChainId = ChainId(13);
    pub const CELO: ChainId = ChainId(14);
    pub const NEAR: ChainId = ChainId(15);
    pub const MOONBEAM: ChainId = ChainId(16);
    pub const ARBITRUM: ChainId = ChainId(23);
    pub const OPTIMISM: ChainId = ChainId(24);
    pub const BASE: ChainId = ChainId(30);
    pub const SEPOLIA: ChainId = ChainId(10002);

    pub fn name(&self) -> Option<&'static str> {
        let name = match *self {
            ChainId::SOLANA => "solana",
            ChainId::ETHEREUM => "ethereum",
            ChainId::TERRA => "terra",
            ChainId::BSC => "bsc",
            ChainId::POLYGON => "polygon",
            ChainId::AVALANCHE => "avalanche",
            ChainId::OASIS => "oasis",
            ChainId::ALGORAND => "algorand",
            ChainId::AURORA => "aurora",
            ChainId::FANTOM => "fantom",
            ChainId::KARURA => "karura",
            ChainId::ACALA => "acala",
            ChainId::KLAYTN => "klaytn",
            ChainId::CELO => "celo",
            ChainId::NEAR => "near",
            ChainId::MOONBEAM => "moonbeam",
            ChainId::ARBITRUM => "arbitrum",
            ChainId::OPTIMISM => "optimism",
            ChainId::BASE => "base",
            ChainId::SEPOLIA => "sepolia",
            _ => return None,
        };
        Some(name)
    }
}

impl Display for ChainId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "unknown chain ID: {}", self.0),
        }
    }
}

impl From<u16> for ChainId {
    fn from(id: u16) -> Self {
        ChainId(id)
    }
}

/// The EVM chains that answer eth call queries out of the box.
pub fn default_supported_query_chains() -> Vec<ChainId> {
    vec![
        ChainId::ETHEREUM,
        ChainId::BSC,
        ChainId::POLYGON,
        ChainId::AVALANCHE,
        ChainId::OASIS,
        ChainId::AURORA,
        ChainId::FANTOM,
        ChainId::KARURA,
        ChainId::ACALA,
        ChainId::KLAYTN,
        ChainId::CELO,
        ChainId::MOONBEAM,
        ChainId::ARBITRUM,
        ChainId::OPTIMISM,
        ChainId::BASE,
        ChainId::SEPOLIA,
    ]
}
