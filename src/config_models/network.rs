use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use strum::EnumIter;

use crate::models::coin_amount::CoinAmount;
use crate::models::node::BlockHeight;

/// The chain a cluster runs on, and the consensus parameters the harness
/// needs in order to predict balances.
#[derive(
    Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default, EnumIter, strum::EnumIs,
)]
#[non_exhaustive]
pub enum Network {
    /// Network for local tests. Blocks are produced on demand and the subsidy
    /// halves every 150 blocks.
    #[default]
    RegTest,

    /// Public test network parameters. Only meaningful against a daemon that
    /// has been configured to mine on demand.
    Testnet,
}

impl Network {
    /// number of blocks that must be built on top of a coinbase before its
    /// reward counts towards the miner's balance.
    ///
    /// A coinbase at height `h` is mature once the tip is at least at
    /// `h + coinbase_maturity()`.
    pub fn coinbase_maturity(&self) -> BlockHeight {
        100
    }

    /// the block subsidy at height 0, before any halving.
    pub fn initial_subsidy(&self) -> CoinAmount {
        CoinAmount::coins(50)
    }

    /// number of blocks between subsidy halvings.
    pub fn subsidy_halving_interval(&self) -> BlockHeight {
        match *self {
            Self::RegTest => 150,
            Self::Testnet => 210_000,
        }
    }

    /// subsidy paid to the miner of the block at `height`, excluding fees.
    pub fn block_subsidy(&self, height: BlockHeight) -> CoinAmount {
        let halvings = height / self.subsidy_halving_interval();
        self.initial_subsidy()
            .halvings(u32::try_from(halvings).unwrap_or(u32::MAX))
    }

    /// the network selection flag understood by the node daemon.
    pub fn daemon_flag(&self) -> &'static str {
        match *self {
            Self::RegTest => "-regtest",
            Self::Testnet => "-testnet",
        }
    }

    /// name of the per-network sub-directory inside a node's data directory.
    pub fn dir_name(&self) -> &'static str {
        match *self {
            Self::RegTest => "regtest",
            Self::Testnet => "testnet3",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = match self {
            Network::RegTest => "regtest",
            Network::Testnet => "testnet",
        };
        write!(f, "{}", string)
    }
}

impl FromStr for Network {
    type Err = String;
    fn from_str(input: &str) -> Result<Network, Self::Err> {
        match input {
            "regtest" => Ok(Network::RegTest),
            "testnet" => Ok(Network::Testnet),
            _ => Err(format!("Failed to parse {} as network", input)),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn regtest_subsidy_halves_every_150_blocks() {
        let network = Network::RegTest;
        assert_eq!(CoinAmount::coins(50), network.block_subsidy(1));
        assert_eq!(CoinAmount::coins(50), network.block_subsidy(149));
        assert_eq!(CoinAmount::coins(25), network.block_subsidy(150));
        assert_eq!(CoinAmount::tenths(125), network.block_subsidy(300));
    }

    #[test]
    fn display_and_from_str_agree() {
        for network in Network::iter() {
            assert_eq!(network, Network::from_str(&network.to_string()).unwrap());
        }
    }
}
