use serde::Deserialize;
use serde::Serialize;
use sha3::Digest;
use sha3::Sha3_256;

use crate::config_models::network::Network;
use crate::models::coin_amount::CoinAmount;
use crate::models::node::Address;
use crate::models::node::BestBlock;
use crate::models::node::BlockHeight;
use crate::models::node::TxId;

/// Relay fee, charged per started kilobyte of transaction size.
pub const FEE_PER_KB: CoinAmount = CoinAmount::from_atomic_units(10_000);

const TX_OVERHEAD_BYTES: usize = 10;
const INPUT_BYTES: usize = 148;
const OUTPUT_BYTES: usize = 34;

/// Address the genesis reward is paid to. No wallet holds its key.
pub const GENESIS_ADDRESS: &str = "genesis";

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: TxId,
    pub vout: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxOut {
    pub address: Address,
    pub value: CoinAmount,
}

/// A spent output, carried along with the reference to it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub spent: TxOut,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tx {
    pub txid: TxId,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    pub nonce: u64,
}

impl Tx {
    pub fn new(inputs: Vec<TxIn>, outputs: Vec<TxOut>, nonce: u64) -> Self {
        let mut hasher = Sha3_256::new();
        for input in &inputs {
            hasher.update(input.prevout.txid.0.as_bytes());
            hasher.update(input.prevout.vout.to_le_bytes());
        }
        for output in &outputs {
            hasher.update(output.address.0.as_bytes());
            hasher.update(output.value.to_atomic_units().to_le_bytes());
        }
        hasher.update(nonce.to_le_bytes());
        let txid = TxId(format!("{:x}", hasher.finalize()));

        Self {
            txid,
            inputs,
            outputs,
            nonce,
        }
    }

    /// The reward transaction of the block at `height`.
    pub fn coinbase(height: BlockHeight, address: Address, value: CoinAmount) -> Self {
        Self::new(vec![], vec![TxOut { address, value }], height)
    }

    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn input_value(&self) -> CoinAmount {
        self.inputs.iter().map(|i| i.spent.value).sum()
    }

    pub fn output_value(&self) -> CoinAmount {
        self.outputs.iter().map(|o| o.value).sum()
    }

    /// What the transaction leaves for the miner. Zero for a coinbase.
    pub fn fee(&self) -> CoinAmount {
        if self.is_coinbase() {
            return CoinAmount::default();
        }
        self.input_value() + -self.output_value()
    }

    /// The outputs this transaction creates, with their outpoints.
    pub fn created_outputs(&self) -> impl Iterator<Item = (OutPoint, &TxOut)> + '_ {
        self.outputs.iter().zip(0u32..).map(|(output, vout)| {
            (
                OutPoint {
                    txid: self.txid.clone(),
                    vout,
                },
                output,
            )
        })
    }

    pub fn spent_outpoints(&self) -> impl Iterator<Item = &OutPoint> + '_ {
        self.inputs.iter().map(|i| &i.prevout)
    }

    /// Serialized size estimate used for fee calculation.
    pub fn estimated_size(num_inputs: usize, num_outputs: usize) -> usize {
        TX_OVERHEAD_BYTES + INPUT_BYTES * num_inputs + OUTPUT_BYTES * num_outputs
    }

    /// Fee for a transaction of the given shape.
    pub fn fee_for(num_inputs: usize, num_outputs: usize) -> CoinAmount {
        let kilobytes = Self::estimated_size(num_inputs, num_outputs).div_ceil(1000);
        FEE_PER_KB.scalar_mul(u32::try_from(kilobytes).unwrap_or(u32::MAX))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: BlockHeight,
    pub prev_hash: String,
    pub hash: String,

    /// the coinbase comes first.
    pub transactions: Vec<Tx>,
}

impl Block {
    /// The genesis block every node of `network` starts from.
    pub fn genesis(network: Network) -> Self {
        let coinbase = Tx::coinbase(
            0,
            Address(GENESIS_ADDRESS.to_string()),
            network.block_subsidy(0),
        );
        Self::new(0, "0".repeat(64), vec![coinbase])
    }

    /// A block on top of `parent`.
    pub fn child_of(parent: &BestBlock, transactions: Vec<Tx>) -> Self {
        Self::new(parent.height + 1, parent.hash.clone(), transactions)
    }

    fn new(height: BlockHeight, prev_hash: String, transactions: Vec<Tx>) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(prev_hash.as_bytes());
        hasher.update(height.to_le_bytes());
        for tx in &transactions {
            hasher.update(tx.txid.0.as_bytes());
        }
        let hash = format!("{:x}", hasher.finalize());

        Self {
            height,
            prev_hash,
            hash,
            transactions,
        }
    }

    pub fn best_block(&self) -> BestBlock {
        BestBlock {
            height: self.height,
            hash: self.hash.clone(),
        }
    }

    pub fn coinbase(&self) -> Option<&Tx> {
        self.transactions.first().filter(|tx| tx.is_coinbase())
    }
}
