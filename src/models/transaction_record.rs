use serde::Deserialize;
use serde::Serialize;

use super::coin_amount::CoinAmount;
use super::node::BlockHeight;
use super::node::NodeIndex;
use super::node::TxId;

/// Outcome of one send attempt between two spenders.
///
/// A suppressed send (the round's coin flip said no) is recorded with zero
/// amount and zero fee so every round has the same structure.
///
/// `fee` is always non-negative: it is what the sender paid.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub from: NodeIndex,
    pub to: NodeIndex,
    pub amount: CoinAmount,
    pub fee: CoinAmount,
    pub txid: Option<TxId>,

    /// height of the block that confirmed the transaction, stamped once the
    /// round's block is mined.
    pub block_height: Option<BlockHeight>,
}

impl TransactionRecord {
    pub fn skipped(from: NodeIndex, to: NodeIndex) -> Self {
        Self {
            from,
            to,
            amount: CoinAmount::default(),
            fee: CoinAmount::default(),
            txid: None,
            block_height: None,
        }
    }

    pub fn sent(
        from: NodeIndex,
        to: NodeIndex,
        amount: CoinAmount,
        fee: CoinAmount,
        txid: TxId,
    ) -> Self {
        Self {
            from,
            to,
            amount,
            fee,
            txid: Some(txid),
            block_height: None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.txid.is_none()
    }

    pub fn confirmed_in(self, height: BlockHeight) -> Self {
        Self {
            block_height: self.txid.as_ref().map(|_| height),
            ..self
        }
    }
}

/// A block mined by a cluster node. The reward is `subsidy` plus the fees of
/// every transaction the block confirmed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoinbaseEvent {
    pub miner: NodeIndex,
    pub height: BlockHeight,
    pub subsidy: CoinAmount,
}
