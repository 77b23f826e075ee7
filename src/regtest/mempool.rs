//! Transactions waiting to be mined, kept in arrival order so a transaction
//! always comes after the transactions whose outputs it spends.

use std::collections::BTreeSet;

use super::block::OutPoint;
use super::block::Tx;
use super::block::TxOut;
use super::chain::Chain;
use crate::models::node::TxId;

/// Outcome of offering a transaction to the mempool.
#[derive(Clone, Debug, PartialEq, Eq, strum::EnumIs)]
pub enum Admission {
    Accepted,

    /// already in the mempool or in the chain.
    Known,

    /// spends outputs this node has not seen yet. Worth offering again
    /// later.
    MissingInputs,

    Rejected(String),
}

#[derive(Clone, Debug, Default)]
pub struct Mempool {
    transactions: Vec<Tx>,
}

impl Mempool {
    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn contains(&self, txid: &TxId) -> bool {
        self.get(txid).is_some()
    }

    pub fn get(&self, txid: &TxId) -> Option<&Tx> {
        self.transactions.iter().find(|tx| &tx.txid == txid)
    }

    pub fn transactions(&self) -> &[Tx] {
        &self.transactions
    }

    pub fn txids(&self) -> BTreeSet<TxId> {
        self.transactions.iter().map(|tx| tx.txid.clone()).collect()
    }

    /// Whether a pending transaction already spends `outpoint`.
    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.transactions
            .iter()
            .any(|tx| tx.spent_outpoints().any(|o| o == outpoint))
    }

    /// An output created by a pending transaction.
    pub fn output(&self, outpoint: &OutPoint) -> Option<&TxOut> {
        self.get(&outpoint.txid)
            .and_then(|tx| tx.outputs.get(usize::try_from(outpoint.vout).ok()?))
    }

    /// Check `tx` against `chain` and the pending transactions, and keep it
    /// if it fits.
    pub fn accept(&mut self, tx: Tx, chain: &Chain) -> Admission {
        if self.contains(&tx.txid) || chain.confirmation_height(&tx.txid).is_some() {
            return Admission::Known;
        }
        if tx.is_coinbase() {
            return Admission::Rejected(format!("{} is a coinbase", tx.txid));
        }

        for input in &tx.inputs {
            if self.is_spent(&input.prevout) {
                return Admission::Rejected(format!(
                    "{} conflicts with a pending transaction",
                    tx.txid
                ));
            }
            if let Some(utxo) = chain.utxo(&input.prevout) {
                if utxo.output != input.spent || !chain.is_spendable_next(utxo) {
                    return Admission::Rejected(format!("{} spends an invalid output", tx.txid));
                }
            } else if let Some(output) = self.output(&input.prevout) {
                if output != &input.spent {
                    return Admission::Rejected(format!("{} spends an invalid output", tx.txid));
                }
            } else if chain.confirmation_height(&input.prevout.txid).is_some() {
                return Admission::Rejected(format!("{} spends a spent output", tx.txid));
            } else {
                return Admission::MissingInputs;
            }
        }
        if tx.fee().is_negative() {
            return Admission::Rejected(format!("{} spends more than it consumes", tx.txid));
        }

        self.transactions.push(tx);
        Admission::Accepted
    }

    /// Remove and return every pending transaction, for inclusion in a
    /// block.
    pub fn take_all(&mut self) -> Vec<Tx> {
        std::mem::take(&mut self.transactions)
    }

    /// Drop transactions that `chain` confirmed or invalidated. `extra` are
    /// offered first, e.g. transactions of disconnected blocks.
    pub fn revalidate(&mut self, chain: &Chain, extra: Vec<Tx>) {
        let pending = extra.into_iter().chain(self.take_all());
        for tx in pending {
            let txid = tx.txid.clone();
            let admission = self.accept(tx, chain);
            if !admission.is_accepted() && !admission.is_known() {
                tracing::debug!("evicted {txid} from mempool: {admission:?}");
            }
        }
    }
}
