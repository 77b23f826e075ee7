use std::collections::BTreeSet;
use std::path::Path;

use anyhow::bail;
use anyhow::Result;
use num_traits::CheckedSub;
use num_traits::Zero;
use rand::Rng;
use tracing::debug;

use super::block::Block;
use super::block::OutPoint;
use super::block::Tx;
use super::block::TxIn;
use super::block::TxOut;
use super::chain::Chain;
use super::mempool::Admission;
use super::mempool::Mempool;
use super::wallet::Wallet;
use crate::config_models::data_directory::DataDirectory;
use crate::config_models::data_directory::NodeDirectory;
use crate::models::coin_amount::CoinAmount;
use crate::models::node::Address;
use crate::models::node::BestBlock;
use crate::models::node::BlockHeight;
use crate::models::node::NodeIndex;
use crate::models::node::TxId;
use crate::node::error::RpcError;
use crate::node::RpcResult;
use crate::node::WalletTransaction;

const INVALID_ADDRESS_OR_KEY: i64 = -5;
const INVALID_AMOUNT: i64 = -3;

/// State of one running simulated node: its wallet, its best chain and its
/// mempool.
#[derive(Debug)]
pub struct SimNode {
    index: NodeIndex,
    directory: NodeDirectory,
    wallet: Wallet,
    chain: Chain,
    mempool: Mempool,
}

impl SimNode {
    /// Open the stores in `directory`, creating whichever is missing.
    pub async fn open(
        index: NodeIndex,
        directory: NodeDirectory,
        keypool_size: usize,
    ) -> Result<Self> {
        DataDirectory::create_dir_if_not_exists(&directory.network_dir_path()).await?;
        let wallet = Wallet::load_or_create(directory.wallet_file_path(), keypool_size).await?;
        let chain = Chain::load(&directory, directory.network()).await?;
        chain.persist(&directory).await?;
        debug!("{index} opened at {} with tip {}", directory, chain.tip());

        Ok(Self {
            index,
            directory,
            wallet,
            chain,
            mempool: Mempool::default(),
        })
    }

    /// Flush both stores. The mempool is not persisted.
    pub async fn close(&self) -> Result<()> {
        self.wallet.persist().await?;
        self.chain.persist(&self.directory).await?;
        debug!("{} closed at tip {}", self.index, self.chain.tip());
        Ok(())
    }

    pub fn tip(&self) -> &BestBlock {
        self.chain.tip()
    }

    pub fn mempool_txids(&self) -> BTreeSet<TxId> {
        self.mempool.txids()
    }

    pub fn mempool_transactions(&self) -> Vec<Tx> {
        self.mempool.transactions().to_vec()
    }

    pub fn blocks_above(&self, height: BlockHeight) -> Vec<Block> {
        self.chain.blocks_above(height)
    }

    pub async fn new_address(&mut self) -> Result<Address> {
        self.wallet.new_address().await
    }

    fn is_from_me(&self, tx: &Tx) -> bool {
        !tx.is_coinbase() && tx.inputs.iter().all(|i| self.wallet.owns(&i.spent.address))
    }

    /// Coins the wallet may spend right now: mature confirmed outputs and the
    /// change of its own pending transactions, minus whatever a pending
    /// transaction already spends.
    fn spendable_coins(&self) -> Vec<(OutPoint, TxOut)> {
        let confirmed = self
            .chain
            .utxos()
            .filter(|(_, utxo)| {
                self.wallet.owns(&utxo.output.address) && self.chain.is_mature(utxo)
            })
            .map(|(outpoint, utxo)| (outpoint.clone(), utxo.output.clone()));
        let own_change = self
            .mempool
            .transactions()
            .iter()
            .filter(|tx| self.is_from_me(tx))
            .flat_map(|tx| tx.created_outputs())
            .filter(|(_, output)| self.wallet.owns(&output.address))
            .map(|(outpoint, output)| (outpoint, output.clone()));

        confirmed
            .chain(own_change)
            .filter(|(outpoint, _)| !self.mempool.is_spent(outpoint))
            .collect()
    }

    /// The trusted balance.
    pub fn balance(&self) -> CoinAmount {
        self.spendable_coins().iter().map(|(_, o)| o.value).sum()
    }

    /// Pay `amount` to `to`, largest coins first, change to a fresh key.
    pub async fn send(&mut self, to: &Address, amount: CoinAmount) -> RpcResult<TxId> {
        if !amount.is_positive() {
            return Err(RpcError::Call {
                method: "sendtoaddress".to_string(),
                code: INVALID_AMOUNT,
                message: format!("Invalid amount {amount}"),
            });
        }

        let mut coins = self.spendable_coins();
        coins.sort_by(|(a_outpoint, a), (b_outpoint, b)| {
            b.value.cmp(&a.value).then_with(|| a_outpoint.cmp(b_outpoint))
        });

        let mut inputs = vec![];
        let mut selected = CoinAmount::zero();
        let mut fee = Tx::fee_for(1, 2);
        for (prevout, spent) in coins {
            if selected >= amount + fee {
                break;
            }
            selected += spent.value;
            inputs.push(TxIn { prevout, spent });
            fee = Tx::fee_for(inputs.len(), 2);
        }
        let Some(change) = selected.checked_sub(&(amount + fee)) else {
            return Err(RpcError::InsufficientFunds { requested: amount });
        };

        let mut outputs = vec![TxOut {
            address: to.clone(),
            value: amount,
        }];
        if change.is_positive() {
            outputs.push(TxOut {
                address: self.wallet.new_address().await?,
                value: change,
            });
        }

        let tx = Tx::new(inputs, outputs, rand::rng().random());
        let txid = tx.txid.clone();
        match self.mempool.accept(tx, &self.chain) {
            Admission::Accepted => {
                debug!("{} sent {amount} to {to} in {txid}, fee {fee}", self.index);
                Ok(txid)
            }
            admission => Err(RpcError::Failed(format!(
                "own transaction {txid} not accepted: {admission:?}"
            ))),
        }
    }

    /// A transaction as seen by this wallet.
    pub fn transaction(&self, txid: &TxId) -> RpcResult<WalletTransaction> {
        let (tx, confirmations) = match self.mempool.get(txid) {
            Some(tx) => (tx, 0),
            None => match self.chain.find_transaction(txid) {
                Some((tx, height)) => (tx, self.chain.height() - height + 1),
                None => return Err(Self::not_in_wallet(txid)),
            },
        };

        let credit: CoinAmount = tx
            .outputs
            .iter()
            .filter(|o| self.wallet.owns(&o.address))
            .map(|o| o.value)
            .sum();
        let (amount, fee) = if self.is_from_me(tx) {
            let to_others: CoinAmount = tx
                .outputs
                .iter()
                .filter(|o| !self.wallet.owns(&o.address))
                .map(|o| o.value)
                .sum();
            (-to_others, -tx.fee())
        } else if credit.is_positive() {
            (credit, CoinAmount::zero())
        } else {
            return Err(Self::not_in_wallet(txid));
        };

        Ok(WalletTransaction {
            txid: txid.clone(),
            amount,
            fee,
            confirmations,
        })
    }

    fn not_in_wallet(txid: &TxId) -> RpcError {
        RpcError::Call {
            method: "gettransaction".to_string(),
            code: INVALID_ADDRESS_OR_KEY,
            message: format!("Invalid or non-wallet transaction id {txid}"),
        }
    }

    /// Mine `num_blocks` blocks on the local tip. The first one confirms the
    /// whole mempool.
    pub async fn generate(&mut self, num_blocks: u32) -> Result<()> {
        for _ in 0..num_blocks {
            let address = self.wallet.new_address().await?;
            let transactions = self.mempool.take_all();
            let height = self.chain.height() + 1;
            let fees: CoinAmount = transactions.iter().map(Tx::fee).sum();
            let reward = self.chain.network().block_subsidy(height) + fees;

            let mut block_transactions = vec![Tx::coinbase(height, address, reward)];
            block_transactions.extend(transactions);
            let block = Block::child_of(self.chain.tip(), block_transactions);
            self.chain.connect(block)?;
        }
        debug!("{} mined {num_blocks} block(s), tip {}", self.index, self.chain.tip());
        Ok(())
    }

    /// Adopt `blocks` from a peer if they lead to a longer chain. Returns
    /// whether the tip changed.
    pub fn receive_blocks(&mut self, blocks: Vec<Block>) -> Result<bool> {
        let Some(last) = blocks.last() else {
            return Ok(false);
        };
        if last.height <= self.chain.height() {
            return Ok(false);
        }

        let Some(first_new) = blocks.iter().position(|b| {
            self.chain
                .block_at(b.height)
                .map_or(true, |own| own.hash != b.hash)
        }) else {
            return Ok(false);
        };
        let fork_point = blocks[first_new].height.saturating_sub(1);
        let attaches = self
            .chain
            .block_at(fork_point)
            .is_some_and(|parent| parent.hash == blocks[first_new].prev_hash);
        if !attaches {
            bail!(
                "blocks from height {} do not attach to the chain of {}",
                blocks[first_new].height,
                self.index
            );
        }

        let disconnected = if fork_point < self.chain.height() {
            debug!("{} reorganizing above height {fork_point}", self.index);
            self.chain.disconnect_above(fork_point)
        } else {
            vec![]
        };
        for block in blocks.into_iter().skip(first_new) {
            self.chain.connect(block)?;
        }
        self.mempool.revalidate(&self.chain, disconnected);
        Ok(true)
    }

    pub fn receive_transaction(&mut self, tx: Tx) -> Admission {
        self.mempool.accept(tx, &self.chain)
    }

    pub async fn backup_wallet(&self, destination: &Path) -> Result<()> {
        self.wallet.backup_to(destination).await
    }

    pub async fn dump_wallet(&self, destination: &Path) -> Result<()> {
        self.wallet.dump_to(destination).await
    }

    /// Import the keys of a dump. The balance follows immediately since it
    /// is derived from the chain.
    pub async fn import_wallet(&mut self, path: &Path) -> Result<usize> {
        self.wallet.import_from(path).await
    }
}
