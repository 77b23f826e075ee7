use std::collections::HashMap;
use std::collections::HashSet;

use anyhow::bail;
use anyhow::ensure;
use anyhow::Context;
use anyhow::Result;
use serde::Deserialize;
use serde::Serialize;

use super::block::Block;
use super::block::OutPoint;
use super::block::Tx;
use super::block::TxOut;
use crate::config_models::data_directory::DataDirectory;
use crate::config_models::data_directory::NodeDirectory;
use crate::config_models::network::Network;
use crate::models::coin_amount::CoinAmount;
use crate::models::node::BestBlock;
use crate::models::node::BlockHeight;
use crate::models::node::TxId;

const BLOCKS_FILE_NAME: &str = "blocks.json";
const CHAINSTATE_FILE_NAME: &str = "utxos.json";

/// An unspent output of the best chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub output: TxOut,
    pub height: BlockHeight,
    pub coinbase: bool,
}

#[derive(Serialize, Deserialize)]
struct ChainStateFile {
    tip: BestBlock,
    utxos: Vec<(OutPoint, Utxo)>,
}

/// The best chain of one node together with its unspent outputs.
#[derive(Clone, Debug)]
pub struct Chain {
    network: Network,
    blocks: Vec<Block>,
    tip: BestBlock,
    utxos: HashMap<OutPoint, Utxo>,
    confirmed: HashMap<TxId, BlockHeight>,
}

impl Chain {
    pub fn new(network: Network) -> Self {
        let genesis = Block::genesis(network);
        let mut chain = Self {
            network,
            tip: genesis.best_block(),
            blocks: vec![],
            utxos: HashMap::new(),
            confirmed: HashMap::new(),
        };
        chain.apply(&genesis);
        chain.blocks.push(genesis);
        chain
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn tip(&self) -> &BestBlock {
        &self.tip
    }

    pub fn height(&self) -> BlockHeight {
        self.tip.height
    }

    pub fn block_at(&self, height: BlockHeight) -> Option<&Block> {
        usize::try_from(height)
            .ok()
            .and_then(|h| self.blocks.get(h))
    }

    /// Copies of every block above `height`.
    pub fn blocks_above(&self, height: BlockHeight) -> Vec<Block> {
        self.blocks
            .iter()
            .filter(|b| b.height > height)
            .cloned()
            .collect()
    }

    pub fn utxo(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.utxos.get(outpoint)
    }

    pub fn utxos(&self) -> impl Iterator<Item = (&OutPoint, &Utxo)> {
        self.utxos.iter()
    }

    pub fn confirmation_height(&self, txid: &TxId) -> Option<BlockHeight> {
        self.confirmed.get(txid).copied()
    }

    pub fn find_transaction(&self, txid: &TxId) -> Option<(&Tx, BlockHeight)> {
        let height = self.confirmation_height(txid)?;
        self.block_at(height)?
            .transactions
            .iter()
            .find(|tx| &tx.txid == txid)
            .map(|tx| (tx, height))
    }

    /// Whether `utxo` counts towards a balance at the current tip.
    pub fn is_mature(&self, utxo: &Utxo) -> bool {
        !utxo.coinbase || utxo.height + self.network.coinbase_maturity() <= self.tip.height
    }

    /// Whether `utxo` may be spent by a transaction in the next block.
    pub fn is_spendable_next(&self, utxo: &Utxo) -> bool {
        !utxo.coinbase || utxo.height + self.network.coinbase_maturity() <= self.tip.height + 1
    }

    /// Extend the chain by `block`, which must build on the current tip.
    pub fn connect(&mut self, block: Block) -> Result<()> {
        ensure!(
            block.height == self.tip.height + 1 && block.prev_hash == self.tip.hash,
            "block {} does not extend tip {}",
            block.best_block(),
            self.tip
        );
        self.validate(&block)?;
        self.apply(&block);
        self.blocks.push(block);
        Ok(())
    }

    fn validate(&self, block: &Block) -> Result<()> {
        let Some((coinbase, transactions)) = block.transactions.split_first() else {
            bail!("block {} has no transactions", block.best_block());
        };
        ensure!(coinbase.is_coinbase(), "first transaction is not a coinbase");

        let maturity = self.network.coinbase_maturity();
        let mut spent = HashSet::new();
        let mut created: HashMap<OutPoint, &TxOut> = HashMap::new();
        let mut fees = CoinAmount::default();
        for tx in transactions {
            ensure!(!tx.is_coinbase(), "{} is a second coinbase", tx.txid);
            for input in &tx.inputs {
                let available = match self.utxos.get(&input.prevout) {
                    Some(utxo) => {
                        utxo.output == input.spent
                            && (!utxo.coinbase || utxo.height + maturity <= block.height)
                    }
                    None => created.get(&input.prevout) == Some(&&input.spent),
                };
                ensure!(available, "{} spends unavailable output", tx.txid);
                ensure!(
                    spent.insert(input.prevout.clone()),
                    "{} double spends",
                    tx.txid
                );
            }
            ensure!(
                !tx.fee().is_negative(),
                "{} spends more than it consumes",
                tx.txid
            );
            fees += tx.fee();
            created.extend(tx.created_outputs());
        }

        let allowed = self.network.block_subsidy(block.height) + fees;
        ensure!(
            coinbase.output_value() <= allowed,
            "coinbase claims {} but only {allowed} is available",
            coinbase.output_value()
        );
        Ok(())
    }

    fn apply(&mut self, block: &Block) {
        for tx in &block.transactions {
            for prevout in tx.spent_outpoints() {
                self.utxos.remove(prevout);
            }
            for (outpoint, output) in tx.created_outputs() {
                let utxo = Utxo {
                    output: output.clone(),
                    height: block.height,
                    coinbase: tx.is_coinbase(),
                };
                self.utxos.insert(outpoint, utxo);
            }
            self.confirmed.insert(tx.txid.clone(), block.height);
        }
        self.tip = block.best_block();
    }

    /// Drop every block above `height`. Returns the non-coinbase
    /// transactions of the dropped blocks, oldest first.
    pub fn disconnect_above(&mut self, height: BlockHeight) -> Vec<Tx> {
        let keep = usize::try_from(height).map_or(self.blocks.len(), |h| h + 1);
        let dropped = self.blocks.split_off(keep.min(self.blocks.len()));

        let blocks = std::mem::take(&mut self.blocks);
        self.utxos.clear();
        self.confirmed.clear();
        for block in &blocks {
            self.apply(block);
        }
        self.blocks = blocks;

        dropped
            .into_iter()
            .flat_map(|b| b.transactions.into_iter().skip(1))
            .collect()
    }

    /// Read the chain store, or start from genesis when there is none.
    pub async fn load(directory: &NodeDirectory, network: Network) -> Result<Self> {
        if !directory.has_chain_store() {
            return Ok(Self::new(network));
        }

        let blocks_path = directory.block_dir_path().join(BLOCKS_FILE_NAME);
        let bytes = tokio::fs::read(&blocks_path)
            .await
            .with_context(|| format!("Failed to read {}", blocks_path.display()))?;
        let blocks: Vec<Block> = serde_json::from_slice(&bytes)
            .with_context(|| format!("Corrupt block file {}", blocks_path.display()))?;

        let state_path = directory.chainstate_dir_path().join(CHAINSTATE_FILE_NAME);
        let bytes = tokio::fs::read(&state_path)
            .await
            .with_context(|| format!("Failed to read {}", state_path.display()))?;
        let state: ChainStateFile = serde_json::from_slice(&bytes)
            .with_context(|| format!("Corrupt chain state {}", state_path.display()))?;

        let mut chain = Self::new(network);
        let mut blocks = blocks.into_iter();
        ensure!(
            blocks.next().as_ref() == chain.block_at(0),
            "block file starts with a foreign genesis"
        );
        for block in blocks {
            chain.connect(block)?;
        }
        ensure!(
            chain.tip == state.tip && chain.utxos.len() == state.utxos.len(),
            "chain state at {} does not match blocks at {}",
            state.tip,
            chain.tip
        );
        Ok(chain)
    }

    /// Write the chain store.
    pub async fn persist(&self, directory: &NodeDirectory) -> Result<()> {
        DataDirectory::create_dir_if_not_exists(&directory.block_dir_path()).await?;
        DataDirectory::create_dir_if_not_exists(&directory.chainstate_dir_path()).await?;

        let blocks = serde_json::to_vec(&self.blocks)?;
        tokio::fs::write(directory.block_dir_path().join(BLOCKS_FILE_NAME), blocks).await?;

        let state = ChainStateFile {
            tip: self.tip.clone(),
            utxos: self
                .utxos
                .iter()
                .map(|(o, u)| (o.clone(), u.clone()))
                .collect(),
        };
        let state = serde_json::to_vec(&state)?;
        tokio::fs::write(
            directory.chainstate_dir_path().join(CHAINSTATE_FILE_NAME),
            state,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::models::node::Address;
    use crate::regtest::block::TxIn;
    use crate::tests::shared::unit_test_data_directory;
    use crate::models::node::NodeIndex;

    fn mine_empty(chain: &mut Chain, address: &str) -> Block {
        let height = chain.height() + 1;
        let coinbase = Tx::coinbase(
            height,
            Address(address.to_string()),
            chain.network().block_subsidy(height),
        );
        let block = Block::child_of(chain.tip(), vec![coinbase]);
        chain.connect(block.clone()).unwrap();
        block
    }

    #[test]
    fn coinbase_matures_after_maturity_blocks() {
        let mut chain = Chain::new(Network::RegTest);
        let block = mine_empty(&mut chain, "a");
        let (outpoint, _) = block.transactions[0].created_outputs().next().unwrap();

        for _ in 0..99 {
            mine_empty(&mut chain, "b");
        }
        let utxo = chain.utxo(&outpoint).unwrap().clone();
        assert!(!chain.is_mature(&utxo));
        assert!(chain.is_spendable_next(&utxo));

        mine_empty(&mut chain, "b");
        assert!(chain.is_mature(&utxo));
    }

    #[test]
    fn immature_spend_is_rejected() {
        let mut chain = Chain::new(Network::RegTest);
        let block = mine_empty(&mut chain, "a");
        let (prevout, spent) = block.transactions[0].created_outputs().next().unwrap();
        let spend = Tx::new(
            vec![TxIn {
                prevout,
                spent: spent.clone(),
            }],
            vec![],
            1,
        );
        let coinbase = Tx::coinbase(2, Address("a".to_string()), CoinAmount::coins(50));
        let block = Block::child_of(chain.tip(), vec![coinbase, spend]);
        assert!(chain.connect(block).is_err());
    }

    #[test]
    fn overpaying_coinbase_is_rejected() {
        let mut chain = Chain::new(Network::RegTest);
        let coinbase = Tx::coinbase(1, Address("a".to_string()), CoinAmount::coins(51));
        let block = Block::child_of(chain.tip(), vec![coinbase]);
        assert!(chain.connect(block).is_err());
    }

    #[test]
    fn disconnect_restores_earlier_state() {
        let mut chain = Chain::new(Network::RegTest);
        mine_empty(&mut chain, "a");
        let tip = chain.tip().clone();
        let utxo_count = chain.utxos().count();
        mine_empty(&mut chain, "b");
        mine_empty(&mut chain, "c");

        let dropped = chain.disconnect_above(tip.height);
        assert!(dropped.is_empty());
        assert_eq!(&tip, chain.tip());
        assert_eq!(utxo_count, chain.utxos().count());
    }

    #[tokio::test]
    async fn chain_store_round_trips() {
        let data_dir = unit_test_data_directory(Network::RegTest).unwrap();
        let directory = data_dir.node(NodeIndex(0));

        let mut chain = Chain::new(Network::RegTest);
        for _ in 0..3 {
            mine_empty(&mut chain, "a");
        }
        chain.persist(&directory).await.unwrap();
        assert!(directory.has_chain_store());

        let loaded = Chain::load(&directory, Network::RegTest).await.unwrap();
        assert_eq!(chain.tip(), loaded.tip());

        directory.remove_chain_store().await.unwrap();
        let fresh = Chain::load(&directory, Network::RegTest).await.unwrap();
        assert_eq!(0, fresh.height());
    }
}
