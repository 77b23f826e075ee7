use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use tracing::debug;
use tracing::info;

use super::error::RpcError;
use super::NodeLauncher;
use super::NodeRpc;
use crate::config_models::data_directory::DataDirectory;
use crate::config_models::data_directory::NodeDirectory;
use crate::error::HarnessError;
use crate::models::coin_amount::CoinAmount;
use crate::models::node::Address;
use crate::models::node::BestBlock;
use crate::models::node::NodeIndex;
use crate::models::node::ProcessState;
use crate::models::node::Role;
use crate::models::node::TxId;

/// What a successful `pay` leaves behind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Payment {
    pub txid: TxId,

    /// fee paid by the sender, non-negative.
    pub fee: CoinAmount,
}

/// Which stores to remove while a node is down during a restart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RestartOptions {
    pub wipe_wallet: bool,
    pub wipe_chain: bool,
}

/// Proxy for one node of the cluster.
///
/// Holds the node's identity, its data directory and, while the node runs,
/// its command interface. Every command on a stopped node fails with
/// [`HarnessError::NodeStopped`]; every store manipulation on a running node
/// fails with [`HarnessError::StoreInUse`].
#[derive(Debug)]
pub struct NodeHandle {
    index: NodeIndex,
    role: Role,
    directory: NodeDirectory,
    start_args: Vec<String>,
    launcher: Arc<dyn NodeLauncher>,
    rpc: Option<Box<dyn NodeRpc>>,
}

impl NodeHandle {
    pub fn new(
        index: NodeIndex,
        role: Role,
        directory: NodeDirectory,
        start_args: Vec<String>,
        launcher: Arc<dyn NodeLauncher>,
    ) -> Self {
        Self {
            index,
            role,
            directory,
            start_args,
            launcher,
            rpc: None,
        }
    }

    pub fn index(&self) -> NodeIndex {
        self.index
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn directory(&self) -> &NodeDirectory {
        &self.directory
    }

    pub fn state(&self) -> ProcessState {
        match self.rpc {
            Some(_) => ProcessState::Running,
            None => ProcessState::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    pub fn has_wallet_store(&self) -> bool {
        self.directory.has_wallet_store()
    }

    pub fn has_chain_store(&self) -> bool {
        self.directory.has_chain_store()
    }

    fn rpc(&self) -> Result<&dyn NodeRpc, HarnessError> {
        self.rpc
            .as_deref()
            .ok_or(HarnessError::NodeStopped(self.index))
    }

    fn rpc_error(&self, source: RpcError) -> HarnessError {
        HarnessError::Rpc {
            node: self.index,
            source,
        }
    }

    fn ensure_stopped(&self) -> Result<(), HarnessError> {
        match self.rpc {
            Some(_) => Err(HarnessError::StoreInUse(self.index)),
            None => Ok(()),
        }
    }

    /// Start the node. Starting a running node does nothing.
    pub async fn start(&mut self) -> Result<(), HarnessError> {
        if self.is_running() {
            return Ok(());
        }

        DataDirectory::create_dir_if_not_exists(&self.directory.root_dir_path()).await?;
        let rpc = self
            .launcher
            .start(self.index, &self.directory, &self.start_args)
            .await
            .map_err(|e| self.rpc_error(e))?;
        info!("started {} ({})", self.index, self.role);
        self.rpc = Some(rpc);
        Ok(())
    }

    /// Stop the node. Stopping a stopped node does nothing.
    pub async fn stop(&mut self) -> Result<(), HarnessError> {
        let Some(mut rpc) = self.rpc.take() else {
            return Ok(());
        };

        rpc.stop().await.map_err(|e| self.rpc_error(e))?;
        info!("stopped {}", self.index);
        Ok(())
    }

    /// Stop the node, remove the stores `options` names and start it again.
    pub async fn restart(&mut self, options: RestartOptions) -> Result<(), HarnessError> {
        self.stop().await?;
        if options.wipe_wallet {
            self.wipe_wallet().await?;
        }
        if options.wipe_chain {
            self.wipe_chain().await?;
        }
        self.start().await
    }

    /// Remove the wallet store, leaving the chain store in place.
    pub async fn wipe_wallet(&self) -> Result<(), HarnessError> {
        self.ensure_stopped()?;
        self.directory.remove_wallet_store().await?;
        info!("removed wallet store of {}", self.index);
        Ok(())
    }

    /// Remove the chain store, leaving the wallet store in place.
    pub async fn wipe_chain(&self) -> Result<(), HarnessError> {
        self.ensure_stopped()?;
        self.directory.remove_chain_store().await?;
        info!("removed chain store of {}", self.index);
        Ok(())
    }

    /// Put the wallet backup at `backup` in place of the wallet store.
    pub async fn install_wallet(&self, backup: &Path) -> Result<(), HarnessError> {
        self.ensure_stopped()?;
        DataDirectory::create_dir_if_not_exists(&self.directory.network_dir_path()).await?;
        tokio::fs::copy(backup, self.directory.wallet_file_path()).await?;
        info!("installed {} as wallet of {}", backup.display(), self.index);
        Ok(())
    }

    pub async fn new_address(&self) -> Result<Address, HarnessError> {
        self.rpc()?
            .get_new_address()
            .await
            .map_err(|e| self.rpc_error(e))
    }

    /// Send `amount` to `to`. The returned fee is what this node paid.
    pub async fn pay(&self, to: &Address, amount: CoinAmount) -> Result<Payment, HarnessError> {
        let rpc = self.rpc()?;
        let txid = rpc
            .send_to_address(to, amount)
            .await
            .map_err(|e| match e {
                RpcError::InsufficientFunds { requested } => HarnessError::InsufficientFunds {
                    node: self.index,
                    requested,
                },
                e => self.rpc_error(e),
            })?;
        let tx = rpc
            .get_transaction(&txid)
            .await
            .map_err(|e| self.rpc_error(e))?;

        debug!("{} paid {amount} to {to}, fee {}, txid {txid}", self.index, tx.fee.abs());
        Ok(Payment {
            txid,
            fee: tx.fee.abs(),
        })
    }

    /// Mine `num_blocks` blocks and return the new tip.
    pub async fn mine_blocks(&self, num_blocks: u32) -> Result<BestBlock, HarnessError> {
        self.rpc()?
            .generate(num_blocks)
            .await
            .map_err(|e| self.rpc_error(e))?;
        let tip = self.best_block().await?;
        debug!("{} mined {num_blocks} block(s), tip now {tip}", self.index);
        Ok(tip)
    }

    pub async fn balance(&self) -> Result<CoinAmount, HarnessError> {
        self.rpc()?
            .get_balance()
            .await
            .map_err(|e| self.rpc_error(e))
    }

    pub async fn best_block(&self) -> Result<BestBlock, HarnessError> {
        let rpc = self.rpc()?;
        let height = rpc
            .get_block_count()
            .await
            .map_err(|e| self.rpc_error(e))?;
        let hash = rpc
            .get_best_block_hash()
            .await
            .map_err(|e| self.rpc_error(e))?;
        Ok(BestBlock { height, hash })
    }

    pub async fn mempool(&self) -> Result<BTreeSet<TxId>, HarnessError> {
        self.rpc()?
            .get_raw_mempool()
            .await
            .map_err(|e| self.rpc_error(e))
    }

    /// Write a wallet backup to `path`.
    pub async fn backup(&self, path: &Path) -> Result<(), HarnessError> {
        self.rpc()?
            .backup_wallet(path)
            .await
            .map_err(|e| self.rpc_error(e))
    }

    /// Write a wallet export to `path`.
    pub async fn export(&self, path: &Path) -> Result<(), HarnessError> {
        self.rpc()?
            .dump_wallet(path)
            .await
            .map_err(|e| self.rpc_error(e))
    }

    /// Import a wallet export from `path`.
    pub async fn import(&self, path: &Path) -> Result<(), HarnessError> {
        self.rpc()?
            .import_wallet(path)
            .await
            .map_err(|e| self.rpc_error(e))
    }

    pub fn p2p_address(&self) -> Result<String, HarnessError> {
        Ok(self.rpc()?.p2p_address())
    }

    /// Ask this node to peer with `peer`.
    pub async fn connect(&self, peer: &NodeHandle) -> Result<(), HarnessError> {
        let address = peer.p2p_address()?;
        self.rpc()?
            .add_node(&address)
            .await
            .map_err(|e| self.rpc_error(e))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use num_traits::Zero;

    use super::*;
    use crate::cluster::SyncPolicy;
    use crate::tests::shared::sim_cluster;

    #[tokio::test]
    async fn commands_on_a_stopped_node_fail() {
        let (cluster, _) = sim_cluster(1, 5, SyncPolicy::default()).unwrap();
        let node = cluster.node(NodeIndex(0)).unwrap();
        assert!(node.state().is_stopped());
        assert!(matches!(
            node.balance().await,
            Err(HarnessError::NodeStopped(NodeIndex(0)))
        ));
        assert!(matches!(
            node.mine_blocks(1).await,
            Err(HarnessError::NodeStopped(NodeIndex(0)))
        ));
    }

    #[tokio::test]
    async fn stores_cannot_be_touched_while_running() {
        let (mut cluster, _) = sim_cluster(1, 5, SyncPolicy::default()).unwrap();
        let node = cluster.node_mut(NodeIndex(0)).unwrap();
        node.start().await.unwrap();
        node.start().await.unwrap();
        assert!(node.is_running());
        assert!(node.has_wallet_store());

        assert!(matches!(
            node.wipe_wallet().await,
            Err(HarnessError::StoreInUse(NodeIndex(0)))
        ));
        assert!(matches!(
            node.wipe_chain().await,
            Err(HarnessError::StoreInUse(NodeIndex(0)))
        ));

        node.stop().await.unwrap();
        node.stop().await.unwrap();
        node.wipe_wallet().await.unwrap();
        assert!(!node.has_wallet_store());
        assert!(node.has_chain_store());
    }

    #[tokio::test]
    async fn restart_with_wiped_wallet_forgets_funds_but_keeps_the_chain() {
        let (mut cluster, _) = sim_cluster(1, 5, SyncPolicy::default()).unwrap();
        let node = cluster.node_mut(NodeIndex(0)).unwrap();
        node.start().await.unwrap();
        let tip = node.mine_blocks(101).await.unwrap();
        assert_eq!(CoinAmount::coins(50), node.balance().await.unwrap());

        node.restart(RestartOptions {
            wipe_wallet: true,
            wipe_chain: false,
        })
        .await
        .unwrap();
        assert_eq!(tip, node.best_block().await.unwrap());
        assert!(node.balance().await.unwrap().is_zero());

        node.restart(RestartOptions {
            wipe_wallet: false,
            wipe_chain: true,
        })
        .await
        .unwrap();
        assert_eq!(0, node.best_block().await.unwrap().height);
    }

    #[tokio::test]
    async fn pay_reports_a_positive_fee_and_insufficient_funds() {
        let (mut cluster, _) = sim_cluster(1, 5, SyncPolicy::default()).unwrap();
        cluster.start_all().await.unwrap();
        let spender = cluster.node(NodeIndex(0)).unwrap();
        let miner = cluster.node(NodeIndex(1)).unwrap();
        spender.mine_blocks(101).await.unwrap();

        let to = miner.new_address().await.unwrap();
        let payment = spender.pay(&to, CoinAmount::coins(2)).await.unwrap();
        assert!(payment.fee.is_positive());
        assert!(spender.mempool().await.unwrap().contains(&payment.txid));

        let result = spender.pay(&to, CoinAmount::coins(100)).await;
        assert!(matches!(
            result,
            Err(HarnessError::InsufficientFunds { node: NodeIndex(0), .. })
        ));
    }
}
