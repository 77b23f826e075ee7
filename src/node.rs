//! The seam between the harness and a ledger node.
//!
//! A node is only ever reached through [`NodeRpc`]: the harness never looks
//! inside a node's stores except to remove them or to put a wallet backup in
//! place while the node is stopped. Process lifecycle sits behind
//! [`NodeLauncher`].

pub mod error;
pub mod handle;

use std::collections::BTreeSet;
use std::path::Path;

use async_trait::async_trait;

use crate::config_models::data_directory::NodeDirectory;
use crate::models::coin_amount::CoinAmount;
use crate::models::node::Address;
use crate::models::node::BlockHeight;
use crate::models::node::NodeIndex;
use crate::models::node::TxId;
use self::error::RpcError;

pub type RpcResult<T> = Result<T, RpcError>;

/// A wallet transaction as the node reports it.
///
/// `fee` follows the daemon convention: it is negative for a transaction
/// the wallet paid for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalletTransaction {
    pub txid: TxId,
    pub amount: CoinAmount,
    pub fee: CoinAmount,
    pub confirmations: u64,
}

/// Command surface of one running node.
#[async_trait]
pub trait NodeRpc: Send + Sync + std::fmt::Debug {
    async fn get_new_address(&self) -> RpcResult<Address>;

    /// fails with [`RpcError::InsufficientFunds`] when the wallet cannot
    /// cover `amount` plus fee.
    async fn send_to_address(&self, address: &Address, amount: CoinAmount) -> RpcResult<TxId>;

    async fn get_transaction(&self, txid: &TxId) -> RpcResult<WalletTransaction>;

    /// trusted balance: mature confirmed funds plus own unconfirmed change.
    async fn get_balance(&self) -> RpcResult<CoinAmount>;

    /// mine `num_blocks` blocks paying to this node's wallet.
    async fn generate(&self, num_blocks: u32) -> RpcResult<()>;

    async fn get_block_count(&self) -> RpcResult<BlockHeight>;

    async fn get_best_block_hash(&self) -> RpcResult<String>;

    async fn get_raw_mempool(&self) -> RpcResult<BTreeSet<TxId>>;

    /// write a byte-exact copy of the wallet store to `path`.
    async fn backup_wallet(&self, path: &Path) -> RpcResult<()>;

    /// write the wallet's secrets to `path` as text.
    async fn dump_wallet(&self, path: &Path) -> RpcResult<()>;

    /// add the secrets in `path` to the wallet and rescan the chain.
    async fn import_wallet(&self, path: &Path) -> RpcResult<()>;

    /// ask the node to peer with `peer`, a [`NodeRpc::p2p_address`].
    async fn add_node(&self, peer: &str) -> RpcResult<()>;

    /// the address other nodes use to peer with this one.
    fn p2p_address(&self) -> String;

    /// shut the node down and wait until its stores are released.
    async fn stop(&mut self) -> RpcResult<()>;
}

/// Starts nodes.
#[async_trait]
pub trait NodeLauncher: Send + Sync + std::fmt::Debug {
    /// start node `index` on `data_dir` and return once it accepts commands.
    async fn start(
        &self,
        index: NodeIndex,
        data_dir: &NodeDirectory,
        args: &[String],
    ) -> RpcResult<Box<dyn NodeRpc>>;
}
