use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::sync::DropGuard;
use tracing::debug;
use tracing::warn;

use super::block::Block;
use super::block::Tx;
use super::node::SimNode;
use crate::config_models::data_directory::NodeDirectory;
use crate::models::coin_amount::CoinAmount;
use crate::models::node::Address;
use crate::models::node::BestBlock;
use crate::models::node::BlockHeight;
use crate::models::node::NodeIndex;
use crate::models::node::TxId;
use crate::node::error::RpcError;
use crate::node::NodeLauncher;
use crate::node::NodeRpc;
use crate::node::RpcResult;
use crate::node::WalletTransaction;

/// Number of blocks below the lowest neighbor tip that are offered on every
/// relay, so short forks can be resolved.
const REORG_WINDOW: BlockHeight = 6;

pub const DEFAULT_KEYPOOL_SIZE: usize = 100;

const KEYPOOL_ARG: &str = "-keypool=";

type SharedNode = Arc<Mutex<SimNode>>;

/// Running nodes by p2p address, and the links between them.
#[derive(Debug, Default)]
struct Registry {
    nodes: BTreeMap<String, SharedNode>,
    links: BTreeSet<(String, String)>,
}

impl Registry {
    fn link(&mut self, a: &str, b: &str) {
        let (a, b) = if a <= b { (a, b) } else { (b, a) };
        self.links.insert((a.to_string(), b.to_string()));
    }

    fn remove(&mut self, address: &str) {
        self.nodes.remove(address);
        self.links.retain(|(a, b)| a != address && b != address);
    }
}

/// What one node offers its peers in one relay tick.
struct Offer {
    blocks: Vec<Block>,
    transactions: Vec<Tx>,
}

/// An in-process network of simulated nodes.
///
/// Blocks and transactions travel along links one hop per relay tick, on a
/// background task. The task stops when the network is dropped.
#[derive(Debug)]
pub struct SimNetwork {
    registry: Arc<Mutex<Registry>>,
    _relay_guard: DropGuard,
}

impl SimNetwork {
    /// Create the network and spawn its relay task on the current runtime.
    pub fn new(relay_interval: Duration) -> Self {
        let registry = Arc::new(Mutex::new(Registry::default()));
        let cancel = CancellationToken::new();
        tokio::spawn(relay_loop(
            registry.clone(),
            relay_interval,
            cancel.clone(),
        ));

        Self {
            registry,
            _relay_guard: cancel.drop_guard(),
        }
    }

    fn keypool_size(args: &[String]) -> RpcResult<usize> {
        let mut keypool_size = DEFAULT_KEYPOOL_SIZE;
        for arg in args {
            match arg.strip_prefix(KEYPOOL_ARG) {
                Some(size) => {
                    keypool_size = size.parse().map_err(|_| {
                        RpcError::Failed(format!("invalid keypool size `{size}`"))
                    })?;
                }
                None => warn!("ignoring unsupported node argument `{arg}`"),
            }
        }
        Ok(keypool_size)
    }
}

#[async_trait]
impl NodeLauncher for SimNetwork {
    async fn start(
        &self,
        index: NodeIndex,
        data_dir: &NodeDirectory,
        args: &[String],
    ) -> RpcResult<Box<dyn NodeRpc>> {
        let address = format!("sim://{index}");
        let keypool_size = Self::keypool_size(args)?;

        let mut registry = self.registry.lock().await;
        if registry.nodes.contains_key(&address) {
            return Err(RpcError::Failed(format!("{index} is already running")));
        }
        let node = SimNode::open(index, data_dir.clone(), keypool_size).await?;
        let node = Arc::new(Mutex::new(node));
        registry.nodes.insert(address.clone(), node.clone());

        Ok(Box::new(SimRpc {
            address,
            node,
            registry: self.registry.clone(),
        }))
    }
}

/// Command interface of one simulated node.
#[derive(Debug)]
pub struct SimRpc {
    address: String,
    node: SharedNode,
    registry: Arc<Mutex<Registry>>,
}

#[async_trait]
impl NodeRpc for SimRpc {
    async fn get_new_address(&self) -> RpcResult<Address> {
        Ok(self.node.lock().await.new_address().await?)
    }

    async fn send_to_address(&self, address: &Address, amount: CoinAmount) -> RpcResult<TxId> {
        self.node.lock().await.send(address, amount).await
    }

    async fn get_transaction(&self, txid: &TxId) -> RpcResult<WalletTransaction> {
        self.node.lock().await.transaction(txid)
    }

    async fn get_balance(&self) -> RpcResult<CoinAmount> {
        Ok(self.node.lock().await.balance())
    }

    async fn generate(&self, num_blocks: u32) -> RpcResult<()> {
        Ok(self.node.lock().await.generate(num_blocks).await?)
    }

    async fn get_block_count(&self) -> RpcResult<BlockHeight> {
        Ok(self.node.lock().await.tip().height)
    }

    async fn get_best_block_hash(&self) -> RpcResult<String> {
        Ok(self.node.lock().await.tip().hash.clone())
    }

    async fn get_raw_mempool(&self) -> RpcResult<BTreeSet<TxId>> {
        Ok(self.node.lock().await.mempool_txids())
    }

    async fn backup_wallet(&self, path: &Path) -> RpcResult<()> {
        Ok(self.node.lock().await.backup_wallet(path).await?)
    }

    async fn dump_wallet(&self, path: &Path) -> RpcResult<()> {
        Ok(self.node.lock().await.dump_wallet(path).await?)
    }

    async fn import_wallet(&self, path: &Path) -> RpcResult<()> {
        self.node
            .lock()
            .await
            .import_wallet(path)
            .await
            .map(|_| ())
            .map_err(|e| RpcError::Call {
                method: "importwallet".to_string(),
                code: RpcError::WALLET_ERROR,
                message: format!("{e:#}"),
            })
    }

    async fn add_node(&self, peer: &str) -> RpcResult<()> {
        let mut registry = self.registry.lock().await;
        if !registry.nodes.contains_key(peer) {
            return Err(RpcError::Call {
                method: "addnode".to_string(),
                code: RpcError::INVALID_PARAMETER,
                message: format!("peer {peer} is not reachable"),
            });
        }
        registry.link(&self.address, peer);
        debug!("linked {} and {peer}", self.address);
        Ok(())
    }

    fn p2p_address(&self) -> String {
        self.address.clone()
    }

    async fn stop(&mut self) -> RpcResult<()> {
        self.registry.lock().await.remove(&self.address);
        self.node.lock().await.close().await?;
        Ok(())
    }
}

async fn relay_loop(
    registry: Arc<Mutex<Registry>>,
    relay_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(relay_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("relay task cancelled");
                break;
            }
            _ = ticker.tick() => relay_once(&registry).await,
        }
    }
}

/// One hop: every node offers what it had at the start of the tick to each
/// linked peer.
async fn relay_once(registry: &Mutex<Registry>) {
    let (nodes, links) = {
        let registry = registry.lock().await;
        (registry.nodes.clone(), registry.links.clone())
    };
    if links.is_empty() {
        return;
    }

    let mut neighbors: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (a, b) in &links {
        if nodes.contains_key(a) && nodes.contains_key(b) {
            neighbors.entry(a.as_str()).or_default().push(b.as_str());
            neighbors.entry(b.as_str()).or_default().push(a.as_str());
        }
    }

    let mut heights = BTreeMap::new();
    for (address, node) in &nodes {
        heights.insert(address.as_str(), node.lock().await.tip().height);
    }

    let mut offers = BTreeMap::new();
    for (&address, peers) in &neighbors {
        let lowest_peer = peers
            .iter()
            .filter_map(|p| heights.get(p).copied())
            .min()
            .unwrap_or_default();
        let node = nodes[address].lock().await;
        let blocks = if node.tip().height > lowest_peer {
            node.blocks_above(lowest_peer.saturating_sub(REORG_WINDOW))
        } else {
            vec![]
        };
        let offer = Offer {
            blocks,
            transactions: node.mempool_transactions(),
        };
        offers.insert(address, offer);
    }

    for (&address, peers) in &neighbors {
        let offer = &offers[address];
        for &peer in peers {
            let mut node = nodes[peer].lock().await;
            deliver(&mut node, address, peer, offer);
        }
    }
}

fn deliver(node: &mut SimNode, from: &str, to: &str, offer: &Offer) {
    if !offer.blocks.is_empty() {
        let before: BestBlock = node.tip().clone();
        match node.receive_blocks(offer.blocks.clone()) {
            Ok(true) => debug!("{to} moved from {before} to {} via {from}", node.tip()),
            Ok(false) => {}
            Err(e) => warn!("{to} refused blocks from {from}: {e:#}"),
        }
    }
    for tx in &offer.transactions {
        let admission = node.receive_transaction(tx.clone());
        if admission.is_rejected() {
            debug!("{to} rejected {} from {from}: {admission:?}", tx.txid);
        }
    }
}
