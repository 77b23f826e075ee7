//! Owns every node of the cluster and the links between them, and provides
//! the two synchronization barriers.
//!
//! A barrier polls every running node until all of them report the same
//! view, bounded by [`SyncPolicy::timeout`]. There are no retries: a
//! barrier that does not converge is a failed run.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use tokio::time::Instant;
use tracing::debug;
use tracing::warn;

use crate::config_models::cli_args::Args;
use crate::config_models::data_directory::DataDirectory;
use crate::error::HarnessError;
use crate::models::coin_amount::CoinAmount;
use crate::models::node::BestBlock;
use crate::models::node::NodeIndex;
use crate::models::node::Role;
use crate::models::node::TxId;
use crate::node::handle::NodeHandle;
use crate::node::NodeLauncher;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Barrier {
    Chain,
    Mempool,
}

/// Bounds of barrier polling.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncPolicy {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl From<&Args> for SyncPolicy {
    fn from(args: &Args) -> Self {
        Self {
            timeout: args.sync_timeout,
            poll_interval: args.poll_interval,
        }
    }
}

impl Default for SyncPolicy {
    fn default() -> Self {
        (&Args::default()).into()
    }
}

/// Evidence that every running node held the same mempool.
///
/// Only [`Cluster::barrier_mempool`] creates one, and mining a round's block
/// consumes it.
#[derive(Debug)]
#[must_use]
pub struct SyncedMempool {
    txids: BTreeSet<TxId>,
}

impl SyncedMempool {
    pub fn txids(&self) -> &BTreeSet<TxId> {
        &self.txids
    }
}

type NodeQuery<'a, T> = Pin<Box<dyn Future<Output = Result<T, HarnessError>> + Send + 'a>>;

#[derive(Debug)]
pub struct Cluster {
    nodes: BTreeMap<NodeIndex, NodeHandle>,
    links: BTreeSet<(NodeIndex, NodeIndex)>,
    sync: SyncPolicy,
}

impl Cluster {
    pub fn new(sync: SyncPolicy) -> Self {
        Self {
            nodes: BTreeMap::new(),
            links: BTreeSet::new(),
            sync,
        }
    }

    /// `num_spenders` spenders followed by one miner, all stopped, with data
    /// directories under `data_dir`.
    pub fn with_nodes(
        num_spenders: usize,
        data_dir: &DataDirectory,
        start_args: &[String],
        launcher: Arc<dyn NodeLauncher>,
        sync: SyncPolicy,
    ) -> Self {
        let mut cluster = Self::new(sync);
        for i in 0..=num_spenders {
            let index = NodeIndex(i);
            let role = if i < num_spenders {
                Role::Spender
            } else {
                Role::Miner
            };
            cluster.add_node(NodeHandle::new(
                index,
                role,
                data_dir.node(index),
                start_args.to_vec(),
                launcher.clone(),
            ));
        }
        cluster
    }

    pub fn add_node(&mut self, node: NodeHandle) {
        self.nodes.insert(node.index(), node);
    }

    pub fn sync_policy(&self) -> SyncPolicy {
        self.sync
    }

    pub fn node(&self, index: NodeIndex) -> Result<&NodeHandle, HarnessError> {
        self.nodes
            .get(&index)
            .ok_or(HarnessError::UnknownNode(index))
    }

    pub fn node_mut(&mut self, index: NodeIndex) -> Result<&mut NodeHandle, HarnessError> {
        self.nodes
            .get_mut(&index)
            .ok_or(HarnessError::UnknownNode(index))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeHandle> {
        self.nodes.values()
    }

    pub fn indices(&self) -> Vec<NodeIndex> {
        self.nodes.keys().copied().collect()
    }

    pub fn spenders(&self) -> Vec<NodeIndex> {
        self.nodes()
            .filter(|n| n.role().is_spender())
            .map(NodeHandle::index)
            .collect()
    }

    pub fn miner(&self) -> Result<NodeIndex, HarnessError> {
        self.nodes()
            .find(|n| n.role().is_miner())
            .map(NodeHandle::index)
            .ok_or_else(|| HarnessError::Failed("cluster has no miner".to_string()))
    }

    pub fn links(&self) -> &BTreeSet<(NodeIndex, NodeIndex)> {
        &self.links
    }

    /// Record a link between `a` and `b` and have both ends peer.
    pub async fn connect(&mut self, a: NodeIndex, b: NodeIndex) -> Result<(), HarnessError> {
        let link = if a <= b { (a, b) } else { (b, a) };
        self.node(a)?;
        self.node(b)?;
        self.links.insert(link);
        self.peer(a, b).await
    }

    async fn peer(&self, a: NodeIndex, b: NodeIndex) -> Result<(), HarnessError> {
        let (node_a, node_b) = (self.node(a)?, self.node(b)?);
        if !node_a.is_running() || !node_b.is_running() {
            return Ok(());
        }
        node_a.connect(node_b).await?;
        node_b.connect(node_a).await?;
        debug!("connected {a} and {b}");
        Ok(())
    }

    /// Connect each node to the next one, so data must travel several hops.
    pub async fn connect_chain(&mut self) -> Result<(), HarnessError> {
        let indices = self.indices();
        for (a, b) in indices.into_iter().tuple_windows() {
            self.connect(a, b).await?;
        }
        Ok(())
    }

    /// Re-establish every recorded link between running nodes.
    pub async fn reconnect(&self) -> Result<(), HarnessError> {
        for &(a, b) in &self.links {
            self.peer(a, b).await?;
        }
        Ok(())
    }

    pub async fn start_all(&mut self) -> Result<(), HarnessError> {
        for node in self.nodes.values_mut() {
            node.start().await?;
        }
        Ok(())
    }

    pub async fn stop_all(&mut self) -> Result<(), HarnessError> {
        for node in self.nodes.values_mut() {
            node.stop().await?;
        }
        Ok(())
    }

    /// Balances of every running node.
    pub async fn balances(&self) -> Result<BTreeMap<NodeIndex, CoinAmount>, HarnessError> {
        let mut balances = BTreeMap::new();
        for node in self.nodes().filter(|n| n.is_running()) {
            balances.insert(node.index(), node.balance().await?);
        }
        Ok(balances)
    }

    /// Wait until every running node reports the same best block.
    pub async fn barrier_chain(&self) -> Result<BestBlock, HarnessError> {
        self.wait_for_agreement(
            Barrier::Chain,
            |node| Box::pin(node.best_block()),
            |tip| tip.to_string(),
        )
        .await
    }

    /// Wait until every running node reports the same set of pending
    /// transactions.
    pub async fn barrier_mempool(&self) -> Result<SyncedMempool, HarnessError> {
        let txids = self
            .wait_for_agreement(
                Barrier::Mempool,
                |node| Box::pin(node.mempool()),
                |txids| format!("{} pending", txids.len()),
            )
            .await?;
        Ok(SyncedMempool { txids })
    }

    /// Have `miner` mine `num_blocks` blocks on top of a synchronized
    /// mempool.
    pub async fn mine_after_barrier(
        &self,
        miner: NodeIndex,
        synced: SyncedMempool,
        num_blocks: u32,
    ) -> Result<BestBlock, HarnessError> {
        let node = self.node(miner)?;
        let pending = node.mempool().await?;
        if pending != synced.txids {
            return Err(HarnessError::Failed(format!(
                "mempool of {miner} changed after the barrier: {} pending, {} synchronized",
                pending.len(),
                synced.txids.len()
            )));
        }
        node.mine_blocks(num_blocks).await
    }

    async fn wait_for_agreement<T>(
        &self,
        barrier: Barrier,
        query: for<'a> fn(&'a NodeHandle) -> NodeQuery<'a, T>,
        describe: fn(&T) -> String,
    ) -> Result<T, HarnessError>
    where
        T: PartialEq + Debug,
    {
        let start = Instant::now();
        let mut warned = false;
        let mut polls = 0u32;
        loop {
            polls += 1;
            let mut observed = BTreeMap::new();
            for node in self.nodes().filter(|n| n.is_running()) {
                observed.insert(node.index(), query(node).await?);
            }

            if observed.values().all_equal() {
                if let Some((_, agreed)) = observed.pop_first() {
                    debug!(
                        "{barrier} barrier converged after {polls} poll(s): {}",
                        describe(&agreed)
                    );
                    return Ok(agreed);
                }
                return Err(HarnessError::Failed(format!(
                    "{barrier} barrier with no running node"
                )));
            }

            let waited = start.elapsed();
            let detail = observed
                .iter()
                .map(|(node, value)| format!("{node}: {}", describe(value)))
                .join(", ");
            if waited >= self.sync.timeout {
                return Err(HarnessError::SyncTimeout {
                    barrier,
                    waited,
                    detail,
                });
            }
            if !warned && waited >= self.sync.timeout / 2 {
                warn!("{barrier} barrier slow to converge after {waited:?}: {detail}");
                warned = true;
            }
            tokio::time::sleep(self.sync.poll_interval).await;
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::tests::shared::impatient_sync_policy;
    use crate::tests::shared::running_sim_cluster;
    use crate::tests::shared::sim_cluster;

    #[tokio::test]
    async fn miner_is_last_and_spenders_come_first() {
        let (cluster, _) = sim_cluster(3, 5, SyncPolicy::default()).unwrap();
        assert_eq!(
            vec![NodeIndex(0), NodeIndex(1), NodeIndex(2)],
            cluster.spenders()
        );
        assert_eq!(NodeIndex(3), cluster.miner().unwrap());
        assert!(matches!(
            cluster.node(NodeIndex(4)),
            Err(HarnessError::UnknownNode(NodeIndex(4)))
        ));
    }

    #[tokio::test]
    async fn chain_barrier_waits_for_blocks_to_cross_every_hop() {
        let (cluster, _) = running_sim_cluster(3).await.unwrap();
        assert_eq!(3, cluster.links().len());

        let mined = cluster.node(NodeIndex(0)).unwrap().mine_blocks(4).await.unwrap();
        let agreed = cluster.barrier_chain().await.unwrap();
        assert_eq!(mined, agreed);

        for node in cluster.nodes() {
            assert_eq!(mined, node.best_block().await.unwrap());
        }
    }

    #[traced_test]
    #[tokio::test]
    async fn chain_barrier_times_out_on_a_partition() {
        let (mut cluster, _) = sim_cluster(1, 5, impatient_sync_policy()).unwrap();
        cluster.start_all().await.unwrap();

        // no links, so the miner's block never reaches the spender
        cluster.node(NodeIndex(1)).unwrap().mine_blocks(1).await.unwrap();
        let result = cluster.barrier_chain().await;
        let Err(HarnessError::SyncTimeout { barrier, detail, .. }) = result else {
            panic!("expected a sync timeout, got {result:?}");
        };
        assert_eq!(Barrier::Chain, barrier);
        assert!(detail.contains("node0"));
        assert!(detail.contains("node1"));
        assert!(logs_contain("chain barrier slow to converge"));
    }

    #[tokio::test]
    async fn mempool_barrier_times_out_on_a_partition() {
        let (mut cluster, _) = sim_cluster(1, 5, impatient_sync_policy()).unwrap();
        cluster.start_all().await.unwrap();
        let spender = cluster.node(NodeIndex(0)).unwrap();
        spender.mine_blocks(cluster_maturity() + 1).await.unwrap();

        // no links, so the payment stays in the spender's mempool
        let to = cluster.node(NodeIndex(1)).unwrap().new_address().await.unwrap();
        spender.pay(&to, CoinAmount::coins(1)).await.unwrap();

        let result = cluster.barrier_mempool().await;
        let Err(HarnessError::SyncTimeout { barrier, detail, .. }) = result else {
            panic!("expected a sync timeout, got {result:?}");
        };
        assert_eq!(Barrier::Mempool, barrier);
        assert!(detail.contains("node0: 1 pending"));
        assert!(detail.contains("node1: 0 pending"));
    }

    #[tokio::test]
    async fn stopped_nodes_are_left_out_of_barriers() {
        let (mut cluster, _) = running_sim_cluster(2).await.unwrap();
        cluster.node_mut(NodeIndex(0)).unwrap().stop().await.unwrap();

        cluster.node(NodeIndex(2)).unwrap().mine_blocks(2).await.unwrap();
        let tip = cluster.barrier_chain().await.unwrap();
        assert_eq!(2, tip.height);
        assert_eq!(2, cluster.balances().await.unwrap().len());
    }

    #[tokio::test]
    async fn reconnect_restores_links_after_a_restart() {
        let (mut cluster, _) = running_sim_cluster(2).await.unwrap();
        cluster.stop_all().await.unwrap();
        cluster.start_all().await.unwrap();
        cluster.reconnect().await.unwrap();

        let mined = cluster.node(NodeIndex(2)).unwrap().mine_blocks(1).await.unwrap();
        assert_eq!(mined, cluster.barrier_chain().await.unwrap());
    }

    #[tokio::test]
    async fn mining_refuses_a_stale_mempool_token() {
        let (cluster, _) = running_sim_cluster(1).await.unwrap();
        let spender = cluster.node(NodeIndex(0)).unwrap();
        let maturity = cluster_maturity();
        spender.mine_blocks(maturity + 1).await.unwrap();
        cluster.barrier_chain().await.unwrap();

        let synced = cluster.barrier_mempool().await.unwrap();
        assert!(synced.txids().is_empty());

        let miner = cluster.node(NodeIndex(1)).unwrap();
        let address = miner.new_address().await.unwrap();
        spender.pay(&address, CoinAmount::coins(1)).await.unwrap();
        let fresh = cluster.barrier_mempool().await.unwrap();
        assert_eq!(1, fresh.txids().len());

        let result = cluster.mine_after_barrier(NodeIndex(1), synced, 1).await;
        assert!(matches!(result, Err(HarnessError::Failed(_))));
    }

    fn cluster_maturity() -> u32 {
        let maturity = crate::config_models::network::Network::RegTest.coinbase_maturity();
        u32::try_from(maturity).unwrap()
    }
}
